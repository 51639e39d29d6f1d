//! Decoding for list-valued profile fields (career interests, pathways,
//! specializations) that the platform stores in several shapes.

use serde_json::Value;

/// The shapes a stored list field arrives in.
#[derive(Debug, Clone, PartialEq)]
pub enum RawList {
    /// Already a JSON array.
    Array(Vec<Value>),
    /// Text that looks like JSON (`["a","b"]`, `"a"`).
    JsonString(String),
    /// Comma-separated text.
    CsvString(String),
    /// Anything else: a single word, a number, a bool.
    Scalar(Value),
}

impl RawList {
    pub fn classify(value: Value) -> Self {
        match value {
            Value::Array(items) => RawList::Array(items),
            Value::String(text) => {
                let trimmed = text.trim();
                if trimmed.starts_with('[') || trimmed.starts_with('"') || trimmed.starts_with('{')
                {
                    RawList::JsonString(text)
                } else if trimmed.contains(',') {
                    RawList::CsvString(text)
                } else {
                    RawList::Scalar(Value::String(text))
                }
            }
            other => RawList::Scalar(other),
        }
    }

    /// Total decode: never fails and never returns an empty list. Order of
    /// attempts: array, JSON, comma split, single element. An array with no
    /// usable items yields its raw text.
    pub fn decode(self) -> Vec<String> {
        match self {
            RawList::Array(items) => {
                let decoded = items.iter().flat_map(flatten_value).collect();
                non_empty_or_raw(decoded, &Value::Array(items).to_string())
            }
            RawList::JsonString(text) => match serde_json::from_str::<Value>(text.trim()) {
                Ok(Value::Array(items)) => {
                    non_empty_or_raw(items.iter().flat_map(flatten_value).collect(), &text)
                }
                Ok(Value::String(inner)) => RawList::classify(Value::String(inner)).decode(),
                Ok(other) => non_empty_or_raw(flatten_value(&other), &text),
                Err(_) if text.contains(',') => RawList::CsvString(text).decode(),
                Err(_) => single(&text),
            },
            RawList::CsvString(text) => {
                let parts: Vec<String> = text
                    .split(',')
                    .map(clean_item)
                    .filter(|part| !part.is_empty())
                    .collect();
                non_empty_or_raw(parts, &text)
            }
            RawList::Scalar(value) => {
                let text = value_to_text(&value);
                single(&text)
            }
        }
    }
}

/// Normalize a stored list field into a list of strings.
pub fn normalize_list(value: Value) -> Vec<String> {
    if value.is_null() {
        return Vec::new();
    }
    RawList::classify(value).decode()
}

/// Normalize a nullable TEXT column.
pub fn normalize_text_list(raw: Option<&str>) -> Vec<String> {
    match raw {
        Some(text) if !text.trim().is_empty() => normalize_list(Value::String(text.to_string())),
        _ => Vec::new(),
    }
}

fn flatten_value(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::String(text) => {
            let cleaned = clean_item(text);
            if cleaned.is_empty() {
                Vec::new()
            } else {
                vec![cleaned]
            }
        }
        Value::Array(items) => items.iter().flat_map(flatten_value).collect(),
        Value::Object(map) => map
            .get("name")
            .or_else(|| map.get("title"))
            .or_else(|| map.get("value"))
            .map(flatten_value)
            .unwrap_or_else(|| vec![value.to_string()]),
        other => vec![other.to_string()],
    }
}

fn clean_item(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '[' || c == ']')
        .trim()
        .to_string()
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn single(text: &str) -> Vec<String> {
    let cleaned = clean_item(text);
    if cleaned.is_empty() {
        vec![text.to_string()]
    } else {
        vec![cleaned]
    }
}

fn non_empty_or_raw(items: Vec<String>, raw: &str) -> Vec<String> {
    if items.is_empty() {
        vec![raw.to_string()]
    } else {
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_input_shape_yields_at_least_one_element() {
        let cases = vec![
            (json!(["Finance", "Law"]), vec!["Finance", "Law"]),
            (json!("[\"Healthcare\", \"Nursing\"]"), vec!["Healthcare", "Nursing"]),
            (json!("Engineering, Design ,  Media"), vec!["Engineering", "Design", "Media"]),
            (json!("Technology"), vec!["Technology"]),
            (json!(42), vec!["42"]),
            (json!(true), vec!["true"]),
            (json!([]), vec!["[]"]),
        ];
        for (input, expected) in cases {
            assert_eq!(normalize_list(input.clone()), expected, "input: {input}");
        }
    }

    #[test]
    fn malformed_json_falls_back_to_comma_split_or_raw_text() {
        assert_eq!(
            normalize_list(json!("[\"Banking\", \"Accounting\"")),
            vec!["Banking", "Accounting"]
        );
        assert_eq!(normalize_list(json!("[oops")), vec!["oops"]);
    }

    #[test]
    fn arrays_without_usable_items_fall_back_to_raw_text() {
        assert_eq!(normalize_list(json!([])), vec!["[]"]);
        assert_eq!(normalize_list(json!(["", "  "])), vec![r#"["","  "]"#]);
        assert_eq!(normalize_list(json!("[]")), vec!["[]"]);
        assert_eq!(normalize_list(json!("[\"\", null]")), vec!["[\"\", null]"]);
    }

    #[test]
    fn double_encoded_strings_are_unwrapped() {
        assert_eq!(normalize_list(json!("\"Retail, Hospitality\"")), vec!["Retail", "Hospitality"]);
        assert_eq!(normalize_list(json!("{\"name\": \"Logistics\"}")), vec!["Logistics"]);
    }

    #[test]
    fn null_and_blank_columns_are_empty() {
        assert!(normalize_list(Value::Null).is_empty());
        assert!(normalize_text_list(None).is_empty());
        assert!(normalize_text_list(Some("   ")).is_empty());
        assert_eq!(normalize_text_list(Some("Finance")), vec!["Finance"]);
    }

    #[test]
    fn classify_tags_each_shape() {
        assert!(matches!(RawList::classify(json!(["a"])), RawList::Array(_)));
        assert!(matches!(RawList::classify(json!("[\"a\"]")), RawList::JsonString(_)));
        assert!(matches!(RawList::classify(json!("a,b")), RawList::CsvString(_)));
        assert!(matches!(RawList::classify(json!("a")), RawList::Scalar(_)));
        assert!(matches!(RawList::classify(json!(1.5)), RawList::Scalar(_)));
    }
}
