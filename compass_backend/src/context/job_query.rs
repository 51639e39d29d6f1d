//! Heuristics that decide whether a chat message is a job search and pull
//! the searchable terms out of it.

use std::sync::OnceLock;

use regex_lite::Regex;

/// Industry and role vocabulary that signals a job search on its own.
pub const INDUSTRY_TERMS: &[&str] = &[
    "accounting",
    "agriculture",
    "architecture",
    "automotive",
    "aviation",
    "banking",
    "construction",
    "consulting",
    "culinary",
    "cybersecurity",
    "design",
    "education",
    "energy",
    "engineering",
    "finance",
    "healthcare",
    "hospitality",
    "information technology",
    "insurance",
    "journalism",
    "law",
    "legal",
    "logistics",
    "manufacturing",
    "marketing",
    "media",
    "nursing",
    "pharmacy",
    "real estate",
    "retail",
    "sales",
    "software",
    "technology",
    "telecommunications",
    "tourism",
];

const STOP_PHRASES: &[&str] = &[
    "are there any",
    "is there any",
    "are there",
    "is there",
    "can you find",
    "can you show",
    "could you find",
    "i am looking for",
    "i'm looking for",
    "im looking for",
    "looking for",
    "i want",
    "i need",
    "show me",
    "find me",
    "search for",
    "tell me about",
    "do you have",
    "what are the",
];

const GENERIC_JOB_WORDS: &[&str] = &[
    "job",
    "jobs",
    "position",
    "positions",
    "opening",
    "openings",
    "vacancy",
    "vacancies",
    "role",
    "roles",
    "work",
    "employment",
    "opportunity",
    "opportunities",
    "career",
    "careers",
    "hiring",
    "available",
    "posting",
    "postings",
];

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "any", "are", "as", "at", "be", "can", "do", "for", "from", "get", "have",
    "how", "i", "in", "is", "me", "my", "near", "of", "on", "or", "please", "some", "that",
    "the", "there", "to", "what", "where", "which", "with", "you",
];

fn job_intent_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\b(jobs?|positions?|openings?|vacanc(y|ies)|internships?|apprenticeships?)\b",
            r"\b(hiring|recruiting|employment)\b",
            r"\b(looking for|find|search(ing)? for|apply(ing)? for)\b.*\b(work|roles?|careers?)\b",
            r"\bwork (as|in) (an? )?\w+",
        ]
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                tracing::error!("Invalid job-intent pattern {}: {}", pattern, e);
                None
            }
        })
        .collect()
    })
}

fn words(message: &str) -> Vec<String> {
    message
        .to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '-'))
        .map(|word| word.trim_matches('\'').to_string())
        .filter(|word| !word.is_empty())
        .collect()
}

fn contains_industry_term(lowered: &str, tokens: &[String]) -> bool {
    INDUSTRY_TERMS.iter().any(|term| {
        if term.contains(' ') {
            lowered.contains(term)
        } else {
            tokens.iter().any(|token| token == term)
        }
    })
}

/// A message is a job search when it matches a job-intent pattern or names
/// a known industry.
pub fn is_job_query(message: &str) -> bool {
    let lowered = message.to_lowercase();
    if job_intent_patterns()
        .iter()
        .any(|pattern| pattern.is_match(&lowered))
    {
        return true;
    }
    contains_industry_term(&lowered, &words(&lowered))
}

/// Terms to match against job title, description and tags.
///
/// Stop phrases, stop words and generic job words are removed; industry and
/// role vocabulary is kept, in message order and without duplicates.
pub fn extract_job_keywords(message: &str) -> Vec<String> {
    let mut lowered = format!(" {} ", message.to_lowercase());
    for phrase in STOP_PHRASES {
        lowered = lowered.replace(&format!(" {} ", phrase), " ");
    }

    let mut keywords: Vec<String> = Vec::new();

    // multi-word industry terms survive as one keyword
    for term in INDUSTRY_TERMS.iter().filter(|term| term.contains(' ')) {
        if lowered.contains(term) {
            keywords.push(term.to_string());
            lowered = lowered.replace(term, " ");
        }
    }

    for word in words(&lowered) {
        let keep = INDUSTRY_TERMS.contains(&word.as_str())
            || (word.chars().count() >= 3
                && !STOP_WORDS.contains(&word.as_str())
                && !GENERIC_JOB_WORDS.contains(&word.as_str()));
        if keep && !keywords.contains(&word) {
            keywords.push(word);
        }
    }

    keywords
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banking_question_is_a_job_query_with_banking_keyword() {
        let message = "Are there any banking jobs?";
        assert!(is_job_query(message));
        assert_eq!(extract_job_keywords(message), vec!["banking".to_string()]);
    }

    #[test]
    fn industry_term_alone_marks_a_job_query() {
        assert!(is_job_query("Anything in healthcare near Leeds?"));
        assert!(is_job_query("I'd like to work in real estate"));
        assert!(!is_job_query("How do I write a good essay?"));
        assert!(!is_job_query("What time is the open day?"));
    }

    #[test]
    fn keywords_drop_generic_words_and_keep_roles() {
        assert_eq!(
            extract_job_keywords("I'm looking for software engineering internships in London"),
            vec!["software", "engineering", "internships", "london"]
        );
        assert_eq!(
            extract_job_keywords("Show me real estate openings"),
            vec!["real estate"]
        );
        assert!(extract_job_keywords("any jobs available?").is_empty());
    }

    #[test]
    fn keywords_are_deduplicated() {
        assert_eq!(
            extract_job_keywords("nursing jobs, nursing positions"),
            vec!["nursing"]
        );
    }
}
