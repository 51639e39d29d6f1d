//! Completion providers and the per-request router that chooses between them.
//!
//! Both remote backends speak the OpenAI chat-completions wire format, so one
//! HTTP client type ([`OpenAiCompatProvider`]) serves both; the
//! [`ProviderKind`] tag is what tells them apart.

pub mod fallback;
pub mod openai_compat;
pub mod router;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::config::ServiceConfig;

pub use openai_compat::OpenAiCompatProvider;
pub use router::{
    Completion, CompletionBody, CompletionRequest, ProviderRouter, Responder, RouterConfig,
};

/// Incremental completion text. An `Err` item ends the stream.
pub type ChunkStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    DeepSeek,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::DeepSeek => "deepseek",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" | "gpt" | "chatgpt" => Some(ProviderKind::OpenAi),
            "deepseek" => Some(ProviderKind::DeepSeek),
            _ => None,
        }
    }

    /// The other provider of the pair.
    pub fn alternate(self) -> Self {
        match self {
            ProviderKind::OpenAi => ProviderKind::DeepSeek,
            ProviderKind::DeepSeek => ProviderKind::OpenAi,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// One prior turn as supplied by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    #[serde(alias = "text")]
    pub content: String,
    #[serde(rename = "isUser", alias = "is_user", default)]
    pub is_user: bool,
}

/// A remote chat-completion backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Run a completion and return the whole reply.
    async fn complete(&self, messages: &[Message]) -> Result<String>;

    /// Open a streamed completion. Errors opening the stream are returned
    /// here; errors while reading it arrive as stream items.
    async fn complete_stream(&self, messages: &[Message]) -> Result<ChunkStream>;
}

/// The credentialed providers available to a request.
#[derive(Clone, Default)]
pub struct ProviderSet {
    openai: Option<Arc<dyn CompletionProvider>>,
    deepseek: Option<Arc<dyn CompletionProvider>>,
}

impl ProviderSet {
    /// Build HTTP providers for every backend whose settings carry a key.
    pub fn from_config(config: &ServiceConfig, http: reqwest::Client) -> Self {
        let mut set = Self::default();
        for kind in [ProviderKind::OpenAi, ProviderKind::DeepSeek] {
            let settings = config.provider_settings(kind);
            match OpenAiCompatProvider::from_settings(kind, settings, http.clone()) {
                Some(provider) => {
                    tracing::info!("Provider {} configured (model {})", kind, settings.model);
                    set = set.with(Arc::new(provider));
                }
                None => tracing::warn!("Provider {} has no API key; it will be skipped", kind),
            }
        }
        set
    }

    pub fn with(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        match provider.kind() {
            ProviderKind::OpenAi => self.openai = Some(provider),
            ProviderKind::DeepSeek => self.deepseek = Some(provider),
        }
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&Arc<dyn CompletionProvider>> {
        match kind {
            ProviderKind::OpenAi => self.openai.as_ref(),
            ProviderKind::DeepSeek => self.deepseek.as_ref(),
        }
    }

    pub fn is_credentialed(&self, kind: ProviderKind) -> bool {
        self.get(kind).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_parses_case_insensitively() {
        assert_eq!(ProviderKind::parse(" DeepSeek "), Some(ProviderKind::DeepSeek));
        assert_eq!(ProviderKind::parse("openai"), Some(ProviderKind::OpenAi));
        assert_eq!(ProviderKind::parse("claude"), None);
        assert_eq!(ProviderKind::OpenAi.alternate(), ProviderKind::DeepSeek);
    }

    #[test]
    fn history_item_accepts_camel_and_snake_case() {
        let camel: HistoryItem =
            serde_json::from_str(r#"{"content":"hi","isUser":true}"#).expect("camel");
        let snake: HistoryItem =
            serde_json::from_str(r#"{"text":"hello","is_user":false}"#).expect("snake");
        assert!(camel.is_user);
        assert_eq!(snake.content, "hello");
        assert!(!snake.is_user);
    }

    #[test]
    fn provider_set_skips_backends_without_keys() {
        let mut config = ServiceConfig::default();
        config.deepseek.api_key = Some("sk-deepseek".to_string());
        let set = ProviderSet::from_config(&config, reqwest::Client::new());
        assert!(!set.is_credentialed(ProviderKind::OpenAi));
        assert!(set.is_credentialed(ProviderKind::DeepSeek));
    }
}
