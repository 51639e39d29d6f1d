use std::fmt;

use anyhow::Result;
use futures_util::StreamExt;

use super::fallback::fallback_response;
use super::{ChunkStream, HistoryItem, Message, ProviderKind, ProviderSet};
use crate::config::ServiceConfig;

/// Request-scoped router settings, copied out of the service config.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub default_provider: ProviderKind,
    pub system_prompt: String,
}

impl From<&ServiceConfig> for RouterConfig {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            default_provider: config.default_provider,
            system_prompt: config.system_prompt.clone(),
        }
    }
}

pub struct CompletionRequest<'a> {
    pub message: &'a str,
    pub history: &'a [HistoryItem],
    pub streaming: bool,
    pub provider_hint: Option<ProviderKind>,
    pub grounding: Option<&'a str>,
}

/// Who produced a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Responder {
    Provider(ProviderKind),
    Fallback,
}

impl fmt::Display for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Responder::Provider(kind) => kind.fmt(f),
            Responder::Fallback => f.write_str("fallback"),
        }
    }
}

pub enum CompletionBody {
    Text(String),
    Stream(ChunkStream),
}

pub struct Completion {
    pub responder: Responder,
    pub body: CompletionBody,
}

/// Routes one request's completion to a provider, failing over once to the
/// alternate provider and then to the canned responder.
///
/// Built per request; `set_provider` never affects other requests.
pub struct ProviderRouter {
    config: RouterConfig,
    providers: ProviderSet,
    active: ProviderKind,
}

impl ProviderRouter {
    pub fn new(config: RouterConfig, providers: ProviderSet) -> Self {
        let active = config.default_provider;
        Self {
            config,
            providers,
            active,
        }
    }

    pub fn set_provider(&mut self, kind: ProviderKind) {
        self.active = kind;
    }

    pub fn active_provider(&self) -> ProviderKind {
        self.active
    }

    /// Pick the provider for this call, substituting the credentialed one
    /// when the preferred provider has no key.
    pub fn resolve_target(&self, hint: Option<ProviderKind>) -> Option<ProviderKind> {
        let preferred = hint
            .filter(|kind| self.providers.is_credentialed(*kind))
            .unwrap_or(self.active);
        if self.providers.is_credentialed(preferred) {
            Some(preferred)
        } else if self.providers.is_credentialed(preferred.alternate()) {
            Some(preferred.alternate())
        } else {
            None
        }
    }

    /// System instruction, mapped history, then the new user message.
    pub fn compose_messages(
        &self,
        message: &str,
        history: &[HistoryItem],
        grounding: Option<&str>,
    ) -> Vec<Message> {
        let mut system = self.config.system_prompt.clone();
        if let Some(grounding) = grounding.filter(|text| !text.trim().is_empty()) {
            system.push_str("\n\n=== PLATFORM CONTEXT ===\n");
            system.push_str(grounding);
            if !grounding.ends_with('\n') {
                system.push('\n');
            }
            system.push_str("=== END PLATFORM CONTEXT ===\n\n");
            system.push_str(
                "Use the platform context above when it is relevant to the question. \
                 Only mention jobs, events, news or meetings that appear in it.",
            );
        }

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(system));
        for item in history {
            if item.is_user {
                messages.push(Message::user(item.content.clone()));
            } else {
                messages.push(Message::assistant(item.content.clone()));
            }
        }
        messages.push(Message::user(message));
        messages
    }

    /// Never fails for a well-formed request: provider errors degrade to the
    /// alternate provider and then to the canned responder.
    pub async fn send_message(&self, request: CompletionRequest<'_>) -> Completion {
        let Some(target) = self.resolve_target(request.provider_hint) else {
            tracing::warn!("No completion provider is credentialed; using fallback responder");
            return self.fallback(&request);
        };

        let messages = self.compose_messages(request.message, request.history, request.grounding);
        tracing::debug!(
            "Routing completion to {} (streaming: {}, {} messages)",
            target,
            request.streaming,
            messages.len()
        );

        match self.invoke(target, &messages, request.streaming).await {
            Ok(body) => {
                return Completion {
                    responder: Responder::Provider(target),
                    body,
                }
            }
            Err(e) => tracing::warn!("Provider {} failed: {:#}", target, e),
        }

        let alternate = target.alternate();
        if self.providers.is_credentialed(alternate) {
            tracing::info!("Retrying completion on alternate provider {}", alternate);
            match self.invoke(alternate, &messages, request.streaming).await {
                Ok(body) => {
                    return Completion {
                        responder: Responder::Provider(alternate),
                        body,
                    }
                }
                Err(e) => tracing::warn!("Alternate provider {} failed: {:#}", alternate, e),
            }
        }

        self.fallback(&request)
    }

    async fn invoke(
        &self,
        kind: ProviderKind,
        messages: &[Message],
        streaming: bool,
    ) -> Result<CompletionBody> {
        let provider = self
            .providers
            .get(kind)
            .ok_or_else(|| anyhow::anyhow!("provider {} is not credentialed", kind))?;
        if streaming {
            Ok(CompletionBody::Stream(provider.complete_stream(messages).await?))
        } else {
            Ok(CompletionBody::Text(provider.complete(messages).await?))
        }
    }

    fn fallback(&self, request: &CompletionRequest<'_>) -> Completion {
        let text = fallback_response(request.message);
        let body = if request.streaming {
            let once = futures_util::stream::once(async move { Ok::<_, anyhow::Error>(text) });
            CompletionBody::Stream(once.boxed())
        } else {
            CompletionBody::Text(text)
        };
        Completion {
            responder: Responder::Fallback,
            body,
        }
    }
}


#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::test_support::{Script, ScriptedProvider};
    use super::*;

    fn router_with(default: ProviderKind, providers: ProviderSet) -> ProviderRouter {
        ProviderRouter::new(
            RouterConfig {
                default_provider: default,
                system_prompt: "You are a career assistant.".to_string(),
            },
            providers,
        )
    }

    fn request<'a>(message: &'a str, streaming: bool) -> CompletionRequest<'a> {
        CompletionRequest {
            message,
            history: &[],
            streaming,
            provider_hint: None,
            grounding: None,
        }
    }

    fn text(completion: Completion) -> String {
        match completion.body {
            CompletionBody::Text(text) => text,
            CompletionBody::Stream(_) => panic!("expected text completion"),
        }
    }

    #[tokio::test]
    async fn uncredentialed_router_returns_canned_text() {
        let router = router_with(ProviderKind::OpenAi, ProviderSet::default());
        for message in ["hello", "Are there any banking jobs?", "zzz", ""] {
            let completion = router.send_message(request(message, false)).await;
            assert_eq!(completion.responder, Responder::Fallback);
            assert!(!text(completion).is_empty());
        }
    }

    #[tokio::test]
    async fn uncredentialed_streaming_yields_one_fallback_chunk() {
        let router = router_with(ProviderKind::OpenAi, ProviderSet::default());
        let completion = router.send_message(request("interview tips", true)).await;
        let CompletionBody::Stream(stream) = completion.body else {
            panic!("expected stream");
        };
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].as_ref().expect("chunk").contains("interview"));
    }

    #[tokio::test]
    async fn primary_failure_fails_over_to_alternate_once() {
        let primary = ScriptedProvider::new(
            ProviderKind::OpenAi,
            Script::Fail("NetworkError: connection reset".to_string()),
        );
        let alternate = ScriptedProvider::new(
            ProviderKind::DeepSeek,
            Script::Reply("Try the banking postings.".to_string()),
        );
        let router = router_with(
            ProviderKind::OpenAi,
            ProviderSet::default()
                .with(primary.clone())
                .with(alternate.clone()),
        );

        let completion = router.send_message(request("banking jobs?", false)).await;
        assert_eq!(completion.responder, Responder::Provider(ProviderKind::DeepSeek));
        assert_eq!(text(completion), "Try the banking postings.");
        assert_eq!(primary.call_count(), 1);
        assert_eq!(alternate.call_count(), 1);
        assert_eq!(
            *primary.last_messages.lock().unwrap(),
            *alternate.last_messages.lock().unwrap()
        );
    }

    #[tokio::test]
    async fn both_providers_failing_degrades_to_fallback() {
        let primary =
            ScriptedProvider::new(ProviderKind::OpenAi, Script::Fail("timeout".to_string()));
        let alternate =
            ScriptedProvider::new(ProviderKind::DeepSeek, Script::Fail("503".to_string()));
        let router = router_with(
            ProviderKind::OpenAi,
            ProviderSet::default()
                .with(primary.clone())
                .with(alternate.clone()),
        );

        let completion = router.send_message(request("resume help", false)).await;
        assert_eq!(completion.responder, Responder::Fallback);
        assert!(text(completion).contains("resume"));
        assert_eq!(primary.call_count(), 1);
        assert_eq!(alternate.call_count(), 1);
    }

    #[tokio::test]
    async fn single_failing_provider_goes_straight_to_fallback() {
        let only = ScriptedProvider::new(ProviderKind::DeepSeek, Script::Fail("boom".to_string()));
        let router = router_with(ProviderKind::OpenAi, ProviderSet::default().with(only.clone()));
        let completion = router.send_message(request("hi", false)).await;
        assert_eq!(completion.responder, Responder::Fallback);
        assert_eq!(only.call_count(), 1);
    }

    #[test]
    fn hint_and_default_resolution_substitutes_credentialed_provider() {
        let deepseek = ScriptedProvider::new(ProviderKind::DeepSeek, Script::Reply("x".into()));
        let router = router_with(ProviderKind::OpenAi, ProviderSet::default().with(deepseek));

        assert_eq!(router.resolve_target(None), Some(ProviderKind::DeepSeek));
        assert_eq!(
            router.resolve_target(Some(ProviderKind::OpenAi)),
            Some(ProviderKind::DeepSeek)
        );

        let both = ProviderSet::default()
            .with(ScriptedProvider::new(ProviderKind::OpenAi, Script::Reply("a".into())))
            .with(ScriptedProvider::new(ProviderKind::DeepSeek, Script::Reply("b".into())));
        let mut router = router_with(ProviderKind::OpenAi, both);
        assert_eq!(
            router.resolve_target(Some(ProviderKind::DeepSeek)),
            Some(ProviderKind::DeepSeek)
        );
        router.set_provider(ProviderKind::DeepSeek);
        assert_eq!(router.active_provider(), ProviderKind::DeepSeek);
        assert_eq!(router.resolve_target(None), Some(ProviderKind::DeepSeek));
    }

    #[test]
    fn composed_messages_carry_grounding_and_history_roles() {
        let router = router_with(ProviderKind::OpenAi, ProviderSet::default());
        let history = vec![
            HistoryItem {
                content: "What can you do?".to_string(),
                is_user: true,
            },
            HistoryItem {
                content: "I can help with careers.".to_string(),
                is_user: false,
            },
        ];
        let messages =
            router.compose_messages("Find me jobs", &history, Some("USER: Ada (student)"));

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.starts_with("You are a career assistant."));
        assert!(messages[0]
            .content
            .contains("=== PLATFORM CONTEXT ===\nUSER: Ada (student)\n=== END PLATFORM CONTEXT ==="));
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(messages[3], Message::user("Find me jobs"));

        let bare = router.compose_messages("hi", &[], None);
        assert_eq!(bare[0].content, "You are a career assistant.");
    }

    #[tokio::test]
    async fn streaming_failover_opens_stream_on_alternate() {
        let primary =
            ScriptedProvider::new(ProviderKind::OpenAi, Script::Fail("refused".to_string()));
        let alternate = ScriptedProvider::new(
            ProviderKind::DeepSeek,
            Script::Chunks(vec![Ok("a".to_string()), Ok("b".to_string())]),
        );
        let router = router_with(
            ProviderKind::OpenAi,
            ProviderSet::default().with(primary).with(alternate),
        );
        let completion = router.send_message(request("hi", true)).await;
        assert_eq!(completion.responder, Responder::Provider(ProviderKind::DeepSeek));
        let CompletionBody::Stream(stream) = completion.body else {
            panic!("expected stream");
        };
        let chunks: Vec<String> = stream.map(|chunk| chunk.expect("chunk")).collect().await;
        assert_eq!(chunks, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn responder_display_names() {
        assert_eq!(Responder::Fallback.to_string(), "fallback");
        assert_eq!(
            Responder::Provider(ProviderKind::DeepSeek).to_string(),
            "deepseek"
        );
    }
}
