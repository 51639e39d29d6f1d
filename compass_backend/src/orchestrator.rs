//! Per-request coordinator: identity, grounding, provider routing, relay and
//! persistence, in that order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::ServiceConfig;
use crate::context::{render_prompt, ContextAggregator, Identity};
use crate::error::ChatError;
use crate::persistence::{Exchange, ExchangeStore};
use crate::providers::{
    CompletionBody, CompletionRequest, HistoryItem, ProviderKind, ProviderRouter, ProviderSet,
    Responder, RouterConfig,
};
use crate::streaming::{relay_stream, Frame, RelayOutcome};

const FRAME_BUFFER: usize = 32;

/// Body of `POST /chat` and `POST /chat/stream`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub history: Vec<HistoryItem>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(
        default,
        rename = "conversationID",
        alias = "conversationId",
        alias = "conversation_id"
    )]
    pub conversation_id: Option<String>,
}

/// `data` of a successful non-streaming reply.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub response: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Everything resolved before the provider is called.
struct PreparedTurn {
    identity: Option<Identity>,
    grounding: Option<String>,
    provider_hint: Option<ProviderKind>,
}

pub struct ChatOrchestrator {
    config: Arc<ServiceConfig>,
    providers: ProviderSet,
    aggregator: ContextAggregator,
    store: Arc<dyn ExchangeStore>,
}

impl ChatOrchestrator {
    pub fn new(
        config: Arc<ServiceConfig>,
        providers: ProviderSet,
        aggregator: ContextAggregator,
        store: Arc<dyn ExchangeStore>,
    ) -> Self {
        Self {
            config,
            providers,
            aggregator,
            store,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn router(&self) -> ProviderRouter {
        ProviderRouter::new(RouterConfig::from(self.config.as_ref()), self.providers.clone())
    }

    async fn prepare(
        &self,
        identity: Option<Identity>,
        request: &ChatRequest,
    ) -> Result<PreparedTurn, ChatError> {
        if request.message.trim().is_empty() {
            return Err(ChatError::MissingMessage);
        }

        let provider_hint = match request.provider.as_deref() {
            Some(raw) if !raw.trim().is_empty() => {
                let parsed = ProviderKind::parse(raw);
                if parsed.is_none() {
                    tracing::warn!("Ignoring unknown provider '{}'", raw);
                }
                parsed
            }
            _ => None,
        };

        let Some(identity) = identity else {
            return Ok(PreparedTurn {
                identity: None,
                grounding: None,
                provider_hint,
            });
        };

        match self.aggregator.build_context(identity, &request.message).await {
            Ok(Some(bundle)) => Ok(PreparedTurn {
                identity: Some(identity),
                grounding: Some(render_prompt(&bundle)),
                provider_hint,
            }),
            Ok(None) => {
                tracing::info!(
                    "User {} is unknown; answering as anonymous",
                    identity.user_id
                );
                Ok(PreparedTurn {
                    identity: None,
                    grounding: None,
                    provider_hint,
                })
            }
            Err(e) => {
                tracing::warn!(
                    "Context unavailable for user {}: {:#}",
                    identity.user_id,
                    e
                );
                Ok(PreparedTurn {
                    identity: Some(identity),
                    grounding: None,
                    provider_hint,
                })
            }
        }
    }

    /// Non-streaming turn. Persistence failures are logged, never returned.
    pub async fn respond(
        &self,
        identity: Option<Identity>,
        request: ChatRequest,
    ) -> Result<ChatReply, ChatError> {
        let turn = self.prepare(identity, &request).await?;
        let router = self.router();
        let completion = router
            .send_message(CompletionRequest {
                message: &request.message,
                history: &request.history,
                streaming: false,
                provider_hint: turn.provider_hint,
                grounding: turn.grounding.as_deref(),
            })
            .await;

        let response = match completion.body {
            CompletionBody::Text(text) => text,
            CompletionBody::Stream(_) => {
                tracing::error!("Router returned a stream for a non-streaming request");
                crate::providers::fallback::fallback_response(&request.message)
            }
        };

        let conversation_id = match turn.identity {
            Some(identity) => {
                let exchange = Exchange {
                    identity: Some(identity),
                    conversation_hint: request.conversation_id.clone(),
                    user_text: request.message.clone(),
                    assistant_text: response.clone(),
                    prior_history: request.history.clone(),
                };
                persist(self.store.as_ref(), exchange).await
            }
            None => None,
        };

        Ok(ChatReply {
            response,
            provider: completion.responder.to_string(),
            conversation_id,
        })
    }

    /// Streaming turn. Frames arrive on the returned channel; the exchange
    /// is stored only after the terminal frame of a completed stream.
    pub async fn respond_stream(
        &self,
        identity: Option<Identity>,
        request: ChatRequest,
    ) -> Result<(Responder, mpsc::Receiver<Frame>), ChatError> {
        let turn = self.prepare(identity, &request).await?;
        let router = self.router();
        let completion = router
            .send_message(CompletionRequest {
                message: &request.message,
                history: &request.history,
                streaming: true,
                provider_hint: turn.provider_hint,
                grounding: turn.grounding.as_deref(),
            })
            .await;

        let chunks = match completion.body {
            CompletionBody::Stream(chunks) => chunks,
            CompletionBody::Text(text) => {
                futures_util::StreamExt::boxed(futures_util::stream::once(async move {
                    Ok::<_, anyhow::Error>(text)
                }))
            }
        };

        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let store = self.store.clone();
        let responder = completion.responder;
        tokio::spawn(async move {
            let outcome = relay_stream(chunks, tx).await;
            match outcome {
                RelayOutcome::Completed(text) => {
                    tracing::debug!("Stream from {} completed ({} chars)", responder, text.len());
                    if let Some(identity) = turn.identity {
                        let exchange = Exchange {
                            identity: Some(identity),
                            conversation_hint: request.conversation_id,
                            user_text: request.message,
                            assistant_text: text,
                            prior_history: request.history,
                        };
                        persist(store.as_ref(), exchange).await;
                    }
                }
                RelayOutcome::Failed(reason) => {
                    tracing::warn!("Stream from {} failed, not persisting: {}", responder, reason)
                }
                RelayOutcome::Cancelled => {
                    tracing::info!("Stream from {} cancelled, not persisting", responder)
                }
            }
        });

        Ok((responder, rx))
    }
}

async fn persist(store: &dyn ExchangeStore, exchange: Exchange) -> Option<String> {
    match store.save_exchange(exchange).await {
        Ok(conversation_id) => Some(conversation_id),
        Err(e) => {
            tracing::error!("Failed to persist exchange: {:?}", e);
            None
        }
    }
}
