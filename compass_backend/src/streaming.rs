//! Server-Sent-Events relay: forwards provider chunks to the client as typed
//! frames and accumulates the full reply.

use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

use crate::providers::ChunkStream;

const DONE_SENTINEL: &str = "[DONE]";

/// One SSE unit sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Delta(String),
    Error(String),
    Done,
}

impl Frame {
    /// The `data:` payload.
    pub fn payload(&self) -> String {
        match self {
            Frame::Delta(text) => json!({ "content": text }).to_string(),
            Frame::Error(reason) => json!({ "error": reason }).to_string(),
            Frame::Done => DONE_SENTINEL.to_string(),
        }
    }

    /// Full wire form: `data: <payload>\n\n`.
    pub fn to_wire(&self) -> String {
        format!("data: {}\n\n", self.payload())
    }

    /// Parse the payload of a `data:` line. Unknown JSON shapes yield `None`.
    pub fn from_data(data: &str) -> Option<Frame> {
        let data = data.trim();
        if data == DONE_SENTINEL {
            return Some(Frame::Done);
        }
        let value: serde_json::Value = serde_json::from_str(data).ok()?;
        if let Some(text) = value.get("content").and_then(|v| v.as_str()) {
            return Some(Frame::Delta(text.to_string()));
        }
        value
            .get("error")
            .and_then(|v| v.as_str())
            .map(|reason| Frame::Error(reason.to_string()))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Done)
    }
}

/// How a relayed stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Upstream was exhausted; carries the accumulated reply.
    Completed(String),
    /// Upstream raised mid-stream; the partial reply was discarded.
    Failed(String),
    /// The client went away; nothing more was forwarded.
    Cancelled,
}

impl RelayOutcome {
    /// Only a completed stream yields text worth persisting.
    pub fn into_completed(self) -> Option<String> {
        match self {
            RelayOutcome::Completed(text) => Some(text),
            RelayOutcome::Failed(_) | RelayOutcome::Cancelled => None,
        }
    }
}

/// Forward `chunks` to `frames` until upstream ends, fails, or the receiver
/// is dropped.
///
/// Empty chunks are skipped. A failure sends one error frame followed by
/// the terminal frame. A closed receiver stops the relay without pulling
/// further chunks.
pub async fn relay_stream(mut chunks: ChunkStream, frames: mpsc::Sender<Frame>) -> RelayOutcome {
    let mut accumulated = String::new();

    loop {
        let next = tokio::select! {
            _ = frames.closed() => {
                tracing::info!("Client disconnected mid-stream after {} chars", accumulated.len());
                return RelayOutcome::Cancelled;
            }
            next = chunks.next() => next,
        };

        match next {
            Some(Ok(delta)) => {
                if delta.is_empty() {
                    continue;
                }
                accumulated.push_str(&delta);
                if frames.send(Frame::Delta(delta)).await.is_err() {
                    return RelayOutcome::Cancelled;
                }
            }
            Some(Err(e)) => {
                let reason = format!("{:#}", e);
                tracing::warn!("Completion stream interrupted: {}", reason);
                if frames.send(Frame::Error(reason.clone())).await.is_err()
                    || frames.send(Frame::Done).await.is_err()
                {
                    return RelayOutcome::Cancelled;
                }
                return RelayOutcome::Failed(reason);
            }
            None => {
                if frames.send(Frame::Done).await.is_err() {
                    return RelayOutcome::Cancelled;
                }
                return RelayOutcome::Completed(accumulated);
            }
        }
    }
}
