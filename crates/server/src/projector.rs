//! Response projector
//!
//! Turns the messages of one admitted request into engine sessions, one after
//! another in array order, and renders their fragments either as a single
//! aggregate body or as an incrementally flushed stream of frames.
//!
//! The work always runs in a spawned task that owns the admission slot. The
//! slot is freed only when the last generation thread has been joined, even
//! if the client went away earlier.

use axum::{
    body::Body,
    http::header,
    response::{IntoResponse, Response},
};
use rkserve_common::{GatewayError, Result, METRICS};
use rkserve_engine::{AdmissionSlot, GenerationEngine, SessionStatus};
use rkserve_proto::{ChatChunk, ChatCompletion, ChatMessage, FinishReason};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Frames buffered between the generation task and the response body
const STREAM_BUFFER: usize = 32;

/// Frame terminator on the wire
const FRAME_DELIMITER: &str = "\n\n";

/// Identity shared by every frame of one response
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub id: String,
    pub created: i64,
}

impl ResponseMeta {
    pub fn new() -> Self {
        Self {
            id: format!("rkllm_chat-{}", Uuid::new_v4()),
            created: chrono::Utc::now().timestamp(),
        }
    }
}

impl Default for ResponseMeta {
    fn default() -> Self {
        Self::new()
    }
}

fn finish_reason(status: SessionStatus) -> FinishReason {
    match status {
        SessionStatus::Finished => FinishReason::Stop,
        _ => FinishReason::Error,
    }
}

/// Run every message to completion and bundle one choice per message
pub async fn aggregate(
    engine: Arc<GenerationEngine>,
    slot: AdmissionSlot,
    messages: Vec<ChatMessage>,
    meta: ResponseMeta,
) -> Result<ChatCompletion> {
    let task = tokio::spawn(async move {
        let _slot = slot;
        let mut completion = ChatCompletion::new(meta.id, meta.created);

        for (index, message) in messages.into_iter().enumerate() {
            let session = engine.start(message.content.into())?;
            debug!(
                "Request {} message {} runs as session {}",
                completion.id,
                index,
                session.id()
            );
            let output = session.collect().await;
            completion.push_choice(output.text, finish_reason(output.status));
        }

        Ok::<_, GatewayError>(completion)
    });

    task.await
        .map_err(|e| GatewayError::internal(format!("generation task failed: {}", e)))?
}

/// Stream one frame per fragment and a terminal frame per message
///
/// Frames are JSON objects followed by a blank line, sent as `text/plain`.
pub fn stream(
    engine: Arc<GenerationEngine>,
    slot: AdmissionSlot,
    messages: Vec<ChatMessage>,
    meta: ResponseMeta,
) -> Response {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let timer = METRICS.http.request_duration.start_timer();
    debug!("Streaming request {} on admission slot {}", meta.id, slot.ticket());

    tokio::spawn(async move {
        let mut writer = FrameWriter::new(tx);

        for (index, message) in messages.into_iter().enumerate() {
            let mut session = match engine.start(message.content.into()) {
                Ok(session) => session,
                Err(e) => {
                    error!("Could not start generation for message {}: {}", index, e);
                    writer
                        .send(&ChatChunk::finish(&meta.id, meta.created, index, FinishReason::Error))
                        .await;
                    break;
                }
            };

            while let Some(fragment) = session.next_fragment().await {
                writer
                    .send(&ChatChunk::delta(&meta.id, meta.created, index, fragment))
                    .await;
            }

            let reason = finish_reason(session.status());
            writer
                .send(&ChatChunk::finish(&meta.id, meta.created, index, reason))
                .await;
            debug!(
                "Request {} message {} done: session {}, {:?} after {:?}",
                meta.id,
                index,
                session.id(),
                reason,
                session.elapsed()
            );
            session.finish().await;
        }

        // Free the gate before the body ends.
        drop(slot);
        timer.observe_duration();
    });

    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

struct FrameWriter {
    tx: mpsc::Sender<std::result::Result<String, Infallible>>,
    client_gone: bool,
}

impl FrameWriter {
    fn new(tx: mpsc::Sender<std::result::Result<String, Infallible>>) -> Self {
        Self {
            tx,
            client_gone: false,
        }
    }

    async fn send(&mut self, chunk: &ChatChunk) {
        if self.client_gone {
            return;
        }

        let mut frame = match serde_json::to_string(chunk) {
            Ok(json) => json,
            Err(e) => {
                warn!("Dropping unserializable frame: {}", e);
                return;
            }
        };
        frame.push_str(FRAME_DELIMITER);

        if self.tx.send(Ok(frame)).await.is_err() {
            // Keep draining so the engine finishes and the slot is released.
            debug!("Client disconnected from stream {}", chunk.id);
            self.client_gone = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rkserve_engine::{AdmissionGate, ScriptedBackend};

    fn user(content: &str) -> ChatMessage {
        ChatMessage {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }

    fn engine(fragments: &[&str]) -> Arc<GenerationEngine> {
        Arc::new(GenerationEngine::with_backend(Arc::new(ScriptedBackend::new(
            fragments.to_vec(),
        ))))
    }

    #[tokio::test]
    async fn test_aggregate_one_choice_per_message() {
        let gate = AdmissionGate::new();
        let slot = gate.try_acquire().unwrap();
        let messages = vec![user("first"), user("second")];

        let completion = aggregate(engine(&["ok"]), slot, messages, ResponseMeta::new())
            .await
            .unwrap();

        assert_eq!(completion.choices.len(), 2);
        assert_eq!(completion.choices[1].index, 1);
        assert_eq!(completion.choices[1].message.content, "ok");
        assert!(completion.id.starts_with("rkllm_chat-"));
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn test_aggregate_frees_slot_on_start_error() {
        let gate = AdmissionGate::new();
        let slot = gate.try_acquire().unwrap();
        let engine = Arc::new(GenerationEngine::new());

        let result = aggregate(
            engine,
            slot,
            vec![user("x")],
            ResponseMeta::new(),
        )
        .await;

        assert!(matches!(result, Err(GatewayError::NotInitialized)));
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_finish_reason() {
        assert_eq!(finish_reason(SessionStatus::Finished), FinishReason::Stop);
        assert_eq!(finish_reason(SessionStatus::Error), FinishReason::Error);
    }
}
