//! Chat handler for `POST /rkllm_chat`

use axum::{
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use rkserve_common::{GatewayError, METRICS};
use rkserve_proto::ChatRequest;
use tracing::{debug, info};

use crate::{
    error::ApiError,
    projector::{self, ResponseMeta},
    state::AppState,
};

/// Handle a chat request in aggregate or streaming mode
///
/// Checks run in a fixed order: model loaded (500), admission slot free
/// (503), body well-formed (400). The body is parsed here rather than by an
/// extractor so that a busy gateway answers 503 whatever was sent.
pub async fn handle_chat(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    METRICS.http.requests_total.inc();

    if !state.engine.is_initialized() {
        return Err(GatewayError::NotInitialized.into());
    }

    let slot = state.gate.try_acquire().map_err(|e| {
        METRICS.http.rejected_busy.inc();
        e
    })?;

    let request: ChatRequest = serde_json::from_slice(&body).map_err(|e| {
        METRICS.http.rejected_invalid.inc();
        GatewayError::invalid_request(e.to_string())
    })?;

    let meta = ResponseMeta::new();
    info!(
        "Request {} admitted: {} message(s), stream={}",
        meta.id,
        request.messages.len(),
        request.stream
    );
    for (index, message) in request.messages.iter().enumerate() {
        debug!("Message {} ({}): {} bytes", index, message.role, message.content.len());
    }

    if request.stream {
        METRICS.http.streaming_requests.inc();
        return Ok(projector::stream(
            state.engine.clone(),
            slot,
            request.messages,
            meta,
        ));
    }

    let timer = METRICS.http.request_duration.start_timer();
    let completion = projector::aggregate(state.engine.clone(), slot, request.messages, meta).await?;
    timer.observe_duration();

    Ok(Json(completion).into_response())
}
