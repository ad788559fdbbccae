//! Health check handler

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// Report whether the model is loaded and whether a generation is in flight
pub async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "initialized": state.engine.is_initialized(),
        "busy": state.gate.is_busy(),
        "admitted": state.gate.admitted(),
        "rejected": state.gate.rejected(),
    }))
}
