//! Prometheus exposition handler

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use rkserve_common::METRICS;

use crate::state::AppState;

pub async fn handle_metrics(State(state): State<AppState>) -> Response {
    if !state.config.observability.enable_metrics {
        return StatusCode::NOT_FOUND.into_response();
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.gather(),
    )
        .into_response()
}
