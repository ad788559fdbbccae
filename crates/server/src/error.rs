//! HTTP error mapping

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use rkserve_common::GatewayError;
use rkserve_proto::ErrorEnvelope;
use tracing::error;

/// A gateway error on its way out as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() && !matches!(self.0, GatewayError::Busy) {
            error!("Request failed: {}", self.0);
        }

        (status, Json(ErrorEnvelope::new(self.0.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (GatewayError::Busy, StatusCode::SERVICE_UNAVAILABLE),
            (GatewayError::NotInitialized, StatusCode::INTERNAL_SERVER_ERROR),
            (
                GatewayError::invalid_request("missing field `messages`"),
                StatusCode::BAD_REQUEST,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError(err).into_response().status(), expected);
        }
    }
}
