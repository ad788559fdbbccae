//! Common error types for RKServe
//!
//! This module defines all error types used across the gateway.
//! Every error maps onto an HTTP status so handlers can surface it directly.

use http::StatusCode;
use thiserror::Error;

/// Main error type for RKServe
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Native runtime library could not be loaded or is missing symbols
    #[error("Native library error: {0}")]
    Library(String),

    /// Native engine reported a failure
    #[error("Engine error: {0}")]
    Engine(String),

    /// No model has been loaded into the engine
    #[error("RKLLM model is not initialized!")]
    NotInitialized,

    /// The engine was already initialized once
    #[error("RKLLM model is already initialized")]
    AlreadyInitialized,

    /// The engine handle has been released
    #[error("RKLLM model has been released")]
    EngineReleased,

    /// A generation is already in flight
    #[error("RKLLM_Server is busy! Maybe you can try again later.")]
    Busy,

    /// Malformed request body
    #[error("Invalid JSON data! {0}")]
    InvalidRequest(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Convert error to the HTTP status surfaced to callers
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotInitialized
            | GatewayError::AlreadyInitialized
            | GatewayError::EngineReleased
            | GatewayError::Config(_)
            | GatewayError::Library(_)
            | GatewayError::Engine(_)
            | GatewayError::Serialization(_)
            | GatewayError::Io(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        GatewayError::Config(msg.into())
    }

    /// Create a native library error
    pub fn library(msg: impl Into<String>) -> Self {
        GatewayError::Library(msg.into())
    }

    /// Create an engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        GatewayError::Engine(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        GatewayError::InvalidRequest(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        GatewayError::Internal(msg.into())
    }
}

/// Result type alias for RKServe operations
pub type Result<T> = std::result::Result<T, GatewayError>;
