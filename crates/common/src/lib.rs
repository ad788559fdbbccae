//! RKServe common library
//!
//! This crate contains shared code used across RKServe components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{GatewayConfig, TargetPlatform};
pub use error::{GatewayError, Result};
pub use metrics::{MetricsRegistry, METRICS};
