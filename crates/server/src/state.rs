//! Application state shared across handlers

use rkserve_common::GatewayConfig;
use rkserve_engine::{AdmissionGate, GenerationEngine};
use std::sync::Arc;

/// Explicit application context threaded through every handler
#[derive(Clone)]
pub struct AppState {
    /// The process-wide engine
    pub engine: Arc<GenerationEngine>,

    /// Single-flight gate in front of the engine
    pub gate: AdmissionGate,

    /// Effective configuration
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    pub fn new(engine: Arc<GenerationEngine>, config: GatewayConfig) -> Self {
        Self {
            engine,
            gate: AdmissionGate::new(),
            config: Arc::new(config),
        }
    }
}
