//! Generation engine adapter
//!
//! Wraps a blocking, callback-driven backend behind `start(input) -> session`.
//! Each run executes on its own blocking thread while the caller drains the
//! session concurrently.

use crate::input::EngineInput;
use crate::session::{self, FragmentSink, GenerationSession};
use parking_lot::RwLock;
use rkserve_common::metrics::LatencyTimer;
use rkserve_common::{GatewayError, Result, METRICS};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A model runtime that turns one input into a stream of fragments
///
/// `run` blocks until the generation is over. It reports output through the
/// sink, and may report terminal status there too; an `Err` return is turned
/// into a failure of the session.
pub trait GenerationBackend: Send + Sync {
    /// Run one generation to completion
    fn run(&self, input: &EngineInput, sink: &FragmentSink) -> Result<()>;

    /// Free all runtime resources; no `run` may follow
    fn release(&self) -> Result<()>;

    /// Human-readable backend name for logs
    fn name(&self) -> &str {
        "backend"
    }
}

enum EngineState {
    Uninitialized,
    Ready(Arc<dyn GenerationBackend>),
    Released,
}

/// Process-wide owner of the loaded model
///
/// Initialized at most once and released at most once. Concurrency is not
/// limited here; callers go through the admission gate first.
pub struct GenerationEngine {
    state: RwLock<EngineState>,
}

impl GenerationEngine {
    /// Create an engine with no model loaded
    pub fn new() -> Self {
        Self {
            state: RwLock::new(EngineState::Uninitialized),
        }
    }

    /// Create an engine that is already initialized with `backend`
    pub fn with_backend(backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            state: RwLock::new(EngineState::Ready(backend)),
        }
    }

    /// Install the backend
    ///
    /// Fails with [`GatewayError::AlreadyInitialized`] on every call after the
    /// first, including after release.
    pub fn initialize(&self, backend: Arc<dyn GenerationBackend>) -> Result<()> {
        let mut state = self.state.write();
        match &*state {
            EngineState::Uninitialized => {
                info!("Engine initialized with {}", backend.name());
                *state = EngineState::Ready(backend);
                Ok(())
            }
            EngineState::Ready(_) | EngineState::Released => {
                warn!("Ignoring repeated engine initialization");
                Err(GatewayError::AlreadyInitialized)
            }
        }
    }

    /// Whether a model is loaded and not yet released
    pub fn is_initialized(&self) -> bool {
        matches!(&*self.state.read(), EngineState::Ready(_))
    }

    /// Start a generation on its own blocking thread
    pub fn start(&self, input: EngineInput) -> Result<GenerationSession> {
        let backend = match &*self.state.read() {
            EngineState::Ready(backend) => Arc::clone(backend),
            EngineState::Uninitialized => return Err(GatewayError::NotInitialized),
            EngineState::Released => return Err(GatewayError::EngineReleased),
        };

        let id = Uuid::new_v4();
        let (sink, events) = session::channel();
        debug!("Session {} starting on {}", id, input.describe());
        METRICS.generation.generations_total.inc();

        let worker = tokio::task::spawn_blocking(move || {
            let result = METRICS
                .generation
                .generation_duration
                .observe_closure(|| backend.run(&input, &sink));

            match result {
                // A run that returns without a terminal callback is complete.
                Ok(()) => sink.finish(),
                Err(e) => {
                    error!("Generation {} failed: {}", id, e);
                    sink.fail(e.to_string());
                }
            }
        });

        Ok(GenerationSession::new(id, events, worker))
    }

    /// Release the backend exactly once
    ///
    /// Later calls are no-ops. Release errors are returned for logging; the
    /// engine counts as released either way.
    pub fn release(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.write(), EngineState::Released);
        match previous {
            EngineState::Ready(backend) => {
                info!("Releasing {} resources", backend.name());
                backend.release()
            }
            EngineState::Uninitialized | EngineState::Released => Ok(()),
        }
    }
}

impl Default for GenerationEngine {
    fn default() -> Self {
        Self::new()
    }
}
