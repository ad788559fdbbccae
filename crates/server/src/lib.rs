//! RKServe Server
//!
//! HTTP front-end for an RKLLM model: admits one generation at a time and
//! returns its output either aggregated or as a stream of frames.

pub mod cli;
pub mod error;
pub mod handlers;
pub mod projector;
pub mod server;
pub mod state;

pub use cli::Args;
pub use error::ApiError;
pub use server::{create_router, run_server};
pub use state::AppState;
