//! RKServe Server - Main Entry Point
//!
//! Loads the RKLLM model once, serves `/rkllm_chat` until a shutdown signal,
//! then releases the model.

use anyhow::Context;
use clap::Parser;
use rkserve_engine::{pin_frequency, GenerationEngine, NativeBackend};
use rkserve_server::{run_server, AppState, Args};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;

    // Initialize logging
    let level = &config.observability.log_level;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "rkserve_server={level},rkserve_engine={level},rkserve_common={level},\
                     tower_http=info,axum=info"
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting RKServe");

    config.validate()?;
    let addr: SocketAddr = config
        .listen_address()
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen_address()))?;

    info!(
        "Configuration loaded: model={}, platform={}, bind={}",
        config.model.model_path.display(),
        config
            .model
            .target_platform
            .map(|p| p.as_str())
            .unwrap_or("unset"),
        addr
    );

    pin_frequency(&config);

    // Load model
    let backend = NativeBackend::load(&config).context("RKLLM model initialization failed")?;
    let engine = Arc::new(GenerationEngine::new());
    engine.initialize(Arc::new(backend))?;

    let state = AppState::new(Arc::clone(&engine), config);
    info!("RKServe running");

    let served = run_server(state, addr).await;

    // Release waits for any generation still holding the handle.
    let release = tokio::task::spawn_blocking(move || engine.release()).await;
    match release {
        Ok(Ok(())) => info!("Model released"),
        Ok(Err(e)) => error!("Failed to release model: {}", e),
        Err(e) => error!("Release task failed: {}", e),
    }

    served?;
    info!("RKServe shutdown complete");
    Ok(())
}
