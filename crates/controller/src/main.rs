//! # CWMP Controller
//!
//! Starts the Device Command Bridge and serves the REST API.
//!
//! ## Startup Sequence
//!
//! 1. Initialize logging (`RUST_LOG`, default `info`)
//! 2. Load configuration (defaults, then environment)
//! 3. Connect the message bus and start the bridge
//! 4. Serve REST until Ctrl+C, then drain outstanding device commands

use std::sync::Arc;

use anyhow::{Context, Result};
use cwmp_bridge::Bridge;
use cwmp_bus::InMemoryEventBus;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use controller::{load_config, router};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Load configuration
    let config = load_config();

    // The broker transport is deployment-specific; the in-memory bus is what
    // an embedded ACS (or a broker bridge task) attaches to.
    let bus = Arc::new(InMemoryEventBus::new());

    let bridge = Arc::new(
        Bridge::new(config.bridge.clone(), Arc::clone(&bus))
            .context("invalid bridge configuration")?,
    );
    bridge.start().context("failed to start device command bridge")?;

    let addr = config.rest_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind REST listener on {addr}"))?;
    info!(addr = %addr, "Controller REST API listening");

    let app = router(Arc::clone(&bridge), config.request_timeout);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
            // Cancels outstanding commands so in-flight requests finish now
            bridge.shutdown().await;
        })
        .await
        .context("REST server error")?;

    bus.close();
    info!("Controller stopped");

    Ok(())
}
