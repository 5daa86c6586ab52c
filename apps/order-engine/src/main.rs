//! Order Engine Binary
//!
//! Starts the tiller order engine against the paper exchange.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin order-engine
//! ```
//!
//! # Environment Variables
//!
//! - `TILLER_CONFIG`: config file path (default: `config.yaml` when present)
//! - `TILLER_DRY_RUN`: `1`/`true` forces broker dry-run mode
//! - `RUST_LOG`: log filter (default: `info`)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use order_engine::adapter::PaperExchange;
use order_engine::config::EngineConfig;
use order_engine::service::ServiceRunner;
use order_engine::store::{OrderStore, PositionStore, SqliteStore};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = EngineConfig::load(None).context("loading configuration")?;
    let store =
        Arc::new(SqliteStore::open(&config.store.path).context("opening the order store")?);

    // The composition root owns every component and the adapter lifecycle.
    let adapter = Arc::new(PaperExchange::new());
    let runner = ServiceRunner::new(
        adapter,
        Arc::clone(&store) as Arc<dyn OrderStore>,
        Some(Arc::clone(&store) as Arc<dyn PositionStore>),
        &config,
    )
    .context("wiring the engine")?;

    runner.start().await.context("starting the engine")?;
    info!("order engine running; press ctrl-c to stop");

    signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");

    runner.stop(SHUTDOWN_TIMEOUT).await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
