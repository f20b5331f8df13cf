//! zstate-store binary entry point.
//!
//! Bootstraps the state store and the IPC backend, then keeps purging
//! expired IPC entries until interrupted.
//!
//! Usage:
//! ```bash
//! zstate-store --config zstate.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use zstate_store::cleanup::spawn_cleanup_task;
use zstate_store::config::Config;
use zstate_store::ipc::{FileDownMarker, SqliteIpcProvider};
use zstate_store::storage::{SqliteStateStore, StateStore};
use zstate_store::error::Result;
use zstate_store::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let path = get_config_path();
    let config = if path.exists() {
        Config::from_file(&path)?
    } else {
        Config::default()
    };
    logging::init(&config.logging);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = %path.display(), "Starting zstate-store");

    let store = SqliteStateStore::new(&config.store, config.permissions.clone()).await?;
    let version = store.get_state_version().await?;
    tracing::info!(%version, "State store bootstrapped");

    let down = Arc::new(FileDownMarker::new(&config.ipc.down_lock_file));
    let ipc = Arc::new(SqliteIpcProvider::connect(&config.ipc, down).await?);
    let cleanup = spawn_cleanup_task(ipc, config.cleanup.clone());

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Cannot listen for shutdown signal");
    }
    cleanup.abort();
    tracing::info!("Shutting down");
    Ok(())
}

fn get_config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("zstate.toml"))
}
