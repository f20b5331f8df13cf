//! Background purge of expired IPC entries.
//!
//! Abandoned mutexes are already ignored once their deadline passes; the
//! purge only keeps the shared database from growing.

use crate::config::CleanupConfig;
use crate::ipc::IpcProvider;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Spawn a background cleanup task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    provider: Arc<dyn IpcProvider>,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        let interval_secs = config.interval_secs;
        tracing::info!(interval_secs, "Cleanup task started");

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            timer.tick().await;

            let purged = provider.purge_expired().await;
            if purged > 0 {
                tracing::info!(purged, provider = provider.name(), "Cleanup: purged expired IPC entries");
            } else {
                tracing::debug!("Cleanup: nothing expired");
            }
        }
    })
}
