//! Folder sync cycle.
//!
//! One cycle brings the stored state of a `(device, folder)` pair up to date
//! with a fresh item list:
//!
//! 1. hold the folder mutex for the whole cycle
//! 2. load the state at the client's counter (none on a first sync)
//! 3. diff it against the fresh items and apply every change
//! 4. persist the result at the next counter
//!
//! The next read at the new counter purges the older snapshots.

use crate::error::{StoreError, SyncCycleError};
use crate::interprocess::InterProcessData;
use crate::ipc::{IpcProvider, IpcType};
use crate::storage::StateStore;
use std::sync::Arc;
use zstate_core::DiffState;
use zstate_types::{Counter, DeviceId, DiffChange, StateKey, StateType, SyncItemRef};

/// Result of one sync cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    /// Changes the client must apply, in order.
    pub changes: Vec<DiffChange>,
    /// Counter the new state was stored under.
    pub counter: Counter,
}

/// Runs sync cycles against one store and one IPC provider.
pub struct FolderSync<S: StateStore> {
    store: Arc<S>,
    provider: Arc<dyn IpcProvider>,
}

impl<S: StateStore> FolderSync<S> {
    /// Cycle runner over `store`, serialized through `provider`.
    pub fn new(store: Arc<S>, provider: Arc<dyn IpcProvider>) -> Self {
        Self { store, provider }
    }

    /// Synchronize `folder` of `device` from `counter` to `items`.
    pub async fn run(
        &self,
        device: &DeviceId,
        folder: &str,
        counter: Counter,
        items: &[SyncItemRef],
    ) -> Result<SyncOutcome, SyncCycleError> {
        let ipc = InterProcessData::with_provider(
            IpcType::for_folder(device, folder),
            Arc::clone(&self.provider),
        );

        let guard = ipc.lock().await.ok_or_else(|| {
            tracing::warn!(%device, folder, "Folder is locked by another request");
            SyncCycleError::MutexTimeout
        })?;

        let result = self.cycle(device, folder, counter, items).await;
        guard.release().await;
        result
    }

    async fn cycle(
        &self,
        device: &DeviceId,
        folder: &str,
        counter: Counter,
        items: &[SyncItemRef],
    ) -> Result<SyncOutcome, SyncCycleError> {
        let key = StateKey::new(device.clone(), StateType::FolderData)
            .with_uuid(folder)
            .with_counter(counter);

        let held = match self.store.get_state(&key, true).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound { .. }) if counter == Counter::zero() => {
                tracing::debug!(%device, folder, "First sync of folder");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let mut engine = DiffState::new();
        engine.config_from_bytes(held.as_deref(), 0)?;
        let changes = engine.get_diff_to(items)?;
        engine.apply_diff(&changes, items)?;

        let next = counter.next();
        let bytes = engine.to_bytes()?;
        self.store
            .set_state(&key.with_counter(next), &bytes)
            .await?;

        tracing::info!(
            %device,
            folder,
            changes = changes.len(),
            counter = next.value(),
            "Folder synchronized"
        );

        Ok(SyncOutcome {
            changes,
            counter: next,
        })
    }
}
