//! Interprocess coordination.
//!
//! An [`IpcProvider`] offers named mutexes and a small key/value space
//! shared by every process serving the same deployment. Keys are
//! partitioned by an [`IpcType`]; callers usually go through
//! [`InterProcessData`](crate::InterProcessData) instead of talking to a
//! provider directly.
//!
//! Backend failures never surface as errors here: they degrade to `false`
//! or `None` so callers can fall back.

mod down;
mod memory;
mod sqlite;

pub use down::{DownMarker, FileDownMarker, MemoryDownMarker};
pub use memory::{MemoryIpcProvider, MemorySegment};
pub use sqlite::SqliteIpcProvider;

use crate::config::IpcConfig;
use crate::error::IpcError;
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use zstate_types::DeviceId;

/// Data slot used when a caller does not name one.
pub const DEFAULT_DATA_ID: u32 = 2;

/// Offset between a type and the key of its mutex.
const MUTEX_OFFSET: u64 = 10;

/// Waits longer than this are logged when the mutex is finally acquired.
const SLOW_ACQUIRE: Duration = Duration::from_millis(50);

/// Partition of the shared mutex and key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpcType(pub u32);

impl IpcType {
    /// Partition guarding the state of one folder of one device.
    pub fn for_folder(device_id: &DeviceId, folder: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(device_id.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(folder.as_bytes());
        let digest = hasher.finalize();
        Self(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
    }
}

impl fmt::Display for IpcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof of one mutex acquisition.
///
/// Stored as the mutex value; only the matching token releases it, so a
/// holder whose mutex already expired cannot free its successor's.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MutexToken(String);

impl MutexToken {
    /// Fresh random token.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Token as stored by a provider.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MutexToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutexToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of the mutex guarding `ipc_type`.
pub(crate) fn mutex_key(prefix: &str, ipc_type: IpcType) -> String {
    format!("{prefix}:{}", u64::from(ipc_type.0) + MUTEX_OFFSET)
}

/// Key of data slot `id` of `ipc_type`.
pub(crate) fn data_key(prefix: &str, ipc_type: IpcType, id: u32) -> String {
    format!("{prefix}:{ipc_type}:{id}")
}

/// Prefix shared by every data key of `ipc_type`.
pub(crate) fn partition_prefix(prefix: &str, ipc_type: IpcType) -> String {
    format!("{prefix}:{ipc_type}:")
}

/// Shared lock and key/value backend.
#[async_trait]
pub trait IpcProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// False while the provider considers its backend unreachable.
    async fn is_active(&self) -> bool;

    /// Acquire the mutex of `ipc_type`, waiting up to the mutex timeout.
    ///
    /// The mutex lapses on its own after the mutex timeout.
    async fn block_mutex(&self, ipc_type: IpcType) -> Option<MutexToken>;

    /// Release the mutex of `ipc_type` if `token` still owns it.
    ///
    /// Releasing a free mutex, or one taken over after expiry, is a no-op.
    async fn release_mutex(&self, ipc_type: IpcType, token: &MutexToken) -> bool;

    /// True when slot `id` holds a value.
    async fn has_data(&self, ipc_type: IpcType, id: u32) -> bool;

    /// Value of slot `id`.
    async fn get_data(&self, ipc_type: IpcType, id: u32) -> Option<String>;

    /// Store `data` in slot `id`.
    async fn set_data(&self, ipc_type: IpcType, id: u32, data: &str) -> bool;

    /// Remove every data slot of `ipc_type`.
    async fn clean(&self, ipc_type: IpcType) -> bool;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> u64;
}

/// Available provider implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Shared SQLite database file; works across processes.
    Sqlite,
    /// In-process segment; single-process deployments and tests.
    Memory,
}

impl ProviderKind {
    /// Probe order when no provider is configured.
    pub const LOAD_ORDER: [ProviderKind; 2] = [ProviderKind::Sqlite, ProviderKind::Memory];

    /// Provider name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Memory => "memory",
        }
    }

    /// Construct this provider.
    pub async fn connect(&self, config: &IpcConfig) -> Result<Arc<dyn IpcProvider>, IpcError> {
        match self {
            Self::Sqlite => {
                let down = Arc::new(FileDownMarker::new(&config.down_lock_file));
                let provider = SqliteIpcProvider::connect(config, down).await?;
                Ok(Arc::new(provider))
            }
            Self::Memory => Ok(Arc::new(MemoryIpcProvider::new(config))),
        }
    }
}

/// Construct the configured provider, or the first one of
/// [`ProviderKind::LOAD_ORDER`] that can be constructed.
pub async fn select_provider(config: &IpcConfig) -> Result<Arc<dyn IpcProvider>, IpcError> {
    let candidates: &[ProviderKind] = match &config.provider {
        Some(kind) => std::slice::from_ref(kind),
        None => &ProviderKind::LOAD_ORDER,
    };

    for kind in candidates {
        match kind.connect(config).await {
            Ok(provider) => {
                tracing::info!(provider = kind.name(), "Using IPC provider");
                return Ok(provider);
            }
            Err(e) => {
                tracing::warn!(provider = kind.name(), error = %e, "IPC provider unavailable");
            }
        }
    }

    Err(IpcError::NoProvider)
}

/// Bounded spin-wait used to acquire a mutex.
///
/// Waiters poll; there is no queue, so the last one to retry may win.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexPolicy {
    /// Mutex lifetime, and the longest a caller waits for it.
    pub timeout: Duration,
    /// Pause between attempts. Must not be zero.
    pub poll_interval: Duration,
}

impl MutexPolicy {
    /// Policy from configuration.
    pub fn from_config(config: &IpcConfig) -> Self {
        Self {
            timeout: config.mutex_timeout(),
            poll_interval: config.block_wait(),
        }
    }

    fn poll_ms(&self) -> u64 {
        (self.poll_interval.as_millis() as u64).max(1)
    }

    /// Failed attempts tolerated before giving up.
    pub fn max_wait_cycles(&self) -> u64 {
        self.timeout.as_millis() as u64 / self.poll_ms() + 1
    }

    /// Every this many failed attempts a progress line is logged.
    pub fn log_wait_cycles(&self) -> u64 {
        (self.max_wait_cycles() / 5).max(1)
    }

    /// Retry `attempt` until it succeeds or the cycles are exhausted.
    pub async fn spin<F, Fut>(&self, ipc_type: IpcType, mut attempt: F) -> bool
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = bool> + Send,
    {
        let max_wait = self.max_wait_cycles();
        let log_wait = self.log_wait_cycles();
        let started = Instant::now();
        let mut cycles = 0u64;

        while !attempt().await {
            cycles += 1;
            if cycles % log_wait == 0 {
                tracing::warn!(%ipc_type, cycles, "Waiting to acquire mutex");
            }

            tokio::time::sleep(self.poll_interval).await;

            if cycles > max_wait {
                tracing::error!(%ipc_type, cycles, "Could not acquire mutex");
                return false;
            }
        }

        let waited = started.elapsed();
        if waited > SLOW_ACQUIRE {
            tracing::warn!(%ipc_type, waited_ms = waited.as_millis() as u64, "Mutex acquired after waiting");
        }
        true
    }
}
