//! Per-subsystem façade over an [`IpcProvider`].
//!
//! A subsystem owns one [`InterProcessData`] for its [`IpcType`]. Every call
//! degrades to `false` / `None` when no provider could be constructed, so
//! callers check [`InterProcessData::is_active`] before relying on shared
//! state.
//!
//! [`InterProcessData::block_mutex`] keeps the acquired [`MutexToken`] so a
//! later [`InterProcessData::release_mutex`] only frees a mutex this façade
//! still owns.

use crate::config::IpcConfig;
use crate::ipc::{select_provider, IpcProvider, IpcType, MutexToken, DEFAULT_DATA_ID};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared mutex and data slots for one [`IpcType`].
#[derive(Clone)]
pub struct InterProcessData {
    ipc_type: IpcType,
    provider: Option<Arc<dyn IpcProvider>>,
    held: Arc<Mutex<Option<MutexToken>>>,
}

impl std::fmt::Debug for InterProcessData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterProcessData")
            .field("ipc_type", &self.ipc_type)
            .field("provider", &self.provider.as_ref().map(|p| p.name()))
            .finish()
    }
}

impl InterProcessData {
    /// Select a provider from `config`.
    ///
    /// Failure to construct one is logged; the façade is still returned.
    pub async fn new(ipc_type: IpcType, config: &IpcConfig) -> Self {
        let provider = match select_provider(config).await {
            Ok(provider) => Some(provider),
            Err(e) => {
                tracing::error!(%ipc_type, error = %e, "No IPC provider available");
                None
            }
        };
        Self::from_parts(ipc_type, provider)
    }

    /// Use an already constructed provider.
    pub fn with_provider(ipc_type: IpcType, provider: Arc<dyn IpcProvider>) -> Self {
        Self::from_parts(ipc_type, Some(provider))
    }

    /// Façade with no backend; every call degrades.
    pub fn without_provider(ipc_type: IpcType) -> Self {
        Self::from_parts(ipc_type, None)
    }

    fn from_parts(ipc_type: IpcType, provider: Option<Arc<dyn IpcProvider>>) -> Self {
        Self {
            ipc_type,
            provider,
            held: Arc::new(Mutex::new(None)),
        }
    }

    fn held(&self) -> MutexGuard<'_, Option<MutexToken>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Partition this façade works on.
    pub fn ipc_type(&self) -> IpcType {
        self.ipc_type
    }

    /// Name of the selected provider.
    pub fn provider_name(&self) -> Option<&'static str> {
        self.provider.as_ref().map(|p| p.name())
    }

    /// Remove every data slot of this type.
    pub async fn clean(&self) -> bool {
        match &self.provider {
            Some(p) => p.clean(self.ipc_type).await,
            None => false,
        }
    }

    /// True when a provider exists and its backend is reachable.
    pub async fn is_active(&self) -> bool {
        match &self.provider {
            Some(p) => p.is_active().await,
            None => false,
        }
    }

    /// Acquire the mutex of this type.
    pub async fn block_mutex(&self) -> bool {
        let Some(p) = &self.provider else {
            return false;
        };
        match p.block_mutex(self.ipc_type).await {
            Some(token) => {
                *self.held() = Some(token);
                true
            }
            None => false,
        }
    }

    /// Release the mutex of this type if this façade holds it.
    pub async fn release_mutex(&self) -> bool {
        let Some(p) = &self.provider else {
            return false;
        };
        let token = self.held().take();
        match token {
            Some(token) => p.release_mutex(self.ipc_type, &token).await,
            None => {
                tracing::debug!(ipc_type = %self.ipc_type, "Mutex not held here, nothing to release");
                true
            }
        }
    }

    /// True when slot `id` holds a value.
    pub async fn has_data(&self, id: u32) -> bool {
        match &self.provider {
            Some(p) => p.has_data(self.ipc_type, id).await,
            None => false,
        }
    }

    /// Raw value of slot `id`.
    pub async fn get_data(&self, id: u32) -> Option<String> {
        match &self.provider {
            Some(p) => p.get_data(self.ipc_type, id).await,
            None => None,
        }
    }

    /// Store a raw value in slot `id`.
    pub async fn set_data(&self, data: &str, id: u32) -> bool {
        match &self.provider {
            Some(p) => p.set_data(self.ipc_type, id, data).await,
            None => false,
        }
    }

    /// Decode the JSON value of the default slot.
    pub async fn get_value<T: DeserializeOwned>(&self) -> Option<T> {
        let raw = self.get_data(DEFAULT_DATA_ID).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(ipc_type = %self.ipc_type, error = %e, "Undecodable IPC value");
                None
            }
        }
    }

    /// Encode `value` as JSON into the default slot.
    pub async fn set_value<T: Serialize + ?Sized>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(raw) => self.set_data(&raw, DEFAULT_DATA_ID).await,
            Err(e) => {
                tracing::warn!(ipc_type = %self.ipc_type, error = %e, "Unencodable IPC value");
                false
            }
        }
    }

    /// Acquire the mutex and return a guard that releases it.
    pub async fn lock(&self) -> Option<IpcMutexGuard> {
        let provider = self.provider.as_ref()?;
        let token = provider.block_mutex(self.ipc_type).await?;
        Some(IpcMutexGuard {
            ipc_type: self.ipc_type,
            token,
            provider: Some(Arc::clone(provider)),
        })
    }

    /// Run `f` while holding the mutex.
    ///
    /// Returns `None` without running `f` when the mutex could not be
    /// acquired. The mutex is released whatever `f` returns.
    pub async fn locked<F, Fut, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.lock().await?;
        let out = f().await;
        guard.release().await;
        Some(out)
    }
}

/// Held mutex of one [`IpcType`].
///
/// Call [`release`](Self::release) when done. A guard dropped without it
/// schedules the release on the current tokio runtime; outside a runtime the
/// mutex is left to expire.
pub struct IpcMutexGuard {
    ipc_type: IpcType,
    token: MutexToken,
    provider: Option<Arc<dyn IpcProvider>>,
}

impl IpcMutexGuard {
    /// Partition whose mutex is held.
    pub fn ipc_type(&self) -> IpcType {
        self.ipc_type
    }

    /// Release the mutex.
    pub async fn release(mut self) -> bool {
        match self.provider.take() {
            Some(provider) => provider.release_mutex(self.ipc_type, &self.token).await,
            None => false,
        }
    }
}

impl Drop for IpcMutexGuard {
    fn drop(&mut self) {
        let Some(provider) = self.provider.take() else {
            return;
        };
        let ipc_type = self.ipc_type;
        let token = self.token.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    provider.release_mutex(ipc_type, &token).await;
                });
            }
            Err(_) => {
                tracing::warn!(%ipc_type, "Mutex guard dropped outside a runtime, leaving it to expire");
            }
        }
    }
}
