//! Error types for zstate-store.

use zstate_types::{ErrorKind, StateKey};

/// Main error type for zstate-store operations.
#[derive(Debug, thiserror::Error)]
pub enum ZstateError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// State store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// IPC setup error.
    #[error("ipc error: {0}")]
    Ipc(#[from] IpcError),

    /// Folder sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncCycleError),
}

impl ZstateError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::Store(e) => e.kind(),
            Self::Ipc(e) => e.kind(),
            Self::Sync(e) => e.kind(),
        }
    }
}

/// State store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record matches the key.
    #[error("could not locate state {key}")]
    NotFound {
        /// The key that was looked up.
        key: String,
    },

    /// The database rejected a write.
    #[error("could not write state {key}: {source}")]
    WriteFailed {
        /// The key being written.
        key: String,
        /// Underlying database error.
        source: sqlx::Error,
    },

    /// The database could not be queried.
    #[error("state store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    /// Schema creation or connection setup failed.
    #[error("state store bootstrap failed: {reason}")]
    Bootstrap {
        /// What went wrong.
        reason: String,
    },

    /// A typed value could not be encoded.
    #[error("state encoding failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// A stored blob could not be decoded.
    #[error("state decoding failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl StoreError {
    pub(crate) fn not_found(key: &StateKey) -> Self {
        Self::NotFound {
            key: key.to_string(),
        }
    }

    pub(crate) fn write_failed(key: &StateKey, source: sqlx::Error) -> Self {
        Self::WriteFailed {
            key: key.to_string(),
            source,
        }
    }

    pub(crate) fn bootstrap(reason: impl std::fmt::Display) -> Self {
        Self::Bootstrap {
            reason: reason.to_string(),
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::WriteFailed { .. } => ErrorKind::WriteFailed,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Bootstrap { .. } => ErrorKind::Configuration,
            Self::Encode(_) | Self::Decode(_) => ErrorKind::InvalidInput,
        }
    }

    /// True for a lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// IPC provider construction errors.
///
/// Runtime IPC failures never surface as errors; they degrade to `false` or
/// `None` at the provider boundary.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// The provider could not open its backend.
    #[error("ipc provider {provider} unavailable: {reason}")]
    ProviderUnavailable {
        /// Provider name.
        provider: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// No provider in the load order could be constructed.
    #[error("no ipc provider available")]
    NoProvider,
}

impl IpcError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Unavailable
    }
}

/// Folder sync cycle errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncCycleError {
    /// The folder mutex could not be acquired in time. Retry later.
    #[error("timed out waiting for the folder lock")]
    MutexTimeout,

    /// Loading or persisting the state failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The held state was rejected by the engine.
    #[error(transparent)]
    Diff(#[from] zstate_core::DiffError),
}

impl SyncCycleError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MutexTimeout => ErrorKind::Unavailable,
            Self::Store(e) => e.kind(),
            Self::Diff(e) => e.kind(),
        }
    }

    /// True when the same request may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_transient()
    }
}

/// Result type alias for zstate-store operations.
pub type Result<T> = std::result::Result<T, ZstateError>;
