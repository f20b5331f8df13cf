//! Configuration loading for zstate-store.
//!
//! Configuration is loaded from a TOML file (default: `zstate.toml`). Every
//! section and field is optional.

use crate::ipc::ProviderKind;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for zstate-store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// State store configuration.
    #[serde(default)]
    pub store: StoreConfig,
    /// Interprocess coordination configuration.
    #[serde(default)]
    pub ipc: IpcConfig,
    /// Device pre-authorization policy.
    #[serde(default)]
    pub permissions: PermissionsConfig,
    /// Cleanup task configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// State store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Connection pool size (default: 10).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a statement waits on a locked database (default: 5).
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

/// Interprocess coordination configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IpcConfig {
    /// Explicit provider; probes the load order when absent.
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    /// Path to the shared IPC database file.
    #[serde(default = "default_ipc_database")]
    pub database: PathBuf,
    /// Namespace prefix of every IPC key.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Lifetime of a mutex and maximum time to wait for it (default: 5).
    #[serde(default = "default_mutex_timeout_secs")]
    pub mutex_timeout_secs: u64,
    /// Poll interval while waiting for a mutex (default: 10).
    #[serde(default = "default_block_wait_ms")]
    pub block_wait_ms: u64,
    /// Timeout for opening the IPC backend (default: 100).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// File recording that the IPC backend is down.
    #[serde(default = "default_down_lock_file")]
    pub down_lock_file: PathBuf,
    /// How long the backend stays marked down (default: 30).
    #[serde(default = "default_down_lock_expiration_secs")]
    pub down_lock_expiration_secs: u64,
}

/// Device pre-authorization policy.
#[derive(Debug, Clone, Deserialize)]
pub struct PermissionsConfig {
    /// Authorize users seen for the first time (default: false).
    #[serde(default)]
    pub pre_authorize_new_users: bool,
    /// Authorize devices seen for the first time (default: false).
    #[serde(default)]
    pub pre_authorize_new_devices: bool,
    /// Maximum authorized devices per user (default: 5).
    #[serde(default = "default_max_devices")]
    pub max_devices: u32,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Cleanup interval in seconds (default: 300).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("zstate.db")
}

fn default_max_connections() -> u32 {
    10
}

fn default_busy_timeout_secs() -> u64 {
    5
}

fn default_ipc_database() -> PathBuf {
    std::env::temp_dir().join("zstate-ipc.db")
}

fn default_prefix() -> String {
    "zstate-ipc".to_string()
}

fn default_mutex_timeout_secs() -> u64 {
    5
}

fn default_block_wait_ms() -> u64 {
    10
}

fn default_connect_timeout_ms() -> u64 {
    100
}

fn default_down_lock_file() -> PathBuf {
    std::env::temp_dir().join("zstate-ipc-down")
}

fn default_down_lock_expiration_secs() -> u64 {
    30
}

fn default_max_devices() -> u32 {
    5
}

fn default_cleanup_interval() -> u64 {
    300 // 5 minutes
}

fn default_cleanup_enabled() -> bool {
    true
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            max_connections: default_max_connections(),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            provider: None,
            database: default_ipc_database(),
            prefix: default_prefix(),
            mutex_timeout_secs: default_mutex_timeout_secs(),
            block_wait_ms: default_block_wait_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            down_lock_file: default_down_lock_file(),
            down_lock_expiration_secs: default_down_lock_expiration_secs(),
        }
    }
}

impl IpcConfig {
    /// Mutex lifetime and wait limit.
    pub fn mutex_timeout(&self) -> Duration {
        Duration::from_secs(self.mutex_timeout_secs)
    }

    /// Poll interval while waiting for a mutex.
    pub fn block_wait(&self) -> Duration {
        Duration::from_millis(self.block_wait_ms)
    }

    /// Timeout for opening the backend.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Length of a down window.
    pub fn down_lock_expiration(&self) -> Duration {
        Duration::from_secs(self.down_lock_expiration_secs)
    }
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            pre_authorize_new_users: false,
            pre_authorize_new_devices: false,
            max_devices: default_max_devices(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            enabled: default_cleanup_enabled(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the mutex loop cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ipc.block_wait_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "ipc.block_wait_ms",
                reason: "must be greater than 0".into(),
            });
        }
        if self.ipc.mutex_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "ipc.mutex_timeout_secs",
                reason: "must be greater than 0".into(),
            });
        }
        if self.cleanup.enabled && self.cleanup.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "cleanup.interval_secs",
                reason: "must be greater than 0 when cleanup is enabled".into(),
            });
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ipc.prefix, "zstate-ipc");
        assert_eq!(config.ipc.mutex_timeout(), Duration::from_secs(5));
        assert_eq!(config.ipc.block_wait(), Duration::from_millis(10));
        assert_eq!(config.ipc.connect_timeout(), Duration::from_millis(100));
        assert_eq!(config.ipc.down_lock_expiration(), Duration::from_secs(30));
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[store]
database = "/var/lib/zstate/state.db"
max_connections = 4

[ipc]
provider = "memory"
prefix = "test-ipc"
mutex_timeout_secs = 2
block_wait_ms = 5

[permissions]
pre_authorize_new_users = true
pre_authorize_new_devices = true
max_devices = 2

[cleanup]
interval_secs = 60

[logging]
filter = "zstate_store=debug"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.store.database, PathBuf::from("/var/lib/zstate/state.db"));
        assert_eq!(config.store.max_connections, 4);
        assert_eq!(config.ipc.provider, Some(ProviderKind::Memory));
        assert_eq!(config.ipc.prefix, "test-ipc");
        assert_eq!(config.ipc.block_wait_ms, 5);
        assert!(config.permissions.pre_authorize_new_users);
        assert_eq!(config.permissions.max_devices, 2);
        assert_eq!(config.cleanup.interval_secs, 60);
        assert_eq!(config.logging.filter, "zstate_store=debug");
    }

    #[test]
    fn config_missing_sections_use_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.store.busy_timeout_secs, 5);
        assert_eq!(config.ipc.provider, None);
        assert!(!config.permissions.pre_authorize_new_devices);
        assert!(config.cleanup.enabled);
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let config: Config = toml::from_str("[ipc]\nblock_wait_ms = 0\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "ipc.block_wait_ms",
                ..
            })
        ));
    }

    #[test]
    fn zero_mutex_timeout_rejected() {
        let config: Config = toml::from_str("[ipc]\nmutex_timeout_secs = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reports_missing_file() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/zstate.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn from_file_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zstate.toml");
        std::fs::write(&path, "[ipc]\nblock_wait_ms = 0\n").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
