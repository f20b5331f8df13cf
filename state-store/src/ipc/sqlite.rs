//! IPC provider backed by a shared SQLite database file.
//!
//! Every process opening the same file shares the mutexes and data slots.
//! A mutex is a row with a deadline; acquiring it is a single upsert that
//! only succeeds when the row is absent or its deadline has passed, so a
//! crashed holder never blocks others for longer than the mutex timeout.
//! The row stores the holder's token and release deletes it only while the
//! token still matches.

use super::{
    data_key, mutex_key, partition_prefix, DownMarker, IpcProvider, IpcType, MutexPolicy,
    MutexToken,
};
use crate::config::IpcConfig;
use crate::error::IpcError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// IPC provider over a shared SQLite file.
#[derive(Clone)]
pub struct SqliteIpcProvider {
    pool: SqlitePool,
    prefix: String,
    policy: MutexPolicy,
    down: Arc<dyn DownMarker>,
    down_expiration: Duration,
    was_down: Arc<AtomicBool>,
}

impl SqliteIpcProvider {
    /// Open the shared database described by `config`.
    pub async fn connect(
        config: &IpcConfig,
        down: Arc<dyn DownMarker>,
    ) -> Result<Self, IpcError> {
        let unavailable = |reason: String| IpcError::ProviderUnavailable {
            provider: "sqlite",
            reason,
        };

        if let Some(parent) = config.database.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| unavailable(format!("cannot create {}: {e}", parent.display())))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.database)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(config.mutex_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(config.connect_timeout())
            .connect_with(options)
            .await
            .map_err(|e| unavailable(format!("{}: {e}", config.database.display())))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ipc_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| unavailable(e.to_string()))?;

        let was_down = down.is_down();
        Ok(Self {
            pool,
            prefix: config.prefix.clone(),
            policy: MutexPolicy::from_config(config),
            down,
            down_expiration: config.down_lock_expiration(),
            was_down: Arc::new(AtomicBool::new(was_down)),
        })
    }

    /// Override the mutex wait policy.
    pub fn with_policy(mut self, policy: MutexPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override how long the backend stays marked down after a failure.
    pub fn with_down_expiration(mut self, expiration: Duration) -> Self {
        self.down_expiration = expiration;
        self
    }

    fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// One atomic insert-if-absent-or-expired attempt.
    async fn try_acquire(&self, key: &str, token: &str) -> bool {
        let now = Self::now_millis();
        let expires_at = now + self.policy.timeout.as_millis() as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO ipc_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE
            SET value = excluded.value, expires_at = excluded.expires_at
            WHERE ipc_entries.expires_at IS NOT NULL AND ipc_entries.expires_at <= ?4
            "#,
        )
        .bind(key)
        .bind(token)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => done.rows_affected() == 1,
            Err(e) => {
                tracing::debug!(key, error = %e, "Mutex attempt failed");
                false
            }
        }
    }
}

#[async_trait]
impl IpcProvider for SqliteIpcProvider {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn is_active(&self) -> bool {
        let down = self.down.is_down();
        if !down && self.was_down.swap(false, Ordering::SeqCst) {
            tracing::debug!("IPC backend was down, trying to reconnect");
        }
        !down
    }

    async fn block_mutex(&self, ipc_type: IpcType) -> Option<MutexToken> {
        if !self.is_active().await {
            return None;
        }

        let key = mutex_key(&self.prefix, ipc_type);
        let key = key.as_str();
        let token = MutexToken::new();
        let value = token.as_str();
        let this = self;
        let acquired = self
            .policy
            .spin(ipc_type, move || this.try_acquire(key, value))
            .await;

        if !acquired {
            self.down.mark_down(self.down_expiration);
            self.was_down.store(true, Ordering::SeqCst);
            return None;
        }
        Some(token)
    }

    async fn release_mutex(&self, ipc_type: IpcType, token: &MutexToken) -> bool {
        let result = sqlx::query("DELETE FROM ipc_entries WHERE key = ?1 AND value = ?2")
            .bind(mutex_key(&self.prefix, ipc_type))
            .bind(token.as_str())
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) => {
                if done.rows_affected() == 0 {
                    tracing::debug!(%ipc_type, "Mutex not held by this token, nothing to release");
                }
                true
            }
            Err(e) => {
                tracing::warn!(%ipc_type, error = %e, "Could not release mutex");
                false
            }
        }
    }

    async fn has_data(&self, ipc_type: IpcType, id: u32) -> bool {
        self.get_data(ipc_type, id).await.is_some()
    }

    async fn get_data(&self, ipc_type: IpcType, id: u32) -> Option<String> {
        let result = sqlx::query_scalar::<_, String>(
            r#"
            SELECT value FROM ipc_entries
            WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)
            "#,
        )
        .bind(data_key(&self.prefix, ipc_type, id))
        .bind(Self::now_millis())
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(%ipc_type, id, error = %e, "Could not read IPC data");
                None
            }
        }
    }

    async fn set_data(&self, ipc_type: IpcType, id: u32, data: &str) -> bool {
        let result = sqlx::query(
            r#"
            INSERT INTO ipc_entries (key, value, expires_at) VALUES (?1, ?2, NULL)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = NULL
            "#,
        )
        .bind(data_key(&self.prefix, ipc_type, id))
        .bind(data)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(%ipc_type, id, error = %e, "Could not write IPC data");
                false
            }
        }
    }

    async fn clean(&self, ipc_type: IpcType) -> bool {
        let prefix = partition_prefix(&self.prefix, ipc_type);
        let result = sqlx::query("DELETE FROM ipc_entries WHERE substr(key, 1, length(?1)) = ?1")
            .bind(prefix)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(%ipc_type, error = %e, "Could not clean IPC data");
                false
            }
        }
    }

    async fn purge_expired(&self) -> u64 {
        let result = sqlx::query(
            "DELETE FROM ipc_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        )
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => done.rows_affected(),
            Err(e) => {
                tracing::error!(error = %e, "Could not purge expired IPC entries");
                0
            }
        }
    }
}
