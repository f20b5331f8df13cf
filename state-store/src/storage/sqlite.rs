//! SQLite state store backend.

use super::{
    DevicePermission, LinkTimestamps, StateHash, StateInventoryEntry, StateStore, StateVersion,
};
use crate::config::{PermissionsConfig, StoreConfig};
use crate::error::StoreError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use zstate_types::{Counter, DeviceId, StateKey, StateType};

/// Settings key holding the state format version.
const VERSION_KEY: &str = "state_version";

/// `preauth_users.device_id` of the row that authorizes the user itself.
const USER_AUTH_ROW: &str = "authorized";

/// SQLite-based state store.
///
/// Uses WAL mode for concurrent reads/writes. Key-less states are stored
/// with an empty `uuid` so the unique index covers them too.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
    permissions: PermissionsConfig,
}

impl SqliteStateStore {
    /// Open (and bootstrap) the store described by `config`.
    ///
    /// Creates the database file and its parent directory if missing.
    pub async fn new(
        config: &StoreConfig,
        permissions: PermissionsConfig,
    ) -> Result<Self, StoreError> {
        let path = config.database.as_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::bootstrap(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| StoreError::bootstrap(format!("{}: {e}", path.display())))?;

        let store = Self { pool, permissions };
        store.run_migrations().await?;
        tracing::info!(database = %path.display(), "State store ready");
        Ok(store)
    }

    /// Open a store at `path` with default settings.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let config = StoreConfig {
            database: path.to_path_buf(),
            ..StoreConfig::default()
        };
        Self::new(&config, PermissionsConfig::default()).await
    }

    /// Create an in-memory SQLite store (for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StoreError::bootstrap)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StoreError::bootstrap)?;

        let store = Self {
            pool,
            permissions: PermissionsConfig::default(),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Replace the device pre-authorization policy.
    pub fn with_permissions(mut self, permissions: PermissionsConfig) -> Self {
        self.permissions = permissions;
        self
    }

    /// Create the schema. Safe to run concurrently and repeatedly.
    async fn run_migrations(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key_name TEXT PRIMARY KEY,
                key_value TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT NOT NULL,
                device_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (username, device_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS states (
                id_state INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                uuid TEXT NOT NULL DEFAULT '',
                state_type TEXT NOT NULL,
                counter INTEGER NOT NULL,
                state_data BLOB NOT NULL,
                revision INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_states_key ON states(device_id, uuid, state_type, counter)",
            r#"
            CREATE TABLE IF NOT EXISTS preauth_users (
                username TEXT NOT NULL,
                device_id TEXT NOT NULL,
                authorized INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (username, device_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS combined_usermap (
                username TEXT NOT NULL,
                backend TEXT NOT NULL,
                mappedname TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (username, backend)
            )
            "#,
        ];

        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(StoreError::bootstrap)?;
        }

        Ok(())
    }

    fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    fn stored_uuid(key: &StateKey) -> &str {
        key.uuid.as_deref().unwrap_or("")
    }

    /// Outcome of a new-device request under the configured policy, plus
    /// the authorization to record for it.
    fn new_device_decision(&self, authorized_devices: i64) -> (DevicePermission, Option<bool>) {
        if !self.permissions.pre_authorize_new_devices {
            (DevicePermission::DeviceBlockedForUser, Some(false))
        } else if i64::from(self.permissions.max_devices) > authorized_devices {
            (DevicePermission::Success, Some(true))
        } else {
            (DevicePermission::MaxDevicesReached, None)
        }
    }

    async fn check_permission(
        &self,
        username: &str,
        device_id: &DeviceId,
    ) -> Result<DevicePermission, sqlx::Error> {
        let authorized_devices: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM preauth_users
            WHERE username = ?1 AND device_id != ?2 AND authorized = 1
            "#,
        )
        .bind(username)
        .bind(USER_AUTH_ROW)
        .fetch_one(&self.pool)
        .await?;

        let authorization = |device: String| {
            sqlx::query_scalar::<_, bool>(
                "SELECT authorized FROM preauth_users WHERE username = ?1 AND device_id = ?2",
            )
            .bind(username.to_string())
            .bind(device)
        };

        let user = authorization(USER_AUTH_ROW.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let (status, new_user, new_device) = match user {
            Some(false) => {
                tracing::info!(username, device = %device_id, "Blocked user tried to sync");
                (DevicePermission::UserDisabledForSync, None, None)
            }
            Some(true) => {
                let device = authorization(device_id.as_str().to_string())
                    .fetch_optional(&self.pool)
                    .await?;
                match device {
                    Some(true) => (DevicePermission::Success, None, None),
                    Some(false) => {
                        tracing::info!(username, device = %device_id, "Blocked device");
                        (DevicePermission::DeviceBlockedForUser, None, None)
                    }
                    None => {
                        let (status, new_device) = self.new_device_decision(authorized_devices);
                        (status, None, new_device)
                    }
                }
            }
            None if self.permissions.pre_authorize_new_users => {
                let (status, new_device) = self.new_device_decision(authorized_devices);
                (status, Some(true), new_device)
            }
            None => (DevicePermission::UserDisabledForSync, Some(false), Some(false)),
        };

        let now = Self::now_millis();
        let rows = [
            new_user.map(|auth| (USER_AUTH_ROW, auth)),
            new_device.map(|auth| (device_id.as_str(), auth)),
        ];
        for (device, authorized) in rows.into_iter().flatten() {
            tracing::debug!(username, device, authorized, "Recording pre-authorization");
            sqlx::query(
                r#"
                INSERT INTO preauth_users (username, device_id, authorized, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?4)
                "#,
            )
            .bind(username)
            .bind(device)
            .bind(authorized)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }

        if status == DevicePermission::MaxDevicesReached {
            tracing::info!(username, device = %device_id, "Max number of devices reached");
        }

        Ok(status)
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get_state_hash(&self, key: &StateKey) -> Result<StateHash, StoreError> {
        tracing::debug!(%key, "get_state_hash");

        let row: Option<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT updated_at, revision FROM states
            WHERE device_id = ?1 AND state_type = ?2 AND uuid = ?3 AND counter = ?4
            "#,
        )
        .bind(key.device_id.as_str())
        .bind(key.state_type.as_str())
        .bind(Self::stored_uuid(key))
        .bind(key.stored_counter())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Unavailable)?;

        row.map(|(updated_at, revision)| StateHash {
            updated_at,
            revision,
        })
        .ok_or_else(|| StoreError::not_found(key))
    }

    async fn get_state(
        &self,
        key: &StateKey,
        cleanup: bool,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        tracing::debug!(%key, cleanup, "get_state");

        if cleanup && key.has_counter() {
            self.clean_states(key).await;
        }

        let data: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT state_data FROM states
            WHERE device_id = ?1 AND state_type = ?2 AND uuid = ?3 AND counter = ?4
            "#,
        )
        .bind(key.device_id.as_str())
        .bind(key.state_type.as_str())
        .bind(Self::stored_uuid(key))
        .bind(key.stored_counter())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Unavailable)?;

        match data {
            Some(data) => Ok(Some(data)),
            None if key.state_type.is_failsafe() => {
                tracing::debug!(%key, "No failsafe state");
                Ok(None)
            }
            None => Err(StoreError::not_found(key)),
        }
    }

    async fn set_state(&self, key: &StateKey, data: &[u8]) -> Result<usize, StoreError> {
        tracing::debug!(%key, bytes = data.len(), "set_state");
        let now = Self::now_millis();

        let existing: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id_state FROM states
            WHERE device_id = ?1 AND state_type = ?2 AND uuid = ?3 AND counter = ?4
            "#,
        )
        .bind(key.device_id.as_str())
        .bind(key.state_type.as_str())
        .bind(Self::stored_uuid(key))
        .bind(key.stored_counter())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::write_failed(key, e))?;

        let result = match existing {
            Some(id_state) => {
                sqlx::query(
                    r#"
                    UPDATE states
                    SET state_data = ?1, updated_at = ?2, revision = revision + 1
                    WHERE id_state = ?3
                    "#,
                )
                .bind(data)
                .bind(now)
                .bind(id_state)
                .execute(&self.pool)
                .await
            }
            None => {
                // A concurrent first write may have inserted in between.
                sqlx::query(
                    r#"
                    INSERT INTO states (device_id, state_type, uuid, counter, state_data, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                    ON CONFLICT(device_id, uuid, state_type, counter) DO UPDATE
                    SET state_data = excluded.state_data,
                        updated_at = excluded.updated_at,
                        revision = revision + 1
                    "#,
                )
                .bind(key.device_id.as_str())
                .bind(key.state_type.as_str())
                .bind(Self::stored_uuid(key))
                .bind(key.stored_counter())
                .bind(data)
                .bind(now)
                .execute(&self.pool)
                .await
            }
        };

        result.map_err(|e| {
            tracing::error!(%key, error = %e, "Could not write state");
            StoreError::write_failed(key, e)
        })?;

        Ok(data.len())
    }

    async fn clean_states(&self, key: &StateKey) -> u64 {
        tracing::debug!(%key, "clean_states");

        let result = match key.counter {
            None => {
                sqlx::query(
                    "DELETE FROM states WHERE device_id = ?1 AND state_type = ?2 AND uuid = ?3",
                )
                .bind(key.device_id.as_str())
                .bind(key.state_type.as_str())
                .bind(Self::stored_uuid(key))
                .execute(&self.pool)
                .await
            }
            Some(counter) => {
                sqlx::query(
                    r#"
                    DELETE FROM states
                    WHERE device_id = ?1 AND state_type = ?2 AND uuid = ?3 AND counter < ?4
                    "#,
                )
                .bind(key.device_id.as_str())
                .bind(key.state_type.as_str())
                .bind(Self::stored_uuid(key))
                .bind(counter.value() as i64)
                .execute(&self.pool)
                .await
            }
        };

        match result {
            Ok(done) => {
                if done.rows_affected() > 0 {
                    tracing::debug!(%key, deleted = done.rows_affected(), "Cleaned states");
                }
                done.rows_affected()
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "Could not clean states");
                0
            }
        }
    }

    async fn link_user_device(
        &self,
        username: &str,
        device_id: &DeviceId,
        timestamps: LinkTimestamps,
    ) -> bool {
        tracing::debug!(username, device = %device_id, "link_user_device");
        let now = Self::now_millis();

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO users (username, device_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(username)
        .bind(device_id.as_str())
        .bind(timestamps.created_at.unwrap_or(now))
        .bind(timestamps.updated_at.unwrap_or(now))
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => {
                tracing::debug!(username, device = %device_id, "Linked user-device");
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::error!(username, device = %device_id, error = %e, "Unable to link user-device");
                false
            }
        }
    }

    async fn unlink_user_device(&self, username: &str, device_id: &DeviceId) -> bool {
        tracing::debug!(username, device = %device_id, "unlink_user_device");

        let result = sqlx::query("DELETE FROM users WHERE username = ?1 AND device_id = ?2")
            .bind(username)
            .bind(device_id.as_str())
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) => done.rows_affected() > 0,
            Err(e) => {
                tracing::error!(username, device = %device_id, error = %e, "Unable to unlink user-device");
                false
            }
        }
    }

    async fn get_all_devices(&self, username: Option<&str>) -> Result<Vec<DeviceId>, StoreError> {
        tracing::debug!(?username, "get_all_devices");

        let ids: Vec<String> = match username {
            Some(username) => {
                sqlx::query_scalar(
                    "SELECT device_id FROM users WHERE username = ?1 ORDER BY device_id",
                )
                .bind(username)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_scalar("SELECT DISTINCT device_id FROM users ORDER BY device_id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(StoreError::Unavailable)?;

        Ok(ids.into_iter().map(DeviceId::from).collect())
    }

    async fn get_all_user_devices(&self) -> Result<BTreeMap<String, Vec<DeviceId>>, StoreError> {
        tracing::debug!("get_all_user_devices");

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT username, device_id FROM users ORDER BY username, device_id")
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::Unavailable)?;

        let mut map: BTreeMap<String, Vec<DeviceId>> = BTreeMap::new();
        for (username, device_id) in rows {
            map.entry(username).or_default().push(DeviceId::from(device_id));
        }
        Ok(map)
    }

    async fn get_state_version(&self) -> Result<StateVersion, StoreError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT key_value FROM settings WHERE key_name = ?1")
                .bind(VERSION_KEY)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::Unavailable)?;

        let version = match value {
            Some(value) => value.parse::<u32>().map(StateVersion).map_err(|_| {
                StoreError::bootstrap(format!("invalid state version {value:?}"))
            })?,
            None => {
                tracing::info!(version = %StateVersion::SUPPORTED, "Initializing state version");
                self.set_state_version(StateVersion::SUPPORTED).await?;
                StateVersion::SUPPORTED
            }
        };

        tracing::debug!(%version, "get_state_version");
        Ok(version)
    }

    async fn set_state_version(&self, version: StateVersion) -> Result<(), StoreError> {
        tracing::debug!(%version, "set_state_version");
        let now = Self::now_millis();

        sqlx::query(
            r#"
            INSERT INTO settings (key_name, key_value, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(key_name) DO UPDATE
            SET key_value = excluded.key_value, updated_at = excluded.updated_at
            "#,
        )
        .bind(VERSION_KEY)
        .bind(version.0.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::WriteFailed {
            key: VERSION_KEY.to_string(),
            source: e,
        })?;

        Ok(())
    }

    async fn tables_have_data(&self) -> Result<bool, StoreError> {
        let checks = [
            ("settings", "SELECT 1 FROM settings LIMIT 1"),
            ("states", "SELECT 1 FROM states LIMIT 1"),
            ("users", "SELECT 1 FROM users LIMIT 1"),
        ];
        for (table, sql) in checks {
            let row: Option<i64> = sqlx::query_scalar(sql)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::Unavailable)?;
            if row.is_none() {
                tracing::debug!(table, "Table has no data");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn get_all_states_for_device(
        &self,
        device_id: &DeviceId,
    ) -> Result<Vec<StateInventoryEntry>, StoreError> {
        tracing::debug!(device = %device_id, "get_all_states_for_device");

        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            "SELECT state_type, counter, uuid FROM states WHERE device_id = ?1 ORDER BY id_state",
        )
        .bind(device_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Unavailable)?;

        Ok(rows
            .into_iter()
            .map(|(state_type, counter, uuid)| StateInventoryEntry {
                state_type: StateType::from(state_type),
                counter: Counter::new(counter.max(0) as u64),
                uuid: (!uuid.is_empty()).then_some(uuid),
            })
            .collect())
    }

    async fn get_user_device_permission(
        &self,
        username: &str,
        device_id: &DeviceId,
    ) -> DevicePermission {
        tracing::debug!(username, device = %device_id, "get_user_device_permission");

        if device_id.is_provisioning_probe() {
            return DevicePermission::Success;
        }

        match self.check_permission(username, device_id).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(username, device = %device_id, error = %e, "Permission check failed");
                DevicePermission::UserDisabledForSync
            }
        }
    }

    async fn get_mapped_username(&self, username: &str, backend: &str) -> Option<String> {
        let result = sqlx::query_scalar(
            "SELECT mappedname FROM combined_usermap WHERE username = ?1 AND backend = ?2",
        )
        .bind(username)
        .bind(backend)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(mapped) => mapped,
            Err(e) => {
                tracing::error!(username, backend, error = %e, "Could not read username map");
                None
            }
        }
    }

    async fn map_username(&self, username: &str, backend: &str, mapped_name: &str) -> bool {
        tracing::debug!(username, backend, mapped_name, "map_username");
        let now = Self::now_millis();

        let result = sqlx::query(
            r#"
            INSERT INTO combined_usermap (username, backend, mappedname, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(username, backend) DO UPDATE
            SET mappedname = excluded.mappedname, updated_at = excluded.updated_at
            "#,
        )
        .bind(username)
        .bind(backend)
        .bind(mapped_name)
        .bind(now)
        .execute(&self.pool)
        .await;

        result
            .map_err(|e| tracing::error!(username, backend, error = %e, "Could not map username"))
            .is_ok()
    }

    async fn unmap_username(&self, username: &str, backend: &str) -> bool {
        tracing::debug!(username, backend, "unmap_username");

        let result = sqlx::query("DELETE FROM combined_usermap WHERE username = ?1 AND backend = ?2")
            .bind(username)
            .bind(backend)
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) => done.rows_affected() == 1,
            Err(e) => {
                tracing::error!(username, backend, error = %e, "Could not unmap username");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StateStoreExt;
    use zstate_types::ErrorKind;

    fn fd_key(device: &str, uuid: &str, counter: u64) -> StateKey {
        StateKey::new(device, StateType::FolderData)
            .with_uuid(uuid)
            .with_counter(Counter::new(counter))
    }

    async fn store_with(permissions: PermissionsConfig) -> SqliteStateStore {
        SqliteStateStore::in_memory()
            .await
            .unwrap()
            .with_permissions(permissions)
    }

    #[tokio::test]
    async fn state_roundtrip() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let key = fd_key("dev1", "folder-a", 1);

        let written = store.set_state(&key, b"state blob").await.unwrap();
        assert_eq!(written, 10);

        let data = store.get_state(&key, true).await.unwrap();
        assert_eq!(data.as_deref(), Some(&b"state blob"[..]));
    }

    #[tokio::test]
    async fn set_state_updates_in_place() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let key = fd_key("dev1", "folder-a", 1);

        store.set_state(&key, b"one").await.unwrap();
        let first = store.get_state_hash(&key).await.unwrap();
        store.set_state(&key, b"two").await.unwrap();
        let second = store.get_state_hash(&key).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(second.revision, first.revision + 1);
        assert_eq!(
            store.get_state(&key, false).await.unwrap().as_deref(),
            Some(&b"two"[..])
        );

        let inventory = store
            .get_all_states_for_device(&DeviceId::new("dev1"))
            .await
            .unwrap();
        assert_eq!(inventory.len(), 1);
    }

    #[tokio::test]
    async fn missing_state_is_not_found() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let key = fd_key("dev1", "nope", 1);

        let err = store.get_state(&key, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = store.get_state_hash(&key).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn missing_failsafe_is_none() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let key = StateKey::new("dev1", StateType::Failsafe).with_uuid("folder-a");
        assert_eq!(store.get_state(&key, true).await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_state_cleans_older_counters() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        for counter in 1..=3 {
            store
                .set_state(&fd_key("dev1", "f", counter), b"x")
                .await
                .unwrap();
        }

        store.get_state(&fd_key("dev1", "f", 2), true).await.unwrap();

        assert!(store.get_state(&fd_key("dev1", "f", 1), false).await.is_err());
        assert!(store.get_state(&fd_key("dev1", "f", 3), false).await.is_ok());
    }

    #[tokio::test]
    async fn get_state_without_cleanup_keeps_older_counters() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        store.set_state(&fd_key("dev1", "f", 1), b"x").await.unwrap();
        store.set_state(&fd_key("dev1", "f", 2), b"y").await.unwrap();

        store.get_state(&fd_key("dev1", "f", 2), false).await.unwrap();
        assert!(store.get_state(&fd_key("dev1", "f", 1), false).await.is_ok());
    }

    #[tokio::test]
    async fn clean_states_below_counter() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        for counter in 1..=3 {
            store
                .set_state(&fd_key("dev1", "f", counter), b"x")
                .await
                .unwrap();
        }

        let deleted = store.clean_states(&fd_key("dev1", "f", 3)).await;
        assert_eq!(deleted, 2);

        let inventory = store
            .get_all_states_for_device(&DeviceId::new("dev1"))
            .await
            .unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].counter, Counter::new(3));
    }

    #[tokio::test]
    async fn clean_states_without_counter_wipes_all() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        for counter in 1..=3 {
            store
                .set_state(&fd_key("dev1", "f", counter), b"x")
                .await
                .unwrap();
        }
        store.set_state(&fd_key("dev1", "other", 1), b"x").await.unwrap();

        let key = StateKey::new("dev1", StateType::FolderData).with_uuid("f");
        assert_eq!(store.clean_states(&key).await, 3);

        let inventory = store
            .get_all_states_for_device(&DeviceId::new("dev1"))
            .await
            .unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].uuid.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn keyless_state_reported_without_uuid() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let key = StateKey::new("dev1", StateType::DeviceData);
        store.set_state(&key, b"device").await.unwrap();
        store.set_state(&key, b"device v2").await.unwrap();
        store.set_state(&fd_key("dev1", "f", 4), b"x").await.unwrap();

        let inventory = store
            .get_all_states_for_device(&DeviceId::new("dev1"))
            .await
            .unwrap();
        assert_eq!(
            inventory,
            vec![
                StateInventoryEntry {
                    state_type: StateType::DeviceData,
                    counter: Counter::zero(),
                    uuid: None,
                },
                StateInventoryEntry {
                    state_type: StateType::FolderData,
                    counter: Counter::new(4),
                    uuid: Some("f".into()),
                },
            ]
        );
    }

    #[tokio::test]
    async fn typed_load_and_save() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let key = StateKey::new("dev1", StateType::Hierarchy);
        let folders = vec!["inbox".to_string(), "sent".to_string()];

        store.save(&key, &folders).await.unwrap();
        let loaded: Option<Vec<String>> = store.load(&key, true).await.unwrap();
        assert_eq!(loaded, Some(folders));
    }

    #[tokio::test]
    async fn link_and_unlink_devices() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let dev1 = DeviceId::new("dev1");
        let dev2 = DeviceId::new("dev2");

        assert!(store.link_user_device("alice", &dev1, LinkTimestamps::default()).await);
        assert!(!store.link_user_device("alice", &dev1, LinkTimestamps::default()).await);
        assert!(store.link_user_device("alice", &dev2, LinkTimestamps::default()).await);
        assert!(store.link_user_device("bob", &dev1, LinkTimestamps::default()).await);

        assert_eq!(
            store.get_all_devices(None).await.unwrap(),
            vec![dev1.clone(), dev2.clone()]
        );
        assert_eq!(
            store.get_all_devices(Some("bob")).await.unwrap(),
            vec![dev1.clone()]
        );

        let all = store.get_all_user_devices().await.unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["alice", "bob"]);
        assert_eq!(all["alice"], vec![dev1.clone(), dev2.clone()]);

        assert!(store.unlink_user_device("alice", &dev1).await);
        assert!(!store.unlink_user_device("alice", &dev1).await);
        assert_eq!(
            store.get_all_devices(Some("alice")).await.unwrap(),
            vec![dev2]
        );
    }

    #[tokio::test]
    async fn tables_have_data_once_populated() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        assert!(!store.tables_have_data().await.unwrap());

        store.set_state_version(StateVersion::SUPPORTED).await.unwrap();
        store.set_state(&fd_key("dev1", "inbox", 1), b"x").await.unwrap();
        assert!(!store.tables_have_data().await.unwrap());

        assert!(
            store
                .link_user_device("alice", &DeviceId::new("dev1"), LinkTimestamps::default())
                .await
        );
        assert!(store.tables_have_data().await.unwrap());
    }

    #[tokio::test]
    async fn state_version_initializes_to_supported() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        assert_eq!(
            store.get_state_version().await.unwrap(),
            StateVersion::SUPPORTED
        );

        store.set_state_version(StateVersion::V1).await.unwrap();
        assert_eq!(store.get_state_version().await.unwrap(), StateVersion::V1);
    }

    #[tokio::test]
    async fn provisioning_requests_always_succeed() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        for device in ["", "validate"] {
            let status = store
                .get_user_device_permission("alice", &DeviceId::new(device))
                .await;
            assert_eq!(status, DevicePermission::Success);
        }
    }

    #[tokio::test]
    async fn unknown_user_blocked_by_default() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let dev = DeviceId::new("dev1");

        let status = store.get_user_device_permission("alice", &dev).await;
        assert_eq!(status, DevicePermission::UserDisabledForSync);

        // The refusal was recorded; the user is now known and blocked.
        let status = store.get_user_device_permission("alice", &dev).await;
        assert_eq!(status, DevicePermission::UserDisabledForSync);
    }

    #[tokio::test]
    async fn new_user_and_device_pre_authorized() {
        let store = store_with(PermissionsConfig {
            pre_authorize_new_users: true,
            pre_authorize_new_devices: true,
            max_devices: 2,
        })
        .await;

        let status = store
            .get_user_device_permission("alice", &DeviceId::new("dev1"))
            .await;
        assert_eq!(status, DevicePermission::Success);

        let status = store
            .get_user_device_permission("alice", &DeviceId::new("dev1"))
            .await;
        assert_eq!(status, DevicePermission::Success);
    }

    #[tokio::test]
    async fn max_devices_enforced() {
        let store = store_with(PermissionsConfig {
            pre_authorize_new_users: true,
            pre_authorize_new_devices: true,
            max_devices: 1,
        })
        .await;

        assert_eq!(
            store
                .get_user_device_permission("alice", &DeviceId::new("dev1"))
                .await,
            DevicePermission::Success
        );
        assert_eq!(
            store
                .get_user_device_permission("alice", &DeviceId::new("dev2"))
                .await,
            DevicePermission::MaxDevicesReached
        );
    }

    #[tokio::test]
    async fn new_device_blocked_without_device_pre_authorization() {
        let store = store_with(PermissionsConfig {
            pre_authorize_new_users: true,
            pre_authorize_new_devices: false,
            max_devices: 5,
        })
        .await;

        let dev = DeviceId::new("dev1");
        assert_eq!(
            store.get_user_device_permission("alice", &dev).await,
            DevicePermission::DeviceBlockedForUser
        );
        // The user row was recorded as authorized, the device as blocked.
        assert_eq!(
            store.get_user_device_permission("alice", &dev).await,
            DevicePermission::DeviceBlockedForUser
        );
    }

    #[tokio::test]
    async fn username_map() {
        let store = SqliteStateStore::in_memory().await.unwrap();

        assert_eq!(store.get_mapped_username("alice", "imap").await, None);
        assert!(store.map_username("alice", "imap", "alice@example.com").await);
        assert!(store.map_username("alice", "imap", "a.smith@example.com").await);
        assert_eq!(
            store.get_mapped_username("alice", "imap").await.as_deref(),
            Some("a.smith@example.com")
        );

        assert!(store.unmap_username("alice", "imap").await);
        assert!(!store.unmap_username("alice", "imap").await);
    }

    #[tokio::test]
    async fn bootstrap_creates_file_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");

        let store = SqliteStateStore::open(&path).await.unwrap();
        let key = fd_key("dev1", "f", 1);
        store.set_state(&key, b"persisted").await.unwrap();
        drop(store);

        let reopened = SqliteStateStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.get_state(&key, false).await.unwrap().as_deref(),
            Some(&b"persisted"[..])
        );
    }
}
