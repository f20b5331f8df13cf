//! State store for zstate.
//!
//! Persists versioned state blobs keyed by `(device, type, uuid, counter)`,
//! plus the user/device relation, device pre-authorization and the
//! username map used by composite backends.

mod sqlite;

pub use sqlite::SqliteStateStore;

use crate::error::StoreError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use zstate_types::{Counter, DeviceId, StateKey, StateType};

/// Token that changes whenever a state record is rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateHash {
    /// Last write, unix milliseconds.
    pub updated_at: i64,
    /// Number of writes to the record.
    pub revision: i64,
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.updated_at, self.revision)
    }
}

/// One row of a device's state inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateInventoryEntry {
    /// Kind of state.
    pub state_type: StateType,
    /// Snapshot counter (0 for singleton states).
    pub counter: Counter,
    /// Sub-key, if any.
    pub uuid: Option<String>,
}

/// Outcome of a device authorization check.
///
/// Discriminants are the status codes sent to devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DevicePermission {
    /// The device may synchronize.
    Success = 1,
    /// The user is blocked, unknown, or the check failed.
    UserDisabledForSync = 126,
    /// The device is blocked for this user.
    DeviceBlockedForUser = 129,
    /// The user already has the maximum number of devices.
    MaxDevicesReached = 177,
}

impl DevicePermission {
    /// Status code sent to the device.
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// True when the device may synchronize.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Version of the state format written by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateVersion(pub u32);

impl StateVersion {
    /// First versioned format.
    pub const V1: Self = Self(1);
    /// Current format.
    pub const V2: Self = Self(2);
    /// Version written by this build.
    pub const SUPPORTED: Self = Self::V2;
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Explicit timestamps for a user/device link, used when migrating links
/// from another store. Unix milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkTimestamps {
    /// Original creation time.
    pub created_at: Option<i64>,
    /// Original update time.
    pub updated_at: Option<i64>,
}

/// Trait for state store backends.
///
/// Lookups distinguish a miss ([`StoreError::NotFound`]) from an unreachable
/// backend ([`StoreError::Unavailable`]); the store never locks across
/// processes, callers serialize read-modify-write cycles themselves.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Token for the record at `key`; changes when the record changes.
    async fn get_state_hash(&self, key: &StateKey) -> Result<StateHash, StoreError>;

    /// Read the record at `key`.
    ///
    /// With a counter above 0 and `cleanup` set, older counters of the same
    /// `(device, type, uuid)` are deleted first. A missing failsafe record
    /// yields `Ok(None)`; any other miss is [`StoreError::NotFound`].
    async fn get_state(&self, key: &StateKey, cleanup: bool)
        -> Result<Option<Vec<u8>>, StoreError>;

    /// Insert or update the record at `key`. Returns the bytes written.
    async fn set_state(&self, key: &StateKey, data: &[u8]) -> Result<usize, StoreError>;

    /// Delete records of `(device, type, uuid)`.
    ///
    /// Without a counter every record goes; with one, only lower counters.
    /// Failures are logged. Returns the number of deleted records.
    async fn clean_states(&self, key: &StateKey) -> u64;

    /// Link a user and a device. Returns true when a link was created.
    async fn link_user_device(
        &self,
        username: &str,
        device_id: &DeviceId,
        timestamps: LinkTimestamps,
    ) -> bool;

    /// Remove a user/device link. Returns true when a link was removed.
    async fn unlink_user_device(&self, username: &str, device_id: &DeviceId) -> bool;

    /// Devices linked to `username`, or to anybody when `None`.
    async fn get_all_devices(&self, username: Option<&str>) -> Result<Vec<DeviceId>, StoreError>;

    /// Every user with their linked devices.
    async fn get_all_user_devices(&self) -> Result<BTreeMap<String, Vec<DeviceId>>, StoreError>;

    /// Version of the stored state format, initialized on first read.
    async fn get_state_version(&self) -> Result<StateVersion, StoreError>;

    /// Record the stored state format version.
    async fn set_state_version(&self, version: StateVersion) -> Result<(), StoreError>;

    /// True once settings, states and user links all hold rows.
    ///
    /// Used to tell a populated database from a freshly bootstrapped one.
    async fn tables_have_data(&self) -> Result<bool, StoreError>;

    /// Every state record of a device, in insertion order.
    async fn get_all_states_for_device(
        &self,
        device_id: &DeviceId,
    ) -> Result<Vec<StateInventoryEntry>, StoreError>;

    /// Decide whether `device_id` may synchronize for `username`.
    ///
    /// May record first-seen users and devices; call once per decision.
    async fn get_user_device_permission(
        &self,
        username: &str,
        device_id: &DeviceId,
    ) -> DevicePermission;

    /// Name `username` is known by in `backend`.
    async fn get_mapped_username(&self, username: &str, backend: &str) -> Option<String>;

    /// Map `username` to `mapped_name` for `backend`.
    async fn map_username(&self, username: &str, backend: &str, mapped_name: &str) -> bool;

    /// Remove the mapping of `username` for `backend`.
    async fn unmap_username(&self, username: &str, backend: &str) -> bool;
}

/// Typed access to state records, encoded with MessagePack.
#[async_trait]
pub trait StateStoreExt: StateStore {
    /// Read and decode the record at `key`.
    async fn load<T>(&self, key: &StateKey, cleanup: bool) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned + Send,
    {
        match self.get_state(key, cleanup).await? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Encode and write `value` at `key`.
    async fn save<T>(&self, key: &StateKey, value: &T) -> Result<usize, StoreError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let bytes = rmp_serde::to_vec_named(value)?;
        self.set_state(key, &bytes).await
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}
