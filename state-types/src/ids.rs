//! Identity and addressing types for persisted synchronization state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier a mobile device announces for itself.
///
/// Device ids are opaque strings chosen by the client. Two values are
/// reserved for provisioning probes and never denote a real device: the
/// empty string and `"validate"`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a DeviceId from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the ids clients send while probing provisioning support.
    pub fn is_provisioning_probe(&self) -> bool {
        self.0.is_empty() || self.0 == "validate"
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

/// Kind of persisted state.
///
/// The well-known kinds use the short names the store has always written;
/// anything else round-trips through [`StateType::Custom`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StateType {
    /// Per-device metadata (`devicedata`).
    DeviceData,
    /// Folder content synchronization state (`fd`).
    FolderData,
    /// Failsafe snapshot (`fs`). Usually absent.
    Failsafe,
    /// Folder hierarchy cache (`hc`).
    Hierarchy,
    /// Opaque backend storage (`bs`).
    BackendStorage,
    /// Any other state name.
    Custom(String),
}

impl StateType {
    /// The name stored in the database.
    pub fn as_str(&self) -> &str {
        match self {
            Self::DeviceData => "devicedata",
            Self::FolderData => "fd",
            Self::Failsafe => "fs",
            Self::Hierarchy => "hc",
            Self::BackendStorage => "bs",
            Self::Custom(name) => name,
        }
    }

    /// True for the reserved type whose absence is not an error.
    pub fn is_failsafe(&self) -> bool {
        matches!(self, Self::Failsafe)
    }
}

impl From<&str> for StateType {
    fn from(value: &str) -> Self {
        match value {
            "devicedata" => Self::DeviceData,
            "fd" => Self::FolderData,
            "fs" => Self::Failsafe,
            "hc" => Self::Hierarchy,
            "bs" => Self::BackendStorage,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for StateType {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<StateType> for String {
    fn from(value: StateType) -> Self {
        match value {
            StateType::Custom(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateType({})", self.as_str())
    }
}

/// A monotonically increasing sequence number for successive snapshots of
/// the same `(device, type, uuid)` state.
///
/// Counter 0 is never assigned to a snapshot; a key without a counter is
/// persisted with 0.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Counter(u64);

impl Counter {
    /// Create a new Counter with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this Counter.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Create a Counter representing "no snapshot yet".
    pub fn zero() -> Self {
        Self(0)
    }

    /// Increment the counter by one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Counter({})", self.0)
    }
}

/// Full address of one persisted state record.
///
/// `counter == None` addresses the singleton record of a key (stored with
/// counter 0). When cleaning states `None` means "every counter", so it
/// stays distinct from `Some(Counter(0))`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    /// Device owning the state.
    pub device_id: DeviceId,
    /// Kind of state.
    pub state_type: StateType,
    /// Optional sub-key, usually a folder sync uuid.
    pub uuid: Option<String>,
    /// Optional snapshot counter.
    pub counter: Option<Counter>,
}

impl StateKey {
    /// Address the singleton state of a device.
    pub fn new(device_id: impl Into<DeviceId>, state_type: StateType) -> Self {
        Self {
            device_id: device_id.into(),
            state_type,
            uuid: None,
            counter: None,
        }
    }

    /// Narrow the key to a sub-key.
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    /// Narrow the key to one snapshot.
    pub fn with_counter(mut self, counter: Counter) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Same device/type/uuid without a counter.
    pub fn without_counter(&self) -> Self {
        Self {
            counter: None,
            ..self.clone()
        }
    }

    /// Counter value as persisted (absent counters are stored as 0).
    pub fn stored_counter(&self) -> i64 {
        self.counter.map(|c| c.value() as i64).unwrap_or(0)
    }

    /// True when the key names a real snapshot (counter above 0).
    pub fn has_counter(&self) -> bool {
        self.counter.map(|c| c.value() > 0).unwrap_or(false)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}', '{}', '{}', '{}'",
            self.device_id,
            self.state_type,
            self.uuid.as_deref().unwrap_or("null"),
            self.counter
                .map(|c| c.to_string())
                .unwrap_or_else(|| "false".to_string())
        )
    }
}

/// A client-visible sync key: `{uuid}counter`.
///
/// The uuid addresses the folder state, the counter the snapshot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncKey {
    uuid: uuid::Uuid,
    counter: Counter,
}

impl SyncKey {
    /// Start a fresh key sequence (counter 1).
    pub fn new() -> Self {
        Self {
            uuid: uuid::Uuid::new_v4(),
            counter: Counter::new(1),
        }
    }

    /// Build a key from its parts.
    pub fn from_parts(uuid: uuid::Uuid, counter: Counter) -> Self {
        Self { uuid, counter }
    }

    /// The uuid part.
    pub fn uuid(&self) -> &uuid::Uuid {
        &self.uuid
    }

    /// The counter part.
    pub fn counter(&self) -> Counter {
        self.counter
    }

    /// The key issued after this one.
    pub fn next(&self) -> Self {
        Self {
            uuid: self.uuid,
            counter: self.counter.next(),
        }
    }

    /// The state record this key refers to.
    pub fn state_key(&self, device_id: impl Into<DeviceId>, state_type: StateType) -> StateKey {
        StateKey::new(device_id, state_type)
            .with_uuid(self.uuid.to_string())
            .with_counter(self.counter)
    }
}

impl Default for SyncKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.uuid, self.counter)
    }
}

impl fmt::Debug for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncKey({})", self)
    }
}

/// Error parsing a [`SyncKey`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid sync key: {0}")]
pub struct SyncKeyError(pub String);

impl FromStr for SyncKey {
    type Err = SyncKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('{')
            .ok_or_else(|| SyncKeyError(s.to_string()))?;
        let (uuid, counter) = rest
            .split_once('}')
            .ok_or_else(|| SyncKeyError(s.to_string()))?;
        let uuid = uuid::Uuid::parse_str(uuid).map_err(|_| SyncKeyError(s.to_string()))?;
        let counter = counter
            .parse::<u64>()
            .map_err(|_| SyncKeyError(s.to_string()))?;
        Ok(Self {
            uuid,
            counter: Counter::new(counter),
        })
    }
}
