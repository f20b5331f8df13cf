//! The minimal view of a synchronized item used by the diff engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Opaque revision stamp that changes whenever an item's content changes.
///
/// Only equality matters to the engine.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModToken(String);

impl ModToken {
    /// Create a token from any string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Get the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for ModToken {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for ModToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ModToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ModToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ModToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModToken({})", self.0)
    }
}

/// Per-item flag bits (read state and similar).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemFlags(u32);

impl ItemFlags {
    /// Flags attached to an item seen for the first time (an unread message).
    pub const NEW_MESSAGE: Self = Self(0);
    /// The item was read on the device or the server.
    pub const READ: Self = Self(1);
    /// The item carries a follow-up flag.
    pub const FLAGGED: Self = Self(1 << 1);

    /// Create flags from raw bits.
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Get the raw bits.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// True when every bit of `other` is set.
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// True when no bit is set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ItemFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for ItemFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemFlags({:#b})", self.0)
    }
}

/// One item of a folder as seen by the differential engine.
///
/// `id` is unique within one state snapshot. `flags` is optional because
/// not every folder type tracks flags; two items only compare flags when
/// both carry them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItemRef {
    /// Item identifier, unique within the folder.
    pub id: String,
    /// Revision stamp.
    #[serde(rename = "mod")]
    pub mod_token: ModToken,
    /// Flag bits, if the folder tracks them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<ItemFlags>,
}

impl SyncItemRef {
    /// Create an item without flags.
    pub fn new(id: impl Into<String>, mod_token: impl Into<ModToken>) -> Self {
        Self {
            id: id.into(),
            mod_token: mod_token.into(),
            flags: None,
        }
    }

    /// Attach flags.
    pub fn with_flags(mut self, flags: ItemFlags) -> Self {
        self.flags = Some(flags);
        self
    }
}
