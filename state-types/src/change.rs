//! Change records produced by the diff engine and fed back into it.

use crate::item::{ItemFlags, SyncItemRef};
use serde::{Deserialize, Serialize};

/// Kind of a detected change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Content changed, or the item is new.
    Change,
    /// Only the flags changed.
    Flags,
    /// The item disappeared.
    Delete,
}

impl ChangeKind {
    /// Name used in logs and serialized records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Change => "change",
            Self::Flags => "flags",
            Self::Delete => "delete",
        }
    }
}

/// One entry of a diff.
///
/// An add is a [`ChangeKind::Change`] carrying [`ItemFlags::NEW_MESSAGE`];
/// an ordinary content change carries no flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffChange {
    /// What happened.
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    /// Affected item.
    pub id: String,
    /// New flags for adds and flag changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<ItemFlags>,
}

impl DiffChange {
    /// An item not present in the prior state.
    pub fn added(id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Change,
            id: id.into(),
            flags: Some(ItemFlags::NEW_MESSAGE),
        }
    }

    /// An item whose revision stamp changed.
    pub fn changed(id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Change,
            id: id.into(),
            flags: None,
        }
    }

    /// An item whose flags changed.
    pub fn flags(id: impl Into<String>, flags: ItemFlags) -> Self {
        Self {
            kind: ChangeKind::Flags,
            id: id.into(),
            flags: Some(flags),
        }
    }

    /// An item no longer present.
    pub fn deleted(id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            id: id.into(),
            flags: None,
        }
    }

    /// True for changes describing a new item.
    pub fn is_add(&self) -> bool {
        self.kind == ChangeKind::Change && self.flags.is_some()
    }
}

/// A change accepted by the caller and applied back to the held state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateUpdate {
    /// Replace the item with this id, or append it.
    Change(SyncItemRef),
    /// Overwrite only the flags of an item.
    Flags {
        /// Affected item.
        id: String,
        /// New flags.
        flags: ItemFlags,
    },
    /// Remove an item.
    Delete {
        /// Affected item.
        id: String,
    },
}

impl StateUpdate {
    /// Id of the affected item.
    pub fn id(&self) -> &str {
        match self {
            Self::Change(item) => &item.id,
            Self::Flags { id, .. } | Self::Delete { id } => id,
        }
    }

    /// Kind of the update.
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Change(_) => ChangeKind::Change,
            Self::Flags { .. } => ChangeKind::Flags,
            Self::Delete { .. } => ChangeKind::Delete,
        }
    }
}

/// Operation a remote peer wants to apply to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteOp {
    /// Content change.
    Change,
    /// Deletion.
    Delete,
    /// Flag change.
    Flags,
    /// Move to another folder.
    Move,
}
