//! Conflict classification between a pending remote operation and local
//! edits made since the held state was recorded.

use zstate_types::{RemoteOp, SyncItemRef};

/// Look up the current, live version of an item.
///
/// Implemented by whatever owns the folder contents (a mailbox backend, a
/// test fixture). `None` means the item no longer exists.
pub trait ItemStat {
    /// Stat an item in a folder.
    fn stat(&self, folder_id: &str, id: &str) -> Option<SyncItemRef>;
}

impl<F> ItemStat for F
where
    F: Fn(&str, &str) -> Option<SyncItemRef>,
{
    fn stat(&self, folder_id: &str, id: &str) -> Option<SyncItemRef> {
        self(folder_id, id)
    }
}

/// Decide whether applying `op` to an item conflicts with a local edit.
///
/// `held` is the item as last recorded in the state, `live` is what exists
/// now. Flag changes and moves never conflict with local edits; content
/// changes and deletes do when the revision moved.
pub fn classify(op: RemoteOp, held: Option<&SyncItemRef>, live: Option<&SyncItemRef>) -> bool {
    let Some(live) = live else {
        // Gone locally: only a remote content change disagrees.
        return op == RemoteOp::Change;
    };

    let Some(held) = held else {
        // Never recorded, so it is new here.
        return false;
    };

    if live.mod_token == held.mod_token {
        return false;
    }

    matches!(op, RemoteOp::Change | RemoteOp::Delete)
}
