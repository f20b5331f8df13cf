//! Differential state engine.
//!
//! One [`DiffState`] serves one folder session. It holds the last-known list
//! of items for a device, computes the changes between that list and a fresh
//! one, and absorbs the changes the caller accepted so the updated list can
//! be persisted for the next session.
//!
//! ## Ordering
//!
//! [`DiffState::get_diff_to`] emits adds, content changes and flag changes in
//! the input order of the new items, followed by deletes in the order the
//! items appeared in the held state. Downstream conflict handling depends on
//! this order.
//!
//! ## Duplicate records
//!
//! When both the flags and the revision of one item changed, two records are
//! emitted for that id: `flags` first, then `change`. Replaying them in order
//! leaves the item equal to its new version.

use crate::conflict::{classify, ItemStat};
use crate::content::{unix_now, ContentParameters};
use std::collections::{HashMap, HashSet};
use zstate_types::{DiffChange, ErrorKind, RemoteOp, StateUpdate, SyncItemRef};

/// Error type for engine operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiffError {
    /// The held state is missing or malformed.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The held state could not be encoded.
    #[error("failed to encode state: {0}")]
    Encode(String),
}

impl DiffError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState(_) | Self::Encode(_) => ErrorKind::InvalidInput,
        }
    }
}

/// Lifecycle of a folder session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffPhase {
    /// No state loaded yet.
    Unconfigured,
    /// Prior state loaded.
    Configured,
    /// A diff was computed against the held state.
    Diffing,
    /// At least one change was applied to the held state.
    Updated,
}

/// Holds the prior state of one folder and diffs against it.
#[derive(Debug, Clone)]
pub struct DiffState {
    sync_state: Option<Vec<SyncItemRef>>,
    flags: u32,
    content: Option<ContentParameters>,
    cutoff: Option<i64>,
    phase: DiffPhase,
}

impl DiffState {
    /// Create an unconfigured engine.
    pub fn new() -> Self {
        Self {
            sync_state: None,
            flags: 0,
            content: None,
            cutoff: None,
            phase: DiffPhase::Unconfigured,
        }
    }

    /// Load the prior state.
    ///
    /// An empty list is a first synchronization. Ids must be unique.
    pub fn config(&mut self, state: Vec<SyncItemRef>, flags: u32) -> Result<(), DiffError> {
        let mut seen = HashSet::with_capacity(state.len());
        if let Some(dup) = state.iter().find(|item| !seen.insert(item.id.as_str())) {
            return Err(DiffError::InvalidState(format!(
                "duplicate item id {:?}",
                dup.id
            )));
        }

        self.sync_state = Some(state);
        self.flags = flags;
        self.phase = DiffPhase::Configured;
        Ok(())
    }

    /// Load the prior state from its persisted encoding.
    ///
    /// A missing or empty blob means no prior state.
    pub fn config_from_bytes(&mut self, bytes: Option<&[u8]>, flags: u32) -> Result<(), DiffError> {
        let state = match bytes {
            None | Some([]) => Vec::new(),
            Some(bytes) => rmp_serde::from_slice(bytes)
                .map_err(|e| DiffError::InvalidState(e.to_string()))?,
        };
        self.config(state, flags)
    }

    /// Narrow the session with content parameters.
    pub fn config_content_parameters(&mut self, params: ContentParameters) {
        self.config_content_parameters_at(params, unix_now());
    }

    /// Same as [`config_content_parameters`](Self::config_content_parameters)
    /// with an explicit clock (unix seconds).
    pub fn config_content_parameters_at(&mut self, params: ContentParameters, now: i64) {
        self.cutoff = params.filter_type.cutoff_from(now);
        self.content = Some(params);
    }

    /// The held state.
    pub fn state(&self) -> Result<&[SyncItemRef], DiffError> {
        self.sync_state
            .as_deref()
            .ok_or_else(|| DiffError::InvalidState("state not available".into()))
    }

    /// Take the held state out of the engine.
    pub fn into_state(self) -> Result<Vec<SyncItemRef>, DiffError> {
        self.sync_state
            .ok_or_else(|| DiffError::InvalidState("state not available".into()))
    }

    /// Encode the held state for persistence.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DiffError> {
        let state = self.state()?;
        rmp_serde::to_vec_named(state).map_err(|e| DiffError::Encode(e.to_string()))
    }

    /// Flags passed to [`config`](Self::config).
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Content parameters, if configured.
    pub fn content_parameters(&self) -> Option<&ContentParameters> {
        self.content.as_ref()
    }

    /// Oldest timestamp (unix seconds) inside the requested window.
    pub fn cutoff_date(&self) -> Option<i64> {
        self.cutoff
    }

    /// True when an item stamped `timestamp` falls inside the window.
    pub fn within_cutoff(&self, timestamp: i64) -> bool {
        self.cutoff.map_or(true, |cutoff| timestamp >= cutoff)
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> DiffPhase {
        self.phase
    }

    /// Compute the changes leading from the held state to `new_items`.
    pub fn get_diff_to(&mut self, new_items: &[SyncItemRef]) -> Result<Vec<DiffChange>, DiffError> {
        let held = self.state()?;

        let mut old: HashMap<&str, &SyncItemRef> =
            held.iter().map(|item| (item.id.as_str(), item)).collect();
        let mut changes = Vec::new();

        for item in new_items {
            let Some(old_item) = old.remove(item.id.as_str()) else {
                changes.push(DiffChange::added(item.id.clone()));
                continue;
            };

            if let (Some(before), Some(after)) = (old_item.flags, item.flags) {
                if before != after {
                    changes.push(DiffChange::flags(item.id.clone(), after));
                }
            }

            if old_item.mod_token != item.mod_token {
                changes.push(DiffChange::changed(item.id.clone()));
            }
        }

        // Leftovers vanished; report them in held order.
        changes.extend(
            held.iter()
                .filter(|item| old.contains_key(item.id.as_str()))
                .map(|item| DiffChange::deleted(item.id.clone())),
        );

        self.phase = DiffPhase::Diffing;
        Ok(changes)
    }

    /// Apply one accepted change to the held state.
    ///
    /// Changes replace the item with the same id or append it. Flag updates
    /// and deletes of unknown ids are ignored.
    pub fn update_state(&mut self, update: StateUpdate) -> Result<(), DiffError> {
        let state = self
            .sync_state
            .as_mut()
            .ok_or_else(|| DiffError::InvalidState("state not available".into()))?;

        let pos = state.iter().position(|item| item.id == update.id());
        match (update, pos) {
            (StateUpdate::Change(item), Some(i)) => state[i] = item,
            (StateUpdate::Change(item), None) => state.push(item),
            (StateUpdate::Flags { flags, .. }, Some(i)) => state[i].flags = Some(flags),
            (StateUpdate::Delete { .. }, Some(i)) => {
                state.remove(i);
            }
            (StateUpdate::Flags { .. } | StateUpdate::Delete { .. }, None) => {}
        }

        self.phase = DiffPhase::Updated;
        Ok(())
    }

    /// Apply every change of a diff, resolving items from `new_items`.
    ///
    /// Changes whose id is missing from `new_items` are skipped.
    pub fn apply_diff(
        &mut self,
        changes: &[DiffChange],
        new_items: &[SyncItemRef],
    ) -> Result<(), DiffError> {
        let by_id: HashMap<&str, &SyncItemRef> =
            new_items.iter().map(|item| (item.id.as_str(), item)).collect();

        for change in changes {
            if let Some(update) = resolve_update(change, &by_id) {
                self.update_state(update)?;
            }
        }
        Ok(())
    }

    /// Whether `op` on `id` conflicts, given the live item.
    pub fn is_conflict_with(&self, op: RemoteOp, id: &str, live: Option<&SyncItemRef>) -> bool {
        let held = self
            .sync_state
            .as_deref()
            .and_then(|state| state.iter().find(|item| item.id == id));
        classify(op, held, live)
    }

    /// Whether `op` on `id` conflicts, stating the live item first.
    pub fn is_conflict(
        &self,
        op: RemoteOp,
        folder_id: &str,
        id: &str,
        stat: &impl ItemStat,
    ) -> bool {
        let live = stat.stat(folder_id, id);
        self.is_conflict_with(op, id, live.as_ref())
    }
}

impl Default for DiffState {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_update(
    change: &DiffChange,
    new_items: &HashMap<&str, &SyncItemRef>,
) -> Option<StateUpdate> {
    use zstate_types::ChangeKind;

    match change.kind {
        ChangeKind::Change => new_items
            .get(change.id.as_str())
            .map(|item| StateUpdate::Change((*item).clone())),
        ChangeKind::Flags => change.flags.map(|flags| StateUpdate::Flags {
            id: change.id.clone(),
            flags,
        }),
        ChangeKind::Delete => Some(StateUpdate::Delete {
            id: change.id.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::FilterType;
    use zstate_types::{ChangeKind, ItemFlags};

    fn item(id: &str, rev: u64) -> SyncItemRef {
        SyncItemRef::new(id, rev)
    }

    fn configured(state: Vec<SyncItemRef>) -> DiffState {
        let mut diff = DiffState::new();
        diff.config(state, 0).unwrap();
        diff
    }

    fn kinds(changes: &[DiffChange]) -> Vec<(ChangeKind, &str)> {
        changes.iter().map(|c| (c.kind, c.id.as_str())).collect()
    }

    #[test]
    fn new_engine_is_unconfigured() {
        let diff = DiffState::new();
        assert_eq!(diff.phase(), DiffPhase::Unconfigured);
        assert!(matches!(diff.state(), Err(DiffError::InvalidState(_))));
    }

    #[test]
    fn diff_requires_config() {
        let mut diff = DiffState::new();
        let err = diff.get_diff_to(&[item("a", 1)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn config_rejects_duplicate_ids() {
        let mut diff = DiffState::new();
        let result = diff.config(vec![item("a", 1), item("a", 2)], 0);
        assert!(matches!(result, Err(DiffError::InvalidState(_))));
        assert_eq!(diff.phase(), DiffPhase::Unconfigured);
    }

    #[test]
    fn config_keeps_flags() {
        let mut diff = DiffState::new();
        diff.config(Vec::new(), 3).unwrap();
        assert_eq!(diff.flags(), 3);
        assert_eq!(diff.phase(), DiffPhase::Configured);
    }

    #[test]
    fn first_sync_reports_everything_as_added() {
        let mut diff = configured(Vec::new());
        let changes = diff.get_diff_to(&[item("a", 1), item("b", 1)]).unwrap();
        assert_eq!(changes, vec![DiffChange::added("a"), DiffChange::added("b")]);
        assert!(changes.iter().all(DiffChange::is_add));
    }

    #[test]
    fn output_order_is_new_items_then_deletes() {
        let mut diff = configured(vec![item("A", 0), item("D", 0)]);
        let new = [item("A", 1), item("B", 0), item("C", 1)];

        let changes = diff.get_diff_to(&new).unwrap();
        assert_eq!(
            kinds(&changes),
            vec![
                (ChangeKind::Change, "A"),
                (ChangeKind::Change, "B"),
                (ChangeKind::Change, "C"),
                (ChangeKind::Delete, "D"),
            ]
        );
        assert_eq!(diff.phase(), DiffPhase::Diffing);
    }

    #[test]
    fn deletes_follow_held_order() {
        let mut diff = configured(vec![item("z", 0), item("a", 0), item("m", 0)]);
        let changes = diff.get_diff_to(&[]).unwrap();
        assert_eq!(
            changes,
            vec![
                DiffChange::deleted("z"),
                DiffChange::deleted("a"),
                DiffChange::deleted("m"),
            ]
        );
    }

    #[test]
    fn flags_and_mod_change_both_emitted() {
        let mut diff = configured(vec![item("a", 1).with_flags(ItemFlags::NEW_MESSAGE)]);
        let changes = diff
            .get_diff_to(&[item("a", 2).with_flags(ItemFlags::READ)])
            .unwrap();
        assert_eq!(
            changes,
            vec![
                DiffChange::flags("a", ItemFlags::READ),
                DiffChange::changed("a")
            ]
        );
    }

    #[test]
    fn flags_only_compared_when_both_present() {
        let mut diff = configured(vec![item("a", 1)]);
        let changes = diff
            .get_diff_to(&[item("a", 1).with_flags(ItemFlags::READ)])
            .unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn unchanged_items_produce_nothing() {
        let state = vec![item("a", 1).with_flags(ItemFlags::READ), item("b", 2)];
        let mut diff = configured(state.clone());
        assert!(diff.get_diff_to(&state).unwrap().is_empty());
    }

    #[test]
    fn update_change_replaces_or_appends() {
        let mut diff = configured(vec![item("a", 1), item("b", 1)]);
        diff.update_state(StateUpdate::Change(item("a", 5))).unwrap();
        diff.update_state(StateUpdate::Change(item("c", 1))).unwrap();

        assert_eq!(
            diff.state().unwrap(),
            &[item("a", 5), item("b", 1), item("c", 1)]
        );
        assert_eq!(diff.phase(), DiffPhase::Updated);
    }

    #[test]
    fn update_flags_overwrites_only_flags() {
        let mut diff = configured(vec![item("a", 1)]);
        diff.update_state(StateUpdate::Flags {
            id: "a".into(),
            flags: ItemFlags::READ,
        })
        .unwrap();

        let state = diff.state().unwrap();
        assert_eq!(state[0].mod_token, item("a", 1).mod_token);
        assert_eq!(state[0].flags, Some(ItemFlags::READ));
    }

    #[test]
    fn update_delete_splices() {
        let mut diff = configured(vec![item("a", 1), item("b", 1), item("c", 1)]);
        diff.update_state(StateUpdate::Delete { id: "b".into() })
            .unwrap();
        assert_eq!(diff.state().unwrap(), &[item("a", 1), item("c", 1)]);
    }

    #[test]
    fn update_unknown_id_is_ignored() {
        let mut diff = configured(vec![item("a", 1)]);
        diff.update_state(StateUpdate::Delete { id: "x".into() })
            .unwrap();
        diff.update_state(StateUpdate::Flags {
            id: "x".into(),
            flags: ItemFlags::READ,
        })
        .unwrap();
        assert_eq!(diff.state().unwrap(), &[item("a", 1)]);
    }

    #[test]
    fn apply_diff_converges_to_new_items() {
        let mut diff = configured(vec![
            item("A", 0).with_flags(ItemFlags::NEW_MESSAGE),
            item("D", 0),
        ]);
        let new = vec![
            item("A", 1).with_flags(ItemFlags::READ),
            item("B", 0),
            item("C", 1),
        ];

        let changes = diff.get_diff_to(&new).unwrap();
        diff.apply_diff(&changes, &new).unwrap();
        assert_eq!(diff.state().unwrap(), new.as_slice());
    }

    #[test]
    fn bytes_roundtrip() {
        let state = vec![item("a", 1).with_flags(ItemFlags::READ), item("b", 2)];
        let diff = configured(state.clone());
        let bytes = diff.to_bytes().unwrap();

        let mut restored = DiffState::new();
        restored.config_from_bytes(Some(&bytes), 0).unwrap();
        assert_eq!(restored.state().unwrap(), state.as_slice());
    }

    #[test]
    fn missing_or_empty_blob_is_first_sync() {
        let mut diff = DiffState::new();
        diff.config_from_bytes(None, 0).unwrap();
        assert!(diff.state().unwrap().is_empty());

        diff.config_from_bytes(Some(&[]), 0).unwrap();
        assert!(diff.state().unwrap().is_empty());
    }

    #[test]
    fn garbage_blob_is_invalid_state() {
        let mut diff = DiffState::new();
        let err = diff
            .config_from_bytes(Some(b"definitely not msgpack"), 0)
            .unwrap_err();
        assert!(matches!(err, DiffError::InvalidState(_)));
    }

    #[test]
    fn content_parameters_set_cutoff() {
        let mut diff = configured(Vec::new());
        assert_eq!(diff.cutoff_date(), None);
        assert!(diff.within_cutoff(0));

        let now = 1_700_000_000;
        diff.config_content_parameters_at(ContentParameters::new(FilterType::OneDay), now);
        assert_eq!(diff.cutoff_date(), Some(now - 86_400));
        assert!(diff.within_cutoff(now - 3_600));
        assert!(!diff.within_cutoff(now - 2 * 86_400));
        assert_eq!(
            diff.content_parameters().map(|p| p.filter_type),
            Some(FilterType::OneDay)
        );
    }

    // Conflict matrix

    #[test]
    fn conflict_live_gone() {
        let diff = configured(vec![item("a", 1)]);
        assert!(diff.is_conflict_with(RemoteOp::Change, "a", None));
        assert!(!diff.is_conflict_with(RemoteOp::Delete, "a", None));
        assert!(!diff.is_conflict_with(RemoteOp::Flags, "a", None));
        assert!(!diff.is_conflict_with(RemoteOp::Move, "a", None));
    }

    #[test]
    fn conflict_never_for_unrecorded_item() {
        let diff = configured(vec![item("a", 1)]);
        let live = item("new", 4);
        for op in [RemoteOp::Change, RemoteOp::Delete, RemoteOp::Flags, RemoteOp::Move] {
            assert!(!diff.is_conflict_with(op, "new", Some(&live)));
        }
    }

    #[test]
    fn conflict_never_when_revision_unchanged() {
        let diff = configured(vec![item("a", 1)]);
        let live = item("a", 1);
        for op in [RemoteOp::Change, RemoteOp::Delete, RemoteOp::Flags, RemoteOp::Move] {
            assert!(!diff.is_conflict_with(op, "a", Some(&live)));
        }
    }

    #[test]
    fn conflict_when_revision_changed() {
        let diff = configured(vec![item("a", 1)]);
        let live = item("a", 2);
        assert!(diff.is_conflict_with(RemoteOp::Change, "a", Some(&live)));
        assert!(diff.is_conflict_with(RemoteOp::Delete, "a", Some(&live)));
        assert!(!diff.is_conflict_with(RemoteOp::Flags, "a", Some(&live)));
        assert!(!diff.is_conflict_with(RemoteOp::Move, "a", Some(&live)));
    }

    #[test]
    fn conflict_through_item_stat() {
        let diff = configured(vec![item("a", 1)]);
        let stat = |folder: &str, id: &str| {
            assert_eq!(folder, "inbox");
            (id == "a").then(|| item("a", 2))
        };
        assert!(diff.is_conflict(RemoteOp::Delete, "inbox", "a", &stat));
        assert!(diff.is_conflict(RemoteOp::Change, "inbox", "gone", &stat));
    }
}
