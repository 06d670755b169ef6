//! Per-session caches that make protocol and layout transitions reversible.
//!
//! Everything here lives in one [`SessionContext`] owned by the controller, so
//! two sessions never share state and `clear` tears down the lot.
//!
//! | cache              | key                      | value                                  |
//! |--------------------|--------------------------|----------------------------------------|
//! | grid snapshots     | `study:protocol:stage`   | [`GridState`] as last left             |
//! | last-used stage    | `study:protocol`         | stage index                            |
//! | toggle return      | `study:protocol:stage`   | pair active before the toggle-on       |
//! | one-up return      | (single slot)            | grid saved when one-up was entered     |

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::grid::GridState;
use super::matcher::DisplaySetSelectorMap;

/// `study:protocol:stage`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotKey {
    pub study_instance_uid: String,
    pub protocol_id: String,
    pub stage_index: usize,
}

impl SnapshotKey {
    pub fn new(study_instance_uid: &str, protocol_id: &str, stage_index: usize) -> Self {
        Self {
            study_instance_uid: study_instance_uid.to_string(),
            protocol_id: protocol_id.to_string(),
            stage_index,
        }
    }

    pub fn protocol_key(&self) -> ProtocolKey {
        ProtocolKey::new(&self.study_instance_uid, &self.protocol_id)
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.study_instance_uid, self.protocol_id, self.stage_index)
    }
}

/// `study:protocol`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolKey {
    pub study_instance_uid: String,
    pub protocol_id: String,
}

impl ProtocolKey {
    pub fn new(study_instance_uid: &str, protocol_id: &str) -> Self {
        Self {
            study_instance_uid: study_instance_uid.to_string(),
            protocol_id: protocol_id.to_string(),
        }
    }
}

impl fmt::Display for ProtocolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.study_instance_uid, self.protocol_id)
    }
}

/// A `(protocol, stage)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedProtocol {
    pub protocol_id: String,
    pub stage_index: usize,
}

impl AppliedProtocol {
    pub fn new(protocol_id: impl Into<String>, stage_index: usize) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            stage_index,
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionContext {
    snapshots: BTreeMap<SnapshotKey, GridState>,
    stage_indices: BTreeMap<ProtocolKey, usize>,
    toggle_returns: BTreeMap<SnapshotKey, AppliedProtocol>,
    one_up_return: Option<GridState>,
    selector_map: DisplaySetSelectorMap,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    // ── grid snapshots ────────────────────────────────────────────────────────

    /// Caches `grid` under `key`.  An identical entry is left alone; returns
    /// whether the cache changed.
    pub fn store_snapshot(&mut self, key: SnapshotKey, grid: &GridState) -> bool {
        if self.snapshots.get(&key) == Some(grid) {
            return false;
        }
        trace!(key = %key, "snapshot stored");
        self.snapshots.insert(key, grid.clone());
        true
    }

    pub fn snapshot(&self, key: &SnapshotKey) -> Option<&GridState> {
        self.snapshots.get(key)
    }

    pub fn has_snapshot(&self, key: &SnapshotKey) -> bool {
        self.snapshots.contains_key(key)
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    // ── last-used stage ───────────────────────────────────────────────────────

    pub fn remember_stage(&mut self, key: ProtocolKey, stage_index: usize) {
        self.stage_indices.insert(key, stage_index);
    }

    pub fn last_stage(&self, key: &ProtocolKey) -> Option<usize> {
        self.stage_indices.get(key).copied()
    }

    // ── toggle returns ────────────────────────────────────────────────────────

    /// Records the pair that was active before toggling on `key`.
    pub fn record_toggle(&mut self, key: SnapshotKey, previous: AppliedProtocol) {
        self.toggle_returns.insert(key, previous);
    }

    pub fn toggle_return(&self, key: &SnapshotKey) -> Option<&AppliedProtocol> {
        self.toggle_returns.get(key)
    }

    // ── one-up return ─────────────────────────────────────────────────────────

    pub fn save_one_up(&mut self, grid: GridState) {
        self.one_up_return = Some(grid);
    }

    pub fn one_up_return(&self) -> Option<&GridState> {
        self.one_up_return.as_ref()
    }

    pub fn take_one_up(&mut self) -> Option<GridState> {
        self.one_up_return.take()
    }

    // ── selector bindings ─────────────────────────────────────────────────────

    /// Selector bindings of the protocol currently applied.
    pub fn selector_map(&self) -> &DisplaySetSelectorMap {
        &self.selector_map
    }

    pub fn set_selector_map(&mut self, map: DisplaySetSelectorMap) {
        self.selector_map = map;
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::grid::{GridPosition, ViewportInstance};
    use crate::domain::protocol::GridLayout;

    fn one_up(id: &str) -> GridState {
        GridState::from_viewports(
            GridLayout::ONE_UP,
            vec![ViewportInstance::empty(id, GridPosition::new(0, 0))],
            None,
            true,
        )
    }

    #[test]
    fn test_keys_format_as_colon_joined_parts() {
        let key = SnapshotKey::new("1.2.3", "mpr", 2);
        assert_eq!(key.to_string(), "1.2.3:mpr:2");
        assert_eq!(key.protocol_key().to_string(), "1.2.3:mpr");
    }

    #[test]
    fn test_store_snapshot_only_overwrites_when_grid_differs() {
        let mut session = SessionContext::new();
        let key = SnapshotKey::new("s", "p", 0);

        assert!(session.store_snapshot(key.clone(), &one_up("a")));
        assert!(!session.store_snapshot(key.clone(), &one_up("a")));
        assert!(session.store_snapshot(key.clone(), &one_up("b")));
        assert_eq!(session.snapshot(&key), Some(&one_up("b")));
    }

    #[test]
    fn test_last_stage_is_per_study_and_protocol() {
        let mut session = SessionContext::new();
        session.remember_stage(ProtocolKey::new("s1", "mpr"), 2);

        assert_eq!(session.last_stage(&ProtocolKey::new("s1", "mpr")), Some(2));
        assert_eq!(session.last_stage(&ProtocolKey::new("s2", "mpr")), None);
    }

    #[test]
    fn test_take_one_up_empties_the_slot() {
        let mut session = SessionContext::new();
        session.save_one_up(one_up("a"));

        assert!(session.take_one_up().is_some());
        assert!(session.one_up_return().is_none());
    }

    #[test]
    fn test_clear_drops_every_cache() {
        let mut session = SessionContext::new();
        let key = SnapshotKey::new("s", "p", 0);
        session.store_snapshot(key.clone(), &one_up("a"));
        session.remember_stage(key.protocol_key(), 0);
        session.record_toggle(key.clone(), AppliedProtocol::new("default", 0));
        session.save_one_up(one_up("a"));

        session.clear();

        assert_eq!(session.snapshot_count(), 0);
        assert_eq!(session.last_stage(&key.protocol_key()), None);
        assert!(session.toggle_return(&key).is_none());
        assert!(session.one_up_return().is_none());
    }
}
