//! Sync group coordinator: keeps pan/zoom, window-level and frame index in
//! lockstep across viewports.
//!
//! # Membership sources
//!
//! Synchronizers come from two places:
//!
//! - **stage-declared**: each viewport's `viewport_options.sync_groups`.  These
//!   are rebuilt from the grid by [`SyncGroupCoordinator::reconcile`] after
//!   every commit, so they always match what is on screen.
//! - **manual**: created by [`SyncGroupCoordinator::toggle`] when the user
//!   asks for a synchronizer the stage did not declare.  Reconcile only prunes
//!   these; it never adds members.
//!
//! In both cases the `enabled` flag survives reconciliation, so a group the
//! user switched off stays off across stage changes.
//!
//! # Propagation
//!
//! ```text
//!   source viewport ──change──► every enabled group of the matching type
//!                                  that lists the source as `source`
//!                                        │
//!                                        ▼
//!                               all `target` members (except the source)
//! ```
//!
//! Frame-view groups may carry an explicit `viewport_index` per member; the
//! frame offset between two members is the difference of their indices.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::display_set::DisplaySet;
use super::grid::{GridState, ViewportInstance};
use super::protocol::{SyncGroupType, ViewportId};

/// Errors raised by [`SyncGroupCoordinator::toggle`].
#[derive(Debug, Error, PartialEq)]
pub enum SyncError {
    #[error("synchronizer '{id}' already exists with type {existing}")]
    KindMismatch { id: String, existing: SyncGroupType },

    #[error("no viewport is eligible for a {kind} synchronizer")]
    NoEligibleViewports { kind: SyncGroupType },
}

/// Where a synchronizer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOrigin {
    Stage,
    Manual,
}

/// How one viewport participates in a synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRole {
    pub source: bool,
    pub target: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_index: Option<i64>,
}

impl SyncRole {
    fn both(viewport_index: Option<i64>) -> Self {
        Self {
            source: true,
            target: true,
            viewport_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synchronizer {
    pub id: String,
    pub kind: SyncGroupType,
    pub enabled: bool,
    pub origin: SyncOrigin,
    pub members: BTreeMap<ViewportId, SyncRole>,
}

impl Synchronizer {
    pub fn member_ids(&self) -> Vec<ViewportId> {
        self.members.keys().cloned().collect()
    }
}

/// Notifications for the external tool runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Created {
        id: String,
        kind: SyncGroupType,
        members: Vec<ViewportId>,
    },
    MembersChanged {
        id: String,
        members: Vec<ViewportId>,
    },
    Enabled {
        id: String,
    },
    Disabled {
        id: String,
    },
    Destroyed {
        id: String,
    },
}

/// Per-viewport presentation values the synchronizers operate on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewportPresentation {
    pub pan: (f64, f64),
    pub zoom: f64,
    pub window_width: Option<f64>,
    pub window_center: Option<f64>,
    pub frame_index: i64,
}

impl Default for ViewportPresentation {
    fn default() -> Self {
        Self {
            pan: (0.0, 0.0),
            zoom: 1.0,
            window_width: None,
            window_center: None,
            frame_index: 0,
        }
    }
}

/// A user interaction on one viewport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum PresentationChange {
    Camera { pan: (f64, f64), zoom: f64 },
    Voi { window_width: f64, window_center: f64 },
    FrameIndex { frame_index: i64 },
}

impl PresentationChange {
    /// The synchronizer type that propagates this change.
    pub fn kind(&self) -> SyncGroupType {
        match self {
            PresentationChange::Camera { .. } => SyncGroupType::ZoomPan,
            PresentationChange::Voi { .. } => SyncGroupType::Voi,
            PresentationChange::FrameIndex { .. } => SyncGroupType::FrameView,
        }
    }

    fn apply_to(&self, presentation: &mut ViewportPresentation, frame_offset: i64) {
        match self {
            PresentationChange::Camera { pan, zoom } => {
                presentation.pan = *pan;
                presentation.zoom = *zoom;
            }
            PresentationChange::Voi {
                window_width,
                window_center,
            } => {
                presentation.window_width = Some(*window_width);
                presentation.window_center = Some(*window_center);
            }
            PresentationChange::FrameIndex { frame_index } => {
                presentation.frame_index = frame_index.saturating_add(frame_offset).max(0);
            }
        }
    }
}

/// Presentation state keyed by viewport id.
#[derive(Debug, Clone, Default)]
pub struct PresentationStore {
    by_viewport: BTreeMap<ViewportId, ViewportPresentation>,
}

impl PresentationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Presentation of a viewport; untouched viewports report the default.
    pub fn get(&self, viewport_id: &str) -> ViewportPresentation {
        self.by_viewport.get(viewport_id).cloned().unwrap_or_default()
    }

    fn entry(&mut self, viewport_id: &str) -> &mut ViewportPresentation {
        self.by_viewport.entry(viewport_id.to_string()).or_default()
    }

    /// Forgets viewports no longer in `grid`.
    pub fn retain_grid(&mut self, grid: &GridState) {
        self.by_viewport.retain(|id, _| grid.viewports.contains_key(id));
    }

    pub fn clear(&mut self) {
        self.by_viewport.clear();
    }
}

/// Registry of all synchronizers of a session.
#[derive(Debug, Default)]
pub struct SyncGroupCoordinator {
    synchronizers: BTreeMap<String, Synchronizer>,
}

impl SyncGroupCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sync_id: &str) -> Option<&Synchronizer> {
        self.synchronizers.get(sync_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Synchronizer> {
        self.synchronizers.values()
    }

    pub fn is_empty(&self) -> bool {
        self.synchronizers.is_empty()
    }

    /// Rebuilds stage-declared memberships from `grid` and prunes manual ones.
    pub fn reconcile(&mut self, grid: &GridState) -> Vec<SyncEvent> {
        let mut declared: BTreeMap<String, (SyncGroupType, BTreeMap<ViewportId, SyncRole>)> =
            BTreeMap::new();
        for vp in grid.viewports.values() {
            for spec in &vp.viewport_options.sync_groups {
                let entry = declared
                    .entry(spec.id.clone())
                    .or_insert_with(|| (spec.kind, BTreeMap::new()));
                entry.1.insert(
                    vp.viewport_id.clone(),
                    SyncRole {
                        source: spec.source,
                        target: spec.target,
                        viewport_index: spec.viewport_index(),
                    },
                );
            }
        }

        let mut events = Vec::new();

        // Stage groups that vanished, or whose id now names another type.
        let stale: Vec<String> = self
            .synchronizers
            .values()
            .filter(|s| match declared.get(&s.id) {
                Some((kind, _)) => *kind != s.kind,
                None => s.origin == SyncOrigin::Stage,
            })
            .map(|s| s.id.clone())
            .collect();
        for id in stale {
            self.synchronizers.remove(&id);
            events.push(SyncEvent::Destroyed { id });
        }

        for (id, (kind, members)) in declared {
            match self.synchronizers.get_mut(&id) {
                Some(existing) => {
                    existing.origin = SyncOrigin::Stage;
                    if existing.members != members {
                        existing.members = members;
                        events.push(SyncEvent::MembersChanged {
                            id: id.clone(),
                            members: existing.member_ids(),
                        });
                    }
                }
                None => {
                    let synchronizer = Synchronizer {
                        id: id.clone(),
                        kind,
                        enabled: true,
                        origin: SyncOrigin::Stage,
                        members,
                    };
                    events.push(SyncEvent::Created {
                        id: id.clone(),
                        kind,
                        members: synchronizer.member_ids(),
                    });
                    self.synchronizers.insert(id, synchronizer);
                }
            }
        }

        let mut emptied = Vec::new();
        for s in self.synchronizers.values_mut() {
            if s.origin != SyncOrigin::Manual {
                continue;
            }
            let before = s.members.len();
            s.members.retain(|id, _| grid.viewports.contains_key(id));
            if s.members.is_empty() {
                emptied.push(s.id.clone());
            } else if s.members.len() != before {
                events.push(SyncEvent::MembersChanged {
                    id: s.id.clone(),
                    members: s.member_ids(),
                });
            }
        }
        for id in emptied {
            self.synchronizers.remove(&id);
            events.push(SyncEvent::Destroyed { id });
        }

        if !events.is_empty() {
            debug!(count = events.len(), "sync groups reconciled");
        }
        events
    }

    /// Flips an existing synchronizer, or creates an enabled one.
    ///
    /// Without explicit `viewports` the members are chosen from `grid`:
    /// `voi` takes the viewports sharing the active viewport's modality;
    /// `zoompan` and `frameview` take those sharing its orientation, or every
    /// populated viewport with index mapping by position when it has none.
    ///
    /// # Errors
    ///
    /// [`SyncError::KindMismatch`] when `sync_id` exists with another type,
    /// [`SyncError::NoEligibleViewports`] when no member could be chosen.
    pub fn toggle(
        &mut self,
        kind: SyncGroupType,
        sync_id: &str,
        viewports: Option<&[ViewportId]>,
        grid: &GridState,
        display_sets: &[DisplaySet],
    ) -> Result<SyncEvent, SyncError> {
        if let Some(existing) = self.synchronizers.get_mut(sync_id) {
            if existing.kind != kind {
                return Err(SyncError::KindMismatch {
                    id: sync_id.to_string(),
                    existing: existing.kind,
                });
            }
            existing.enabled = !existing.enabled;
            info!(sync_id, enabled = existing.enabled, "synchronizer toggled");
            return Ok(if existing.enabled {
                SyncEvent::Enabled { id: sync_id.to_string() }
            } else {
                SyncEvent::Disabled { id: sync_id.to_string() }
            });
        }

        let members: BTreeMap<ViewportId, SyncRole> = match viewports {
            Some(ids) => ids
                .iter()
                .filter(|id| grid.viewports.contains_key(id.as_str()))
                .map(|id| (id.clone(), SyncRole::both(None)))
                .collect(),
            None => default_members(kind, grid, display_sets),
        };
        if members.is_empty() {
            return Err(SyncError::NoEligibleViewports { kind });
        }

        let synchronizer = Synchronizer {
            id: sync_id.to_string(),
            kind,
            enabled: true,
            origin: SyncOrigin::Manual,
            members,
        };
        let event = SyncEvent::Created {
            id: sync_id.to_string(),
            kind,
            members: synchronizer.member_ids(),
        };
        info!(sync_id, %kind, members = synchronizer.members.len(), "synchronizer created");
        self.synchronizers.insert(sync_id.to_string(), synchronizer);
        Ok(event)
    }

    /// Applies `change` to `source` and propagates it through every enabled
    /// synchronizer of the matching type.  Returns the viewports that changed,
    /// source first.
    pub fn apply_change(
        &self,
        store: &mut PresentationStore,
        source: &str,
        change: &PresentationChange,
    ) -> Vec<ViewportId> {
        change.apply_to(store.entry(source), 0);
        let mut updated = vec![source.to_string()];
        let mut seen: BTreeSet<&str> = BTreeSet::from([source]);

        let kind = change.kind();
        for s in self.synchronizers.values() {
            if !s.enabled || s.kind != kind {
                continue;
            }
            let Some(source_role) = s.members.get(source).filter(|r| r.source) else {
                continue;
            };
            for (target_id, role) in &s.members {
                if !role.target || !seen.insert(target_id.as_str()) {
                    continue;
                }
                let offset = match (source_role.viewport_index, role.viewport_index) {
                    (Some(from), Some(to)) => to.saturating_sub(from),
                    _ => 0,
                };
                change.apply_to(store.entry(target_id), offset);
                updated.push(target_id.clone());
            }
        }
        updated
    }

    /// Drops every synchronizer, emitting one `Destroyed` per entry.
    pub fn clear(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.synchronizers)
            .into_keys()
            .map(|id| SyncEvent::Destroyed { id })
            .collect()
    }
}

fn default_members(
    kind: SyncGroupType,
    grid: &GridState,
    display_sets: &[DisplaySet],
) -> BTreeMap<ViewportId, SyncRole> {
    let lookup = |uid: &str| display_sets.iter().find(|ds| ds.uid == uid);
    let populated: Vec<_> = grid
        .viewports_in_order()
        .into_iter()
        .filter(|vp| !vp.display_set_uids.is_empty())
        .collect();
    let first_set = |vp: &ViewportInstance| {
        vp.display_set_uids.first().and_then(|uid| lookup(uid))
    };
    let orientation_of = |vp: &ViewportInstance| -> Option<String> {
        vp.viewport_options
            .orientation
            .clone()
            .or_else(|| first_set(vp).and_then(|ds| ds.orientation().map(str::to_string)))
    };

    let active = grid.active_viewport();
    match kind {
        SyncGroupType::Voi => {
            let modality = active.and_then(|vp| first_set(vp)).and_then(|ds| ds.modality());
            populated
                .into_iter()
                .filter(|vp| {
                    modality.is_none() || first_set(vp).and_then(|ds| ds.modality()) == modality
                })
                .map(|vp| (vp.viewport_id.clone(), SyncRole::both(None)))
                .collect()
        }
        SyncGroupType::ZoomPan | SyncGroupType::FrameView => {
            match active.and_then(|vp| orientation_of(vp)) {
                Some(orientation) => populated
                    .into_iter()
                    .filter(|vp| orientation_of(vp).as_deref() == Some(orientation.as_str()))
                    .map(|vp| (vp.viewport_id.clone(), SyncRole::both(None)))
                    .collect(),
                None => populated
                    .into_iter()
                    .enumerate()
                    .map(|(index, vp)| (vp.viewport_id.clone(), SyncRole::both(Some(index as i64))))
                    .collect(),
            }
        }
    }
}
