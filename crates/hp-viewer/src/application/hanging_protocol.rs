//! HangingProtocolController: the viewer's layout state machine.
//!
//! The controller is the only writer of the viewport grid.  Every operation
//! runs to completion, either commits one new [`GridState`] or leaves the
//! previous one untouched, and reports failures through the
//! [`NotificationSink`](super::ports::NotificationSink).
//!
//! # States
//!
//! ```text
//!            set_hanging_protocol / first display sets
//!   Idle ─────────────────────────────────────────────► Applied(protocol, stage)
//!    ▲                                                    │   ▲
//!    │ exit_session                 delta_stage, toggle,  │   │
//!    └────────────────────────────  set_hanging_protocol  └───┘
//!
//!   orthogonal:  one-up entered ──toggle_one_up──► saved grid restored
//! ```
//!
//! # Reversibility (for beginners)
//!
//! Before any protocol or stage change, the grid currently on screen is cached
//! under `study:protocol:stage`.  Coming back to that key later restores the
//! cached grid verbatim, including anything the user changed by hand.  A
//! toggle additionally remembers which `(protocol, stage)` it replaced, so the
//! same toggle command run twice lands exactly where it started.

use std::fmt;
use std::time::Duration;

use hp_core::{
    collapse_to_one_up, domain::matcher::study_display_sets, match_selectors, reshape,
    resolve_stage, AppliedProtocol, DisplaySet, GridLayout, GridState, GridStore, MatchError,
    PresentationChange, PresentationStore, Protocol, ProtocolKey, ProtocolLibrary,
    ProtocolMatcher, SessionContext, SnapshotKey, SyncError, SyncEvent, SyncGroupCoordinator,
    SyncGroupType, Synchronizer, ViewportId, ViewportPresentation,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::commands::SetHangingProtocolArgs;
use super::deferred::{DeferredSlot, DeferredTask, ScheduledTask};
use super::hooks::{LayoutChange, LayoutHookRegistry, Vetoed};
use super::ports::{DisplaySetEvent, Notification, NotificationKind, ViewerPorts};

const APPLY_TITLE: &str = "Apply Hanging Protocol";
const APPLY_FAILED_MESSAGE: &str = "The hanging protocol could not be applied.";
const CHANGE_STAGE_TITLE: &str = "Change Stage";
const NO_MORE_STAGES_MESSAGE: &str = "The hanging protocol has no more applicable stages";
const LOADING_TITLE: &str = "Loading in Progress";
const LOADING_MESSAGE: &str =
    "Please ensure all images are fully loaded before using MPR or 3D view.";
const SYNC_TITLE: &str = "Toggle Synchronizer";
const NO_PROTOCOL: &str = "<none>";

/// Controller tuning, normally read from the `[engine]` config table.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Used when no protocol matches the study.
    pub default_protocol_id: String,
    /// Restored by a toggle-off that has no recorded predecessor.
    pub baseline_protocol_id: String,
    /// Wait before retrying a toggle whose series are still loading.
    pub loading_retry_delay: Duration,
    pub notification_duration_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_protocol_id: "default".to_string(),
            baseline_protocol_id: "default".to_string(),
            loading_retry_delay: Duration::from_millis(500),
            notification_duration_ms: 3000,
        }
    }
}

/// Failures of controller operations.  None of them is fatal: the grid on
/// screen is unchanged whenever one is returned.
#[derive(Debug, Error, PartialEq)]
pub enum HangingProtocolError {
    #[error("protocol matching failed: {0}")]
    MatchingFailure(#[from] MatchError),

    #[error("could not apply protocol '{protocol_id}': {reason}")]
    ApplyFailure { protocol_id: String, reason: String },

    /// The operation was parked and will be retried.
    #[error("display set '{display_set_uid}' needed by '{protocol_id}' is still loading")]
    LoadingNotReady {
        protocol_id: String,
        display_set_uid: String,
    },

    #[error("protocol '{protocol_id}' has no more applicable stages")]
    StageRangeExhausted { protocol_id: String },

    #[error("no hanging protocol is applied")]
    NotApplied,

    #[error(transparent)]
    Vetoed(#[from] Vetoed),

    #[error("synchronizer error: {0}")]
    Sync(#[from] SyncError),
}

fn apply_failure(protocol_id: &str, reason: impl fmt::Display) -> HangingProtocolError {
    HangingProtocolError::ApplyFailure {
        protocol_id: protocol_id.to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    Applied(AppliedProtocol),
}

impl ControllerState {
    pub fn applied(&self) -> Option<&AppliedProtocol> {
        match self {
            ControllerState::Idle => None,
            ControllerState::Applied(applied) => Some(applied),
        }
    }
}

/// Index of the first enabled stage after `from`, stepping by `direction`.
pub fn next_enabled_stage(protocol: &Protocol, from: usize, direction: i32) -> Option<usize> {
    if direction == 0 {
        return None;
    }
    let step = direction as isize;
    let mut index = from as isize + step;
    while index >= 0 && (index as usize) < protocol.stages.len() {
        if protocol.stages[index as usize].is_enabled() {
            return Some(index as usize);
        }
        index += step;
    }
    None
}

/// The hanging-protocol state machine.
pub struct HangingProtocolController {
    session_id: Uuid,
    settings: EngineSettings,
    library: ProtocolLibrary,
    matcher: ProtocolMatcher,
    grid: GridStore,
    session: SessionContext,
    sync: SyncGroupCoordinator,
    presentations: PresentationStore,
    hooks: LayoutHookRegistry,
    deferred: DeferredSlot,
    state: ControllerState,
    active_study_uid: Option<String>,
    ports: ViewerPorts,
}

impl HangingProtocolController {
    pub fn new(settings: EngineSettings, library: ProtocolLibrary, ports: ViewerPorts) -> Self {
        let session_id = Uuid::new_v4();
        info!(%session_id, protocols = library.len(), "hanging protocol session started");
        Self {
            session_id,
            matcher: ProtocolMatcher::new(settings.default_protocol_id.clone()),
            settings,
            library,
            grid: GridStore::new(),
            session: SessionContext::new(),
            sync: SyncGroupCoordinator::new(),
            presentations: PresentationStore::new(),
            hooks: LayoutHookRegistry::new(),
            deferred: DeferredSlot::new(),
            state: ControllerState::Idle,
            active_study_uid: None,
            ports,
        }
    }

    // ── Read access ───────────────────────────────────────────────────────────

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn applied(&self) -> Option<&AppliedProtocol> {
        self.state.applied()
    }

    pub fn active_study_uid(&self) -> Option<&str> {
        self.active_study_uid.as_deref()
    }

    /// Copy of the live grid.
    pub fn grid(&self) -> GridState {
        self.grid.snapshot()
    }

    pub fn grid_revision(&self) -> u64 {
        self.grid.revision()
    }

    pub fn library(&self) -> &ProtocolLibrary {
        &self.library
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn synchronizer(&self, sync_id: &str) -> Option<&Synchronizer> {
        self.sync.get(sync_id)
    }

    pub fn presentation(&self, viewport_id: &str) -> ViewportPresentation {
        self.presentations.get(viewport_id)
    }

    pub fn pending_task(&self) -> Option<&ScheduledTask> {
        self.deferred.pending()
    }

    pub fn hooks_mut(&mut self) -> &mut LayoutHookRegistry {
        &mut self.hooks
    }

    fn current_protocol(&self) -> Option<&Protocol> {
        self.state
            .applied()
            .and_then(|applied| self.library.get(&applied.protocol_id))
    }

    fn failure(&self, reason: impl fmt::Display) -> HangingProtocolError {
        let protocol_id = self
            .state
            .applied()
            .map_or(NO_PROTOCOL, |applied| applied.protocol_id.as_str());
        apply_failure(protocol_id, reason)
    }

    // ── setHangingProtocol ────────────────────────────────────────────────────

    /// Applies a protocol stage, restoring a cached layout when one exists.
    ///
    /// A protocol that is unknown or does not match the study falls back to
    /// the default protocol; that is reported as information and still
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`HangingProtocolError::MatchingFailure`] or
    /// [`HangingProtocolError::ApplyFailure`]; the grid is left as it was.
    pub fn set_hanging_protocol(
        &mut self,
        args: SetHangingProtocolArgs,
    ) -> Result<(), HangingProtocolError> {
        self.deferred.cancel();
        let result = self.apply_protocol(&args);
        self.report(result)
    }

    fn apply_protocol(&mut self, args: &SetHangingProtocolArgs) -> Result<(), HangingProtocolError> {
        self.cache_current_layout();

        let display_sets = self.ports.display_sets.active_display_sets();
        let study_uid = self.resolve_study(args.active_study_uid.as_deref(), &display_sets)?;
        let study_changed = self.active_study_uid.as_deref() != Some(study_uid.as_str());
        let current = self.state.applied().cloned();

        let requested = args
            .protocol_id
            .clone()
            .or_else(|| current.as_ref().map(|c| c.protocol_id.clone()));
        let outcome = match requested.as_deref() {
            None => self
                .matcher
                .run(self.library.iter(), &self.library, &study_uid, &display_sets)?,
            Some(id) => self
                .matcher
                .run(self.library.get(id), &self.library, &study_uid, &display_sets)?,
        };
        if outcome.fell_back {
            info!(
                session_id = %self.session_id,
                requested = requested.as_deref().unwrap_or(NO_PROTOCOL),
                fallback = %outcome.protocol_id,
                "no matching protocol; using default"
            );
            self.ports.notifications.show(Notification::new(
                APPLY_TITLE,
                format!("No matching hanging protocol; using '{}'.", outcome.protocol_id),
                NotificationKind::Info,
                self.settings.notification_duration_ms,
            ));
        }

        let protocol = self
            .library
            .get(&outcome.protocol_id)
            .ok_or_else(|| apply_failure(&outcome.protocol_id, "protocol is not loaded"))?;
        let protocol_id = protocol.id.clone();

        let explicit_stage =
            !outcome.fell_back && (args.stage_id.is_some() || args.stage_index.is_some());
        let stage_index = if explicit_stage {
            protocol
                .stage_index(args.stage_id.as_deref(), args.stage_index)
                .ok_or_else(|| apply_failure(&protocol_id, "unknown stage"))?
        } else {
            match &current {
                Some(c) if args.protocol_id.is_none() && c.protocol_id == protocol_id => c.stage_index,
                _ => self
                    .session
                    .last_stage(&ProtocolKey::new(&study_uid, &protocol_id))
                    .filter(|index| *index < protocol.stages.len())
                    .unwrap_or(0),
            }
        };
        let stage = protocol
            .stage(stage_index)
            .cloned()
            .ok_or_else(|| apply_failure(&protocol_id, "protocol has no stages"))?;

        let key = SnapshotKey::new(&study_uid, &protocol_id, stage_index);
        let target = AppliedProtocol::new(protocol_id.clone(), stage_index);
        let cold = args.reset
            || current.is_none()
            || (study_changed && !self.session.has_snapshot(&key) && !explicit_stage);

        let (next, restored) = if cold {
            let grid = resolve_stage(&stage, &outcome.selector_map, &GridState::empty(), true);
            (grid, false)
        } else if current.as_ref() == Some(&target) && args.active_study_uid.is_none() {
            let grid = resolve_stage(&stage, &outcome.selector_map, self.grid.current(), true);
            (grid, false)
        } else if let Some(snapshot) = self.session.snapshot(&key) {
            (Ok(snapshot.clone()), true)
        } else {
            let grid = resolve_stage(&stage, &outcome.selector_map, self.grid.current(), true);
            (grid, false)
        };
        let next = next.map_err(|e| apply_failure(&protocol_id, e))?;

        self.commit_grid(next)
            .map_err(|e| apply_failure(&protocol_id, e))?;

        self.session
            .remember_stage(ProtocolKey::new(&study_uid, &protocol_id), stage_index);
        self.session.set_selector_map(outcome.selector_map);
        self.session.take_one_up();
        self.state = ControllerState::Applied(target);
        self.active_study_uid = Some(study_uid);

        info!(
            session_id = %self.session_id,
            protocol = %protocol_id,
            stage = stage_index,
            cold,
            restored,
            "hanging protocol applied"
        );
        Ok(())
    }

    /// Stores the grid on screen under the current `study:protocol:stage`.
    fn cache_current_layout(&mut self) {
        let (Some(applied), Some(study)) = (self.state.applied(), self.active_study_uid.as_deref())
        else {
            return;
        };
        let grid = self.grid.current();
        if grid.is_empty() {
            return;
        }
        let key = SnapshotKey::new(study, &applied.protocol_id, applied.stage_index);
        if self.session.store_snapshot(key.clone(), grid) {
            debug!(session_id = %self.session_id, key = %key, "layout cached");
        }
        self.session
            .remember_stage(key.protocol_key(), applied.stage_index);
    }

    fn resolve_study(
        &self,
        requested: Option<&str>,
        display_sets: &[DisplaySet],
    ) -> Result<String, HangingProtocolError> {
        requested
            .or(self.active_study_uid.as_deref())
            .or_else(|| display_sets.first().map(|ds| ds.study_instance_uid.as_str()))
            .map(str::to_string)
            .ok_or_else(|| self.failure("no active study"))
    }

    // ── toggleHangingProtocol ─────────────────────────────────────────────────

    /// Switches to `protocol_id`, or back to what it replaced when it is
    /// already showing.
    ///
    /// # Errors
    ///
    /// [`HangingProtocolError::LoadingNotReady`] when a series the target stage
    /// needs is still loading; the toggle is then retried after the configured
    /// delay.  Otherwise as [`Self::set_hanging_protocol`].
    pub fn toggle_hanging_protocol(
        &mut self,
        protocol_id: &str,
        stage_index: Option<usize>,
    ) -> Result<(), HangingProtocolError> {
        self.deferred.cancel();
        let result = self.toggle_protocol(protocol_id, stage_index);
        self.report(result)
    }

    fn toggle_protocol(
        &mut self,
        protocol_id: &str,
        stage_index: Option<usize>,
    ) -> Result<(), HangingProtocolError> {
        let display_sets = self.ports.display_sets.active_display_sets();
        let study_uid = self.resolve_study(None, &display_sets)?;
        let key = SnapshotKey::new(&study_uid, protocol_id, stage_index.unwrap_or(0));

        let is_current = self.state.applied().is_some_and(|applied| {
            applied.protocol_id == protocol_id
                && stage_index.map_or(true, |index| index == applied.stage_index)
        });

        if is_current {
            let args = match self.session.toggle_return(&key) {
                Some(previous) => SetHangingProtocolArgs::protocol(previous.protocol_id.clone())
                    .at_stage(previous.stage_index),
                None => SetHangingProtocolArgs::protocol(self.settings.baseline_protocol_id.clone()),
            };
            info!(session_id = %self.session_id, key = %key, "toggling protocol off");
            return self.apply_protocol(&args);
        }

        if let Some(loading) = self.loading_display_set(protocol_id, stage_index, &study_uid, &display_sets) {
            self.deferred.schedule(
                self.settings.loading_retry_delay,
                DeferredTask::ProtocolToggle {
                    protocol_id: protocol_id.to_string(),
                    stage_index,
                },
            );
            return Err(HangingProtocolError::LoadingNotReady {
                protocol_id: protocol_id.to_string(),
                display_set_uid: loading,
            });
        }

        let previous = self.state.applied().cloned();
        let mut args = SetHangingProtocolArgs::protocol(protocol_id).with_reset();
        args.stage_index = stage_index;
        self.apply_protocol(&args)?;

        if let Some(previous) = previous {
            info!(session_id = %self.session_id, key = %key, "toggled protocol on");
            self.session.record_toggle(key, previous);
        }
        Ok(())
    }

    /// First display set the target stage would show that is still loading.
    fn loading_display_set(
        &self,
        protocol_id: &str,
        stage_index: Option<usize>,
        study_uid: &str,
        display_sets: &[DisplaySet],
    ) -> Option<String> {
        let protocol = self.library.get(protocol_id)?;
        let index = stage_index
            .or_else(|| self.session.last_stage(&ProtocolKey::new(study_uid, protocol_id)))
            .unwrap_or(0);
        let stage = protocol.stage(index)?;
        let selectors = match_selectors(protocol, &study_display_sets(study_uid, display_sets));

        stage
            .slots
            .iter()
            .flat_map(|slot| &slot.display_set_refs)
            .filter_map(|r| selectors.resolve(&r.selector_id, r.match_index))
            .find(|uid| self.ports.display_sets.is_loading(uid))
            .map(str::to_string)
    }

    // ── Stage navigation ──────────────────────────────────────────────────────

    /// Moves to the first enabled stage in `direction` (+1 forward, -1 back).
    ///
    /// # Errors
    ///
    /// [`HangingProtocolError::NotApplied`] before any protocol is applied;
    /// [`HangingProtocolError::StageRangeExhausted`] when no enabled stage is
    /// left in that direction (nothing changes).
    pub fn delta_stage(&mut self, direction: i32) -> Result<(), HangingProtocolError> {
        self.deferred.cancel();
        let result = self.change_stage(direction);
        self.report(result)
    }

    pub fn next_stage(&mut self) -> Result<(), HangingProtocolError> {
        self.delta_stage(1)
    }

    pub fn previous_stage(&mut self) -> Result<(), HangingProtocolError> {
        self.delta_stage(-1)
    }

    fn change_stage(&mut self, direction: i32) -> Result<(), HangingProtocolError> {
        let applied = self
            .state
            .applied()
            .cloned()
            .ok_or(HangingProtocolError::NotApplied)?;
        let protocol = self
            .library
            .get(&applied.protocol_id)
            .ok_or_else(|| apply_failure(&applied.protocol_id, "protocol is not loaded"))?;

        let target = next_enabled_stage(protocol, applied.stage_index, direction).ok_or_else(|| {
            HangingProtocolError::StageRangeExhausted {
                protocol_id: applied.protocol_id.clone(),
            }
        })?;
        debug!(session_id = %self.session_id, from = applied.stage_index, to = target, "changing stage");
        self.apply_protocol(&SetHangingProtocolArgs::protocol(applied.protocol_id).at_stage(target))
    }

    // ── setViewportGridLayout ─────────────────────────────────────────────────

    /// Requests a free-form `num_rows × num_cols` grid.
    ///
    /// The protocol's layout hook runs first and may veto.  The change itself
    /// is committed at the end of the tick by [`Self::run_deferred`]; a later
    /// layout command issued before then replaces it; a vetoed one does not.
    ///
    /// # Errors
    ///
    /// [`HangingProtocolError::Vetoed`] from the hook, or
    /// [`HangingProtocolError::ApplyFailure`] for a zero-sized grid.
    pub fn set_viewport_grid_layout(
        &mut self,
        num_rows: u32,
        num_cols: u32,
        is_hanging_protocol_layout: bool,
    ) -> Result<(), HangingProtocolError> {
        let result = self.request_layout(GridLayout::new(num_rows, num_cols), is_hanging_protocol_layout);
        self.report(result)
    }

    fn request_layout(
        &mut self,
        layout: GridLayout,
        is_hanging_protocol_layout: bool,
    ) -> Result<(), HangingProtocolError> {
        if layout.capacity() == 0 {
            return Err(self.failure(format!("invalid grid layout {layout}")));
        }

        let change = LayoutChange {
            protocol_id: self.state.applied().map(|a| a.protocol_id.clone()),
            from: self.grid.current().layout(),
            to: layout,
            is_hanging_protocol_layout,
        };
        if let Some(hook) = self
            .current_protocol()
            .and_then(|p| p.callbacks.on_layout_change.as_deref())
        {
            self.hooks.run(hook, &change)?;
        }

        self.deferred.cancel();
        let id = self.deferred.schedule(
            Duration::ZERO,
            DeferredTask::LayoutCommit {
                layout,
                is_hanging_protocol_layout,
            },
        );
        debug!(session_id = %self.session_id, id, %layout, "layout change scheduled");
        Ok(())
    }

    fn commit_layout(
        &mut self,
        layout: GridLayout,
        is_hanging_protocol_layout: bool,
    ) -> Result<(), HangingProtocolError> {
        let previous = self.grid.snapshot();

        if layout == GridLayout::ONE_UP && !previous.is_one_up() && !previous.is_empty() {
            let collapsed = collapse_to_one_up(&previous, is_hanging_protocol_layout)
                .ok_or_else(|| self.failure("grid has no active viewport"))?;
            self.commit_grid(collapsed).map_err(|e| self.failure(e))?;
            self.session.save_one_up(previous);
        } else {
            let template = self.current_protocol().and_then(|p| p.default_viewport.as_ref());
            let next = reshape(
                &previous,
                layout,
                is_hanging_protocol_layout,
                template,
                self.session.selector_map(),
            );
            self.commit_grid(next).map_err(|e| self.failure(e))?;
            if layout != GridLayout::ONE_UP {
                self.session.take_one_up();
            }
        }

        info!(session_id = %self.session_id, %layout, "grid layout changed");
        Ok(())
    }

    // ── toggleOneUp ───────────────────────────────────────────────────────────

    /// Expands the active viewport to 1×1, or restores the grid it came from.
    ///
    /// A 1×1 grid with nothing saved is left alone.
    ///
    /// # Errors
    ///
    /// [`HangingProtocolError::ApplyFailure`] when there is no active viewport
    /// to expand or the restored grid is invalid.
    pub fn toggle_one_up(&mut self) -> Result<(), HangingProtocolError> {
        self.deferred.cancel();
        let result = self.flip_one_up();
        self.report(result)
    }

    fn flip_one_up(&mut self) -> Result<(), HangingProtocolError> {
        let current = self.grid.snapshot();

        if current.is_one_up() {
            let Some(mut restored) = self.session.one_up_return().cloned() else {
                debug!(session_id = %self.session_id, "one-up has nothing to restore");
                return Ok(());
            };

            // The one-up viewport may have been given another series meanwhile.
            if let Some(vp) = current.active_viewport() {
                if let [uid] = vp.display_set_uids.as_slice() {
                    let changed = restored
                        .viewport(&vp.viewport_id)
                        .is_some_and(|saved| saved.display_set_uids != vp.display_set_uids);
                    if changed {
                        restored = self.place_display_set(&restored, &vp.viewport_id, uid)?;
                    }
                }
            }

            self.commit_grid(restored).map_err(|e| self.failure(e))?;
            self.session.take_one_up();
            self.ports.tools.reset_crosshairs();
            info!(session_id = %self.session_id, "one-up restored");
        } else {
            let collapsed = collapse_to_one_up(&current, false)
                .ok_or_else(|| self.failure("grid has no active viewport"))?;
            self.commit_grid(collapsed).map_err(|e| self.failure(e))?;
            self.session.save_one_up(current);
            info!(session_id = %self.session_id, "one-up entered");
        }
        Ok(())
    }

    // ── Display set placement ─────────────────────────────────────────────────

    /// Shows `display_set_uid` in `viewport_id` (drag and drop).
    ///
    /// # Errors
    ///
    /// [`HangingProtocolError::ApplyFailure`] for an unknown viewport or
    /// display set.
    pub fn set_display_set_for_viewport(
        &mut self,
        viewport_id: &str,
        display_set_uid: &str,
    ) -> Result<(), HangingProtocolError> {
        self.deferred.cancel();
        let result = self.assign_display_set(viewport_id, display_set_uid);
        self.report(result)
    }

    fn assign_display_set(
        &mut self,
        viewport_id: &str,
        display_set_uid: &str,
    ) -> Result<(), HangingProtocolError> {
        let known = self
            .ports
            .display_sets
            .active_display_sets()
            .iter()
            .any(|ds| ds.uid == display_set_uid);
        if !known {
            return Err(self.failure(format!("unknown display set '{display_set_uid}'")));
        }

        let next = self.place_display_set(self.grid.current(), viewport_id, display_set_uid)?;
        self.commit_grid(next).map_err(|e| self.failure(e))?;
        debug!(session_id = %self.session_id, viewport_id, display_set_uid, "display set placed");
        Ok(())
    }

    /// `grid` with `display_set_uid` placed in `viewport_id`, as the renderer
    /// asks for it.
    fn place_display_set(
        &self,
        grid: &GridState,
        viewport_id: &str,
        display_set_uid: &str,
    ) -> Result<GridState, HangingProtocolError> {
        let target = grid
            .viewport(viewport_id)
            .ok_or_else(|| self.failure(format!("unknown viewport '{viewport_id}'")))?;

        let updates = self.ports.renderer.viewports_require_update(
            grid,
            viewport_id,
            display_set_uid,
            grid.is_hanging_protocol_layout,
        );

        let mut next = grid.clone();
        if updates.is_empty() {
            let mut replaced = target.clone();
            replaced.display_set_uids = vec![display_set_uid.to_string()];
            replaced.display_set_options = vec![Default::default()];
            next.viewports.insert(replaced.viewport_id.clone(), replaced);
        } else {
            for update in updates {
                next.viewports.insert(update.viewport_id.clone(), update);
            }
        }
        Ok(next)
    }

    // ── Synchronizers ─────────────────────────────────────────────────────────

    /// Flips synchronizer `sync_id`, creating it when absent.
    ///
    /// # Errors
    ///
    /// [`HangingProtocolError::Sync`] when the id names another type or no
    /// viewport qualifies.
    pub fn toggle_synchronizer(
        &mut self,
        kind: SyncGroupType,
        sync_id: &str,
        viewports: Option<&[ViewportId]>,
    ) -> Result<SyncEvent, HangingProtocolError> {
        let display_sets = self.ports.display_sets.active_display_sets();
        let result = self
            .sync
            .toggle(kind, sync_id, viewports, self.grid.current(), &display_sets)
            .map_err(HangingProtocolError::from);
        if let Ok(event) = &result {
            self.ports
                .tools
                .apply_sync_events(std::slice::from_ref(event));
        }
        self.report(result)
    }

    /// Applies a user interaction on `viewport_id` and propagates it through
    /// the enabled synchronizers.  Returns every viewport that changed.
    ///
    /// # Errors
    ///
    /// [`HangingProtocolError::ApplyFailure`] for an unknown viewport.
    pub fn apply_presentation_change(
        &mut self,
        viewport_id: &str,
        change: &PresentationChange,
    ) -> Result<Vec<ViewportId>, HangingProtocolError> {
        if self.grid.current().viewport(viewport_id).is_none() {
            let err = self.failure(format!("unknown viewport '{viewport_id}'"));
            return self.report(Err(err));
        }
        Ok(self
            .sync
            .apply_change(&mut self.presentations, viewport_id, change))
    }

    // ── Display set events ────────────────────────────────────────────────────

    /// Reacts to series arriving or changing.
    ///
    /// While idle, the first arrival hangs the best matching protocol.  While
    /// applied, the current stage is re-matched and re-resolved, unless the
    /// user has replaced the protocol layout with a free-form grid.
    ///
    /// # Errors
    ///
    /// As [`Self::set_hanging_protocol`].
    pub fn on_display_sets_event(
        &mut self,
        event: &DisplaySetEvent,
    ) -> Result<(), HangingProtocolError> {
        debug!(session_id = %self.session_id, ?event, "display sets event");
        if self.state.applied().is_some() {
            let result = self.refresh_current_stage();
            return self.report(result);
        }
        if self.ports.display_sets.active_display_sets().is_empty() {
            return Ok(());
        }
        info!(session_id = %self.session_id, "display sets arrived; hanging study");
        self.set_hanging_protocol(SetHangingProtocolArgs::default())
    }

    fn refresh_current_stage(&mut self) -> Result<(), HangingProtocolError> {
        let applied = self
            .state
            .applied()
            .cloned()
            .ok_or(HangingProtocolError::NotApplied)?;
        let display_sets = self.ports.display_sets.active_display_sets();
        let study_uid = self.resolve_study(None, &display_sets)?;
        let protocol = self
            .library
            .get(&applied.protocol_id)
            .ok_or_else(|| apply_failure(&applied.protocol_id, "protocol is not loaded"))?;

        let selectors = match_selectors(protocol, &study_display_sets(&study_uid, &display_sets));
        if self.grid.current().is_hanging_protocol_layout {
            let stage = protocol
                .stage(applied.stage_index)
                .ok_or_else(|| apply_failure(&applied.protocol_id, "unknown stage"))?;
            let next = resolve_stage(stage, &selectors, self.grid.current(), true)
                .map_err(|e| apply_failure(&applied.protocol_id, e))?;
            self.commit_grid(next)
                .map_err(|e| apply_failure(&applied.protocol_id, e))?;
        }
        self.session.set_selector_map(selectors);
        debug!(session_id = %self.session_id, protocol = %applied.protocol_id, "stage refreshed");
        Ok(())
    }

    // ── Deferred work ─────────────────────────────────────────────────────────

    /// Runs the pending deferred task now.  Returns whether one ran.
    ///
    /// # Errors
    ///
    /// The task's own failure, already reported.
    pub fn run_deferred(&mut self) -> Result<bool, HangingProtocolError> {
        match self.deferred.take() {
            Some(task) => self.run_task(task),
            None => Ok(false),
        }
    }

    /// Runs task `id` if it is still the pending one.  Returns whether it ran.
    ///
    /// # Errors
    ///
    /// The task's own failure, already reported.
    pub fn run_deferred_task(&mut self, id: u64) -> Result<bool, HangingProtocolError> {
        match self.deferred.take_if(id) {
            Some(task) => self.run_task(task),
            None => {
                debug!(session_id = %self.session_id, id, "stale deferred task skipped");
                Ok(false)
            }
        }
    }

    fn run_task(&mut self, scheduled: ScheduledTask) -> Result<bool, HangingProtocolError> {
        debug!(session_id = %self.session_id, id = scheduled.id, "running deferred task");
        match scheduled.task {
            DeferredTask::LayoutCommit {
                layout,
                is_hanging_protocol_layout,
            } => {
                let result = self.commit_layout(layout, is_hanging_protocol_layout);
                self.report(result)?;
            }
            DeferredTask::ProtocolToggle {
                protocol_id,
                stage_index,
            } => match self.toggle_protocol(&protocol_id, stage_index) {
                // Rescheduled inside; the user was already told.
                Err(HangingProtocolError::LoadingNotReady { .. }) => {
                    debug!(session_id = %self.session_id, protocol = %protocol_id, "still loading");
                }
                other => {
                    self.report(other)?;
                }
            },
        }
        Ok(true)
    }

    // ── Session ───────────────────────────────────────────────────────────────

    /// Drops every cache and synchronizer and returns to `Idle` with an empty
    /// grid.
    pub fn exit_session(&mut self) {
        self.deferred.cancel();
        self.session.clear();
        let events = self.sync.clear();
        if !events.is_empty() {
            self.ports.tools.apply_sync_events(&events);
        }
        self.presentations.clear();
        self.grid.clear();
        self.ports.renderer.commit(self.grid.current());
        self.state = ControllerState::Idle;
        self.active_study_uid = None;
        info!(session_id = %self.session_id, "hanging protocol session ended");
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// Commits `next` and brings synchronizers and the renderer in line.
    fn commit_grid(&mut self, next: GridState) -> Result<(), hp_core::GridError> {
        self.grid.commit(next)?;
        let grid = self.grid.current();
        let events = self.sync.reconcile(grid);
        if !events.is_empty() {
            self.ports.tools.apply_sync_events(&events);
        }
        self.presentations.retain_grid(grid);
        self.ports.renderer.commit(grid);
        Ok(())
    }

    /// Shows `result`'s error to the user, then hands `result` back.
    fn report<T>(&self, result: Result<T, HangingProtocolError>) -> Result<T, HangingProtocolError> {
        if let Err(err) = &result {
            self.notify(err);
        }
        result
    }

    fn notify(&self, err: &HangingProtocolError) {
        let duration = self.settings.notification_duration_ms;
        let notification = match err {
            HangingProtocolError::LoadingNotReady { .. } => {
                warn!(session_id = %self.session_id, %err, "protocol toggle deferred");
                Notification::new(LOADING_TITLE, LOADING_MESSAGE, NotificationKind::Warning, duration)
            }
            HangingProtocolError::StageRangeExhausted { .. } => {
                info!(session_id = %self.session_id, %err, "stage change ignored");
                Notification::new(CHANGE_STAGE_TITLE, NO_MORE_STAGES_MESSAGE, NotificationKind::Info, duration)
            }
            HangingProtocolError::Vetoed(veto) => {
                info!(session_id = %self.session_id, hook = %veto.hook, reason = %veto.reason, "layout change vetoed");
                return;
            }
            HangingProtocolError::Sync(_) => {
                warn!(session_id = %self.session_id, %err, "synchronizer toggle failed");
                Notification::new(SYNC_TITLE, err.to_string(), NotificationKind::Error, duration)
            }
            HangingProtocolError::NotApplied
            | HangingProtocolError::MatchingFailure(_)
            | HangingProtocolError::ApplyFailure { .. } => {
                error!(session_id = %self.session_id, %err, "hanging protocol operation failed");
                Notification::new(APPLY_TITLE, APPLY_FAILED_MESSAGE, NotificationKind::Error, duration)
            }
        };
        self.ports.notifications.show(notification);
    }
}
