//! Headless rendering side: a renderer and a tool runtime that record what
//! the controller asks of them.
//!
//! A real viewer would create rendering viewports and tool synchronizers here.
//! The headless host only needs to know what was committed, so both adapters
//! keep a log that the command bridge and tests can inspect.

use std::sync::{Mutex, PoisonError};

use hp_core::{DisplaySetOptions, GridState, SyncEvent, ViewportInstance};
use tracing::debug;

use crate::application::ports::{ToolRuntime, ViewportRenderer};

#[derive(Debug, Default)]
pub struct InMemoryViewportRenderer {
    commits: Mutex<Vec<GridState>>,
}

impl InMemoryViewportRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn last_commit(&self) -> Option<GridState> {
        self.commits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl ViewportRenderer for InMemoryViewportRenderer {
    fn commit(&self, grid: &GridState) {
        debug!(layout = %grid.layout(), viewports = grid.viewports.len(), "grid rendered");
        self.commits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(grid.clone());
    }

    /// Replaces the target viewport's display sets.  Stack viewports show one
    /// series; volume viewports keep any fused series after the first.
    fn viewports_require_update(
        &self,
        grid: &GridState,
        viewport_id: &str,
        display_set_uid: &str,
        _is_hanging_protocol_layout: bool,
    ) -> Vec<ViewportInstance> {
        let Some(target) = grid.viewport(viewport_id) else {
            return Vec::new();
        };
        let mut updated = target.clone();
        if updated.display_set_uids.len() > 1 {
            updated.display_set_uids[0] = display_set_uid.to_string();
        } else {
            updated.display_set_uids = vec![display_set_uid.to_string()];
            updated.display_set_options = vec![DisplaySetOptions::new()];
        }
        vec![updated]
    }
}

#[derive(Debug, Default)]
pub struct InMemoryToolRuntime {
    events: Mutex<Vec<SyncEvent>>,
    crosshair_resets: Mutex<usize>,
}

impl InMemoryToolRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn crosshair_resets(&self) -> usize {
        *self.crosshair_resets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ToolRuntime for InMemoryToolRuntime {
    fn apply_sync_events(&self, events: &[SyncEvent]) {
        debug!(count = events.len(), "sync events applied");
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(events);
    }

    fn reset_crosshairs(&self) {
        *self.crosshair_resets.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }
}
