//! Viewport grid state: the live record of layout shape and
//! viewport-to-display-set bindings.
//!
//! [`GridState`] is a plain value.  [`GridStore`] holds the one live copy and
//! hands out clones, so consumers always see an immutable point-in-time
//! snapshot and can never mutate the engine's state behind its back.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::display_set::{AttributeValue, DisplaySetUid};
use super::protocol::{GridLayout, ViewportId, ViewportOptions};

/// Violations of the grid invariants.
#[derive(Debug, Error, PartialEq)]
pub enum GridError {
    #[error("grid {layout} cannot hold {count} viewports")]
    TooManyViewports { layout: GridLayout, count: usize },

    #[error("position {0} is used by more than one viewport")]
    DuplicatePosition(String),

    #[error("viewport {viewport_id} is outside grid {layout}")]
    OutOfBounds { viewport_id: ViewportId, layout: GridLayout },

    #[error("active viewport '{0}' is not in the grid")]
    ActiveViewportMissing(String),

    #[error("grid has viewports but no active viewport")]
    NoActiveViewport,
}

/// Cell coordinates of a viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridPosition {
    pub row: u32,
    pub col: u32,
}

impl GridPosition {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Position of the `index`-th cell in row-major order.
    pub fn from_index(index: usize, cols: u32) -> Self {
        let cols = cols.max(1) as usize;
        Self {
            row: (index / cols) as u32,
            col: (index % cols) as u32,
        }
    }

    /// Stable textual id, `"{col}-{row}"`.
    pub fn position_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for GridPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.col, self.row)
    }
}

/// Options attached to one display set inside one viewport.
pub type DisplaySetOptions = BTreeMap<String, AttributeValue>;

/// One viewport of the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewportInstance {
    pub viewport_id: ViewportId,
    pub position: GridPosition,
    pub display_set_uids: Vec<DisplaySetUid>,
    /// Parallel to `display_set_uids`.
    pub display_set_options: Vec<DisplaySetOptions>,
    pub viewport_options: ViewportOptions,
}

impl ViewportInstance {
    /// An empty viewport with default options.
    pub fn empty(viewport_id: impl Into<String>, position: GridPosition) -> Self {
        Self {
            viewport_id: viewport_id.into(),
            position,
            display_set_uids: Vec::new(),
            display_set_options: Vec::new(),
            viewport_options: ViewportOptions::default(),
        }
    }

    pub fn position_id(&self) -> String {
        self.position.position_id()
    }

    pub fn shows(&self, display_set_uid: &str) -> bool {
        self.display_set_uids.iter().any(|uid| uid == display_set_uid)
    }
}

/// Layout shape, viewport bindings and active viewport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridState {
    pub num_rows: u32,
    pub num_cols: u32,
    pub viewports: BTreeMap<ViewportId, ViewportInstance>,
    pub active_viewport_id: Option<ViewportId>,
    pub is_hanging_protocol_layout: bool,
}

impl Default for GridState {
    fn default() -> Self {
        Self::empty()
    }
}

impl GridState {
    /// The state before any protocol has been applied: 1×1, no viewports.
    pub fn empty() -> Self {
        Self {
            num_rows: 1,
            num_cols: 1,
            viewports: BTreeMap::new(),
            active_viewport_id: None,
            is_hanging_protocol_layout: false,
        }
    }

    pub fn layout(&self) -> GridLayout {
        GridLayout::new(self.num_rows, self.num_cols)
    }

    pub fn is_one_up(&self) -> bool {
        self.num_rows == 1 && self.num_cols == 1
    }

    pub fn is_empty(&self) -> bool {
        self.viewports.is_empty()
    }

    pub fn viewport(&self, viewport_id: &str) -> Option<&ViewportInstance> {
        self.viewports.get(viewport_id)
    }

    pub fn active_viewport(&self) -> Option<&ViewportInstance> {
        self.active_viewport_id
            .as_deref()
            .and_then(|id| self.viewports.get(id))
    }

    pub fn viewport_at(&self, position: GridPosition) -> Option<&ViewportInstance> {
        self.viewports.values().find(|vp| vp.position == position)
    }

    /// Viewports in row-major order.
    pub fn viewports_in_order(&self) -> Vec<&ViewportInstance> {
        let mut ordered: Vec<&ViewportInstance> = self.viewports.values().collect();
        ordered.sort_by_key(|vp| vp.position);
        ordered
    }

    /// Every display set shown anywhere in the grid.
    pub fn displayed_uids(&self) -> BTreeSet<&str> {
        self.viewports
            .values()
            .flat_map(|vp| vp.display_set_uids.iter().map(String::as_str))
            .collect()
    }

    /// Builds a grid from viewports, choosing the active viewport when
    /// `preferred` is absent or not present among them.
    pub fn from_viewports(
        layout: GridLayout,
        viewports: Vec<ViewportInstance>,
        preferred_active: Option<&str>,
        is_hanging_protocol_layout: bool,
    ) -> Self {
        let mut map = BTreeMap::new();
        let mut first: Option<(GridPosition, ViewportId)> = None;
        for vp in viewports {
            if first.as_ref().map_or(true, |(pos, _)| vp.position < *pos) {
                first = Some((vp.position, vp.viewport_id.clone()));
            }
            map.insert(vp.viewport_id.clone(), vp);
        }

        let active_viewport_id = match preferred_active {
            Some(id) if map.contains_key(id) => Some(id.to_string()),
            _ => first.map(|(_, id)| id),
        };

        Self {
            num_rows: layout.rows,
            num_cols: layout.cols,
            viewports: map,
            active_viewport_id,
            is_hanging_protocol_layout,
        }
    }

    /// Checks the grid invariants.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant as a [`GridError`].
    pub fn validate(&self) -> Result<(), GridError> {
        let layout = self.layout();
        if self.viewports.len() > layout.capacity() {
            return Err(GridError::TooManyViewports {
                layout,
                count: self.viewports.len(),
            });
        }

        let mut seen = BTreeSet::new();
        for vp in self.viewports.values() {
            if vp.position.row >= self.num_rows || vp.position.col >= self.num_cols {
                return Err(GridError::OutOfBounds {
                    viewport_id: vp.viewport_id.clone(),
                    layout,
                });
            }
            if !seen.insert(vp.position) {
                return Err(GridError::DuplicatePosition(vp.position_id()));
            }
        }

        match &self.active_viewport_id {
            Some(id) if !self.viewports.contains_key(id) => {
                Err(GridError::ActiveViewportMissing(id.clone()))
            }
            None if !self.viewports.is_empty() => Err(GridError::NoActiveViewport),
            _ => Ok(()),
        }
    }
}

/// Single source of truth for the live grid.
#[derive(Debug, Default)]
pub struct GridStore {
    current: GridState,
    revision: u64,
}

impl GridStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy-on-read snapshot of the live grid.
    pub fn snapshot(&self) -> GridState {
        self.current.clone()
    }

    /// Borrow for engine-internal reads.
    pub fn current(&self) -> &GridState {
        &self.current
    }

    /// Number of commits so far.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Replaces the live grid after validating it.  On error the live grid is
    /// left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`GridError`] when `next` violates an invariant.
    pub fn commit(&mut self, next: GridState) -> Result<(), GridError> {
        next.validate()?;
        self.current = next;
        self.revision += 1;
        Ok(())
    }

    /// Drops the live grid back to [`GridState::empty`].
    pub fn clear(&mut self) {
        self.current = GridState::empty();
        self.revision += 1;
    }
}
