//! Stage layout resolver: turns a stage plus selector bindings into a concrete
//! [`GridState`].
//!
//! # Viewport identity
//!
//! Re-resolving a stage must not tear down viewports that would come back
//! unchanged; that would reset their camera, tool state and scroll position
//! and make the screen flicker.  So when the previous grid already holds a
//! viewport at the same position showing the same display sets with the same
//! options, that instance is carried over verbatim.  An instance whose id
//! another slot of the stage declares is never carried over.
//!
//! # Slot placement
//!
//! Slot `i` lands at row-major position `(i / cols, i % cols)`:
//!
//! ```text
//! 2×2 stage:   slot0 │ slot1
//!              ──────┼──────
//!              slot2 │ slot3
//! ```

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::trace;

use super::grid::{DisplaySetOptions, GridError, GridPosition, GridState, ViewportInstance};
use super::matcher::DisplaySetSelectorMap;
use super::protocol::{GridLayout, SlotSpec, Stage};

/// Errors raised while resolving a stage.  Each one aborts the transition.
#[derive(Debug, Error, PartialEq)]
pub enum ResolveError {
    #[error("stage '{stage_id}' references unknown selector '{selector_id}'")]
    UnknownSelector { stage_id: String, selector_id: String },

    #[error("stage '{stage_id}' declares viewport id '{viewport_id}' more than once")]
    DuplicateViewportId { stage_id: String, viewport_id: String },

    #[error("stage '{stage_id}' has an empty {layout} layout")]
    EmptyLayout { stage_id: String, layout: GridLayout },

    #[error("resolved grid is invalid: {0}")]
    InvalidGrid(#[from] GridError),
}

/// Default id for a viewport that its slot spec does not name.
pub fn generated_viewport_id(position: GridPosition) -> String {
    format!("viewport-{}", position.position_id())
}

/// Resolves every slot of `stage` into a new grid.
///
/// `previous` may be [`GridState::empty`].  The active viewport is the primary
/// slot, else the previous active viewport when it survives, else the first
/// position.
///
/// # Errors
///
/// See [`ResolveError`].  Too many slots for the stage layout surfaces as
/// [`ResolveError::InvalidGrid`].
pub fn resolve_stage(
    stage: &Stage,
    selectors: &DisplaySetSelectorMap,
    previous: &GridState,
    is_hanging_protocol_layout: bool,
) -> Result<GridState, ResolveError> {
    if stage.layout.capacity() == 0 {
        return Err(ResolveError::EmptyLayout {
            stage_id: stage.id.clone(),
            layout: stage.layout,
        });
    }

    let mut viewports = Vec::with_capacity(stage.slots.len());
    let mut ids = BTreeSet::new();
    let mut primary: Option<String> = None;
    let declared: BTreeSet<&str> = stage
        .slots
        .iter()
        .filter_map(|slot| slot.viewport_id.as_deref())
        .collect();

    for (index, slot) in stage.slots.iter().enumerate() {
        let position = GridPosition::from_index(index, stage.layout.cols);
        let fresh = build_viewport(&stage.id, slot, position, selectors)?;

        let instance = match previous.viewport_at(position) {
            Some(existing)
                if existing.display_set_uids == fresh.display_set_uids
                    && existing.display_set_options == fresh.display_set_options
                    && existing.viewport_options == fresh.viewport_options
                    && (existing.viewport_id == fresh.viewport_id
                        || !declared.contains(existing.viewport_id.as_str())) =>
            {
                trace!(viewport = %existing.viewport_id, "reusing viewport");
                existing.clone()
            }
            _ => fresh,
        };

        if !ids.insert(instance.viewport_id.clone()) {
            return Err(ResolveError::DuplicateViewportId {
                stage_id: stage.id.clone(),
                viewport_id: instance.viewport_id,
            });
        }
        if slot.primary && primary.is_none() {
            primary = Some(instance.viewport_id.clone());
        }
        viewports.push(instance);
    }

    let preferred = primary.as_deref().or(previous.active_viewport_id.as_deref());
    let grid = GridState::from_viewports(stage.layout, viewports, preferred, is_hanging_protocol_layout);
    grid.validate()?;
    Ok(grid)
}

fn build_viewport(
    stage_id: &str,
    slot: &SlotSpec,
    position: GridPosition,
    selectors: &DisplaySetSelectorMap,
) -> Result<ViewportInstance, ResolveError> {
    let mut display_set_uids = Vec::new();
    let mut display_set_options: Vec<DisplaySetOptions> = Vec::new();

    for reference in &slot.display_set_refs {
        if !selectors.contains_selector(&reference.selector_id) {
            return Err(ResolveError::UnknownSelector {
                stage_id: stage_id.to_string(),
                selector_id: reference.selector_id.clone(),
            });
        }
        if let Some(uid) = selectors.resolve(&reference.selector_id, reference.match_index) {
            display_set_uids.push(uid.to_string());
            display_set_options.push(reference.options.clone());
        }
    }

    Ok(ViewportInstance {
        viewport_id: slot
            .viewport_id
            .clone()
            .unwrap_or_else(|| generated_viewport_id(position)),
        position,
        display_set_uids,
        display_set_options,
        viewport_options: slot.viewport_options.clone(),
    })
}

/// Re-shapes `previous` into a `layout` grid.
///
/// Viewports are kept by position; cells outside the new shape are dropped.
/// New cells are filled from `template` (the protocol's default viewport) with
/// the best-ranked series of each referenced selector that is not already on
/// screen, or left empty without a template.
pub fn reshape(
    previous: &GridState,
    layout: GridLayout,
    is_hanging_protocol_layout: bool,
    template: Option<&SlotSpec>,
    selectors: &DisplaySetSelectorMap,
) -> GridState {
    let kept: Vec<ViewportInstance> = previous
        .viewports_in_order()
        .into_iter()
        .filter(|vp| vp.position.row < layout.rows && vp.position.col < layout.cols)
        .cloned()
        .collect();

    let mut in_display: BTreeSet<String> = kept
        .iter()
        .flat_map(|vp| vp.display_set_uids.iter().cloned())
        .collect();
    let mut ids: BTreeSet<String> = kept.iter().map(|vp| vp.viewport_id.clone()).collect();
    let mut viewports = kept;

    for index in 0..layout.capacity() {
        let position = GridPosition::from_index(index, layout.cols);
        if viewports.iter().any(|vp| vp.position == position) {
            continue;
        }

        let mut viewport_id = generated_viewport_id(position);
        let mut suffix = 1;
        while ids.contains(&viewport_id) {
            viewport_id = format!("{}-{suffix}", generated_viewport_id(position));
            suffix += 1;
        }
        ids.insert(viewport_id.clone());

        let mut instance = ViewportInstance::empty(viewport_id, position);
        if let Some(template) = template {
            instance.viewport_options = template.viewport_options.clone();
            for reference in &template.display_set_refs {
                let unused = selectors
                    .matches(&reference.selector_id)
                    .iter()
                    .skip(reference.match_index)
                    .find(|uid| !in_display.contains(uid.as_str()));
                if let Some(uid) = unused {
                    in_display.insert(uid.clone());
                    instance.display_set_uids.push(uid.clone());
                    instance.display_set_options.push(reference.options.clone());
                }
            }
        }
        viewports.push(instance);
    }

    GridState::from_viewports(
        layout,
        viewports,
        previous.active_viewport_id.as_deref(),
        is_hanging_protocol_layout,
    )
}

/// A 1×1 grid showing only the active viewport of `previous`, which keeps its
/// id and content.  `None` when `previous` has no active viewport.
pub fn collapse_to_one_up(previous: &GridState, is_hanging_protocol_layout: bool) -> Option<GridState> {
    let active = previous.active_viewport()?;
    let mut only = active.clone();
    only.position = GridPosition::new(0, 0);
    Some(GridState::from_viewports(
        GridLayout::ONE_UP,
        vec![only],
        Some(&active.viewport_id),
        is_hanging_protocol_layout,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::protocol::{DisplaySetRef, StageStatus, ViewportOptions, ViewportType};

    fn slot(id: &str, selector: &str) -> SlotSpec {
        SlotSpec {
            viewport_id: Some(id.to_string()),
            primary: false,
            viewport_options: ViewportOptions::default(),
            display_set_refs: vec![DisplaySetRef::new(selector)],
        }
    }

    fn stage(layout: GridLayout, slots: Vec<SlotSpec>) -> Stage {
        Stage {
            id: "stage".to_string(),
            name: "stage".to_string(),
            layout,
            slots,
            status: StageStatus::Enabled,
        }
    }

    fn selectors() -> DisplaySetSelectorMap {
        let mut map = DisplaySetSelectorMap::new();
        map.insert("ct", vec!["ct-1".to_string(), "ct-2".to_string(), "ct-3".to_string()]);
        map.insert("mr", vec![]);
        map
    }

    #[test]
    fn test_resolve_places_slots_row_major() {
        let s = stage(
            GridLayout::new(2, 2),
            vec![slot("a", "ct"), slot("b", "ct"), slot("c", "ct")],
        );
        let grid = resolve_stage(&s, &selectors(), &GridState::empty(), true).unwrap();

        assert_eq!(grid.viewport("c").unwrap().position, GridPosition::new(1, 0));
        assert_eq!(grid.active_viewport_id.as_deref(), Some("a"));
        assert!(grid.is_hanging_protocol_layout);
    }

    #[test]
    fn test_resolve_uses_match_index() {
        let mut second = slot("b", "ct");
        second.display_set_refs[0].match_index = 1;
        let s = stage(GridLayout::new(1, 2), vec![slot("a", "ct"), second]);

        let grid = resolve_stage(&s, &selectors(), &GridState::empty(), true).unwrap();
        assert_eq!(grid.viewport("b").unwrap().display_set_uids, ["ct-2".to_string()]);
    }

    #[test]
    fn test_resolve_leaves_viewport_empty_when_selector_matched_nothing() {
        let s = stage(GridLayout::ONE_UP, vec![slot("a", "mr")]);
        let grid = resolve_stage(&s, &selectors(), &GridState::empty(), true).unwrap();
        assert!(grid.viewport("a").unwrap().display_set_uids.is_empty());
    }

    #[test]
    fn test_resolve_rejects_unknown_selector() {
        let s = stage(GridLayout::ONE_UP, vec![slot("a", "pet")]);
        let err = resolve_stage(&s, &selectors(), &GridState::empty(), true).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownSelector { .. }));
    }

    #[test]
    fn test_resolve_rejects_more_slots_than_cells() {
        let s = stage(GridLayout::ONE_UP, vec![slot("a", "ct"), slot("b", "ct")]);
        let err = resolve_stage(&s, &selectors(), &GridState::empty(), true).unwrap_err();
        assert!(matches!(err, ResolveError::InvalidGrid(GridError::OutOfBounds { .. })));
    }

    #[test]
    fn test_resolve_rejects_duplicate_viewport_ids() {
        let s = stage(GridLayout::new(1, 2), vec![slot("a", "ct"), slot("a", "ct")]);
        let err = resolve_stage(&s, &selectors(), &GridState::empty(), true).unwrap_err();
        assert!(matches!(err, ResolveError::DuplicateViewportId { .. }));
    }

    #[test]
    fn test_resolve_prefers_primary_slot_as_active() {
        let mut b = slot("b", "ct");
        b.primary = true;
        let s = stage(GridLayout::new(1, 2), vec![slot("a", "ct"), b]);

        let grid = resolve_stage(&s, &selectors(), &GridState::empty(), true).unwrap();
        assert_eq!(grid.active_viewport_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_resolve_carries_over_previous_active_viewport() {
        let s = stage(GridLayout::new(1, 2), vec![slot("a", "ct"), slot("b", "ct")]);
        let mut previous = resolve_stage(&s, &selectors(), &GridState::empty(), true).unwrap();
        previous.active_viewport_id = Some("b".to_string());

        let grid = resolve_stage(&s, &selectors(), &previous, true).unwrap();
        assert_eq!(grid.active_viewport_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_resolve_reuses_unchanged_viewport_verbatim() {
        let s = stage(GridLayout::ONE_UP, vec![slot("a", "ct")]);
        let mut previous = GridState::empty();
        let mut existing = ViewportInstance::empty("kept-id", GridPosition::new(0, 0));
        existing.display_set_uids = vec!["ct-1".to_string()];
        existing.display_set_options = vec![Default::default()];
        previous.viewports.insert("kept-id".to_string(), existing.clone());
        previous.active_viewport_id = Some("kept-id".to_string());

        let grid = resolve_stage(&s, &selectors(), &previous, true).unwrap();
        assert_eq!(grid.viewport("kept-id"), Some(&existing));
    }

    #[test]
    fn test_resolve_rebuilds_viewport_when_options_change() {
        let s = stage(GridLayout::ONE_UP, vec![slot("a", "ct")]);
        let first = resolve_stage(&s, &selectors(), &GridState::empty(), true).unwrap();

        let mut volume = s.clone();
        volume.slots[0].viewport_options.viewport_type = ViewportType::Volume;
        let grid = resolve_stage(&volume, &selectors(), &first, true).unwrap();

        assert_eq!(grid.viewport("a").unwrap().viewport_options.viewport_type, ViewportType::Volume);
    }

    #[test]
    fn test_resolve_rebuilds_viewport_when_display_set_options_change() {
        let s = stage(GridLayout::ONE_UP, vec![slot("a", "ct")]);
        let first = resolve_stage(&s, &selectors(), &GridState::empty(), true).unwrap();

        let mut preset = s.clone();
        preset.slots[0].display_set_refs[0]
            .options
            .insert("voi".to_string(), "lung".into());
        let grid = resolve_stage(&preset, &selectors(), &first, true).unwrap();

        let expected = vec![preset.slots[0].display_set_refs[0].options.clone()];
        assert_eq!(grid.viewport("a").unwrap().display_set_options, expected);
    }

    #[test]
    fn test_resolve_does_not_reuse_id_declared_by_another_slot() {
        // Arrange: "b" sits at position 0 and shows what the new first slot shows
        let previous_stage = stage(GridLayout::new(1, 2), vec![slot("b", "ct"), slot("c", "mr")]);
        let previous = resolve_stage(&previous_stage, &selectors(), &GridState::empty(), true).unwrap();
        let next = stage(GridLayout::new(1, 2), vec![slot("a", "ct"), slot("b", "ct")]);

        // Act
        let grid = resolve_stage(&next, &selectors(), &previous, true).unwrap();

        // Assert
        assert_eq!(grid.viewport("a").unwrap().position, GridPosition::new(0, 0));
        assert_eq!(grid.viewport("b").unwrap().position, GridPosition::new(0, 1));
    }

    #[test]
    fn test_resolve_generates_viewport_id_when_slot_has_none() {
        let mut anonymous = slot("x", "ct");
        anonymous.viewport_id = None;
        let s = stage(GridLayout::ONE_UP, vec![anonymous]);

        let grid = resolve_stage(&s, &selectors(), &GridState::empty(), false).unwrap();
        assert!(grid.viewport("viewport-0-0").is_some());
    }

    // ── reshape ───────────────────────────────────────────────────────────────

    #[test]
    fn test_reshape_keeps_viewports_by_position_and_drops_the_rest() {
        let s = stage(
            GridLayout::new(2, 2),
            vec![slot("a", "ct"), slot("b", "ct"), slot("c", "ct"), slot("d", "ct")],
        );
        let previous = resolve_stage(&s, &selectors(), &GridState::empty(), true).unwrap();

        let grid = reshape(&previous, GridLayout::new(1, 2), false, None, &selectors());

        let ids: Vec<&str> = grid.viewports.keys().map(String::as_str).collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(!grid.is_hanging_protocol_layout);
    }

    #[test]
    fn test_reshape_fills_new_cells_with_unused_series_from_template() {
        let s = stage(GridLayout::ONE_UP, vec![slot("a", "ct")]);
        let previous = resolve_stage(&s, &selectors(), &GridState::empty(), true).unwrap();
        let template = slot("ignored", "ct");

        let grid = reshape(&previous, GridLayout::new(1, 3), false, Some(&template), &selectors());

        let in_order: Vec<Vec<String>> = grid
            .viewports_in_order()
            .into_iter()
            .map(|vp| vp.display_set_uids.clone())
            .collect();
        assert_eq!(
            in_order,
            vec![
                vec!["ct-1".to_string()],
                vec!["ct-2".to_string()],
                vec!["ct-3".to_string()]
            ]
        );
    }

    #[test]
    fn test_reshape_without_template_creates_empty_viewports() {
        let grid = reshape(&GridState::empty(), GridLayout::new(2, 1), false, None, &selectors());
        assert_eq!(grid.viewports.len(), 2);
        assert!(grid.displayed_uids().is_empty());
        assert_eq!(grid.active_viewport_id.as_deref(), Some("viewport-0-0"));
    }

    // ── collapse_to_one_up ────────────────────────────────────────────────────

    #[test]
    fn test_collapse_keeps_active_viewport_id_and_content() {
        let s = stage(GridLayout::new(1, 2), vec![slot("a", "ct"), slot("b", "ct")]);
        let mut previous = resolve_stage(&s, &selectors(), &GridState::empty(), true).unwrap();
        previous.active_viewport_id = Some("b".to_string());

        let one_up = collapse_to_one_up(&previous, false).expect("grid has an active viewport");

        assert!(one_up.is_one_up());
        let only = one_up.viewport("b").unwrap();
        assert_eq!(only.position, GridPosition::new(0, 0));
        assert_eq!(only.display_set_uids, previous.viewport("b").unwrap().display_set_uids);
        assert_eq!(one_up.validate(), Ok(()));
    }

    #[test]
    fn test_collapse_of_empty_grid_is_none() {
        assert!(collapse_to_one_up(&GridState::empty(), false).is_none());
    }
}
