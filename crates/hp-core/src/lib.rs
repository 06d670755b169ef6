//! # hp-core
//!
//! Domain library for the hanging-protocol engine: rule matching, protocol
//! selection, stage layout resolution, the viewport-grid model, sync groups,
//! and per-session snapshot caches.
//!
//! This crate has no dependencies on rendering, timers, or file I/O; the
//! `hp-viewer` crate supplies those through ports.
//!
//! # Architecture overview (for beginners)
//!
//! A radiology viewer shows a study (a set of series, called *display sets*)
//! in a grid of viewports.  Which series goes where is decided by a *hanging
//! protocol*: a declarative document with matching rules, series selectors,
//! and one or more *stages* (alternative layouts of the same study).
//!
//! - **`domain::rules`**: a closed set of constraints evaluated against any
//!   [`AttributeSource`].  Failing a required rule disqualifies a candidate;
//!   passing rules add their weight to its score.
//! - **`domain::matcher`**: picks the best protocol and ranks series per
//!   selector.
//! - **`domain::resolver`**: turns a stage into a validated [`GridState`].
//! - **`domain::sync`**: keeps camera, window level and frame index in step.
//! - **`domain::session`**: caches grids per `study:protocol:stage` so a
//!   transition can be reversed exactly.

pub mod domain;

// Re-export the most-used types at the crate root so callers can write
// `hp_core::GridState` instead of `hp_core::domain::grid::GridState`.
pub use domain::display_set::{
    AttributeSource, AttributeValue, DisplaySet, DisplaySetUid, StudySubject, MODALITY, ORIENTATION,
};
pub use domain::grid::{
    DisplaySetOptions, GridError, GridPosition, GridState, GridStore, ViewportInstance,
};
pub use domain::matcher::{
    best_protocol, match_selectors, DisplaySetSelectorMap, MatchError, MatchOutcome, ProtocolMatch,
    ProtocolMatcher,
};
pub use domain::protocol::{
    DisplaySetRef, DisplaySetSelector, GridLayout, Protocol, ProtocolCallbacks, ProtocolLibrary,
    SlotSpec, Stage, StageStatus, SyncGroupSpec, SyncGroupType, ViewportId, ViewportOptions,
    ViewportType,
};
pub use domain::resolver::{collapse_to_one_up, reshape, resolve_stage, ResolveError};
pub use domain::rules::{evaluate, score, Constraint, Rule, RuleOutcome};
pub use domain::session::{AppliedProtocol, ProtocolKey, SessionContext, SnapshotKey};
pub use domain::sync::{
    PresentationChange, PresentationStore, SyncError, SyncEvent, SyncGroupCoordinator,
    SyncOrigin, SyncRole, Synchronizer, ViewportPresentation,
};
