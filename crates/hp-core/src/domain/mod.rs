//! Domain entities for the hanging-protocol engine.
//!
//! This module contains pure logic with no infrastructure dependencies: no
//! clocks, no I/O, no viewport rendering.
//!
//! # How the pieces fit (for beginners)
//!
//! A *hanging protocol* is a recipe for arranging a study's series on screen.
//! Applying one runs through these modules in order:
//!
//! 1. [`rules`] scores every protocol's matching rules against the study;
//! 2. [`matcher`] picks the winner and ranks series for each of its selectors;
//! 3. [`resolver`] turns one stage of the winner into a concrete [`grid::GridState`];
//! 4. [`sync`] rebuilds the synchronizers the new grid declares;
//! 5. [`grid::GridStore`] commits the grid, and [`session`] remembers it so the
//!    transition can be undone.
//!
//! The state machine that drives this pipeline lives in the `hp-viewer` crate,
//! which adds the clock, notifications, and the ports to the rendering layer.

/// Series handles and their attributes.
pub mod display_set;

/// Viewport grid state and its single-copy store.
pub mod grid;

/// Protocol selection and series binding.
pub mod matcher;

/// Declarative protocol model.
pub mod protocol;

/// Stage → grid resolution.
pub mod resolver;

/// Declarative matching rules.
pub mod rules;

/// Per-session snapshot caches.
pub mod session;

/// Cross-viewport synchronizers.
pub mod sync;
