//! Application layer: the hanging-protocol state machine and its ports.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure rules in `hp-core`) and the infrastructure (files, timers, the
//! rendering engine).
//!
//! Code in this layer:
//!
//! - **Orchestrates** domain objects to fulfil a user goal (e.g., "show the
//!   next stage of the current protocol").
//! - **Depends on abstractions** (the traits in [`ports`]) rather than on a
//!   concrete renderer or data layer, so both can be swapped in tests.
//! - **Contains no file system access and no clocks**.  Work that must wait is
//!   parked in a [`deferred::DeferredSlot`] and run by whoever hosts the
//!   controller.
//!
//! # Sub-modules
//!
//! - **`hanging_protocol`** – The controller: `setHangingProtocol`,
//!   `toggleHangingProtocol`, stage navigation, grid layout changes, one-up.
//! - **`commands`**  – Typed command arguments and the serializable
//!   [`commands::ViewerCommand`] surface.
//! - **`ports`**     – Traits the controller uses to reach the outside world.
//! - **`deferred`**  – The single cancellable slot for end-of-tick and retry work.
//! - **`hooks`**     – Named pre-commit layout hooks that may veto a change.

pub mod commands;
pub mod deferred;
pub mod hanging_protocol;
pub mod hooks;
pub mod ports;
