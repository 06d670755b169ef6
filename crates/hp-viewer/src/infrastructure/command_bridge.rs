//! JSON command bridge: the viewer's command surface for scripts and UIs.
//!
//! Callers send [`ViewerCommand`]s as JSON and always get back the same
//! response shape, `{ success, data, error }`, so a front end never has to
//! distinguish transport errors from command failures.
//!
//! After each command the bridge drains deferred work (layout commits and
//! loading retries) so the returned grid reflects the command's full effect.

use std::sync::Arc;

use hp_core::GridState;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::application::commands::{execute, CommandOutput, ViewerCommand};
use crate::application::hanging_protocol::{ControllerState, HangingProtocolController};
use crate::application::ports::DisplaySetEvent;

use super::scheduler::DeferredScheduler;

/// Upper bound on deferred tasks run after one command.
pub const DEFAULT_DRAIN_ROUNDS: usize = 8;

/// State shared by all bridge calls.
///
/// The controller sits behind a tokio `Mutex` because bridge calls are async
/// and the scheduler waits for deferred work between them.
pub struct ViewerState {
    pub controller: Arc<Mutex<HangingProtocolController>>,
    scheduler: DeferredScheduler,
    drain_rounds: usize,
}

impl ViewerState {
    pub fn new(controller: HangingProtocolController) -> Arc<Self> {
        Self::with_drain_rounds(controller, DEFAULT_DRAIN_ROUNDS)
    }

    pub fn with_drain_rounds(controller: HangingProtocolController, drain_rounds: usize) -> Arc<Self> {
        let controller = Arc::new(Mutex::new(controller));
        Arc::new(Self {
            scheduler: DeferredScheduler::new(Arc::clone(&controller)),
            controller,
            drain_rounds,
        })
    }

    pub fn scheduler(&self) -> &DeferredScheduler {
        &self.scheduler
    }
}

/// Unified response wrapper used by every bridge call.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResult<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> CommandResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Parses and runs one command, then drains deferred work.
///
/// # Example
/// ```json
/// { "command": "deltaStage", "args": { "direction": 1 } }
/// ```
pub async fn execute_json(state: &ViewerState, json: &str) -> CommandResult<CommandOutput> {
    let command: ViewerCommand = match serde_json::from_str(json) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "rejected malformed command");
            return CommandResult::err(format!("invalid command: {e}"));
        }
    };
    execute_command(state, command).await
}

pub async fn execute_command(state: &ViewerState, command: ViewerCommand) -> CommandResult<CommandOutput> {
    let name = command.name();
    let result = {
        let mut controller = state.controller.lock().await;
        execute(&mut controller, command)
    };
    let drained = state.scheduler.drain(state.drain_rounds).await;
    debug!(command = name, drained, ok = result.is_ok(), "command executed");

    match result {
        Ok(output) => CommandResult::ok(output),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

/// Forwards a display set event to the controller.
pub async fn notify_display_sets(state: &ViewerState, event: DisplaySetEvent) -> CommandResult<()> {
    let result = {
        let mut controller = state.controller.lock().await;
        controller.on_display_sets_event(&event)
    };
    state.scheduler.drain(state.drain_rounds).await;
    match result {
        Ok(()) => CommandResult::ok(()),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

/// Returns the grid currently on screen.
pub async fn get_grid(state: &ViewerState) -> CommandResult<GridState> {
    CommandResult::ok(state.controller.lock().await.grid())
}

/// Returns whether a protocol is applied, and which.
pub async fn get_controller_state(state: &ViewerState) -> CommandResult<ControllerState> {
    CommandResult::ok(state.controller.lock().await.state().clone())
}
