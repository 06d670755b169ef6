//! Command surface of the viewer.
//!
//! Each controller operation has a typed argument struct, and
//! [`ViewerCommand`] wraps them in one serde-tagged enum so commands can be
//! scripted or sent over a bridge as JSON:
//!
//! ```json
//! { "command": "setHangingProtocol", "args": { "protocolId": "mpr", "stageIndex": 0 } }
//! { "command": "nextStage" }
//! ```
//!
//! Field names are camelCase on the wire to match the command names.

use hp_core::{PresentationChange, SyncEvent, SyncGroupType, ViewportId};
use serde::{Deserialize, Serialize};

use super::hanging_protocol::{HangingProtocolController, HangingProtocolError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetHangingProtocolArgs {
    #[serde(default)]
    pub protocol_id: Option<String>,
    #[serde(default)]
    pub stage_id: Option<String>,
    #[serde(default)]
    pub stage_index: Option<usize>,
    #[serde(default)]
    pub active_study_uid: Option<String>,
    /// Discard cached layouts and apply from scratch.
    #[serde(default)]
    pub reset: bool,
}

impl SetHangingProtocolArgs {
    pub fn protocol(protocol_id: impl Into<String>) -> Self {
        Self {
            protocol_id: Some(protocol_id.into()),
            ..Self::default()
        }
    }

    pub fn at_stage(mut self, stage_index: usize) -> Self {
        self.stage_index = Some(stage_index);
        self
    }

    pub fn for_study(mut self, study_instance_uid: impl Into<String>) -> Self {
        self.active_study_uid = Some(study_instance_uid.into());
        self
    }

    pub fn with_reset(mut self) -> Self {
        self.reset = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleHangingProtocolArgs {
    pub protocol_id: String,
    #[serde(default)]
    pub stage_index: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaStageArgs {
    pub direction: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetViewportGridLayoutArgs {
    pub num_rows: u32,
    pub num_cols: u32,
    #[serde(default)]
    pub is_hanging_protocol_layout: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleSynchronizerArgs {
    #[serde(rename = "type")]
    pub kind: SyncGroupType,
    pub sync_id: String,
    #[serde(default)]
    pub viewports: Option<Vec<ViewportId>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDisplaySetForViewportArgs {
    pub viewport_id: ViewportId,
    pub display_set_uid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyPresentationChangeArgs {
    pub viewport_id: ViewportId,
    pub change: PresentationChange,
}

/// Every command the viewer accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "camelCase")]
pub enum ViewerCommand {
    SetHangingProtocol(SetHangingProtocolArgs),
    ToggleHangingProtocol(ToggleHangingProtocolArgs),
    NextStage,
    PreviousStage,
    DeltaStage(DeltaStageArgs),
    SetViewportGridLayout(SetViewportGridLayoutArgs),
    ToggleOneUp,
    ToggleSynchronizer(ToggleSynchronizerArgs),
    SetDisplaySetForViewport(SetDisplaySetForViewportArgs),
    ApplyPresentationChange(ApplyPresentationChangeArgs),
    ExitSession,
}

impl ViewerCommand {
    /// Wire name of the command, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ViewerCommand::SetHangingProtocol(_) => "setHangingProtocol",
            ViewerCommand::ToggleHangingProtocol(_) => "toggleHangingProtocol",
            ViewerCommand::NextStage => "nextStage",
            ViewerCommand::PreviousStage => "previousStage",
            ViewerCommand::DeltaStage(_) => "deltaStage",
            ViewerCommand::SetViewportGridLayout(_) => "setViewportGridLayout",
            ViewerCommand::ToggleOneUp => "toggleOneUp",
            ViewerCommand::ToggleSynchronizer(_) => "toggleSynchronizer",
            ViewerCommand::SetDisplaySetForViewport(_) => "setDisplaySetForViewport",
            ViewerCommand::ApplyPresentationChange(_) => "applyPresentationChange",
            ViewerCommand::ExitSession => "exitSession",
        }
    }
}

/// What a successful command produced beyond the grid change itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output", content = "value", rename_all = "snake_case")]
pub enum CommandOutput {
    Done,
    Sync(SyncEvent),
    UpdatedViewports(Vec<ViewportId>),
}

/// Runs one command against the controller.
///
/// # Errors
///
/// Returns the controller's [`HangingProtocolError`]; it has already been
/// reported through the notification sink.
pub fn execute(
    controller: &mut HangingProtocolController,
    command: ViewerCommand,
) -> Result<CommandOutput, HangingProtocolError> {
    match command {
        ViewerCommand::SetHangingProtocol(args) => {
            controller.set_hanging_protocol(args).map(|_| CommandOutput::Done)
        }
        ViewerCommand::ToggleHangingProtocol(args) => controller
            .toggle_hanging_protocol(&args.protocol_id, args.stage_index)
            .map(|_| CommandOutput::Done),
        ViewerCommand::NextStage => controller.next_stage().map(|_| CommandOutput::Done),
        ViewerCommand::PreviousStage => controller.previous_stage().map(|_| CommandOutput::Done),
        ViewerCommand::DeltaStage(args) => {
            controller.delta_stage(args.direction).map(|_| CommandOutput::Done)
        }
        ViewerCommand::SetViewportGridLayout(args) => controller
            .set_viewport_grid_layout(args.num_rows, args.num_cols, args.is_hanging_protocol_layout)
            .map(|_| CommandOutput::Done),
        ViewerCommand::ToggleOneUp => controller.toggle_one_up().map(|_| CommandOutput::Done),
        ViewerCommand::ToggleSynchronizer(args) => controller
            .toggle_synchronizer(args.kind, &args.sync_id, args.viewports.as_deref())
            .map(CommandOutput::Sync),
        ViewerCommand::SetDisplaySetForViewport(args) => controller
            .set_display_set_for_viewport(&args.viewport_id, &args.display_set_uid)
            .map(|_| CommandOutput::Done),
        ViewerCommand::ApplyPresentationChange(args) => controller
            .apply_presentation_change(&args.viewport_id, &args.change)
            .map(CommandOutput::UpdatedViewports),
        ViewerCommand::ExitSession => {
            controller.exit_session();
            Ok(CommandOutput::Done)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parses_camel_case_args() {
        let json = r#"{ "command": "setHangingProtocol", "args": { "protocolId": "mpr", "stageIndex": 2, "reset": true } }"#;

        let command: ViewerCommand = serde_json::from_str(json).expect("valid command");

        assert_eq!(
            command,
            ViewerCommand::SetHangingProtocol(SetHangingProtocolArgs::protocol("mpr").at_stage(2).with_reset())
        );
    }

    #[test]
    fn test_unit_command_parses_without_args() {
        let command: ViewerCommand = serde_json::from_str(r#"{ "command": "toggleOneUp" }"#).unwrap();
        assert_eq!(command, ViewerCommand::ToggleOneUp);
        assert_eq!(command.name(), "toggleOneUp");
    }

    #[test]
    fn test_toggle_synchronizer_reads_type_field() {
        let json = r#"{ "command": "toggleSynchronizer", "args": { "type": "voi", "syncId": "wl" } }"#;

        let command: ViewerCommand = serde_json::from_str(json).unwrap();

        assert_eq!(
            command,
            ViewerCommand::ToggleSynchronizer(ToggleSynchronizerArgs {
                kind: SyncGroupType::Voi,
                sync_id: "wl".to_string(),
                viewports: None,
            })
        );
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        assert!(serde_json::from_str::<ViewerCommand>(r#"{ "command": "launchRocket" }"#).is_err());
    }
}
