//! Headless hanging-protocol viewer.
//!
//! Loads a study fixture, hangs it with the best matching protocol, runs an
//! optional script of viewer commands, and prints the resulting grid as JSON.
//!
//! ```text
//! main()
//!  └─ load_config()                 -- viewer.toml, defaults when absent
//!  └─ load_library()                -- built-in + site protocols
//!  └─ HangingProtocolController     -- wired to in-memory ports
//!  └─ ViewerState                   -- tokio Mutex + deferred scheduler
//!       ├─ notify_display_sets()    -- first arrival hangs the study
//!       └─ execute_command()        -- each scripted command, then drain
//! ```
//!
//! Example:
//!
//! ```text
//! hp-viewer --study study.json --script script.json
//! ```
//!
//! where `script.json` is an array of commands:
//!
//! ```json
//! [
//!   { "command": "toggleHangingProtocol", "args": { "protocolId": "mpr" } },
//!   { "command": "nextStage" }
//! ]
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hp_core::GridState;
use hp_viewer::application::commands::ViewerCommand;
use hp_viewer::application::hanging_protocol::{ControllerState, HangingProtocolController};
use hp_viewer::application::hooks::register_builtin_hooks;
use hp_viewer::application::ports::{
    DisplaySetEvent, DisplaySetProvider, Notification, NotificationSink, ViewerPorts,
};
use hp_viewer::infrastructure::command_bridge::{
    execute_command, get_controller_state, get_grid, notify_display_sets, ViewerState,
};
use hp_viewer::infrastructure::display_sets::InMemoryDisplaySetProvider;
use hp_viewer::infrastructure::notifications::RecordingNotificationSink;
use hp_viewer::infrastructure::storage::config::load_config;
use hp_viewer::infrastructure::storage::protocol_library::load_library;
use hp_viewer::infrastructure::viewport_service::{InMemoryToolRuntime, InMemoryViewportRenderer};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Headless hanging-protocol viewer.
#[derive(Debug, Parser)]
#[command(
    name = "hp-viewer",
    about = "Applies hanging protocols to a study and reports the viewport grid",
    version
)]
struct Cli {
    /// Viewer configuration file.  Missing file means defaults.
    #[arg(long, default_value = "viewer.toml", env = "HP_VIEWER_CONFIG")]
    config: PathBuf,

    /// Study fixture (JSON) with the display sets to hang.
    #[arg(long, env = "HP_VIEWER_STUDY")]
    study: PathBuf,

    /// Optional JSON array of viewer commands to run after hanging.
    #[arg(long)]
    script: Option<PathBuf>,

    /// Log filter, overriding the config file.  `RUST_LOG` wins over both.
    #[arg(long)]
    log_level: Option<String>,
}

/// What the binary prints when it is done.
#[derive(Debug, Serialize)]
struct Report {
    state: ControllerState,
    grid: Option<GridState>,
    failed_commands: Vec<String>,
    notifications: Vec<Notification>,
}

fn read_script(path: &Path) -> anyhow::Result<Vec<ViewerCommand>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading script {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing script {}", path.display()))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    // Level comes from --log-level, then the config file; `RUST_LOG` overrides both.
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let base_dir = cli.config.parent().unwrap_or_else(|| Path::new("."));
    let library = load_library(&config.protocols, base_dir).context("loading protocol library")?;

    let display_sets = Arc::new(
        InMemoryDisplaySetProvider::from_file(&cli.study)
            .with_context(|| format!("loading study {}", cli.study.display()))?,
    );
    let notifications = Arc::new(RecordingNotificationSink::new());
    let ports = ViewerPorts {
        display_sets: Arc::clone(&display_sets) as Arc<dyn DisplaySetProvider>,
        renderer: Arc::new(InMemoryViewportRenderer::new()),
        tools: Arc::new(InMemoryToolRuntime::new()),
        notifications: Arc::clone(&notifications) as Arc<dyn NotificationSink>,
    };

    let mut controller = HangingProtocolController::new(config.engine.to_settings(), library, ports);
    register_builtin_hooks(controller.hooks_mut());
    info!(session_id = %controller.session_id(), study = %cli.study.display(), "hp-viewer starting");

    let state = ViewerState::new(controller);

    // ── Hang the study ────────────────────────────────────────────────────────
    let hung = notify_display_sets(&state, DisplaySetEvent::Added(display_sets.uids())).await;
    if let Some(e) = hung.error {
        warn!(error = %e, "study could not be hung");
    }

    // ── Scripted commands ─────────────────────────────────────────────────────
    let mut failed_commands = Vec::new();
    if let Some(path) = &cli.script {
        for command in read_script(path)? {
            let name = command.name();
            let result = execute_command(&state, command).await;
            if let Some(e) = result.error {
                warn!(command = name, error = %e, "command failed");
                failed_commands.push(format!("{name}: {e}"));
            }
        }
    }

    let report = Report {
        state: get_controller_state(&state).await.data.unwrap_or(ControllerState::Idle),
        grid: get_grid(&state).await.data,
        failed_commands,
        notifications: notifications.drain(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
