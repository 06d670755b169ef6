//! Ports: the traits the controller uses to reach the outside world.
//!
//! Infrastructure supplies the real implementations (see
//! `crate::infrastructure`); tests inject recording fakes or `mockall` mocks.
//! All ports are synchronous: the controller runs each command to completion
//! on one thread and never awaits.

use std::sync::Arc;

use hp_core::{DisplaySet, DisplaySetUid, GridState, SyncEvent, ViewportInstance};
use serde::{Deserialize, Serialize};

/// Source of the display sets of the active study.
pub trait DisplaySetProvider: Send + Sync {
    /// Every display set currently known, in provider order.  Order matters:
    /// it breaks ties when series are ranked.
    fn active_display_sets(&self) -> Vec<DisplaySet>;

    /// Whether the display set is still streaming in.
    fn is_loading(&self, display_set_uid: &str) -> bool;
}

/// Change notifications from the display set provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "display_set_uids", rename_all = "snake_case")]
pub enum DisplaySetEvent {
    Added(Vec<DisplaySetUid>),
    Changed(Vec<DisplaySetUid>),
}

/// The rendering side of the viewport grid.
pub trait ViewportRenderer: Send + Sync {
    /// Called once per committed grid.
    fn commit(&self, grid: &GridState);

    /// Viewports that must change when `display_set_uid` is placed in
    /// `viewport_id` of `grid`.  An empty result means only that viewport
    /// changes, and only its display sets.
    fn viewports_require_update(
        &self,
        grid: &GridState,
        viewport_id: &str,
        display_set_uid: &str,
        is_hanging_protocol_layout: bool,
    ) -> Vec<ViewportInstance>;
}

/// The tool layer that owns the live synchronizer objects.
pub trait ToolRuntime: Send + Sync {
    fn apply_sync_events(&self, events: &[SyncEvent]);
    fn reset_crosshairs(&self);
}

/// Severity of a user-visible notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

/// A toast shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub duration_ms: u64,
}

impl Notification {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        kind: NotificationKind,
        duration_ms: u64,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            kind,
            duration_ms,
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn show(&self, notification: Notification);
}

/// The four ports bundled for construction.
#[derive(Clone)]
pub struct ViewerPorts {
    pub display_sets: Arc<dyn DisplaySetProvider>,
    pub renderer: Arc<dyn ViewportRenderer>,
    pub tools: Arc<dyn ToolRuntime>,
    pub notifications: Arc<dyn NotificationSink>,
}
