//! Notification sinks.
//!
//! The headless host has no toast UI, so [`TracingNotificationSink`] writes
//! each notification to the log at a level matching its kind.
//! [`RecordingNotificationSink`] keeps them in memory for the command bridge
//! and for tests.

use std::sync::{Mutex, PoisonError};

use tracing::{error, info, warn};

use crate::application::ports::{Notification, NotificationKind, NotificationSink};

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn show(&self, n: Notification) {
        match n.kind {
            NotificationKind::Info | NotificationKind::Success => {
                info!(title = %n.title, duration_ms = n.duration_ms, "{}", n.message)
            }
            NotificationKind::Warning => {
                warn!(title = %n.title, duration_ms = n.duration_ms, "{}", n.message)
            }
            NotificationKind::Error => {
                error!(title = %n.title, duration_ms = n.duration_ms, "{}", n.message)
            }
        }
    }
}

/// Keeps every notification, and logs it as well.
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    shown: Mutex<Vec<Notification>>,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shown(&self) -> Vec<Notification> {
        self.shown.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Removes and returns everything recorded so far.
    pub fn drain(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.shown.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl NotificationSink for RecordingNotificationSink {
    fn show(&self, notification: Notification) {
        TracingNotificationSink.show(notification.clone());
        self.shown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
    }
}
