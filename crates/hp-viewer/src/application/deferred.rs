//! Single-slot cancellable deferred work.
//!
//! Two things the controller does are not immediate:
//!
//! - a grid layout change commits at the end of the current tick, so several
//!   layout commands issued back to back collapse into the last one;
//! - toggling a protocol whose series are still loading retries after a delay.
//!
//! Both share one slot.  Scheduling replaces whatever was pending, and any new
//! layout-changing command cancels it, so at most one deferred task exists at
//! any time.  The host (a tokio task in the binary, a direct call in tests)
//! waits for [`ScheduledTask::delay`] and then asks the controller to run the
//! task by id; a stale id is ignored.

use std::time::Duration;

use hp_core::GridLayout;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Work parked until the host runs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum DeferredTask {
    LayoutCommit {
        layout: GridLayout,
        is_hanging_protocol_layout: bool,
    },
    ProtocolToggle {
        protocol_id: String,
        stage_index: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub id: u64,
    pub delay: Duration,
    pub task: DeferredTask,
}

#[derive(Debug, Default)]
pub struct DeferredSlot {
    pending: Option<ScheduledTask>,
    next_id: u64,
}

impl DeferredSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks `task`, replacing anything pending.  Returns the new task id.
    pub fn schedule(&mut self, delay: Duration, task: DeferredTask) -> u64 {
        self.next_id += 1;
        if let Some(replaced) = self.pending.take() {
            debug!(id = replaced.id, "deferred task replaced");
        }
        self.pending = Some(ScheduledTask {
            id: self.next_id,
            delay,
            task,
        });
        self.next_id
    }

    /// Drops the pending task, if any.
    pub fn cancel(&mut self) -> Option<ScheduledTask> {
        let cancelled = self.pending.take();
        if let Some(task) = &cancelled {
            debug!(id = task.id, "deferred task cancelled");
        }
        cancelled
    }

    pub fn pending(&self) -> Option<&ScheduledTask> {
        self.pending.as_ref()
    }

    pub fn take(&mut self) -> Option<ScheduledTask> {
        self.pending.take()
    }

    /// Takes the pending task only if it is still task `id`.
    pub fn take_if(&mut self, id: u64) -> Option<ScheduledTask> {
        match &self.pending {
            Some(task) if task.id == id => self.pending.take(),
            _ => None,
        }
    }
}
