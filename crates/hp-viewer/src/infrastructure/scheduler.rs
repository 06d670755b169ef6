//! Runs the controller's deferred work on the tokio runtime.
//!
//! The controller never sleeps: it parks at most one task in its deferred
//! slot and tells the host how long to wait.  [`DeferredScheduler`] is that
//! host.  It waits without holding the controller lock, so commands issued in
//! the meantime can cancel or replace the task; the task is then run by id
//! and a stale id is ignored.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use crate::application::hanging_protocol::HangingProtocolController;

#[derive(Clone)]
pub struct DeferredScheduler {
    controller: Arc<Mutex<HangingProtocolController>>,
}

impl DeferredScheduler {
    pub fn new(controller: Arc<Mutex<HangingProtocolController>>) -> Self {
        Self { controller }
    }

    /// Runs deferred tasks until none is pending or `max_rounds` have run.
    /// Returns how many ran.
    ///
    /// Failures have already been reported by the controller and do not stop
    /// the drain.
    pub async fn drain(&self, max_rounds: usize) -> usize {
        let mut ran = 0;
        while ran < max_rounds {
            let Some((id, delay)) = self.pending().await else {
                break;
            };

            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }

            let mut controller = self.controller.lock().await;
            match controller.run_deferred_task(id) {
                Ok(true) => ran += 1,
                Ok(false) => {}
                Err(e) => {
                    ran += 1;
                    debug!(id, error = %e, "deferred task failed");
                }
            }
        }
        ran
    }

    async fn pending(&self) -> Option<(u64, Duration)> {
        let controller = self.controller.lock().await;
        controller.pending_task().map(|task| (task.id, task.delay))
    }
}
