//! Background task that ends idle flows.
//!
//! The reaper is started lazily when the first flow starts and stopped when
//! the last flow ends. Its handle lives in the manager's flow table, so start
//! and stop happen under the same lock as flow insertion and removal.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Running idle-reaper task.
///
/// Dropping the reaper cancels it, including a run that is in flight.
pub(crate) struct IdleReaper {
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl IdleReaper {
    /// Spawns a task calling `scan` every `period` (fixed delay, first scan
    /// immediately). The task exits when `scan` returns false.
    pub(crate) fn spawn<F>(runtime: &Handle, period: Duration, scan: F) -> Self
    where
        F: Fn() -> bool + Send + 'static,
    {
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();

        let task = runtime.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            debug!(period_ms = period.as_millis() as u64, "Idle reaper started");

            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        break;
                    }

                    _ = ticker.tick() => {
                        if !scan() {
                            debug!("Idle reaper stopping: manager dropped");
                            break;
                        }
                    }
                }
            }

            debug!("Idle reaper task completed");
        });

        Self { cancel_token, task }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self.task.abort();
    }
}
