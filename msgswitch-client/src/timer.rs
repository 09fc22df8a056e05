//! One-shot timers.

use std::future::Future;
use std::time::Duration;
use tokio::task::AbortHandle;

/// Handle to a scheduled action. Dropping it does not cancel the action.
#[derive(Debug)]
pub struct TimerHandle {
    task: AbortHandle,
}

impl TimerHandle {
    /// Cancels the action if it has not run yet.
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Runs `action` once `delay` has elapsed.
pub fn run_after<F>(delay: Duration, action: F) -> TimerHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        action.await;
    });
    TimerHandle {
        task: task.abort_handle(),
    }
}
