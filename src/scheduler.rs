//! Scheduled Tasks
//!
//! Fixed-interval background jobs (preloading, memory sweeps, storage scans,
//! threshold eviction) with an explicit stop tied to process lifecycle.
//! Jobs are expected to log their own failures and return normally; a job
//! never terminates the loop.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle to a running interval job
pub struct ScheduledTask {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Spawn `job` every `period`. The first run happens one full period
    /// after spawning.
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, job: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            info!("Starting scheduled task '{}' every {:?}", task_name, period);
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() fires immediately; consume that tick so the first
            // run lands one period from now.
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Scheduled task '{}' stopping", task_name);
                        break;
                    }
                    _ = tick.tick() => {
                        debug!("Running scheduled task '{}'", task_name);
                        job().await;
                    }
                }
            }
        });

        Self {
            name,
            cancel,
            handle,
        }
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether the loop is still running
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the loop to stop and wait for the current run to finish
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Scheduled task '{}' ended abnormally: {}", self.name, e);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_on_each_period() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let task = ScheduledTask::spawn("counter", Duration::from_secs(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Nothing runs before the first period elapses
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_further_runs() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let task = ScheduledTask::spawn("halting", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(task.name(), "halting");
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        task.stop().await;
        let after_stop = runs.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
        assert_eq!(after_stop, 2);
    }
}
