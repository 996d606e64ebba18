//! Periodic background jobs with broadcast shutdown.
//!
//! A [`PeriodicTask`] runs one [`BackgroundJob`] every `interval` until the
//! shutdown channel fires. Job failures are logged and counted; the loop keeps
//! going, so a failed run is simply retried on the next tick.
//!
//! # Example
//!
//! ```rust,ignore
//! let (shutdown_tx, _) = broadcast::channel(1);
//! let handle = PeriodicTask::new(job, Duration::from_secs(30), shutdown_tx.subscribe()).spawn();
//!
//! // Later
//! let _ = shutdown_tx.send(());
//! await_shutdown(vec![("reconcile", handle)], Duration::from_secs(10)).await;
//! ```

use crate::metrics::JobMetrics;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Work executed on every tick of a [`PeriodicTask`].
pub trait BackgroundJob: Send + Sync {
    /// Stable name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Execute one run.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure; the task logs it and carries on.
    fn run(&self) -> BoxFuture<'_, Result<(), String>>;
}

/// Runs a job periodically until shutdown.
pub struct PeriodicTask {
    job: Arc<dyn BackgroundJob>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl PeriodicTask {
    /// Create a task running `job` every `interval`.
    #[must_use]
    pub fn new(
        job: Arc<dyn BackgroundJob>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            job,
            interval,
            shutdown,
        }
    }

    /// Spawn the task on the current runtime.
    #[must_use]
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        let name = self.job.name();
        let interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX);
        info!(job = name, interval_ms, "Background job started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so the first run
        // happens one interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(job = name, "Background job received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let started = Instant::now();
                    let result = self.job.run().await;
                    JobMetrics::record_run(name, started.elapsed(), result.is_ok());
                    match result {
                        Ok(()) => debug!(job = name, "Background job run complete"),
                        Err(e) => warn!(job = name, error = %e, "Background job run failed"),
                    }
                }
            }
        }

        info!(job = name, "Background job stopped");
    }
}

/// Wait for spawned tasks to finish, giving each at most `timeout`.
pub async fn await_shutdown(handles: Vec<(&'static str, JoinHandle<()>)>, timeout: Duration) {
    for (name, handle) in handles {
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => info!(task = name, "Task stopped gracefully"),
            Ok(Err(e)) => warn!(task = name, error = %e, "Task failed"),
            Err(_) => warn!(task = name, "Task shutdown timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        runs: AtomicUsize,
        fail: bool,
    }

    impl BackgroundJob for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn run(&self) -> BoxFuture<'_, Result<(), String>> {
            Box::pin(async move {
                self.runs.fetch_add(1, Ordering::SeqCst);
                if self.fail {
                    Err("boom".to_string())
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_every_interval_until_shutdown() {
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let (tx, _) = broadcast::channel(1);
        let handle = PeriodicTask::new(job.clone(), Duration::from_secs(5), tx.subscribe()).spawn();

        tokio::time::sleep(Duration::from_secs(16)).await;
        let _ = tx.send(());
        await_shutdown(vec![("counting", handle)], Duration::from_secs(1)).await;

        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_loop() {
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            fail: true,
        });
        let (tx, _) = broadcast::channel(1);
        let handle = PeriodicTask::new(job.clone(), Duration::from_secs(1), tx.subscribe()).spawn();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let _ = tx.send(());
        await_shutdown(vec![("counting", handle)], Duration::from_secs(1)).await;

        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
    }
}
