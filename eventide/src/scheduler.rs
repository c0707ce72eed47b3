//! Repeating job execution with per-run deadlines and backlog draining.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::warn;

/// The error type for job executions.
///
/// Jobs surface whatever went wrong; the scheduler only logs it and retries
/// on the next tick.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct JobError(Box<dyn std::error::Error + Send + Sync>);

impl JobError {
    /// Wraps an arbitrary error.
    pub fn new(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(error.into())
    }
}

/// A unit of repeatable work.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// A stable name for logging.
    fn name(&self) -> &str;

    /// Runs the job once. Returns `true` when a backlog remains and the job
    /// should be re-invoked immediately.
    async fn execute(&self) -> Result<bool, JobError>;
}

/// Runs jobs on a repeating schedule.
///
/// Each scheduled job gets its own tokio task. After a run reporting
/// backlog the job is re-invoked immediately (drain); otherwise the task
/// sleeps for the repeat schedule. A run exceeding its deadline is cancelled
/// and the next run is scheduled normally. Failed runs are logged and
/// retried on the next tick.
#[derive(Default)]
pub struct Scheduler {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a job to run repeatedly until [`shutdown`](Self::shutdown).
    pub fn schedule_many_times(
        &self,
        repeat_schedule: Duration,
        timeout: Duration,
        job: Arc<dyn Job>,
    ) {
        let handle = tokio::spawn(run_schedule(repeat_schedule, timeout, job));
        self.handles
            .lock()
            .expect("scheduler lock poisoned")
            .push(handle);
    }

    /// Aborts every scheduled job loop.
    pub fn shutdown(&self) {
        let handles = std::mem::take(
            &mut *self.handles.lock().expect("scheduler lock poisoned"),
        );
        for handle in handles {
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_schedule(repeat_schedule: Duration, timeout: Duration, job: Arc<dyn Job>) {
    loop {
        match tokio::time::timeout(timeout, job.execute()).await {
            Ok(Ok(true)) => continue,
            Ok(Ok(false)) => {}
            Ok(Err(error)) => {
                warn!(job = job.name(), %error, "job failed; retrying on next tick");
            }
            Err(_) => {
                warn!(
                    job = job.name(),
                    deadline_ms = timeout.as_millis() as u64,
                    "job exceeded its deadline and was cancelled"
                );
            }
        }
        tokio::time::sleep(repeat_schedule).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct CountingJob {
        runs: AtomicU32,
        backlog_runs: u32,
    }

    #[async_trait]
    impl Job for CountingJob {
        fn name(&self) -> &str {
            "counting"
        }

        async fn execute(&self) -> Result<bool, JobError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(run < self.backlog_runs)
        }
    }

    #[tokio::test]
    async fn backlog_is_drained_without_waiting_for_the_schedule() {
        let job = Arc::new(CountingJob {
            runs: AtomicU32::new(0),
            backlog_runs: 3,
        });
        let scheduler = Scheduler::new();

        // A repeat schedule far longer than the test: only draining can
        // produce more than one run.
        scheduler.schedule_many_times(
            Duration::from_secs(3600),
            Duration::from_secs(1),
            job.clone(),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);

        scheduler.shutdown();
    }

    struct HangingJob {
        runs: AtomicU32,
    }

    #[async_trait]
    impl Job for HangingJob {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn execute(&self) -> Result<bool, JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(false)
        }
    }

    #[tokio::test]
    async fn overrunning_job_is_cancelled_and_rescheduled() {
        let job = Arc::new(HangingJob {
            runs: AtomicU32::new(0),
        });
        let scheduler = Scheduler::new();

        scheduler.schedule_many_times(
            Duration::from_millis(10),
            Duration::from_millis(10),
            job.clone(),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(job.runs.load(Ordering::SeqCst) >= 2);

        scheduler.shutdown();
    }

    struct FailingJob;

    #[async_trait]
    impl Job for FailingJob {
        fn name(&self) -> &str {
            "failing"
        }

        async fn execute(&self) -> Result<bool, JobError> {
            Err(JobError::new("boom"))
        }
    }

    #[tokio::test]
    async fn failed_job_is_retried_on_the_next_tick() {
        let scheduler = Scheduler::new();
        scheduler.schedule_many_times(
            Duration::from_millis(10),
            Duration::from_secs(1),
            Arc::new(FailingJob),
        );

        // Nothing to assert beyond "the loop keeps going"; give it a few
        // ticks and shut down cleanly.
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.shutdown();
    }
}
