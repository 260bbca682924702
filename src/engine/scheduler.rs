//! Recurring job registration.
//!
//! `JobScheduler` is the contract the policy service schedules against;
//! `TokioScheduler` implements it with one tokio task per job id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::background_job::JobStore;
use crate::error::AppError;

/// What the scheduler should do after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Keep the recurring registration.
    Continue,
    /// The job can never succeed as configured; drop the registration.
    Stop,
}

/// Work executed on every tick.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run_job(&self, job_id: &str) -> JobOutcome;
}

pub trait JobScheduler: Send + Sync {
    /// Register a recurring job. Re-registering an id replaces the previous job.
    fn schedule(&self, job_id: &str, run_now: bool, every: Duration) -> Result<(), AppError>;

    /// Stop a recurring job. Unknown or already-cancelled ids are not an error.
    fn cancel(&self, job_id: &str) -> Result<(), AppError>;
}

pub struct TokioScheduler {
    handler: Arc<dyn JobHandler>,
    jobs: Arc<JobStore>,
    runtime: Handle,
}

impl TokioScheduler {
    /// Must be called from within a tokio runtime.
    pub fn new(handler: Arc<dyn JobHandler>) -> Result<Self, AppError> {
        let runtime = Handle::try_current()
            .map_err(|e| AppError::Internal(format!("No tokio runtime for scheduler: {e}")))?;
        Ok(Self {
            handler,
            jobs: Arc::new(JobStore::new("Scheduler job store lock poisoned")),
            runtime,
        })
    }

    pub fn scheduled_ids(&self) -> Vec<String> {
        let mut ids = self.jobs.job_ids();
        ids.sort();
        ids
    }

    pub fn runs(&self, job_id: &str) -> u64 {
        self.jobs.get_snapshot(job_id).map(|s| s.runs).unwrap_or(0)
    }

    /// Cancel every registered job.
    pub fn shutdown(&self) -> usize {
        match self.jobs.cancel_all() {
            Ok(n) => {
                tracing::info!(jobs = n, "Scheduler stopped");
                n
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to stop scheduled jobs");
                0
            }
        }
    }
}

impl JobScheduler for TokioScheduler {
    fn schedule(&self, job_id: &str, run_now: bool, every: Duration) -> Result<(), AppError> {
        if every.is_zero() {
            return Err(AppError::Validation("Job interval must be positive".into()));
        }
        let first_tick = Instant::now()
            .checked_add(every)
            .ok_or_else(|| AppError::Validation("Job interval is too large".into()))?;

        let token = CancellationToken::new();
        if let Some(previous) = self.jobs.register(job_id, token.clone())? {
            previous.cancel();
            tracing::debug!(job_id = %job_id, "Replaced existing scheduled job");
        }

        let handler = self.handler.clone();
        let jobs = self.jobs.clone();
        let id = job_id.to_string();

        self.runtime.spawn(async move {
            if run_now {
                if token.is_cancelled() {
                    return;
                }
                let outcome = handler.run_job(&id).await;
                jobs.record_tick(&id);
                if outcome == JobOutcome::Stop {
                    stop(&jobs, &id, &token);
                    return;
                }
            }

            let mut ticker = interval_at(first_tick, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let outcome = handler.run_job(&id).await;
                jobs.record_tick(&id);
                if outcome == JobOutcome::Stop {
                    stop(&jobs, &id, &token);
                    break;
                }
            }
            tracing::debug!(job_id = %id, "Scheduled job loop exited");
        });

        tracing::info!(
            job_id = %job_id,
            run_now,
            every_secs = every.as_secs(),
            "Scheduled recurring job"
        );
        Ok(())
    }

    fn cancel(&self, job_id: &str) -> Result<(), AppError> {
        if let Some(token) = self.jobs.take_cancel_token(job_id)? {
            token.cancel();
            tracing::info!(job_id = %job_id, "Cancelled scheduled job");
        }
        Ok(())
    }
}

fn stop(jobs: &JobStore, job_id: &str, token: &CancellationToken) {
    token.cancel();
    jobs.remove_if_cancelled(job_id);
    tracing::warn!(job_id = %job_id, "Scheduled job stopped by its handler");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records how many times each job ran; stops jobs named `stop-*`.
    #[derive(Default)]
    struct CountingHandler {
        runs: Mutex<HashMap<String, usize>>,
    }

    impl CountingHandler {
        fn count(&self, id: &str) -> usize {
            self.runs.lock().unwrap().get(id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn run_job(&self, job_id: &str) -> JobOutcome {
            *self.runs.lock().unwrap().entry(job_id.to_string()).or_default() += 1;
            if job_id.starts_with("stop-") {
                JobOutcome::Stop
            } else {
                JobOutcome::Continue
            }
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_now_then_every_interval() {
        let handler = Arc::new(CountingHandler::default());
        let scheduler = TokioScheduler::new(handler.clone()).unwrap();

        scheduler.schedule("rot-1", true, Duration::from_secs(60)).unwrap();
        settle().await;
        assert_eq!(handler.count("rot-1"), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(handler.count("rot-1"), 2);
        assert_eq!(scheduler.runs("rot-1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_run_now_waits_one_interval() {
        let handler = Arc::new(CountingHandler::default());
        let scheduler = TokioScheduler::new(handler.clone()).unwrap();

        scheduler.schedule("rot-1", false, Duration::from_secs(60)).unwrap();
        settle().await;
        assert_eq!(handler.count("rot-1"), 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(handler.count("rot-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_twice_and_unknown_is_ok() {
        let handler = Arc::new(CountingHandler::default());
        let scheduler = TokioScheduler::new(handler.clone()).unwrap();

        scheduler.schedule("rot-1", false, Duration::from_secs(60)).unwrap();
        scheduler.cancel("rot-1").unwrap();
        scheduler.cancel("rot-1").unwrap();
        scheduler.cancel("never-scheduled").unwrap();

        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(handler.count("rot-1"), 0);
        assert!(scheduler.scheduled_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_previous_job() {
        let handler = Arc::new(CountingHandler::default());
        let scheduler = TokioScheduler::new(handler.clone()).unwrap();

        scheduler.schedule("rot-1", false, Duration::from_secs(60)).unwrap();
        scheduler.schedule("rot-1", false, Duration::from_secs(60)).unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        // Only the replacement fires
        assert_eq!(handler.count("rot-1"), 1);
        assert_eq!(scheduler.scheduled_ids(), vec!["rot-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_outcome_unregisters() {
        let handler = Arc::new(CountingHandler::default());
        let scheduler = TokioScheduler::new(handler.clone()).unwrap();

        scheduler.schedule("stop-1", true, Duration::from_secs(60)).unwrap();
        settle().await;
        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(handler.count("stop-1"), 1);
        assert!(scheduler.scheduled_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_all() {
        let handler = Arc::new(CountingHandler::default());
        let scheduler = TokioScheduler::new(handler.clone()).unwrap();
        scheduler.schedule("a", false, Duration::from_secs(60)).unwrap();
        scheduler.schedule("b", false, Duration::from_secs(60)).unwrap();
        assert_eq!(scheduler.shutdown(), 2);

        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(handler.count("a") + handler.count("b"), 0);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let _guard = rt.enter();
        let scheduler = TokioScheduler::new(Arc::new(CountingHandler::default())).unwrap();
        assert!(scheduler.schedule("x", false, Duration::ZERO).is_err());
        assert!(scheduler.schedule("x", false, Duration::MAX).is_err());
        assert!(scheduler.scheduled_ids().is_empty());
    }
}
