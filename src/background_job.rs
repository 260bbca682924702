//! In-process job bookkeeping.
//!
//! `JobStore` is a thread-safe, evicting map from job id to `JobEntry`. The
//! scheduler keeps one entry per registered recurring job (holding its
//! cancellation token); the rotation engine keeps one per in-flight run so a
//! second run of the same policy is refused while the first is active.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// 30-minute TTL for finished entries before eviction.
const JOB_TTL_SECS: u64 = 30 * 60;

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_SCHEDULED: &str = "scheduled";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

#[derive(Clone)]
pub struct JobEntry {
    pub status: String,
    pub error: Option<String>,
    pub cancel_token: Option<CancellationToken>,
    pub created_at: Instant,
    /// Completed runs (scheduled jobs) or attempts (run guard).
    pub runs: u64,
}

impl JobEntry {
    fn new(status: &str, cancel_token: Option<CancellationToken>) -> Self {
        Self {
            status: status.to_string(),
            error: None,
            cancel_token,
            created_at: Instant::now(),
            runs: 0,
        }
    }

    fn is_live(&self) -> bool {
        self.status == STATUS_RUNNING || self.status == STATUS_SCHEDULED
    }
}

pub struct JobStore {
    jobs: Mutex<HashMap<String, JobEntry>>,
    lock_error_msg: &'static str,
}

impl JobStore {
    /// `lock_error_msg` is reported when the mutex is poisoned.
    pub fn new(lock_error_msg: &'static str) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            lock_error_msg,
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, JobEntry>>, AppError> {
        self.jobs
            .lock()
            .map_err(|_| AppError::Internal(self.lock_error_msg.into()))
    }

    /// Remove finished entries older than 30 minutes.
    fn evict_stale(jobs: &mut HashMap<String, JobEntry>) {
        let cutoff = Duration::from_secs(JOB_TTL_SECS);
        jobs.retain(|_, job| job.is_live() || job.created_at.elapsed() < cutoff);
    }

    // ── Run guard ──────────────────────────────────────────────────

    /// Mark `job_id` as running. Returns `Err` if it already is.
    pub fn insert_running(&self, job_id: &str) -> Result<(), AppError> {
        let mut jobs = self.lock()?;
        Self::evict_stale(&mut jobs);
        if let Some(existing) = jobs.get(job_id) {
            if existing.status == STATUS_RUNNING {
                return Err(AppError::Validation(format!("Job {job_id} is already running")));
            }
        }
        let runs = jobs.get(job_id).map(|j| j.runs).unwrap_or(0);
        let mut entry = JobEntry::new(STATUS_RUNNING, None);
        entry.runs = runs + 1;
        jobs.insert(job_id.to_string(), entry);
        Ok(())
    }

    /// Mark a running job as finished.
    pub fn finish(&self, job_id: &str, status: &str, error: Option<String>) {
        if let Ok(mut jobs) = self.lock() {
            if let Some(job) = jobs.get_mut(job_id) {
                job.status = status.to_string();
                job.error = error;
                job.created_at = Instant::now();
            }
        }
    }

    /// Insert a running entry and return a guard that finishes it on drop.
    pub fn start(&self, job_id: &str) -> Result<RunGuard<'_>, AppError> {
        self.insert_running(job_id)?;
        Ok(RunGuard {
            store: self,
            job_id: job_id.to_string(),
            error: None,
        })
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.lock()
            .map(|jobs| jobs.get(job_id).is_some_and(|j| j.status == STATUS_RUNNING))
            .unwrap_or(false)
    }

    // ── Scheduled jobs ─────────────────────────────────────────────

    /// Register a scheduled job, returning the token it replaced (if any).
    pub fn register(
        &self,
        job_id: &str,
        token: CancellationToken,
    ) -> Result<Option<CancellationToken>, AppError> {
        let mut jobs = self.lock()?;
        Self::evict_stale(&mut jobs);
        let previous = jobs
            .insert(job_id.to_string(), JobEntry::new(STATUS_SCHEDULED, Some(token)))
            .and_then(|old| old.cancel_token);
        Ok(previous)
    }

    /// Remove a scheduled job, returning its token. Unknown ids yield `None`.
    pub fn take_cancel_token(&self, job_id: &str) -> Result<Option<CancellationToken>, AppError> {
        let mut jobs = self.lock()?;
        Ok(jobs.remove(job_id).and_then(|j| j.cancel_token))
    }

    /// Drop a scheduled entry whose token has already fired.
    /// A re-registered job carries a fresh token and is left alone.
    pub fn remove_if_cancelled(&self, job_id: &str) {
        if let Ok(mut jobs) = self.lock() {
            let cancelled = jobs
                .get(job_id)
                .and_then(|j| j.cancel_token.as_ref())
                .is_some_and(CancellationToken::is_cancelled);
            if cancelled {
                jobs.remove(job_id);
            }
        }
    }

    /// Bump the run counter of a scheduled job.
    pub fn record_tick(&self, job_id: &str) {
        if let Ok(mut jobs) = self.lock() {
            if let Some(job) = jobs.get_mut(job_id) {
                job.runs += 1;
            }
        }
    }

    /// Cancel every tracked token and clear the store. Returns how many were cancelled.
    pub fn cancel_all(&self) -> Result<usize, AppError> {
        let mut jobs = self.lock()?;
        let mut cancelled = 0;
        for (_, job) in jobs.drain() {
            if let Some(token) = job.cancel_token {
                token.cancel();
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    pub fn get_snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        let jobs = self.lock().ok()?;
        jobs.get(job_id).map(|job| JobSnapshot {
            job_id: job_id.to_string(),
            status: job.status.clone(),
            error: job.error.clone(),
            runs: job.runs,
        })
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.lock()
            .map(|jobs| jobs.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Finishes its entry on drop: `completed` unless `fail` was called.
pub struct RunGuard<'a> {
    store: &'a JobStore,
    job_id: String,
    error: Option<String>,
}

impl RunGuard<'_> {
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let status = if self.error.is_some() { STATUS_FAILED } else { STATUS_COMPLETED };
        self.store.finish(&self.job_id, status, self.error.take());
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: String,
    pub error: Option<String>,
    pub runs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_guard_refuses_second_run() {
        let store = JobStore::new("test lock poisoned");
        let guard = store.start("rot-1").unwrap();
        assert!(store.is_running("rot-1"));
        assert!(matches!(store.start("rot-1"), Err(AppError::Validation(_))));
        // Other ids are independent
        drop(store.start("rot-2").unwrap());

        drop(guard);
        assert!(!store.is_running("rot-1"));
        let snap = store.get_snapshot("rot-1").unwrap();
        assert_eq!(snap.status, STATUS_COMPLETED);
        assert_eq!(snap.runs, 1);

        drop(store.start("rot-1").unwrap());
        assert_eq!(store.get_snapshot("rot-1").unwrap().runs, 2);
    }

    #[test]
    fn test_run_guard_records_failure() {
        let store = JobStore::new("test lock poisoned");
        {
            let mut guard = store.start("rot-1").unwrap();
            guard.fail("boom");
        }
        let snap = store.get_snapshot("rot-1").unwrap();
        assert_eq!(snap.status, STATUS_FAILED);
        assert_eq!(snap.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_register_replaces_and_returns_previous_token() {
        let store = JobStore::new("test lock poisoned");
        let first = CancellationToken::new();
        assert!(store.register("job", first.clone()).unwrap().is_none());

        let previous = store.register("job", CancellationToken::new()).unwrap().unwrap();
        previous.cancel();
        assert!(first.is_cancelled());

        assert!(store.take_cancel_token("job").unwrap().is_some());
        assert!(store.take_cancel_token("job").unwrap().is_none());
    }

    #[test]
    fn test_cancel_all() {
        let store = JobStore::new("test lock poisoned");
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        store.register("a", a.clone()).unwrap();
        store.register("b", b.clone()).unwrap();
        assert_eq!(store.cancel_all().unwrap(), 2);
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(store.job_ids().is_empty());
    }
}
