//! Persistence seam for jobwire: store + durable task queue traits, retry
//! and rate-limit policies, with Postgres and in-memory implementations.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use jobwire_core::{FailedJob, ImportRun, ImportTask, JobRecord, RunDelta, StoredJob};

mod memory;
mod postgres;

pub use memory::{MemoryQueue, MemoryStore};
pub use postgres::{PgQueue, PgStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("import run {0} not found")]
    RunNotFound(Uuid),
    #[error("{0}")]
    Backend(String),
}

/// Read/write surface over stored jobs and import runs.
///
/// `apply_run_delta` and `apply_run_failure` are the run aggregator: each
/// call is one atomic increment-and-append against the stored run and
/// returns the full resulting state, so concurrent task completions from a
/// higher-concurrency worker configuration cannot lose updates.
#[async_trait]
pub trait ImportStore: Send + Sync {
    async fn insert_job(&self, job: &StoredJob) -> Result<(), StoreError>;
    /// All stored jobs matching `external_id` or `url`, oldest first. At
    /// most one match is expected; callers treat extras as a data-integrity
    /// warning.
    async fn find_jobs_by_identity(
        &self,
        external_id: &str,
        url: &str,
    ) -> Result<Vec<StoredJob>, StoreError>;
    /// Overwrites the mutable fields of an existing job in place, refreshing
    /// `updated_at` and `raw`. `external_id`, `url` and `created_at` are
    /// left untouched.
    async fn replace_job_fields(&self, id: Uuid, record: &JobRecord) -> Result<(), StoreError>;
    async fn list_jobs(&self) -> Result<Vec<StoredJob>, StoreError>;
    async fn jobs_created_since(&self, since: DateTime<Utc>)
        -> Result<Vec<StoredJob>, StoreError>;
    async fn count_jobs(&self) -> Result<i64, StoreError>;

    async fn create_run(&self, run: &ImportRun) -> Result<(), StoreError>;
    async fn run(&self, id: Uuid) -> Result<Option<ImportRun>, StoreError>;
    /// Runs newest-first. Returns the total run count alongside the page.
    async fn list_runs(&self, page: i64, limit: i64) -> Result<(i64, Vec<ImportRun>), StoreError>;
    async fn latest_run(&self) -> Result<Option<ImportRun>, StoreError>;
    /// Failed-job list from the most recent run containing at least one
    /// failure; empty when no run has failures.
    async fn latest_failed_jobs(&self) -> Result<Vec<FailedJob>, StoreError>;
    async fn count_runs(&self) -> Result<i64, StoreError>;

    async fn apply_run_delta(&self, run_id: Uuid, delta: &RunDelta)
        -> Result<ImportRun, StoreError>;
    async fn apply_run_failure(
        &self,
        run_id: Uuid,
        failure: &FailedJob,
    ) -> Result<ImportRun, StoreError>;
}

/// Durable queue of import tasks.
///
/// Tasks are delivered in submission order subject to retry rescheduling: a
/// released task keeps its original sequence position but only becomes
/// claimable once its backoff delay has elapsed, so later tasks may overtake
/// it.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueues one task per record as a single batch. Returns the number of
    /// tasks created.
    async fn enqueue_batch(&self, run_id: Uuid, records: &[JobRecord])
        -> Result<usize, StoreError>;
    /// Claims the next due pending task, marking it running and counting the
    /// delivery attempt. Returns `None` when nothing is due.
    async fn claim_due(&self) -> Result<Option<ImportTask>, StoreError>;
    /// Number of pending tasks whose due time has passed. Workers check this
    /// before spending a rate-limiter admission on a claim.
    async fn due_count(&self) -> Result<i64, StoreError>;
    async fn complete(&self, task_id: Uuid) -> Result<(), StoreError>;
    /// Returns a claimed task to pending, due again after `delay`.
    async fn release_for_retry(&self, task_id: Uuid, delay: Duration) -> Result<(), StoreError>;
    /// Terminal state after the retry budget is exhausted.
    async fn mark_failed(&self, task_id: Uuid, reason: &str) -> Result<(), StoreError>;
    /// Number of tasks still pending or running (i.e. not yet resolved).
    async fn outstanding(&self) -> Result<i64, StoreError>;
}

/// Retry budget with exponential backoff for task processing.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the retry that follows `attempt` (1-based): base,
    /// 2*base, 4*base, ... capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Sliding-window rate limiter: at most `max` admissions per trailing
/// `window`. Exists to respect an upstream service's fair-use limits, not
/// for internal resource protection.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max: usize,
    window: Duration,
    admissions: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max: max.max(1),
            window,
            admissions: Mutex::new(VecDeque::new()),
        }
    }

    /// Waits until an admission slot is free in the trailing window, then
    /// takes it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut admissions = self.admissions.lock().await;
                let now = Instant::now();
                while let Some(front) = admissions.front() {
                    if now.duration_since(*front) >= self.window {
                        admissions.pop_front();
                    } else {
                        break;
                    }
                }
                if admissions.len() < self.max {
                    admissions.push_back(now);
                    return;
                }
                // Oldest admission leaves the window first.
                match admissions.front() {
                    Some(front) => self.window.saturating_sub(now.duration_since(*front)),
                    None => Duration::ZERO,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}
