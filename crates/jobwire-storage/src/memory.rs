//! In-memory store and queue, trait-faithful twins of the Postgres
//! implementations. Used by the test suites; not durable across restarts.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use jobwire_core::{FailedJob, ImportRun, ImportTask, JobRecord, RunDelta, StoredJob};

use crate::{ImportStore, StoreError, TaskQueue};

#[derive(Default)]
struct MemoryState {
    jobs: Vec<StoredJob>,
    runs: Vec<ImportRun>,
}

/// Mutex-guarded in-memory [`ImportStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ImportStore for MemoryStore {
    async fn insert_job(&self, job: &StoredJob) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        if state.jobs.iter().any(|j| j.external_id == job.external_id) {
            return Err(StoreError::Backend(format!(
                "duplicate external_id {}",
                job.external_id
            )));
        }
        state.jobs.push(job.clone());
        Ok(())
    }

    async fn find_jobs_by_identity(
        &self,
        external_id: &str,
        url: &str,
    ) -> Result<Vec<StoredJob>, StoreError> {
        let state = self.inner.lock().await;
        // An empty url is the absence of a link, not a shared identity.
        Ok(state
            .jobs
            .iter()
            .filter(|j| j.external_id == external_id || (!url.is_empty() && j.url == url))
            .cloned()
            .collect())
    }

    async fn replace_job_fields(&self, id: Uuid, record: &JobRecord) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| StoreError::Backend(format!("job {id} not found")))?;
        job.title = record.title.clone();
        job.company = record.company.clone();
        job.location = record.location.clone();
        job.description = record.description.clone();
        job.category = record.category.clone();
        job.job_type = record.job_type.clone();
        job.updated_at = record.updated_at;
        job.raw = record.raw.clone();
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<StoredJob>, StoreError> {
        let state = self.inner.lock().await;
        let mut jobs = state.jobs.clone();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn jobs_created_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredJob>, StoreError> {
        let state = self.inner.lock().await;
        let mut jobs: Vec<_> = state
            .jobs
            .iter()
            .filter(|j| j.created_at >= since)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn count_jobs(&self) -> Result<i64, StoreError> {
        Ok(self.inner.lock().await.jobs.len() as i64)
    }

    async fn create_run(&self, run: &ImportRun) -> Result<(), StoreError> {
        self.inner.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn run(&self, id: Uuid) -> Result<Option<ImportRun>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn list_runs(&self, page: i64, limit: i64) -> Result<(i64, Vec<ImportRun>), StoreError> {
        let state = self.inner.lock().await;
        let mut runs = state.runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let total = runs.len() as i64;
        let limit = limit.max(1) as usize;
        let skip = (page.max(1) as usize - 1) * limit;
        Ok((total, runs.into_iter().skip(skip).take(limit).collect()))
    }

    async fn latest_run(&self) -> Result<Option<ImportRun>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .runs
            .iter()
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn latest_failed_jobs(&self) -> Result<Vec<FailedJob>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.failed_jobs_count > 0)
            .max_by_key(|r| r.started_at)
            .map(|r| r.failed_jobs.clone())
            .unwrap_or_default())
    }

    async fn count_runs(&self) -> Result<i64, StoreError> {
        Ok(self.inner.lock().await.runs.len() as i64)
    }

    async fn apply_run_delta(
        &self,
        run_id: Uuid,
        delta: &RunDelta,
    ) -> Result<ImportRun, StoreError> {
        let mut state = self.inner.lock().await;
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        run.total_imported += 1;
        if let Some(detail) = &delta.new_job {
            run.new_jobs += 1;
            run.new_jobs_details.push(detail.clone());
        }
        if delta.updated {
            run.updated_jobs += 1;
        }
        Ok(run.clone())
    }

    async fn apply_run_failure(
        &self,
        run_id: Uuid,
        failure: &FailedJob,
    ) -> Result<ImportRun, StoreError> {
        let mut state = self.inner.lock().await;
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        run.failed_jobs_count += 1;
        run.failed_jobs.push(failure.clone());
        Ok(run.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

struct QueuedTask {
    id: Uuid,
    run_id: Uuid,
    record: JobRecord,
    attempts: u32,
    status: TaskStatus,
    due_at: Instant,
    seq: u64,
    last_error: Option<String>,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    tasks: Vec<QueuedTask>,
}

/// Mutex-guarded in-memory [`TaskQueue`].
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue_batch(
        &self,
        run_id: Uuid,
        records: &[JobRecord],
    ) -> Result<usize, StoreError> {
        let mut state = self.inner.lock().await;
        let now = Instant::now();
        for record in records {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.tasks.push(QueuedTask {
                id: Uuid::new_v4(),
                run_id,
                record: record.clone(),
                attempts: 0,
                status: TaskStatus::Pending,
                due_at: now,
                seq,
                last_error: None,
            });
        }
        Ok(records.len())
    }

    async fn claim_due(&self) -> Result<Option<ImportTask>, StoreError> {
        let mut state = self.inner.lock().await;
        let now = Instant::now();
        let next = state
            .tasks
            .iter_mut()
            .filter(|t| t.status == TaskStatus::Pending && t.due_at <= now)
            .min_by_key(|t| t.seq);
        Ok(next.map(|task| {
            task.status = TaskStatus::Running;
            task.attempts += 1;
            ImportTask {
                id: task.id,
                run_id: task.run_id,
                record: task.record.clone(),
                attempt: task.attempts,
            }
        }))
    }

    async fn due_count(&self) -> Result<i64, StoreError> {
        let state = self.inner.lock().await;
        let now = Instant::now();
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && t.due_at <= now)
            .count() as i64)
    }

    async fn complete(&self, task_id: Uuid) -> Result<(), StoreError> {
        self.transition(task_id, TaskStatus::Completed, None).await
    }

    async fn release_for_retry(&self, task_id: Uuid, delay: Duration) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| StoreError::Backend(format!("task {task_id} not found")))?;
        task.status = TaskStatus::Pending;
        task.due_at = Instant::now() + delay;
        Ok(())
    }

    async fn mark_failed(&self, task_id: Uuid, reason: &str) -> Result<(), StoreError> {
        self.transition(task_id, TaskStatus::Failed, Some(reason.to_string()))
            .await
    }

    async fn outstanding(&self) -> Result<i64, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Running))
            .count() as i64)
    }
}

impl MemoryQueue {
    async fn transition(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        last_error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| StoreError::Backend(format!("task {task_id} not found")))?;
        task.status = status;
        if last_error.is_some() {
            task.last_error = last_error;
        }
        Ok(())
    }
}
