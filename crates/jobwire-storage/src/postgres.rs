//! Postgres-backed store and task queue.
//!
//! All queries are runtime-checked; run aggregation and queue claims are
//! single statements so they stay atomic under concurrent workers. The queue
//! claim uses `FOR UPDATE SKIP LOCKED` so multiple workers never double-claim
//! a task.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use jobwire_core::{FailedJob, ImportRun, ImportTask, JobRecord, RunDelta, StoredJob};

use crate::{ImportStore, StoreError, TaskQueue};

const RUN_COLUMNS: &str = "id, source, started_at, total_fetched, total_imported, \
     new_jobs, new_jobs_details, updated_jobs, failed_jobs_count, failed_jobs, fetched_records";

/// Postgres [`ImportStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))
    }
}

fn job_from_row(row: &PgRow) -> Result<StoredJob, StoreError> {
    Ok(StoredJob {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        location: row.try_get("location")?,
        url: row.try_get("url")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        job_type: row.try_get("job_type")?,
        source: row.try_get("source")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        raw: row.try_get("raw")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<ImportRun, StoreError> {
    let new_jobs_details: JsonValue = row.try_get("new_jobs_details")?;
    let failed_jobs: JsonValue = row.try_get("failed_jobs")?;
    let fetched_records: JsonValue = row.try_get("fetched_records")?;
    Ok(ImportRun {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        started_at: row.try_get("started_at")?,
        total_fetched: row.try_get("total_fetched")?,
        total_imported: row.try_get("total_imported")?,
        new_jobs: row.try_get("new_jobs")?,
        new_jobs_details: serde_json::from_value(new_jobs_details)?,
        updated_jobs: row.try_get("updated_jobs")?,
        failed_jobs_count: row.try_get("failed_jobs_count")?,
        failed_jobs: serde_json::from_value(failed_jobs)?,
        fetched_records: serde_json::from_value(fetched_records)?,
    })
}

#[async_trait]
impl ImportStore for PgStore {
    async fn insert_job(&self, job: &StoredJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, external_id, title, company, location, url,
                              description, category, job_type, source,
                              created_at, updated_at, raw)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.id)
        .bind(&job.external_id)
        .bind(&job.title)
        .bind(&job.company)
        .bind(&job.location)
        .bind(&job.url)
        .bind(&job.description)
        .bind(&job.category)
        .bind(&job.job_type)
        .bind(&job.source)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(&job.raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_jobs_by_identity(
        &self,
        external_id: &str,
        url: &str,
    ) -> Result<Vec<StoredJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE external_id = $1 OR ($2 <> '' AND url = $2)
            ORDER BY created_at ASC
            "#,
        )
        .bind(external_id)
        .bind(url)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn replace_job_fields(&self, id: Uuid, record: &JobRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET title = $2, company = $3, location = $4, description = $5,
                category = $6, job_type = $7, updated_at = $8, raw = $9
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&record.title)
        .bind(&record.company)
        .bind(&record.location)
        .bind(&record.description)
        .bind(&record.category)
        .bind(&record.job_type)
        .bind(record.updated_at)
        .bind(&record.raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<StoredJob>, StoreError> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn jobs_created_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredJob>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE created_at >= $1 ORDER BY created_at DESC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn count_jobs(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }

    async fn create_run(&self, run: &ImportRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO import_runs
                (id, source, started_at, total_fetched, total_imported,
                 new_jobs, new_jobs_details, updated_jobs,
                 failed_jobs_count, failed_jobs, fetched_records)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(run.id)
        .bind(&run.source)
        .bind(run.started_at)
        .bind(run.total_fetched)
        .bind(run.total_imported)
        .bind(run.new_jobs)
        .bind(serde_json::to_value(&run.new_jobs_details)?)
        .bind(run.updated_jobs)
        .bind(run.failed_jobs_count)
        .bind(serde_json::to_value(&run.failed_jobs)?)
        .bind(serde_json::to_value(&run.fetched_records)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn run(&self, id: Uuid) -> Result<Option<ImportRun>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM import_runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, page: i64, limit: i64) -> Result<(i64, Vec<ImportRun>), StoreError> {
        let page = page.max(1);
        let limit = limit.max(1);
        let total: i64 = sqlx::query("SELECT COUNT(*) AS count FROM import_runs")
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM import_runs ORDER BY started_at DESC LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind((page - 1) * limit)
        .fetch_all(&self.pool)
        .await?;
        let runs = rows.iter().map(run_from_row).collect::<Result<_, _>>()?;
        Ok((total, runs))
    }

    async fn latest_run(&self) -> Result<Option<ImportRun>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM import_runs ORDER BY started_at DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn latest_failed_jobs(&self) -> Result<Vec<FailedJob>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT failed_jobs FROM import_runs
            WHERE failed_jobs_count > 0
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let failed: JsonValue = row.try_get("failed_jobs")?;
                Ok(serde_json::from_value(failed)?)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn count_runs(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM import_runs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }

    async fn apply_run_delta(
        &self,
        run_id: Uuid,
        delta: &RunDelta,
    ) -> Result<ImportRun, StoreError> {
        let details = match &delta.new_job {
            Some(detail) => serde_json::to_value(std::slice::from_ref(detail))?,
            None => JsonValue::Array(Vec::new()),
        };
        let row = sqlx::query(&format!(
            r#"
            UPDATE import_runs
            SET total_imported = total_imported + 1,
                new_jobs = new_jobs + $2,
                updated_jobs = updated_jobs + $3,
                new_jobs_details = new_jobs_details || $4::jsonb
            WHERE id = $1
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(if delta.new_job.is_some() { 1i64 } else { 0i64 })
        .bind(if delta.updated { 1i64 } else { 0i64 })
        .bind(details)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => run_from_row(&row),
            None => Err(StoreError::RunNotFound(run_id)),
        }
    }

    async fn apply_run_failure(
        &self,
        run_id: Uuid,
        failure: &FailedJob,
    ) -> Result<ImportRun, StoreError> {
        let entry = serde_json::to_value(std::slice::from_ref(failure))?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE import_runs
            SET failed_jobs_count = failed_jobs_count + 1,
                failed_jobs = failed_jobs || $2::jsonb
            WHERE id = $1
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(entry)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => run_from_row(&row),
            None => Err(StoreError::RunNotFound(run_id)),
        }
    }
}

/// Postgres [`TaskQueue`] over the `import_tasks` table.
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskQueue for PgQueue {
    async fn enqueue_batch(
        &self,
        run_id: Uuid,
        records: &[JobRecord],
    ) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let payload = serde_json::to_value(records)?;
        let result = sqlx::query(
            r#"
            INSERT INTO import_tasks (id, run_id, record)
            SELECT gen_random_uuid(), $1, value
            FROM jsonb_array_elements($2::jsonb)
            "#,
        )
        .bind(run_id)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn claim_due(&self) -> Result<Option<ImportTask>, StoreError> {
        let row = sqlx::query(
            r#"
            WITH next_task AS (
                SELECT id FROM import_tasks
                WHERE status = 'pending' AND scheduled_at <= NOW()
                ORDER BY seq
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE import_tasks t
            SET status = 'running', attempts = t.attempts + 1
            FROM next_task
            WHERE t.id = next_task.id
            RETURNING t.id, t.run_id, t.record, t.attempts
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let record: JsonValue = row.try_get("record")?;
                let attempts: i32 = row.try_get("attempts")?;
                Ok(Some(ImportTask {
                    id: row.try_get("id")?,
                    run_id: row.try_get("run_id")?,
                    record: serde_json::from_value(record)?,
                    attempt: attempts as u32,
                }))
            }
            None => Ok(None),
        }
    }

    async fn due_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM import_tasks WHERE status = 'pending' AND scheduled_at <= NOW()",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("count")?)
    }

    async fn complete(&self, task_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE import_tasks SET status = 'completed' WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_for_retry(&self, task_id: Uuid, delay: Duration) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE import_tasks
            SET status = 'pending',
                scheduled_at = NOW() + make_interval(secs => $2)
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, task_id: Uuid, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE import_tasks SET status = 'failed', last_error = $2 WHERE id = $1",
        )
        .bind(task_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn outstanding(&self) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM import_tasks WHERE status IN ('pending', 'running')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("count")?)
    }
}
