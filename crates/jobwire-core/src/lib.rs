//! Core domain model for the jobwire import pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Canonical, dialect-independent representation of one feed posting.
///
/// `external_id` is guaranteed non-empty after normalization; when a feed
/// item carries no native id, link, or title the normalizer synthesizes a
/// weak fallback identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub external_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: String,
    pub description: String,
    pub category: String,
    pub job_type: String,
    /// Feed URL this record came from.
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Opaque original feed item, retained for audit.
    pub raw: JsonValue,
}

/// Persisted job, one per distinct posting.
///
/// Unique by `external_id`; a stored job with a different `external_id` but
/// the same `url` is treated as the same posting. `external_id`, `url` and
/// `created_at` are immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredJob {
    pub id: Uuid,
    pub external_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: String,
    pub description: String,
    pub category: String,
    pub job_type: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub raw: JsonValue,
}

impl StoredJob {
    pub fn from_record(id: Uuid, record: &JobRecord) -> Self {
        Self {
            id,
            external_id: record.external_id.clone(),
            title: record.title.clone(),
            company: record.company.clone(),
            location: record.location.clone(),
            url: record.url.clone(),
            description: record.description.clone(),
            category: record.category.clone(),
            job_type: record.job_type.clone(),
            source: record.source.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            raw: record.raw.clone(),
        }
    }

    /// True when any of the six mutable fields differs from the incoming
    /// record. Identity fields and timestamps are not compared.
    pub fn differs_from(&self, record: &JobRecord) -> bool {
        self.title != record.title
            || self.company != record.company
            || self.location != record.location
            || self.description != record.description
            || self.category != record.category
            || self.job_type != record.job_type
    }
}

/// Summary entry appended to a run when a task creates a new job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJobDetail {
    pub job_id: Uuid,
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: String,
}

/// One permanently failed task: the original record plus the final error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
    pub record: JobRecord,
    pub reason: String,
}

/// Aggregate bookkeeping for one ingestion pass over one feed.
///
/// Counter invariants, maintained by atomic store deltas:
/// `failed_jobs_count == failed_jobs.len()`,
/// `new_jobs == new_jobs_details.len()`,
/// `new_jobs + updated_jobs <= total_imported`, and
/// `total_imported + failed_jobs_count <= total_fetched` with equality once
/// every queued task has resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRun {
    pub id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub total_fetched: i64,
    /// Tasks that completed processing (created, updated or no-op). Failures
    /// are never counted here.
    pub total_imported: i64,
    pub new_jobs: i64,
    pub new_jobs_details: Vec<NewJobDetail>,
    pub updated_jobs: i64,
    pub failed_jobs_count: i64,
    pub failed_jobs: Vec<FailedJob>,
    /// Raw feed items as fetched, for audit/detail views.
    pub fetched_records: Vec<JsonValue>,
}

impl ImportRun {
    pub fn new(source: &str, total_fetched: i64, fetched_records: Vec<JsonValue>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.to_string(),
            started_at: Utc::now(),
            total_fetched,
            total_imported: 0,
            new_jobs: 0,
            new_jobs_details: Vec::new(),
            updated_jobs: 0,
            failed_jobs_count: 0,
            failed_jobs: Vec::new(),
            fetched_records,
        }
    }
}

/// Result of applying one canonical record against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(Uuid),
    Updated(Uuid),
    Unchanged(Uuid),
}

impl UpsertOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            UpsertOutcome::Created(id) | UpsertOutcome::Updated(id) | UpsertOutcome::Unchanged(id) => {
                *id
            }
        }
    }
}

/// Counter delta produced by one successfully processed task.
///
/// Applied as a single atomic store operation so concurrent workers cannot
/// lose updates: `total_imported` always advances by one; `new_job` carries
/// the detail entry for a created job; `updated` marks an in-place update.
#[derive(Debug, Clone, PartialEq)]
pub struct RunDelta {
    pub new_job: Option<NewJobDetail>,
    pub updated: bool,
}

impl RunDelta {
    pub fn from_outcome(outcome: &UpsertOutcome, record: &JobRecord) -> Self {
        match outcome {
            UpsertOutcome::Created(job_id) => Self {
                new_job: Some(NewJobDetail {
                    job_id: *job_id,
                    title: record.title.clone(),
                    company: record.company.clone(),
                    location: record.location.clone(),
                    url: record.url.clone(),
                }),
                updated: false,
            },
            UpsertOutcome::Updated(_) => Self {
                new_job: None,
                updated: true,
            },
            UpsertOutcome::Unchanged(_) => Self {
                new_job: None,
                updated: false,
            },
        }
    }
}

/// One claimed unit of queued work: merge `record` into the store and update
/// the owning run. `attempt` is 1-based and counts this delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportTask {
    pub id: Uuid,
    pub run_id: Uuid,
    pub record: JobRecord,
    pub attempt: u32,
}
