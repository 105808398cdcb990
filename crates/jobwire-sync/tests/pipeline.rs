//! End-to-end pipeline tests: mock HTTP feeds, in-memory store and queue,
//! one worker draining the queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use jobwire_core::{FailedJob, ImportRun, JobRecord, RunDelta, StoredJob};
use jobwire_storage::{
    ImportStore, MemoryQueue, MemoryStore, RetryPolicy, SlidingWindowLimiter, StoreError,
    TaskQueue,
};
use jobwire_sync::{
    BroadcastPublisher, ImportPipeline, NoopPublisher, RunPublisher, Worker, WorkerOptions,
};

fn feed_xml(ids: &[&str]) -> String {
    let mut body = String::from("<rss><channel>");
    for id in ids {
        body.push_str(&format!(
            "<item><guid>{id}</guid><title>Job {id}</title>\
             <link>https://example.com/jobs/{id}</link>\
             <job:company>Acme</job:company></item>"
        ));
    }
    body.push_str("</channel></rss>");
    body
}

async fn mount_feed(server: &MockServer, route: &str, ids: &[&str]) {
    Mock::given(method("GET"))
        .and(path(route.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_string(feed_xml(ids)))
        .mount(server)
        .await;
}

struct Harness {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    pipeline: ImportPipeline,
    worker: Worker,
}

fn build_harness(
    feed_urls: Vec<String>,
    store: Arc<dyn ImportStore>,
    concrete_store: Arc<MemoryStore>,
    publisher: Arc<dyn RunPublisher>,
    retry_base: Duration,
) -> Harness {
    let queue = Arc::new(MemoryQueue::new());
    let client = jobwire_feeds::FeedClient::new(Duration::from_secs(5), "jobwire-test")
        .expect("feed client");
    let pipeline = ImportPipeline::new(
        feed_urls,
        client,
        store.clone(),
        queue.clone(),
        publisher.clone(),
        Duration::from_millis(1),
    );
    let worker = Worker::new(
        store,
        queue.clone(),
        publisher,
        Arc::new(SlidingWindowLimiter::new(1000, Duration::from_secs(60))),
        WorkerOptions {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: retry_base,
                max_delay: Duration::from_secs(1),
            },
            poll_interval: Duration::from_millis(5),
        },
    );
    Harness {
        store: concrete_store,
        queue,
        pipeline,
        worker,
    }
}

fn simple_harness(feed_urls: Vec<String>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    build_harness(
        feed_urls,
        store.clone(),
        store,
        Arc::new(NoopPublisher),
        Duration::from_millis(10),
    )
}

#[tokio::test]
async fn full_import_creates_runs_and_jobs_per_feed() {
    let server = MockServer::start().await;
    mount_feed(&server, "/a", &["a1", "a2"]).await;
    mount_feed(&server, "/b", &["b1"]).await;

    let urls = vec![format!("{}/a", server.uri()), format!("{}/b", server.uri())];
    let h = simple_harness(urls.clone());

    h.pipeline.run_import().await.unwrap();
    h.worker.drain().await.unwrap();

    assert_eq!(h.store.count_jobs().await.unwrap(), 3);
    let (total, runs) = h.store.list_runs(1, 10).await.unwrap();
    assert_eq!(total, 2);
    for run in &runs {
        assert_eq!(run.total_imported, run.total_fetched);
        assert_eq!(run.new_jobs, run.total_fetched);
        assert_eq!(run.new_jobs_details.len() as i64, run.new_jobs);
        assert_eq!(run.failed_jobs_count, 0);
        assert_eq!(run.fetched_records.len() as i64, run.total_fetched);
    }
    let sources: Vec<_> = runs.iter().map(|r| r.source.clone()).collect();
    assert!(sources.contains(&urls[0]));
    assert!(sources.contains(&urls[1]));
    assert_eq!(h.queue.outstanding().await.unwrap(), 0);
}

#[tokio::test]
async fn reimport_marks_everything_unchanged() {
    let server = MockServer::start().await;
    mount_feed(&server, "/a", &["a1", "a2"]).await;

    let h = simple_harness(vec![format!("{}/a", server.uri())]);
    h.pipeline.run_import().await.unwrap();
    h.worker.drain().await.unwrap();
    h.pipeline.run_import().await.unwrap();
    h.worker.drain().await.unwrap();

    assert_eq!(h.store.count_jobs().await.unwrap(), 2);
    let latest = h.store.latest_run().await.unwrap().unwrap();
    assert_eq!(latest.total_imported, 2);
    assert_eq!(latest.new_jobs, 0);
    assert_eq!(latest.updated_jobs, 0);
    assert_eq!(latest.failed_jobs_count, 0);
}

#[tokio::test]
async fn a_changed_title_counts_as_one_update_and_keeps_created_at() {
    let server = MockServer::start().await;
    mount_feed(&server, "/a", &["a1", "a2", "a3"]).await;

    let h = simple_harness(vec![format!("{}/a", server.uri())]);
    h.pipeline.run_import().await.unwrap();
    h.worker.drain().await.unwrap();
    let before: Vec<_> = h.store.list_jobs().await.unwrap();
    let original = before.iter().find(|j| j.external_id == "a2").unwrap().clone();

    server.reset().await;
    let changed = feed_xml(&["a1", "a2", "a3"])
        .replace("Job a2", "Job a2 (senior)");
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_string(changed))
        .mount(&server)
        .await;

    h.pipeline.run_import().await.unwrap();
    h.worker.drain().await.unwrap();

    let run = h.store.latest_run().await.unwrap().unwrap();
    assert_eq!(run.total_fetched, 3);
    assert_eq!(run.total_imported, 3);
    assert_eq!(run.new_jobs, 0);
    assert_eq!(run.updated_jobs, 1);
    assert_eq!(run.failed_jobs_count, 0);

    let after = h.store.list_jobs().await.unwrap();
    let updated = after.iter().find(|j| j.external_id == "a2").unwrap();
    assert_eq!(updated.title, "Job a2 (senior)");
    assert_eq!(updated.id, original.id);
    assert_eq!(updated.created_at, original.created_at);
}

#[tokio::test]
async fn a_failing_feed_does_not_abort_the_pass() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    mount_feed(&server, "/up", &["u1"]).await;

    let h = simple_harness(vec![
        format!("{}/down", server.uri()),
        format!("{}/up", server.uri()),
    ]);
    h.pipeline.run_import().await.unwrap();
    h.worker.drain().await.unwrap();

    let (total, runs) = h.store.list_runs(1, 10).await.unwrap();
    assert_eq!(total, 1);
    assert!(runs[0].source.ends_with("/up"));
    assert_eq!(h.store.count_jobs().await.unwrap(), 1);
}

#[tokio::test]
async fn an_empty_feed_opens_no_run() {
    let server = MockServer::start().await;
    mount_feed(&server, "/empty", &[]).await;

    let h = simple_harness(vec![format!("{}/empty", server.uri())]);
    h.pipeline.run_import().await.unwrap();

    assert_eq!(h.store.count_runs().await.unwrap(), 0);
    assert_eq!(h.queue.outstanding().await.unwrap(), 0);
}

/// Store wrapper that fails `insert_job` a configured number of times per
/// external id, and optionally `apply_run_delta` a number of times overall,
/// then delegates.
struct FlakyStore {
    inner: Arc<MemoryStore>,
    failures_left: Mutex<HashMap<String, u32>>,
    delta_failures_left: Mutex<u32>,
}

impl FlakyStore {
    fn new(inner: Arc<MemoryStore>, failures: &[(&str, u32)]) -> Self {
        Self {
            inner,
            failures_left: Mutex::new(
                failures
                    .iter()
                    .map(|(id, n)| (id.to_string(), *n))
                    .collect(),
            ),
            delta_failures_left: Mutex::new(0),
        }
    }

    fn failing_deltas(inner: Arc<MemoryStore>, count: u32) -> Self {
        Self {
            inner,
            failures_left: Mutex::new(HashMap::new()),
            delta_failures_left: Mutex::new(count),
        }
    }
}

#[async_trait]
impl ImportStore for FlakyStore {
    async fn insert_job(&self, job: &StoredJob) -> Result<(), StoreError> {
        {
            let mut failures = self.failures_left.lock().await;
            if let Some(left) = failures.get_mut(&job.external_id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(StoreError::Backend("simulated insert failure".into()));
                }
            }
        }
        self.inner.insert_job(job).await
    }

    async fn find_jobs_by_identity(
        &self,
        external_id: &str,
        url: &str,
    ) -> Result<Vec<StoredJob>, StoreError> {
        self.inner.find_jobs_by_identity(external_id, url).await
    }

    async fn replace_job_fields(&self, id: Uuid, record: &JobRecord) -> Result<(), StoreError> {
        self.inner.replace_job_fields(id, record).await
    }

    async fn list_jobs(&self) -> Result<Vec<StoredJob>, StoreError> {
        self.inner.list_jobs().await
    }

    async fn jobs_created_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredJob>, StoreError> {
        self.inner.jobs_created_since(since).await
    }

    async fn count_jobs(&self) -> Result<i64, StoreError> {
        self.inner.count_jobs().await
    }

    async fn create_run(&self, run: &ImportRun) -> Result<(), StoreError> {
        self.inner.create_run(run).await
    }

    async fn run(&self, id: Uuid) -> Result<Option<ImportRun>, StoreError> {
        self.inner.run(id).await
    }

    async fn list_runs(&self, page: i64, limit: i64) -> Result<(i64, Vec<ImportRun>), StoreError> {
        self.inner.list_runs(page, limit).await
    }

    async fn latest_run(&self) -> Result<Option<ImportRun>, StoreError> {
        self.inner.latest_run().await
    }

    async fn latest_failed_jobs(&self) -> Result<Vec<FailedJob>, StoreError> {
        self.inner.latest_failed_jobs().await
    }

    async fn count_runs(&self) -> Result<i64, StoreError> {
        self.inner.count_runs().await
    }

    async fn apply_run_delta(
        &self,
        run_id: Uuid,
        delta: &RunDelta,
    ) -> Result<ImportRun, StoreError> {
        {
            let mut left = self.delta_failures_left.lock().await;
            if *left > 0 {
                *left -= 1;
                return Err(StoreError::Backend("simulated delta failure".into()));
            }
        }
        self.inner.apply_run_delta(run_id, delta).await
    }

    async fn apply_run_failure(
        &self,
        run_id: Uuid,
        failure: &FailedJob,
    ) -> Result<ImportRun, StoreError> {
        self.inner.apply_run_failure(run_id, failure).await
    }
}

#[tokio::test]
async fn a_transiently_failing_task_retries_and_succeeds() {
    let server = MockServer::start().await;
    mount_feed(&server, "/a", &["a1", "a2"]).await;

    let inner = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(inner.clone(), &[("a1", 2)]));
    let h = build_harness(
        vec![format!("{}/a", server.uri())],
        flaky,
        inner,
        Arc::new(NoopPublisher),
        Duration::from_millis(10),
    );

    h.pipeline.run_import().await.unwrap();
    h.worker.drain().await.unwrap();

    // Two failures, third attempt lands within the budget of three.
    assert_eq!(h.store.count_jobs().await.unwrap(), 2);
    let run = h.store.latest_run().await.unwrap().unwrap();
    assert_eq!(run.total_imported, 2);
    assert_eq!(run.new_jobs, 2);
    assert_eq!(run.failed_jobs_count, 0);
    assert_eq!(run.total_imported + run.failed_jobs_count, run.total_fetched);
}

#[tokio::test]
async fn an_exhausted_task_is_recorded_once_as_failed() {
    let server = MockServer::start().await;
    mount_feed(&server, "/a", &["a1", "a2"]).await;

    let inner = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(inner.clone(), &[("a1", 10)]));
    let h = build_harness(
        vec![format!("{}/a", server.uri())],
        flaky,
        inner,
        Arc::new(NoopPublisher),
        Duration::from_millis(10),
    );

    h.pipeline.run_import().await.unwrap();
    h.worker.drain().await.unwrap();

    assert_eq!(h.store.count_jobs().await.unwrap(), 1);
    let run = h.store.latest_run().await.unwrap().unwrap();
    assert_eq!(run.total_fetched, 2);
    assert_eq!(run.total_imported, 1);
    assert_eq!(run.failed_jobs_count, 1);
    assert_eq!(run.failed_jobs.len(), 1);
    assert_eq!(run.failed_jobs[0].record.external_id, "a1");
    assert_eq!(run.total_imported + run.failed_jobs_count, run.total_fetched);

    let failed = h.store.latest_failed_jobs().await.unwrap();
    assert_eq!(failed.len(), 1);
}

#[tokio::test]
async fn a_failed_counter_update_is_retried_until_the_run_absorbs_it() {
    let server = MockServer::start().await;
    mount_feed(&server, "/a", &["a1"]).await;

    let inner = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::failing_deltas(inner.clone(), 2));
    let h = build_harness(
        vec![format!("{}/a", server.uri())],
        flaky,
        inner,
        Arc::new(NoopPublisher),
        Duration::from_millis(10),
    );

    h.pipeline.run_import().await.unwrap();
    h.worker.drain().await.unwrap();

    // The job lands on the first attempt; the retries only re-run the
    // counter update, so the record is still counted exactly once.
    assert_eq!(h.store.count_jobs().await.unwrap(), 1);
    let run = h.store.latest_run().await.unwrap().unwrap();
    assert_eq!(run.total_imported, 1);
    assert_eq!(run.failed_jobs_count, 0);
    assert_eq!(run.total_imported + run.failed_jobs_count, run.total_fetched);
}

#[tokio::test]
async fn a_counter_update_that_never_lands_ends_as_a_recorded_failure() {
    let server = MockServer::start().await;
    mount_feed(&server, "/a", &["a1"]).await;

    let inner = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::failing_deltas(inner.clone(), u32::MAX));
    let h = build_harness(
        vec![format!("{}/a", server.uri())],
        flaky,
        inner,
        Arc::new(NoopPublisher),
        Duration::from_millis(10),
    );

    h.pipeline.run_import().await.unwrap();
    h.worker.drain().await.unwrap();

    let run = h.store.latest_run().await.unwrap().unwrap();
    assert_eq!(run.total_fetched, 1);
    assert_eq!(run.total_imported, 0);
    assert_eq!(run.failed_jobs_count, 1);
    assert_eq!(run.failed_jobs.len(), 1);
    assert_eq!(run.total_imported + run.failed_jobs_count, run.total_fetched);
    assert_eq!(h.queue.outstanding().await.unwrap(), 0);
}

#[tokio::test]
async fn run_updates_are_published_as_they_happen() {
    let server = MockServer::start().await;
    mount_feed(&server, "/a", &["a1", "a2"]).await;

    let publisher = Arc::new(BroadcastPublisher::new(64));
    let mut rx = publisher.subscribe();
    let store = Arc::new(MemoryStore::new());
    let h = build_harness(
        vec![format!("{}/a", server.uri())],
        store.clone(),
        store,
        publisher,
        Duration::from_millis(10),
    );

    h.pipeline.run_import().await.unwrap();
    h.worker.drain().await.unwrap();

    // Run creation plus one update per task.
    let first = rx.recv().await.unwrap();
    assert_eq!(first.total_fetched, 2);
    assert_eq!(first.total_imported, 0);
    let second = rx.recv().await.unwrap();
    assert_eq!(second.total_imported, 1);
    let third = rx.recv().await.unwrap();
    assert_eq!(third.total_imported, 2);
    assert_eq!(third.new_jobs, 2);
}
