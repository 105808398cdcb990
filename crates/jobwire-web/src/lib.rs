//! JSON API over the import pipeline: run history, job listings, manual
//! trigger and a live SSE stream of run updates.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::warn;

use jobwire_core::ImportRun;
use jobwire_storage::ImportStore;
use jobwire_sync::{ImportTrigger, RUN_UPDATED_EVENT};

pub const CRATE_NAME: &str = "jobwire-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ImportStore>,
    pub trigger: Arc<dyn ImportTrigger>,
    pub events: broadcast::Sender<ImportRun>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ImportStore>,
        trigger: Arc<dyn ImportTrigger>,
        events: broadcast::Sender<ImportRun>,
    ) -> Self {
        Self {
            store,
            trigger,
            events,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/import/logs", get(logs_handler))
        .route("/api/import/logs/latest", get(latest_log_handler))
        .route("/api/import/jobs", get(jobs_handler))
        .route("/api/import/jobs/new", get(new_jobs_handler))
        .route("/api/import/jobs/failed", get(failed_jobs_handler))
        .route("/api/import/debug/counts", get(debug_counts_handler))
        .route("/api/import/trigger", post(trigger_handler))
        .route("/api/import/events", get(events_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

#[derive(Debug, Deserialize, Default)]
struct LogsQuery {
    page: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogsPage {
    page: i64,
    limit: i64,
    total: i64,
    total_pages: i64,
    logs: Vec<ImportRun>,
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(10).clamp(1, 100);
    match state.store.list_runs(page, limit).await {
        Ok((total, logs)) => Json(LogsPage {
            page,
            limit,
            total,
            total_pages: (total + limit - 1) / limit,
            logs,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn latest_log_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.latest_run().await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "No logs found"})),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn jobs_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_jobs().await {
        Ok(jobs) => Json(json!({"jobs": jobs})).into_response(),
        Err(err) => server_error(err),
    }
}

async fn new_jobs_handler(State(state): State<Arc<AppState>>) -> Response {
    let since = Utc::now() - ChronoDuration::hours(24);
    match state.store.jobs_created_since(since).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(err) => server_error(err),
    }
}

async fn failed_jobs_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.latest_failed_jobs().await {
        Ok(failed) => Json(failed).into_response(),
        Err(err) => server_error(err),
    }
}

async fn debug_counts_handler(State(state): State<Arc<AppState>>) -> Response {
    let jobs = match state.store.count_jobs().await {
        Ok(n) => n,
        Err(err) => return server_error(err),
    };
    let logs = match state.store.count_runs().await {
        Ok(n) => n,
        Err(err) => return server_error(err),
    };
    Json(json!({"jobs": jobs, "logs": logs})).into_response()
}

async fn trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    let trigger = state.trigger.clone();
    tokio::spawn(async move {
        if let Err(err) = trigger.trigger_import().await {
            warn!(error = %err, "triggered import failed");
        }
    });
    (
        StatusCode::ACCEPTED,
        Json(json!({"message": "Import triggered successfully"})),
    )
        .into_response()
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(run) => match Event::default().event(RUN_UPDATED_EVENT).json_data(&run) {
                    Ok(event) => return Some((Ok::<_, Infallible>(event), rx)),
                    Err(err) => {
                        warn!(error = %err, "dropping unserializable run event");
                        continue;
                    }
                },
                // A lagged subscriber just misses intermediate states.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn server_error(err: impl std::fmt::Display) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": err.to_string()})),
    )
        .into_response()
}
