//! Run endpoints: launch, listing, detail, reports, artifacts, audit,
//! cancellation, and approval.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::dispatch::ingest::resolve_artifact_path;
use crate::error::OrchestratorError;
use crate::launcher::LaunchRequest;
use crate::model::{ApprovalStatus, Job, Run, RunArtifact, RunStatus, WorkerAudit};
use crate::store::{RunFilter, Store};

use super::error::{ApiError, ApiResult};
use super::AppState;

/// Run summary: counts and token totals, never report bodies.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub status: RunStatus,
    pub approval: ApprovalStatus,
    pub directive: String,
    pub worker_host_id: Option<Uuid>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub error_message: String,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id,
            status: run.status,
            approval: run.approval,
            directive: run.directive_snapshot.name.clone(),
            worker_host_id: run.worker_host_id,
            prompt_tokens: run.prompt_tokens,
            completion_tokens: run.completion_tokens,
            total_tokens: run.total_tokens,
            started_at: run.started_at,
            ended_at: run.ended_at,
            created_at: run.created_at,
            error_message: run.error_message.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: Uuid,
    pub kind: crate::model::TaskKind,
    pub status: crate::model::JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_tokens: i64,
    pub error_message: String,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            kind: job.kind,
            status: job.status,
            started_at: job.started_at,
            ended_at: job.ended_at,
            total_tokens: job.total_tokens,
            error_message: job.error_message.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub summary: RunSummary,
    pub jobs: Vec<JobView>,
    pub report_markdown: String,
    pub report_json: serde_json::Value,
}

pub async fn launch(
    State(state): State<AppState>,
    Json(request): Json<LaunchRequest>,
) -> ApiResult<(StatusCode, Json<RunSummary>)> {
    let run = state.launcher.launch(request).await?;
    Ok((StatusCode::CREATED, Json(RunSummary::from(&run))))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<RunSummary>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<RunStatus>)
        .transpose()
        .map_err(OrchestratorError::validation)?;
    let runs = state
        .store
        .list_runs(RunFilter {
            status,
            since: query.since,
            limit: query.limit,
        })
        .await?;
    Ok(Json(runs.iter().map(RunSummary::from).collect()))
}

async fn load_run(state: &AppState, id: Uuid) -> Result<Run, ApiError> {
    Ok(state
        .store
        .get_run(id)
        .await?
        .ok_or(OrchestratorError::RunNotFound { id })?)
}

pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RunDetail>> {
    let run = load_run(&state, id).await?;
    let jobs = state.store.list_jobs(id).await?;
    Ok(Json(RunDetail {
        summary: RunSummary::from(&run),
        jobs: jobs.iter().map(JobView::from).collect(),
        report_markdown: run.report_markdown.clone(),
        report_json: run.report_json.clone(),
    }))
}

pub async fn report(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let run = load_run(&state, id).await?;
    Ok(Json(serde_json::json!({
        "run_id": run.id,
        "status": run.status,
        "markdown": run.report_markdown,
        "summary": run.report_json,
        "total_tokens": run.total_tokens,
    })))
}

pub async fn since_last_success(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let Some(last) = state.store.last_successful_run().await? else {
        return Ok(Json(serde_json::json!({
            "last_success_run": null,
            "runs_since": [],
            "total_count": 0,
        })));
    };
    let cutoff = last.ended_at.unwrap_or(last.created_at);
    let since = state.store.runs_since(cutoff, last.id).await?;
    Ok(Json(serde_json::json!({
        "last_success_run": RunSummary::from(&last),
        "runs_since": since.iter().map(RunSummary::from).collect::<Vec<_>>(),
        "total_count": since.len(),
    })))
}

pub async fn artifacts(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<RunArtifact>>> {
    load_run(&state, id).await?;
    Ok(Json(state.store.list_artifacts(id).await?))
}

pub async fn audit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<WorkerAudit>>> {
    load_run(&state, id).await?;
    Ok(Json(state.store.list_audit_for_run(id).await?))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RunSummary>> {
    let run = state
        .store
        .cancel_run(id, Utc::now())
        .await?
        .ok_or(OrchestratorError::RunNotFound { id })?;
    Ok(Json(RunSummary::from(&run)))
}

#[derive(Debug, Deserialize)]
pub struct ApprovalBody {
    pub approved_by: String,
}

pub async fn approve(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ApprovalBody>,
) -> ApiResult<Json<RunSummary>> {
    let run = state
        .store
        .set_run_approval(id, ApprovalStatus::Approved, &body.approved_by, Utc::now())
        .await?
        .ok_or(OrchestratorError::RunNotFound { id })?;
    Ok(Json(RunSummary::from(&run)))
}

pub async fn deny(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ApprovalBody>,
) -> ApiResult<Json<RunSummary>> {
    let run = state
        .store
        .set_run_approval(id, ApprovalStatus::Denied, &body.approved_by, Utc::now())
        .await?
        .ok_or(OrchestratorError::RunNotFound { id })?;
    Ok(Json(RunSummary::from(&run)))
}

/// Stream artifact bytes after verifying the stored path is rooted in the
/// artifact directory.
pub async fn download_artifact(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let artifact = state
        .store
        .get_artifact(id)
        .await?
        .ok_or(OrchestratorError::ArtifactNotFound { id })?;

    let full_path = resolve_artifact_path(&state.artifact_root, &artifact.path)?;
    let file = tokio::fs::File::open(&full_path)
        .await
        .map_err(|_| OrchestratorError::ArtifactNotFound { id })?;

    let stream = ReaderStream::new(file);
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            if artifact.mime_type.is_empty() {
                "application/octet-stream"
            } else {
                artifact.mime_type.as_str()
            },
        )
        .body(Body::from_stream(stream))
        .map_err(|e| OrchestratorError::internal(e.to_string()))?;
    Ok(response)
}
