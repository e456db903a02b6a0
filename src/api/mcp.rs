//! Streaming tool surface.
//!
//! A single `/mcp` endpoint accepts `{tool, params}`, dispatches to the
//! same operations as the request/response API, and answers over SSE with
//! exactly one event carrying the JSON result, then the stream terminator.
//! Unknown tools produce one error event with `kind=validation`.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::launcher::LaunchRequest;
use crate::model::RunStatus;
use crate::store::{NewAllowlistEntry, RunFilter, Store};

use super::hosts::HostView;
use super::runs::RunSummary;
use super::AppState;

const TOOLS: &[(&str, &str)] = &[
    ("launch_run", "Launch a run with a directive snapshot"),
    ("list_runs", "List runs with optional status filter"),
    ("get_run", "Get run detail"),
    ("get_run_report", "Get run report markdown and JSON summary"),
    ("list_directives", "List directives"),
    ("get_directive", "Get a directive by id"),
    ("get_allowlist", "List container allowlist entries"),
    ("set_allowlist", "Upsert a container allowlist entry"),
    ("list_worker_hosts", "List worker hosts (credentials redacted)"),
    ("get_worker_host", "Get a worker host by id"),
    ("list_schedules", "List schedules"),
    ("run_schedule_now", "Mark a schedule due immediately"),
];

/// GET /mcp: transport description and the curated tool list.
pub async fn describe() -> Json<serde_json::Value> {
    let tools: Vec<serde_json::Value> = TOOLS
        .iter()
        .map(|(name, description)| json!({ "name": name, "description": description }))
        .collect();
    Json(json!({
        "transport": "sse",
        "endpoint": "/mcp",
        "tools": tools,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ToolRequest {
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

type EventStream = tokio_stream::Iter<std::vec::IntoIter<Result<Event, Infallible>>>;

fn single_event(payload: serde_json::Value) -> Sse<EventStream> {
    let event = Event::default().data(payload.to_string());
    Sse::new(tokio_stream::iter(vec![Ok(event)]))
}

/// POST /mcp: dispatch one tool call, emit one event, terminate.
pub async fn invoke(
    State(state): State<AppState>,
    Json(request): Json<ToolRequest>,
) -> Sse<EventStream> {
    let payload = match dispatch(&state, &request).await {
        Ok(value) => value,
        Err(err) => json!({
            "error": { "kind": err.kind(), "message": err.to_string() }
        }),
    };
    single_event(payload)
}

fn param_uuid(params: &serde_json::Value, key: &str) -> Result<Uuid, OrchestratorError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| OrchestratorError::validation(format!("{} required", key)))
}

async fn dispatch(
    state: &AppState,
    request: &ToolRequest,
) -> Result<serde_json::Value, OrchestratorError> {
    let params = &request.params;
    match request.tool.as_str() {
        "launch_run" => {
            let launch: LaunchRequest = serde_json::from_value(params.clone())
                .map_err(|e| OrchestratorError::validation(format!("invalid params: {}", e)))?;
            let run = state.launcher.launch(launch).await?;
            Ok(json!({ "ok": true, "run": RunSummary::from(&run) }))
        }
        "list_runs" => {
            let status = params
                .get("status")
                .and_then(|v| v.as_str())
                .map(str::parse::<RunStatus>)
                .transpose()
                .map_err(OrchestratorError::validation)?;
            let runs = state
                .store
                .list_runs(RunFilter {
                    status,
                    since: None,
                    limit: None,
                })
                .await?;
            Ok(json!({ "runs": runs.iter().map(RunSummary::from).collect::<Vec<_>>() }))
        }
        "get_run" => {
            let id = param_uuid(params, "run_id")?;
            let run = state
                .store
                .get_run(id)
                .await?
                .ok_or(OrchestratorError::RunNotFound { id })?;
            let jobs = state.store.list_jobs(id).await?;
            Ok(json!({
                "run": RunSummary::from(&run),
                "jobs": jobs.iter().map(super::runs::JobView::from).collect::<Vec<_>>(),
            }))
        }
        "get_run_report" => {
            let id = param_uuid(params, "run_id")?;
            let run = state
                .store
                .get_run(id)
                .await?
                .ok_or(OrchestratorError::RunNotFound { id })?;
            Ok(json!({
                "run_id": run.id,
                "markdown": run.report_markdown,
                "summary": run.report_json,
                "total_tokens": run.total_tokens,
            }))
        }
        "list_directives" => {
            let directives = state.store.list_directives().await?;
            Ok(json!({ "directives": directives }))
        }
        "get_directive" => {
            let id = param_uuid(params, "directive_id")?;
            let directive = state
                .store
                .get_directive(id)
                .await?
                .ok_or(OrchestratorError::DirectiveNotFound { id: Some(id) })?;
            Ok(json!({ "directive": directive }))
        }
        "get_allowlist" => {
            let entries = state.store.list_allowlist(true).await?;
            Ok(json!({ "allowlist": entries }))
        }
        "set_allowlist" => {
            let container_id = params
                .get("container_id")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| OrchestratorError::validation("container_id required"))?;
            let entry = state
                .store
                .upsert_allowlist_entry(NewAllowlistEntry {
                    container_id: container_id.to_string(),
                    container_name: params
                        .get("container_name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    description: String::new(),
                    enabled: params
                        .get("enabled")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(true),
                    tags: Vec::new(),
                })
                .await?;
            Ok(json!({ "allowlist": entry }))
        }
        "list_worker_hosts" => {
            let hosts = state.store.list_hosts().await?;
            Ok(json!({ "hosts": hosts.iter().map(HostView::from).collect::<Vec<_>>() }))
        }
        "get_worker_host" => {
            let id = param_uuid(params, "host_id")?;
            let host = state
                .store
                .get_host(id)
                .await?
                .ok_or(OrchestratorError::HostNotFound { id: Some(id) })?;
            Ok(json!({ "host": HostView::from(&host) }))
        }
        "list_schedules" => {
            let schedules = state.store.list_schedules().await?;
            Ok(json!({ "schedules": schedules }))
        }
        "run_schedule_now" => {
            let id = param_uuid(params, "schedule_id")?;
            let schedule = state
                .store
                .get_schedule(id)
                .await?
                .ok_or(OrchestratorError::ScheduleNotFound { id })?;
            if !schedule.enabled {
                return Err(OrchestratorError::validation("schedule is disabled"));
            }
            state.store.defer_schedule(id, Utc::now()).await?;
            Ok(json!({ "ok": true, "schedule_id": id }))
        }
        other => Err(OrchestratorError::validation(format!(
            "unknown tool: {}",
            other
        ))),
    }
}
