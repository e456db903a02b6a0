//! Worker host CRUD and health.
//!
//! SSH credentials are write-only: every read surface exposes just a
//! `has_ssh_config` boolean.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::hosts::validate_endpoint;
use crate::model::{HostCapabilities, HostKind, SshConfig, WorkerHost};
use crate::store::{NewWorkerHost, Store, WorkerHostUpdate};

use super::error::ApiResult;
use super::AppState;

/// Read-side projection of a worker host. No `ssh` field exists here, so
/// credentials cannot leak by construction.
#[derive(Debug, Serialize)]
pub struct HostView {
    pub id: Uuid,
    pub name: String,
    pub kind: HostKind,
    pub endpoint: String,
    pub capabilities: HostCapabilities,
    pub enabled: bool,
    pub healthy: bool,
    pub active_runs_count: i32,
    pub has_ssh_config: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkerHost> for HostView {
    fn from(host: &WorkerHost) -> Self {
        Self {
            id: host.id,
            name: host.name.clone(),
            kind: host.kind,
            endpoint: host.endpoint.clone(),
            capabilities: host.capabilities.clone(),
            enabled: host.enabled,
            healthy: host.healthy,
            active_runs_count: host.active_runs_count,
            has_ssh_config: host.ssh.is_some(),
            last_seen_at: host.last_seen_at,
            created_at: host.created_at,
            updated_at: host.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateHostBody {
    pub name: String,
    pub kind: HostKind,
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: HostCapabilities,
    pub ssh: Option<SshConfig>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateHostBody>,
) -> ApiResult<(StatusCode, Json<HostView>)> {
    if body.name.trim().is_empty() {
        return Err(OrchestratorError::validation("host name is required").into());
    }
    validate_endpoint(body.kind, &body.endpoint)?;
    if body.ssh.is_some() && body.kind != HostKind::RemoteTcp {
        return Err(
            OrchestratorError::validation("ssh config is only valid for remote_tcp hosts").into(),
        );
    }

    let host = state
        .store
        .create_host(NewWorkerHost {
            name: body.name,
            kind: body.kind,
            endpoint: body.endpoint,
            capabilities: body.capabilities,
            ssh: body.ssh,
            enabled: body.enabled,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(HostView::from(&host))))
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<HostView>>> {
    let hosts = state.store.list_hosts().await?;
    Ok(Json(hosts.iter().map(HostView::from).collect()))
}

async fn load(state: &AppState, id: Uuid) -> Result<WorkerHost, OrchestratorError> {
    state
        .store
        .get_host(id)
        .await
        .map_err(OrchestratorError::from)?
        .ok_or(OrchestratorError::HostNotFound { id: Some(id) })
}

pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<HostView>> {
    Ok(Json(HostView::from(&load(&state, id).await?)))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateHostBody {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub capabilities: Option<HostCapabilities>,
    pub ssh: Option<SshConfig>,
    #[serde(default)]
    pub clear_ssh: bool,
    pub enabled: Option<bool>,
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateHostBody>,
) -> ApiResult<Json<HostView>> {
    let existing = load(&state, id).await?;
    if let Some(endpoint) = &body.endpoint {
        validate_endpoint(existing.kind, endpoint)?;
    }

    let ssh = if body.clear_ssh {
        Some(None)
    } else {
        body.ssh.map(Some)
    };
    let ssh_changed = ssh.is_some();

    let host = state
        .store
        .update_host(
            id,
            WorkerHostUpdate {
                name: body.name,
                endpoint: body.endpoint,
                capabilities: body.capabilities,
                ssh,
                enabled: body.enabled,
            },
        )
        .await?
        .ok_or(OrchestratorError::HostNotFound { id: Some(id) })?;

    // A changed forwarding config invalidates the live tunnel.
    if ssh_changed {
        state.tunnels.close(id).await;
    }
    Ok(Json(HostView::from(&host)))
}

pub async fn remove(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    if state.store.delete_host(id).await? {
        state.tunnels.close(id).await;
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(OrchestratorError::HostNotFound { id: Some(id) }.into())
    }
}

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    pub check: bool,
}

/// Cached health status; `?check=true` triggers a fresh probe. A plain read
/// counts as a heartbeat and refreshes `last_seen_at`.
pub async fn health(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<HealthQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let host = load(&state, id).await?;

    let probe_error = if query.check {
        state.health.check_host(&host).await.err()
    } else {
        state.store.touch_host(id, Utc::now()).await?;
        None
    };

    let host = load(&state, id).await?;
    Ok(Json(serde_json::json!({
        "host_id": host.id,
        "name": host.name,
        "healthy": host.healthy,
        "last_seen_at": host.last_seen_at,
        "is_stale": host.is_stale(Utc::now(), state.staleness),
        "active_runs_count": host.active_runs_count,
        "error": probe_error.map(|e| e.kind()),
    })))
}
