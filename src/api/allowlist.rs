//! Container and worker-image allowlist CRUD.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::{ContainerAllowlistEntry, WorkerImage};
use crate::store::{NewAllowlistEntry, NewWorkerImage, Store};

use super::error::ApiResult;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct UpsertContainerBody {
    pub container_id: String,
    #[serde(default)]
    pub container_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

pub async fn upsert_container(
    State(state): State<AppState>,
    Json(body): Json<UpsertContainerBody>,
) -> ApiResult<Json<ContainerAllowlistEntry>> {
    if body.container_id.trim().is_empty() {
        return Err(OrchestratorError::validation("container_id is required").into());
    }
    let entry = state
        .store
        .upsert_allowlist_entry(NewAllowlistEntry {
            container_id: body.container_id,
            container_name: body.container_name,
            description: body.description,
            enabled: body.enabled,
            tags: body.tags,
        })
        .await?;
    Ok(Json(entry))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub enabled_only: bool,
}

pub async fn list_containers(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<ContainerAllowlistEntry>>> {
    Ok(Json(state.store.list_allowlist(query.enabled_only).await?))
}

pub async fn get_container(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
) -> ApiResult<Json<ContainerAllowlistEntry>> {
    let entry = state
        .store
        .get_allowlist_entry(&container_id)
        .await?
        .ok_or_else(|| OrchestratorError::validation("container not in allowlist"))?;
    Ok(Json(entry))
}

pub async fn remove_container(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.store.delete_allowlist_entry(&container_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(OrchestratorError::validation("container not in allowlist").into())
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateImageBody {
    pub image: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub requires_gpu: bool,
    #[serde(default)]
    pub cpu_fallback: bool,
    #[serde(default)]
    pub min_vram_mb: i32,
}

fn default_tag() -> String {
    "latest".to_string()
}

pub async fn create_image(
    State(state): State<AppState>,
    Json(body): Json<CreateImageBody>,
) -> ApiResult<(StatusCode, Json<WorkerImage>)> {
    if body.image.trim().is_empty() {
        return Err(OrchestratorError::validation("image is required").into());
    }
    if body.min_vram_mb < 0 {
        return Err(OrchestratorError::validation("min_vram_mb must be non-negative").into());
    }
    let image = state
        .store
        .create_worker_image(NewWorkerImage {
            image: body.image,
            tag: body.tag,
            description: body.description,
            enabled: body.enabled,
            requires_gpu: body.requires_gpu,
            cpu_fallback: body.cpu_fallback,
            min_vram_mb: body.min_vram_mb,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(image)))
}

pub async fn list_images(State(state): State<AppState>) -> ApiResult<Json<Vec<WorkerImage>>> {
    Ok(Json(state.store.list_worker_images().await?))
}

pub async fn remove_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if state.store.delete_worker_image(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(OrchestratorError::validation("worker image not found").into())
    }
}
