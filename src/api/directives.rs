//! Directive CRUD.
//!
//! Directives are mutable templates; runs capture them by value at launch,
//! so editing or deleting a directive never rewrites history.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::{Directive, TaskKind};
use crate::store::{DirectiveUpdate, NewDirective, Store};

use super::error::ApiResult;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateDirectiveBody {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object")]
    pub task_config: serde_json::Value,
    #[serde(default)]
    pub directive_text: String,
    #[serde(default = "all_tasks")]
    pub task_list: Vec<TaskKind>,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default = "default_max_runs")]
    pub max_concurrent_runs: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

fn all_tasks() -> Vec<TaskKind> {
    TaskKind::ALL.to_vec()
}

fn default_max_runs() -> i32 {
    5
}

fn default_true() -> bool {
    true
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateDirectiveBody>,
) -> ApiResult<(StatusCode, Json<Directive>)> {
    if body.name.trim().is_empty() {
        return Err(OrchestratorError::validation("directive name is required").into());
    }
    let directive = state
        .store
        .create_directive(NewDirective {
            name: body.name,
            description: body.description,
            task_config: body.task_config,
            directive_text: body.directive_text,
            task_list: body.task_list,
            approval_required: body.approval_required,
            max_concurrent_runs: body.max_concurrent_runs,
            enabled: body.enabled,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(directive)))
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Directive>>> {
    Ok(Json(state.store.list_directives().await?))
}

pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Directive>> {
    let directive = state
        .store
        .get_directive(id)
        .await?
        .ok_or(OrchestratorError::DirectiveNotFound { id: Some(id) })?;
    Ok(Json(directive))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateDirectiveBody {
    pub description: Option<String>,
    pub task_config: Option<serde_json::Value>,
    pub directive_text: Option<String>,
    pub task_list: Option<Vec<TaskKind>>,
    pub approval_required: Option<bool>,
    pub max_concurrent_runs: Option<i32>,
    pub enabled: Option<bool>,
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateDirectiveBody>,
) -> ApiResult<Json<Directive>> {
    let directive = state
        .store
        .update_directive(
            id,
            DirectiveUpdate {
                description: body.description,
                task_config: body.task_config,
                directive_text: body.directive_text,
                task_list: body.task_list,
                approval_required: body.approval_required,
                max_concurrent_runs: body.max_concurrent_runs,
                enabled: body.enabled,
            },
        )
        .await?
        .ok_or(OrchestratorError::DirectiveNotFound { id: Some(id) })?;
    Ok(Json(directive))
}

pub async fn remove(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    if state.store.delete_directive(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(OrchestratorError::DirectiveNotFound { id: Some(id) }.into())
    }
}
