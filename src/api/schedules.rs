//! Schedule CRUD plus `run-now`, `enable`, `disable`, and `history`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::{Schedule, ScheduleKind, ScheduledRun, TaskKind, TaskScope};
use crate::scheduler::compute_next_run;
use crate::store::{NewSchedule, ScheduleUpdate, Store};

use super::error::ApiResult;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateScheduleBody {
    pub name: String,
    pub task_kind: TaskKind,
    pub directive_id: Option<Uuid>,
    #[serde(default)]
    pub custom_directive_text: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub kind: ScheduleKind,
    pub interval_minutes: Option<i64>,
    pub cron_expr: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_scope")]
    pub task3_scope: TaskScope,
    pub max_global: Option<i32>,
    pub max_per_job: Option<i32>,
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_scope() -> TaskScope {
    TaskScope::Allowlist
}

fn validate_recurrence(body: &CreateScheduleBody) -> Result<(), OrchestratorError> {
    match body.kind {
        ScheduleKind::Interval => {
            let Some(minutes) = body.interval_minutes else {
                return Err(OrchestratorError::validation(
                    "interval schedules require interval_minutes",
                ));
            };
            if minutes <= 0 {
                return Err(OrchestratorError::validation(
                    "interval_minutes must be positive",
                ));
            }
            if body.cron_expr.is_some() {
                return Err(OrchestratorError::validation(
                    "interval schedules must not set cron_expr",
                ));
            }
        }
        ScheduleKind::Cron => {
            let Some(expr) = body.cron_expr.as_deref() else {
                return Err(OrchestratorError::validation(
                    "cron schedules require cron_expr",
                ));
            };
            if expr.parse::<cron::Schedule>().is_err() {
                return Err(OrchestratorError::validation("invalid cron expression"));
            }
            if body.interval_minutes.is_some() {
                return Err(OrchestratorError::validation(
                    "cron schedules must not set interval_minutes",
                ));
            }
            if body.timezone.parse::<chrono_tz::Tz>().is_err() {
                return Err(OrchestratorError::validation("unknown timezone"));
            }
        }
    }
    Ok(())
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateScheduleBody>,
) -> ApiResult<(StatusCode, Json<Schedule>)> {
    if body.name.trim().is_empty() {
        return Err(OrchestratorError::validation("schedule name is required").into());
    }
    validate_recurrence(&body)?;
    if let Some(id) = body.directive_id {
        if state.store.get_directive(id).await?.is_none() {
            return Err(OrchestratorError::DirectiveNotFound { id: Some(id) }.into());
        }
    }

    let schedule = state
        .store
        .create_schedule(NewSchedule {
            name: body.name,
            task_kind: body.task_kind,
            directive_id: body.directive_id,
            custom_directive_text: body.custom_directive_text,
            enabled: body.enabled,
            kind: body.kind,
            interval_minutes: body.interval_minutes,
            cron_expr: body.cron_expr,
            timezone: body.timezone,
            task3_scope: body.task3_scope,
            max_global: body.max_global,
            max_per_job: body.max_per_job,
            next_run_at: None,
        })
        .await?;

    // First fire time comes from the recurrence rule itself.
    let next = compute_next_run(&schedule, Utc::now());
    let schedule = state
        .store
        .update_schedule(
            schedule.id,
            ScheduleUpdate {
                next_run_at: Some(next),
                ..Default::default()
            },
        )
        .await?
        .ok_or_else(|| OrchestratorError::internal("schedule vanished during creation"))?;

    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Schedule>>> {
    Ok(Json(state.store.list_schedules().await?))
}

async fn load(state: &AppState, id: Uuid) -> Result<Schedule, OrchestratorError> {
    state
        .store
        .get_schedule(id)
        .await
        .map_err(OrchestratorError::from)?
        .ok_or(OrchestratorError::ScheduleNotFound { id })
}

pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(load(&state, id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateScheduleBody {
    pub enabled: Option<bool>,
    pub interval_minutes: Option<i64>,
    pub cron_expr: Option<String>,
    pub timezone: Option<String>,
    pub task3_scope: Option<TaskScope>,
    pub max_global: Option<i32>,
    pub max_per_job: Option<i32>,
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateScheduleBody>,
) -> ApiResult<Json<Schedule>> {
    let schedule = state
        .store
        .update_schedule(
            id,
            ScheduleUpdate {
                enabled: body.enabled,
                interval_minutes: body.interval_minutes.map(Some),
                cron_expr: body.cron_expr.map(Some),
                timezone: body.timezone,
                task3_scope: body.task3_scope,
                max_global: body.max_global.map(Some),
                max_per_job: body.max_per_job.map(Some),
                next_run_at: None,
            },
        )
        .await?
        .ok_or(OrchestratorError::ScheduleNotFound { id })?;
    Ok(Json(schedule))
}

pub async fn remove(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    if state.store.delete_schedule(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(OrchestratorError::ScheduleNotFound { id }.into())
    }
}

/// Mark the schedule due immediately. A disabled schedule is refused; the
/// claim loop would never pick it up.
pub async fn run_now(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Schedule>> {
    let schedule = load(&state, id).await?;
    if !schedule.enabled {
        return Err(OrchestratorError::validation("schedule is disabled").into());
    }
    state.store.defer_schedule(id, Utc::now()).await?;
    Ok(Json(load(&state, id).await?))
}

pub async fn enable(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Schedule>> {
    set_enabled(state, id, true).await
}

pub async fn disable(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Schedule>> {
    set_enabled(state, id, false).await
}

async fn set_enabled(state: AppState, id: Uuid, enabled: bool) -> ApiResult<Json<Schedule>> {
    let schedule = state
        .store
        .update_schedule(
            id,
            ScheduleUpdate {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await?
        .ok_or(OrchestratorError::ScheduleNotFound { id })?;
    Ok(Json(schedule))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

pub async fn history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<ScheduledRun>>> {
    load(&state, id).await?;
    let history = state
        .store
        .schedule_history(id, query.limit.unwrap_or(50))
        .await?;
    Ok(Json(history))
}
