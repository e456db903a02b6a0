//! Token statistics, cost reporting, and GPU telemetry endpoints.
//!
//! Everything here is counts and derived money. Prompt or response text is
//! structurally absent from the underlying rows.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::GpuState;
use crate::store::{GpuSample, Store};

use super::error::ApiResult;
use super::AppState;

/// Cost per 1000 tokens by model id, in dollars. Unknown models use the
/// default rate.
fn cost_per_kilotoken(model_id: &str) -> f64 {
    match model_id {
        "gpt-4" => 0.03,
        "gpt-3.5-turbo" => 0.002,
        "mistral-7b" => 0.001,
        _ => 0.002,
    }
}

pub async fn token_stats(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let totals = state.store.token_totals().await?;
    let by_model = state.store.token_totals_by_model().await?;
    Ok(Json(serde_json::json!({
        "total_tokens": totals.total_tokens,
        "total_prompt_tokens": totals.prompt_tokens,
        "total_completion_tokens": totals.completion_tokens,
        "call_count": totals.call_count,
        "by_model": by_model,
    })))
}

pub async fn cost_report(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let by_model = state.store.token_totals_by_model().await?;
    let mut total_cost = 0.0;
    let mut models = serde_json::Map::new();
    for entry in &by_model {
        let cost = (entry.total_tokens as f64 / 1000.0) * cost_per_kilotoken(&entry.model_id);
        total_cost += cost;
        models.insert(
            entry.model_id.clone(),
            serde_json::json!({
                "tokens": entry.total_tokens,
                "calls": entry.call_count,
                "estimated_cost": cost,
            }),
        );
    }
    Ok(Json(serde_json::json!({
        "total_cost": total_cost,
        "by_model": models,
        "note": "costs are estimates based on static per-model rates",
    })))
}

pub async fn usage_by_directive(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let usage = state.store.usage_by_directive().await?;
    Ok(Json(serde_json::json!({ "directives": usage })))
}

#[derive(Debug, Deserialize)]
pub struct GpuQuery {
    pub host_id: Option<Uuid>,
}

pub async fn gpu_state(
    State(state): State<AppState>,
    Query(query): Query<GpuQuery>,
) -> ApiResult<Json<Vec<GpuState>>> {
    Ok(Json(state.store.list_gpu_states(query.host_id).await?))
}

/// One collected GPU sample, as submitted by an out-of-band collector.
#[derive(Debug, Deserialize)]
pub struct GpuSampleBody {
    pub host_id: Uuid,
    pub device_index: i32,
    #[serde(default)]
    pub name: String,
    pub total_vram_mb: i32,
    pub used_vram_mb: i32,
    #[serde(default)]
    pub utilization_percent: f64,
    #[serde(default = "default_true")]
    pub available: bool,
}

fn default_true() -> bool {
    true
}

pub async fn put_gpu_state(
    State(state): State<AppState>,
    Json(samples): Json<Vec<GpuSampleBody>>,
) -> ApiResult<Json<Vec<GpuState>>> {
    let mut updated = Vec::with_capacity(samples.len());
    for sample in samples {
        if state.store.get_host(sample.host_id).await?.is_none() {
            return Err(OrchestratorError::HostNotFound {
                id: Some(sample.host_id),
            }
            .into());
        }
        if sample.used_vram_mb > sample.total_vram_mb || sample.used_vram_mb < 0 {
            return Err(
                OrchestratorError::validation("used_vram_mb out of range for device").into(),
            );
        }
        let gpu = state
            .store
            .upsert_gpu_state(GpuSample {
                host_id: sample.host_id,
                device_index: sample.device_index,
                name: sample.name,
                total_vram_mb: sample.total_vram_mb,
                used_vram_mb: sample.used_vram_mb,
                free_vram_mb: sample.total_vram_mb - sample.used_vram_mb,
                utilization_percent: sample.utilization_percent.clamp(0.0, 100.0),
                available: sample.available,
            })
            .await?;
        updated.push(gpu);
    }
    Ok(Json(updated))
}
