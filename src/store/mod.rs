//! State store: the only shared mutable resource across orchestrator
//! processes.
//!
//! [`Store`] is the repository seam. Production uses [`PgStore`] (Postgres
//! over a deadpool pool, skip-locked claims); tests and local development
//! use [`MemStore`]. Status transitions are store methods with explicit
//! preconditions — a terminal row can never be resurrected, and the claim
//! and counter primitives are atomic in both implementations.

pub mod memory;
pub mod migrations;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    ApprovalStatus, ArtifactKind, ContainerAllowlistEntry, Directive, DirectiveSnapshot, GpuState,
    HostCapabilities, HostKind, Job, JobStatus, LlmCall, Run, RunArtifact, RunStatus, Schedule,
    ScheduleKind, ScheduledRun, ScheduledRunStatus, SshConfig, TaskKind, TaskScope, WorkerAudit,
    WorkerHost, WorkerImage,
};

pub use memory::MemStore;
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Input for creating a directive.
#[derive(Debug, Clone)]
pub struct NewDirective {
    pub name: String,
    pub description: String,
    pub task_config: serde_json::Value,
    pub directive_text: String,
    pub task_list: Vec<TaskKind>,
    pub approval_required: bool,
    pub max_concurrent_runs: i32,
    pub enabled: bool,
}

/// Partial directive update; `None` fields are left unchanged. Any applied
/// update bumps the version.
#[derive(Debug, Clone, Default)]
pub struct DirectiveUpdate {
    pub description: Option<String>,
    pub task_config: Option<serde_json::Value>,
    pub directive_text: Option<String>,
    pub task_list: Option<Vec<TaskKind>>,
    pub approval_required: Option<bool>,
    pub max_concurrent_runs: Option<i32>,
    pub enabled: Option<bool>,
}

/// Input for materializing a run and its jobs in one transaction.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub directive_id: Option<Uuid>,
    pub snapshot: DirectiveSnapshot,
    pub approval: ApprovalStatus,
    pub worker_host_id: Option<Uuid>,
    pub tasks: Vec<TaskKind>,
}

/// Run listing filter.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub name: String,
    pub task_kind: TaskKind,
    pub directive_id: Option<Uuid>,
    pub custom_directive_text: String,
    pub enabled: bool,
    pub kind: ScheduleKind,
    pub interval_minutes: Option<i64>,
    pub cron_expr: Option<String>,
    pub timezone: String,
    pub task3_scope: TaskScope,
    pub max_global: Option<i32>,
    pub max_per_job: Option<i32>,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    pub enabled: Option<bool>,
    pub interval_minutes: Option<Option<i64>>,
    pub cron_expr: Option<Option<String>>,
    pub timezone: Option<String>,
    pub task3_scope: Option<TaskScope>,
    pub max_global: Option<Option<i32>>,
    pub max_per_job: Option<Option<i32>>,
    pub next_run_at: Option<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone)]
pub struct NewWorkerHost {
    pub name: String,
    pub kind: HostKind,
    pub endpoint: String,
    pub capabilities: HostCapabilities,
    pub ssh: Option<SshConfig>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerHostUpdate {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub capabilities: Option<HostCapabilities>,
    pub ssh: Option<Option<SshConfig>>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct NewWorkerImage {
    pub image: String,
    pub tag: String,
    pub description: String,
    pub enabled: bool,
    pub requires_gpu: bool,
    pub cpu_fallback: bool,
    pub min_vram_mb: i32,
}

#[derive(Debug, Clone)]
pub struct NewAllowlistEntry {
    pub container_id: String,
    pub container_name: String,
    pub description: String,
    pub enabled: bool,
    pub tags: Vec<String>,
}

/// A collected GPU telemetry sample.
#[derive(Debug, Clone)]
pub struct GpuSample {
    pub host_id: Uuid,
    pub device_index: i32,
    pub name: String,
    pub total_vram_mb: i32,
    pub used_vram_mb: i32,
    pub free_vram_mb: i32,
    pub utilization_percent: f64,
    pub available: bool,
}

#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub run_id: Uuid,
    pub kind: ArtifactKind,
    pub path: String,
    pub size_bytes: i64,
    pub mime_type: String,
}

#[derive(Debug, Clone)]
pub struct NewLlmCall {
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub model_id: String,
    pub endpoint: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub duration_ms: i64,
    pub success: bool,
    pub error_kind: String,
}

#[derive(Debug, Clone)]
pub struct NewAudit {
    pub run_id: Uuid,
    pub job_id: Option<Uuid>,
    pub operation: crate::model::AuditOperation,
    pub container_id: String,
    pub image: String,
    pub gpu_assigned: String,
    pub gpu_reason: String,
    pub config_snapshot: serde_json::Value,
    pub success: bool,
    pub error_message: String,
}

/// Aggregate token counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TokenTotals {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub call_count: i64,
}

/// Token counts for one model.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelTokenTotals {
    pub model_id: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub call_count: i64,
}

/// Token usage attributed to a directive-snapshot name.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DirectiveUsage {
    pub directive_name: String,
    pub total_tokens: i64,
    pub call_count: i64,
}

/// Transactional repository over the orchestrator entities.
#[async_trait]
pub trait Store: Send + Sync {
    // -- Directives --

    async fn create_directive(&self, input: NewDirective) -> StoreResult<Directive>;
    async fn get_directive(&self, id: Uuid) -> StoreResult<Option<Directive>>;
    async fn list_directives(&self) -> StoreResult<Vec<Directive>>;
    async fn update_directive(
        &self,
        id: Uuid,
        update: DirectiveUpdate,
    ) -> StoreResult<Option<Directive>>;
    async fn delete_directive(&self, id: Uuid) -> StoreResult<bool>;
    /// The directive used when a launch request names none.
    async fn first_enabled_directive(&self) -> StoreResult<Option<Directive>>;

    // -- Runs and jobs --

    /// Create a run plus one pending job per task, atomically.
    async fn create_run_with_jobs(&self, input: NewRun) -> StoreResult<(Run, Vec<Job>)>;
    /// Launcher materialization: run + jobs + one due one-shot schedule and
    /// pending ScheduledRun per task, in a single transaction.
    async fn create_launch(&self, input: NewRun, now: DateTime<Utc>) -> StoreResult<(Run, Vec<Job>)>;
    async fn get_run(&self, id: Uuid) -> StoreResult<Option<Run>>;
    async fn list_runs(&self, filter: RunFilter) -> StoreResult<Vec<Run>>;
    /// `pending → running`. Returns false if the run was not pending.
    async fn mark_run_running(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;
    /// Terminal transition with report fields. Returns false unless the run
    /// was pending or running.
    async fn finish_run(
        &self,
        id: Uuid,
        status: RunStatus,
        now: DateTime<Utc>,
        report_markdown: &str,
        report_json: &serde_json::Value,
        error_message: &str,
    ) -> StoreResult<bool>;
    /// Cancel iff not terminal; returns the resulting row either way.
    async fn cancel_run(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Run>>;
    async fn set_run_host(&self, id: Uuid, host_id: Uuid) -> StoreResult<()>;
    async fn set_run_approval(
        &self,
        id: Uuid,
        approval: ApprovalStatus,
        approver: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Run>>;
    async fn add_run_tokens(
        &self,
        id: Uuid,
        prompt: i64,
        completion: i64,
        total: i64,
    ) -> StoreResult<()>;
    async fn last_successful_run(&self) -> StoreResult<Option<Run>>;
    /// Runs that ended after `cutoff` or have not ended, newest first.
    async fn runs_since(&self, cutoff: DateTime<Utc>, exclude: Uuid) -> StoreResult<Vec<Run>>;
    async fn count_running_runs(&self) -> StoreResult<i64>;
    async fn count_running_runs_of_kind(&self, kind: TaskKind) -> StoreResult<i64>;

    async fn list_jobs(&self, run_id: Uuid) -> StoreResult<Vec<Job>>;
    async fn mark_job_running(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;
    /// Exactly-one terminal transition for a job.
    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        now: DateTime<Utc>,
        result: &serde_json::Value,
        error_message: &str,
    ) -> StoreResult<bool>;
    async fn add_job_tokens(
        &self,
        id: Uuid,
        prompt: i64,
        completion: i64,
        total: i64,
    ) -> StoreResult<()>;

    // -- Schedules --

    async fn create_schedule(&self, input: NewSchedule) -> StoreResult<Schedule>;
    async fn get_schedule(&self, id: Uuid) -> StoreResult<Option<Schedule>>;
    async fn list_schedules(&self) -> StoreResult<Vec<Schedule>>;
    async fn update_schedule(
        &self,
        id: Uuid,
        update: ScheduleUpdate,
    ) -> StoreResult<Option<Schedule>>;
    async fn delete_schedule(&self, id: Uuid) -> StoreResult<bool>;

    /// Claim up to `limit` due schedules for `claimant`, setting
    /// `claimed_by`/`claimed_until = now + ttl` within the same transaction.
    /// Concurrent callers never observe the same row.
    async fn claim_due_schedules(
        &self,
        now: DateTime<Utc>,
        claimant: &str,
        ttl: Duration,
        limit: i64,
    ) -> StoreResult<Vec<Schedule>>;
    async fn release_schedule_claim(&self, id: Uuid) -> StoreResult<()>;
    /// Record a completed dispatch cycle: `last_run_at` and the recomputed
    /// `next_run_at`.
    async fn record_schedule_run(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;
    /// Push `next_run_at` forward (concurrency-gate backoff).
    async fn defer_schedule(&self, id: Uuid, until: DateTime<Utc>) -> StoreResult<()>;

    async fn create_scheduled_run(
        &self,
        schedule_id: Uuid,
        run_id: Uuid,
        status: ScheduledRunStatus,
    ) -> StoreResult<ScheduledRun>;
    async fn pending_scheduled_run(&self, schedule_id: Uuid) -> StoreResult<Option<ScheduledRun>>;
    async fn mark_scheduled_run_started(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<()>;
    async fn finish_scheduled_run(
        &self,
        id: Uuid,
        status: ScheduledRunStatus,
        now: DateTime<Utc>,
        error_summary: &str,
    ) -> StoreResult<()>;
    async fn schedule_history(&self, schedule_id: Uuid, limit: i64)
        -> StoreResult<Vec<ScheduledRun>>;

    // -- Worker hosts --

    async fn create_host(&self, input: NewWorkerHost) -> StoreResult<WorkerHost>;
    async fn get_host(&self, id: Uuid) -> StoreResult<Option<WorkerHost>>;
    async fn list_hosts(&self) -> StoreResult<Vec<WorkerHost>>;
    async fn update_host(
        &self,
        id: Uuid,
        update: WorkerHostUpdate,
    ) -> StoreResult<Option<WorkerHost>>;
    /// Refused with `Conflict` while the host has active runs.
    async fn delete_host(&self, id: Uuid) -> StoreResult<bool>;
    /// Gated increment of `active_runs_count`; true iff the slot was taken.
    async fn try_acquire_host_slot(&self, id: Uuid) -> StoreResult<bool>;
    async fn release_host_slot(&self, id: Uuid) -> StoreResult<()>;
    /// Probe outcome. A successful probe refreshes `last_seen_at`; a failed
    /// one leaves it untouched.
    async fn set_host_health(
        &self,
        id: Uuid,
        healthy: bool,
        seen_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;
    async fn touch_host(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<()>;
    async fn mark_stale_hosts_unhealthy(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    // -- Allowlists --

    async fn upsert_allowlist_entry(
        &self,
        input: NewAllowlistEntry,
    ) -> StoreResult<ContainerAllowlistEntry>;
    async fn get_allowlist_entry(&self, container_id: &str)
        -> StoreResult<Option<ContainerAllowlistEntry>>;
    async fn list_allowlist(&self, enabled_only: bool)
        -> StoreResult<Vec<ContainerAllowlistEntry>>;
    async fn delete_allowlist_entry(&self, container_id: &str) -> StoreResult<bool>;

    async fn create_worker_image(&self, input: NewWorkerImage) -> StoreResult<WorkerImage>;
    async fn find_worker_image(&self, image: &str, tag: &str) -> StoreResult<Option<WorkerImage>>;
    async fn list_worker_images(&self) -> StoreResult<Vec<WorkerImage>>;
    async fn delete_worker_image(&self, id: Uuid) -> StoreResult<bool>;

    // -- GPU state --

    async fn upsert_gpu_state(&self, sample: GpuSample) -> StoreResult<GpuState>;
    async fn list_gpu_states(&self, host_id: Option<Uuid>) -> StoreResult<Vec<GpuState>>;
    async fn adjust_gpu_workers(
        &self,
        host_id: Uuid,
        device_index: i32,
        delta: i32,
    ) -> StoreResult<()>;

    // -- Artifacts, telemetry, audit --

    async fn insert_artifact(&self, input: NewArtifact) -> StoreResult<RunArtifact>;
    async fn list_artifacts(&self, run_id: Uuid) -> StoreResult<Vec<RunArtifact>>;
    async fn get_artifact(&self, id: Uuid) -> StoreResult<Option<RunArtifact>>;

    async fn insert_llm_call(&self, input: NewLlmCall) -> StoreResult<LlmCall>;
    async fn list_llm_calls(&self, run_id: Uuid) -> StoreResult<Vec<LlmCall>>;
    async fn token_totals(&self) -> StoreResult<TokenTotals>;
    async fn token_totals_by_model(&self) -> StoreResult<Vec<ModelTokenTotals>>;
    async fn usage_by_directive(&self) -> StoreResult<Vec<DirectiveUsage>>;

    async fn insert_audit(&self, input: NewAudit) -> StoreResult<WorkerAudit>;
    async fn list_audit_for_run(&self, run_id: Uuid) -> StoreResult<Vec<WorkerAudit>>;
}
