//! Record types for the orchestrator state store.
//!
//! These are plain data carriers: all lifecycle transitions happen through
//! [`crate::store::Store`] methods with explicit preconditions, never by
//! mutating a record in memory and writing it back.
//!
//! The LlmCall record deliberately has no field capable of holding prompt or
//! response text. Token counts, model/endpoint identifiers, and a short
//! error kind are the only things the store can ever learn about a model
//! interaction.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The task kinds a worker container can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    LogTriage,
    GpuReport,
    ServiceMap,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LogTriage => "log_triage",
            Self::GpuReport => "gpu_report",
            Self::ServiceMap => "service_map",
        }
    }

    /// Worker image used when the directive snapshot doesn't override it.
    pub fn default_image(&self) -> (&'static str, &'static str) {
        match self {
            Self::LogTriage => ("dockhand/log-triage", "latest"),
            Self::GpuReport => ("dockhand/gpu-report", "latest"),
            Self::ServiceMap => ("dockhand/service-map", "latest"),
        }
    }

    pub const ALL: [TaskKind; 3] = [Self::LogTriage, Self::GpuReport, Self::ServiceMap];
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log_triage" => Ok(Self::LogTriage),
            "gpu_report" => Ok(Self::GpuReport),
            "service_map" => Ok(Self::ServiceMap),
            _ => Err(format!("unknown task kind: {}", s)),
        }
    }
}

/// Run lifecycle. Transitions are one-way:
/// `pending → running → {success | failed | partial | cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Partial,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Partial => "partial",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Partial | Self::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "partial" => Ok(Self::Partial),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("unknown run status: {}", s)),
        }
    }
}

/// Approval state for runs citing an approval-gated directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    None,
    Pending,
    Approved,
    Denied,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "denied" => Ok(Self::Denied),
            _ => Err(format!("unknown approval status: {}", s)),
        }
    }
}

/// Job lifecycle within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown job status: {}", s)),
        }
    }
}

/// A named configuration that runs cite by value (snapshot) at launch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directive {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// Structured values consumed by workers (timeouts, image overrides, …).
    pub task_config: serde_json::Value,
    pub directive_text: String,
    /// Task kinds runs citing this directive may contain.
    pub task_list: Vec<TaskKind>,
    pub approval_required: bool,
    pub max_concurrent_runs: i32,
    pub version: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The directive content captured at launch time. Immutable for the run's
/// lifetime: later edits or deletion of the directive never affect it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectiveSnapshot {
    pub name: String,
    pub task_config: serde_json::Value,
    pub directive_text: String,
    pub task_list: Vec<TaskKind>,
    pub approval_required: bool,
    pub max_concurrent_runs: i32,
    pub version: i32,
    pub captured_at: DateTime<Utc>,
}

impl DirectiveSnapshot {
    pub fn from_directive(directive: &Directive, now: DateTime<Utc>) -> Self {
        Self {
            name: directive.name.clone(),
            task_config: directive.task_config.clone(),
            directive_text: directive.directive_text.clone(),
            task_list: directive.task_list.clone(),
            approval_required: directive.approval_required,
            max_concurrent_runs: directive.max_concurrent_runs,
            version: directive.version,
            captured_at: now,
        }
    }

    /// Snapshot for launches that carry inline directive text instead of a
    /// stored directive.
    pub fn custom(text: &str, now: DateTime<Utc>) -> Self {
        Self {
            name: "custom".to_string(),
            task_config: serde_json::json!({}),
            directive_text: text.to_string(),
            task_list: TaskKind::ALL.to_vec(),
            approval_required: false,
            max_concurrent_runs: 5,
            version: 1,
            captured_at: now,
        }
    }

    /// Per-job wall-clock timeout, from `task_config.timeout_secs`.
    pub fn job_timeout(&self, default: Duration) -> Duration {
        self.task_config
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or(default)
    }

    /// Worker image for a task kind; `task_config.images.<kind>` overrides
    /// the built-in default. Accepts `name` or `name:tag`.
    pub fn image_for(&self, kind: TaskKind) -> (String, String) {
        let configured = self
            .task_config
            .get("images")
            .and_then(|images| images.get(kind.as_str()))
            .and_then(|v| v.as_str());

        match configured {
            Some(raw) => match raw.split_once(':') {
                Some((name, tag)) => (name.to_string(), tag.to_string()),
                None => (raw.to_string(), "latest".to_string()),
            },
            None => {
                let (name, tag) = kind.default_image();
                (name.to_string(), tag.to_string())
            }
        }
    }

    /// Whether a job of this kind is required: its failure fails all jobs
    /// that haven't started yet. `task_config.required_tasks` lists kinds.
    pub fn job_required(&self, kind: TaskKind) -> bool {
        self.task_config
            .get("required_tasks")
            .and_then(|v| v.as_array())
            .map(|kinds| kinds.iter().any(|k| k.as_str() == Some(kind.as_str())))
            .unwrap_or(false)
    }
}

/// A single orchestrated execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub directive_id: Option<Uuid>,
    pub directive_snapshot: DirectiveSnapshot,
    pub status: RunStatus,
    pub approval: ApprovalStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub worker_host_id: Option<Uuid>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Markdown report; empty until the run is terminal.
    pub report_markdown: String,
    /// Structured mirror of the markdown report.
    pub report_json: serde_json::Value,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

/// One task within a run, executed by a single worker container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub run_id: Uuid,
    pub kind: TaskKind,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Bounded JSON holding references only (paths, counts, model ids).
    pub result: serde_json::Value,
    pub error_message: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Interval,
    Cron,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::Cron => "cron",
        }
    }
}

impl std::fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ScheduleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interval" => Ok(Self::Interval),
            "cron" => Ok(Self::Cron),
            _ => Err(format!("unknown schedule kind: {}", s)),
        }
    }
}

/// Container scope for service-map tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskScope {
    Allowlist,
    All,
}

impl TaskScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowlist => "allowlist",
            Self::All => "all",
        }
    }
}

impl FromStr for TaskScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allowlist" => Ok(Self::Allowlist),
            "all" => Ok(Self::All),
            _ => Err(format!("unknown task scope: {}", s)),
        }
    }
}

/// A due-time pointer consumed by the claim loop.
///
/// A one-shot schedule (created by the launcher) has `kind = interval` with
/// `interval_minutes = None`; the scheduler dispatches it once and pushes
/// `next_run_at` into the far future.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
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
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub claimed_by: String,
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn is_one_shot(&self) -> bool {
        self.kind == ScheduleKind::Interval && self.interval_minutes.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledRunStatus {
    Pending,
    Started,
    Finished,
    Failed,
}

impl ScheduledRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ScheduledRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "started" => Ok(Self::Started),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown scheduled-run status: {}", s)),
        }
    }
}

/// Binding between a schedule and the run it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledRun {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub run_id: Uuid,
    pub status: ScheduledRunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_summary: String,
    pub created_at: DateTime<Utc>,
}

/// How a worker host's Docker endpoint is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKind {
    LocalSocket,
    RemoteTcp,
}

impl HostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalSocket => "local_socket",
            Self::RemoteTcp => "remote_tcp",
        }
    }
}

impl FromStr for HostKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_socket" => Ok(Self::LocalSocket),
            "remote_tcp" => Ok(Self::RemoteTcp),
            _ => Err(format!("unknown host kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostCapabilities {
    #[serde(default)]
    pub gpus: bool,
    #[serde(default)]
    pub gpu_count: i32,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: i32,
    #[serde(default)]
    pub labels: Vec<String>,
}

fn default_max_concurrency() -> i32 {
    5
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self {
            gpus: false,
            gpu_count: 0,
            max_concurrency: default_max_concurrency(),
            labels: Vec::new(),
        }
    }
}

/// SSH forwarding configuration for a remote host.
///
/// Held server-side only: the read API exposes nothing but a boolean
/// `has_ssh_config` flag, and `Debug` masks every field.
#[derive(Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    pub key_path: String,
}

fn default_ssh_port() -> u16 {
    22
}

impl std::fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &"[redacted]")
            .field("port", &"[redacted]")
            .field("user", &"[redacted]")
            .field("key_path", &"[redacted]")
            .finish()
    }
}

/// A Docker endpoint the dispatcher may use.
#[derive(Debug, Clone)]
pub struct WorkerHost {
    pub id: Uuid,
    pub name: String,
    pub kind: HostKind,
    /// `unix:///var/run/docker.sock` or `tcp://10.0.0.5:2376`.
    pub endpoint: String,
    pub capabilities: HostCapabilities,
    pub ssh: Option<SshConfig>,
    pub enabled: bool,
    pub healthy: bool,
    pub active_runs_count: i32,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerHost {
    /// A host is stale when its last successful probe is older than the
    /// threshold; stale hosts are excluded from routing even if `healthy`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match self.last_seen_at {
            Some(seen) => {
                now - seen
                    > chrono::Duration::from_std(threshold)
                        .unwrap_or_else(|_| chrono::Duration::zero())
            }
            None => true,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.active_runs_count < self.capabilities.max_concurrency
    }

    pub fn has_gpu(&self) -> bool {
        self.capabilities.gpus
    }
}

/// A container identity that service-map / log-triage tasks may inspect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerAllowlistEntry {
    /// Docker container id (primary key).
    pub container_id: String,
    pub container_name: String,
    pub description: String,
    pub enabled: bool,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An `(image, tag)` pair the dispatcher may spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerImage {
    pub id: Uuid,
    pub image: String,
    pub tag: String,
    pub description: String,
    pub enabled: bool,
    pub requires_gpu: bool,
    /// Permit running on CPU when no GPU satisfies the VRAM floor.
    pub cpu_fallback: bool,
    pub min_vram_mb: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerImage {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

/// Per-host, per-device GPU telemetry used for placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuState {
    pub id: Uuid,
    pub host_id: Uuid,
    pub device_index: i32,
    pub name: String,
    pub total_vram_mb: i32,
    pub used_vram_mb: i32,
    pub free_vram_mb: i32,
    pub utilization_percent: f64,
    pub available: bool,
    pub active_workers: i32,
    pub updated_at: DateTime<Utc>,
}

impl GpuState {
    /// Weighted blend of VRAM pressure and utilization; lower wins.
    pub fn scheduling_score(&self) -> f64 {
        let vram_pressure = if self.total_vram_mb > 0 {
            f64::from(self.used_vram_mb) / f64::from(self.total_vram_mb)
        } else {
            1.0
        };
        0.6 * vram_pressure + 0.4 * (self.utilization_percent / 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Log,
    Report,
    Data,
    Other,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Report => "report",
            Self::Data => "data",
            Self::Other => "other",
        }
    }

    /// Classify by file extension.
    pub fn from_path(path: &str) -> Self {
        match path.rsplit_once('.').map(|(_, ext)| ext) {
            Some("md") => Self::Report,
            Some("json") => Self::Data,
            Some("log") | Some("txt") => Self::Log,
            _ => Self::Other,
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" => Ok(Self::Log),
            "report" => Ok(Self::Report),
            "data" => Ok(Self::Data),
            "other" => Ok(Self::Other),
            _ => Err(format!("unknown artifact kind: {}", s)),
        }
    }
}

/// Metadata for a file a worker produced under the artifact root.
/// Content is never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArtifact {
    pub id: Uuid,
    pub run_id: Uuid,
    pub kind: ArtifactKind,
    /// Path relative to the artifact root, always `run_<id>/...`.
    pub path: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

/// Per-model token-and-timing telemetry for a job.
///
/// There is structurally no way to store prompt or response text here:
/// every column is a count, a flag, a duration, or a short identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCall {
    pub id: Uuid,
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
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Spawn,
    Start,
    Stop,
    Remove,
    Error,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawn => "spawn",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Remove => "remove",
            Self::Error => "error",
        }
    }
}

impl FromStr for AuditOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spawn" => Ok(Self::Spawn),
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "remove" => Ok(Self::Remove),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown audit operation: {}", s)),
        }
    }
}

/// Append-only record of a dispatcher action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAudit {
    pub id: Uuid,
    pub run_id: Uuid,
    pub job_id: Option<Uuid>,
    pub operation: AuditOperation,
    pub container_id: String,
    pub image: String,
    /// Device index as a string, or "cpu".
    pub gpu_assigned: String,
    pub gpu_reason: String,
    pub config_snapshot: serde_json::Value,
    pub success: bool,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_kind_round_trips() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
    }

    #[test]
    fn run_status_lattice() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        for s in [
            RunStatus::Success,
            RunStatus::Failed,
            RunStatus::Partial,
            RunStatus::Cancelled,
        ] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn snapshot_image_override() {
        let mut directive = test_directive();
        directive.task_config = serde_json::json!({
            "images": { "log_triage": "lab/triage:v2" }
        });
        let snap = DirectiveSnapshot::from_directive(&directive, Utc::now());

        assert_eq!(
            snap.image_for(TaskKind::LogTriage),
            ("lab/triage".to_string(), "v2".to_string())
        );
        // Unconfigured kinds fall back to the built-in image.
        assert_eq!(
            snap.image_for(TaskKind::GpuReport),
            ("dockhand/gpu-report".to_string(), "latest".to_string())
        );
    }

    #[test]
    fn snapshot_timeout_clamps_to_one_second() {
        let mut directive = test_directive();
        directive.task_config = serde_json::json!({ "timeout_secs": 0 });
        let snap = DirectiveSnapshot::from_directive(&directive, Utc::now());
        assert_eq!(
            snap.job_timeout(Duration::from_secs(600)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn gpu_score_prefers_idle_device() {
        let busy = gpu(0, 7168, 8192, 90.0);
        let idle = gpu(1, 1024, 8192, 10.0);
        assert!(idle.scheduling_score() < busy.scheduling_score());
    }

    #[test]
    fn stale_host_without_probe_history() {
        let host = WorkerHost {
            id: Uuid::new_v4(),
            name: "h0".into(),
            kind: HostKind::LocalSocket,
            endpoint: "unix:///var/run/docker.sock".into(),
            capabilities: HostCapabilities::default(),
            ssh: None,
            enabled: true,
            healthy: true,
            active_runs_count: 0,
            last_seen_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(host.is_stale(Utc::now(), Duration::from_secs(300)));
    }

    #[test]
    fn llm_call_has_no_field_that_could_hold_text() {
        let call = LlmCall {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            model_id: "mistral-7b".into(),
            endpoint: "vllm".into(),
            prompt_tokens: 150,
            completion_tokens: 50,
            total_tokens: 200,
            duration_ms: 1800,
            success: true,
            error_kind: String::new(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&call).unwrap();
        let mut keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        // Counts, flags, identifiers, timestamps. Nothing else exists to
        // put a prompt or completion into.
        assert_eq!(
            keys,
            vec![
                "completion_tokens",
                "created_at",
                "duration_ms",
                "endpoint",
                "error_kind",
                "id",
                "job_id",
                "model_id",
                "prompt_tokens",
                "run_id",
                "success",
                "total_tokens",
            ]
        );
    }

    #[test]
    fn ssh_config_debug_is_masked() {
        let ssh = SshConfig {
            host: "10.0.0.9".into(),
            port: 22,
            user: "ops".into(),
            key_path: "/keys/id_ed25519".into(),
        };
        let rendered = format!("{:?}", ssh);
        assert!(!rendered.contains("10.0.0.9"));
        assert!(!rendered.contains("ops"));
        assert!(!rendered.contains("id_ed25519"));
    }

    fn test_directive() -> Directive {
        Directive {
            id: Uuid::new_v4(),
            name: "nightly".into(),
            description: String::new(),
            task_config: serde_json::json!({}),
            directive_text: String::new(),
            task_list: TaskKind::ALL.to_vec(),
            approval_required: false,
            max_concurrent_runs: 5,
            version: 1,
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn gpu(index: i32, used: i32, total: i32, util: f64) -> GpuState {
        GpuState {
            id: Uuid::new_v4(),
            host_id: Uuid::new_v4(),
            device_index: index,
            name: format!("GPU {}", index),
            total_vram_mb: total,
            used_vram_mb: used,
            free_vram_mb: total - used,
            utilization_percent: util,
            available: true,
            active_workers: 0,
            updated_at: Utc::now(),
        }
    }
}
