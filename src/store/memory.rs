//! In-memory implementation of [`Store`] for tests and local development.
//!
//! A single mutex serializes every operation, which trivially satisfies the
//! claim invariant: two concurrent claimants can never observe the same
//! schedule row as unclaimed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::*;

use super::{
    DirectiveUpdate, DirectiveUsage, GpuSample, ModelTokenTotals, NewAllowlistEntry, NewArtifact,
    NewAudit, NewDirective, NewLlmCall, NewRun, NewSchedule, NewWorkerHost, NewWorkerImage,
    RunFilter, ScheduleUpdate, Store, StoreResult, TokenTotals, WorkerHostUpdate,
};

#[derive(Default)]
struct Inner {
    directives: Vec<Directive>,
    runs: Vec<Run>,
    jobs: Vec<Job>,
    schedules: Vec<Schedule>,
    scheduled_runs: Vec<ScheduledRun>,
    hosts: Vec<WorkerHost>,
    allowlist: Vec<ContainerAllowlistEntry>,
    images: Vec<WorkerImage>,
    gpus: Vec<GpuState>,
    artifacts: Vec<RunArtifact>,
    llm_calls: Vec<LlmCall>,
    audits: Vec<WorkerAudit>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    // -- Directives --

    async fn create_directive(&self, input: NewDirective) -> StoreResult<Directive> {
        let mut inner = self.inner.lock().await;
        if inner.directives.iter().any(|d| d.name == input.name) {
            return Err(StoreError::Conflict(format!(
                "directive name already exists: {}",
                input.name
            )));
        }
        let now = Utc::now();
        let directive = Directive {
            id: Uuid::new_v4(),
            name: input.name,
            description: input.description,
            task_config: input.task_config,
            directive_text: input.directive_text,
            task_list: input.task_list,
            approval_required: input.approval_required,
            max_concurrent_runs: input.max_concurrent_runs,
            version: 1,
            enabled: input.enabled,
            created_at: now,
            updated_at: now,
        };
        inner.directives.push(directive.clone());
        Ok(directive)
    }

    async fn get_directive(&self, id: Uuid) -> StoreResult<Option<Directive>> {
        let inner = self.inner.lock().await;
        Ok(inner.directives.iter().find(|d| d.id == id).cloned())
    }

    async fn list_directives(&self) -> StoreResult<Vec<Directive>> {
        let inner = self.inner.lock().await;
        let mut out = inner.directives.clone();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn update_directive(
        &self,
        id: Uuid,
        update: DirectiveUpdate,
    ) -> StoreResult<Option<Directive>> {
        let mut inner = self.inner.lock().await;
        let Some(d) = inner.directives.iter_mut().find(|d| d.id == id) else {
            return Ok(None);
        };
        if let Some(v) = update.description {
            d.description = v;
        }
        if let Some(v) = update.task_config {
            d.task_config = v;
        }
        if let Some(v) = update.directive_text {
            d.directive_text = v;
        }
        if let Some(v) = update.task_list {
            d.task_list = v;
        }
        if let Some(v) = update.approval_required {
            d.approval_required = v;
        }
        if let Some(v) = update.max_concurrent_runs {
            d.max_concurrent_runs = v;
        }
        if let Some(v) = update.enabled {
            d.enabled = v;
        }
        d.version += 1;
        d.updated_at = Utc::now();
        Ok(Some(d.clone()))
    }

    async fn delete_directive(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.directives.len();
        inner.directives.retain(|d| d.id != id);
        Ok(inner.directives.len() < before)
    }

    async fn first_enabled_directive(&self) -> StoreResult<Option<Directive>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .directives
            .iter()
            .filter(|d| d.enabled)
            .min_by_key(|d| d.created_at)
            .cloned())
    }

    // -- Runs and jobs --

    async fn create_run_with_jobs(&self, input: NewRun) -> StoreResult<(Run, Vec<Job>)> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let run = Run {
            id: Uuid::new_v4(),
            directive_id: input.directive_id,
            directive_snapshot: input.snapshot,
            status: RunStatus::Pending,
            approval: input.approval,
            approved_by: None,
            approved_at: None,
            worker_host_id: input.worker_host_id,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            started_at: None,
            ended_at: None,
            report_markdown: String::new(),
            report_json: serde_json::json!({}),
            error_message: String::new(),
            created_at: now,
        };
        let jobs: Vec<Job> = input
            .tasks
            .iter()
            .map(|kind| Job {
                id: Uuid::new_v4(),
                run_id: run.id,
                kind: *kind,
                status: JobStatus::Pending,
                started_at: None,
                ended_at: None,
                result: serde_json::json!({}),
                error_message: String::new(),
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
                created_at: now,
            })
            .collect();
        inner.runs.push(run.clone());
        inner.jobs.extend(jobs.clone());
        Ok((run, jobs))
    }

    async fn create_launch(
        &self,
        input: NewRun,
        now: DateTime<Utc>,
    ) -> StoreResult<(Run, Vec<Job>)> {
        let tasks = input.tasks.clone();
        let directive_id = input.directive_id;
        let (run, jobs) = self.create_run_with_jobs(input).await?;

        let mut inner = self.inner.lock().await;
        for kind in &tasks {
            let schedule_id = Uuid::new_v4();
            inner.schedules.push(Schedule {
                id: schedule_id,
                name: format!("launch-run-{}-{}", run.id, kind),
                task_kind: *kind,
                directive_id,
                custom_directive_text: String::new(),
                enabled: true,
                kind: ScheduleKind::Interval,
                interval_minutes: None,
                cron_expr: None,
                timezone: "UTC".to_string(),
                task3_scope: TaskScope::Allowlist,
                max_global: None,
                max_per_job: None,
                last_run_at: None,
                next_run_at: Some(now),
                claimed_by: String::new(),
                claimed_until: None,
                created_at: now,
                updated_at: now,
            });
            inner.scheduled_runs.push(ScheduledRun {
                id: Uuid::new_v4(),
                schedule_id,
                run_id: run.id,
                status: ScheduledRunStatus::Pending,
                started_at: None,
                finished_at: None,
                error_summary: String::new(),
                created_at: now,
            });
        }
        drop(inner);
        Ok((run, jobs))
    }

    async fn get_run(&self, id: Uuid) -> StoreResult<Option<Run>> {
        let inner = self.inner.lock().await;
        Ok(inner.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn list_runs(&self, filter: RunFilter) -> StoreResult<Vec<Run>> {
        let inner = self.inner.lock().await;
        let limit = filter.limit.unwrap_or(100) as usize;
        Ok(inner
            .runs
            .iter()
            .rev()
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| filter.since.map_or(true, |since| r.created_at >= since))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_run_running(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(run) = inner.runs.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        if run.status != RunStatus::Pending {
            return Ok(false);
        }
        run.status = RunStatus::Running;
        run.started_at = Some(now);
        Ok(true)
    }

    async fn finish_run(
        &self,
        id: Uuid,
        status: RunStatus,
        now: DateTime<Utc>,
        report_markdown: &str,
        report_json: &serde_json::Value,
        error_message: &str,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(run) = inner.runs.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        if run.status.is_terminal() {
            return Ok(false);
        }
        run.status = status;
        run.started_at = run.started_at.or(Some(now));
        run.ended_at = Some(now);
        run.report_markdown = report_markdown.to_string();
        run.report_json = report_json.clone();
        run.error_message = error_message.to_string();
        Ok(true)
    }

    async fn cancel_run(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Run>> {
        let mut inner = self.inner.lock().await;
        let Some(run) = inner.runs.iter_mut().find(|r| r.id == id) else {
            return Ok(None);
        };
        if !run.status.is_terminal() {
            run.status = RunStatus::Cancelled;
            run.ended_at = Some(now);
        }
        Ok(Some(run.clone()))
    }

    async fn set_run_host(&self, id: Uuid, host_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(run) = inner.runs.iter_mut().find(|r| r.id == id) {
            run.worker_host_id = Some(host_id);
        }
        Ok(())
    }

    async fn set_run_approval(
        &self,
        id: Uuid,
        approval: ApprovalStatus,
        approver: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Run>> {
        let mut inner = self.inner.lock().await;
        let Some(run) = inner.runs.iter_mut().find(|r| r.id == id) else {
            return Ok(None);
        };
        if run.approval == ApprovalStatus::Pending {
            run.approval = approval;
            run.approved_by = Some(approver.to_string());
            run.approved_at = Some(now);
        }
        Ok(Some(run.clone()))
    }

    async fn add_run_tokens(
        &self,
        id: Uuid,
        prompt: i64,
        completion: i64,
        total: i64,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(run) = inner.runs.iter_mut().find(|r| r.id == id) {
            run.prompt_tokens += prompt;
            run.completion_tokens += completion;
            run.total_tokens += total;
        }
        Ok(())
    }

    async fn last_successful_run(&self) -> StoreResult<Option<Run>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .iter()
            .filter(|r| r.status == RunStatus::Success)
            .max_by_key(|r| r.ended_at)
            .cloned())
    }

    async fn runs_since(&self, cutoff: DateTime<Utc>, exclude: Uuid) -> StoreResult<Vec<Run>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .iter()
            .rev()
            .filter(|r| r.id != exclude)
            .filter(|r| r.ended_at.map_or(true, |ended| ended > cutoff))
            .cloned()
            .collect())
    }

    async fn count_running_runs(&self) -> StoreResult<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .iter()
            .filter(|r| r.status == RunStatus::Running)
            .count() as i64)
    }

    async fn count_running_runs_of_kind(&self, kind: TaskKind) -> StoreResult<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .iter()
            .filter(|r| r.status == RunStatus::Running)
            .filter(|r| {
                inner
                    .jobs
                    .iter()
                    .any(|j| j.run_id == r.id && j.kind == kind)
            })
            .count() as i64)
    }

    async fn list_jobs(&self, run_id: Uuid) -> StoreResult<Vec<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .iter()
            .filter(|j| j.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn mark_job_running(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.iter_mut().find(|j| j.id == id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Pending {
            return Ok(false);
        }
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        Ok(true)
    }

    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        now: DateTime<Utc>,
        result: &serde_json::Value,
        error_message: &str,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.iter_mut().find(|j| j.id == id) else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = status;
        job.started_at = job.started_at.or(Some(now));
        job.ended_at = Some(now);
        job.result = result.clone();
        job.error_message = error_message.to_string();
        Ok(true)
    }

    async fn add_job_tokens(
        &self,
        id: Uuid,
        prompt: i64,
        completion: i64,
        total: i64,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.iter_mut().find(|j| j.id == id) {
            job.prompt_tokens += prompt;
            job.completion_tokens += completion;
            job.total_tokens += total;
        }
        Ok(())
    }

    // -- Schedules --

    async fn create_schedule(&self, input: NewSchedule) -> StoreResult<Schedule> {
        let mut inner = self.inner.lock().await;
        if inner.schedules.iter().any(|s| s.name == input.name) {
            return Err(StoreError::Conflict(format!(
                "schedule name already exists: {}",
                input.name
            )));
        }
        let now = Utc::now();
        let schedule = Schedule {
            id: Uuid::new_v4(),
            name: input.name,
            task_kind: input.task_kind,
            directive_id: input.directive_id,
            custom_directive_text: input.custom_directive_text,
            enabled: input.enabled,
            kind: input.kind,
            interval_minutes: input.interval_minutes,
            cron_expr: input.cron_expr,
            timezone: input.timezone,
            task3_scope: input.task3_scope,
            max_global: input.max_global,
            max_per_job: input.max_per_job,
            last_run_at: None,
            next_run_at: input.next_run_at,
            claimed_by: String::new(),
            claimed_until: None,
            created_at: now,
            updated_at: now,
        };
        inner.schedules.push(schedule.clone());
        Ok(schedule)
    }

    async fn get_schedule(&self, id: Uuid) -> StoreResult<Option<Schedule>> {
        let inner = self.inner.lock().await;
        Ok(inner.schedules.iter().find(|s| s.id == id).cloned())
    }

    async fn list_schedules(&self) -> StoreResult<Vec<Schedule>> {
        let inner = self.inner.lock().await;
        let mut out = inner.schedules.clone();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn update_schedule(
        &self,
        id: Uuid,
        update: ScheduleUpdate,
    ) -> StoreResult<Option<Schedule>> {
        let mut inner = self.inner.lock().await;
        let Some(s) = inner.schedules.iter_mut().find(|s| s.id == id) else {
            return Ok(None);
        };
        if let Some(v) = update.enabled {
            s.enabled = v;
        }
        if let Some(v) = update.interval_minutes {
            s.interval_minutes = v;
        }
        if let Some(v) = update.cron_expr {
            s.cron_expr = v;
        }
        if let Some(v) = update.timezone {
            s.timezone = v;
        }
        if let Some(v) = update.task3_scope {
            s.task3_scope = v;
        }
        if let Some(v) = update.max_global {
            s.max_global = v;
        }
        if let Some(v) = update.max_per_job {
            s.max_per_job = v;
        }
        if let Some(v) = update.next_run_at {
            s.next_run_at = v;
        }
        s.updated_at = Utc::now();
        Ok(Some(s.clone()))
    }

    async fn delete_schedule(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.schedules.len();
        inner.schedules.retain(|s| s.id != id);
        Ok(inner.schedules.len() < before)
    }

    async fn claim_due_schedules(
        &self,
        now: DateTime<Utc>,
        claimant: &str,
        ttl: Duration,
        limit: i64,
    ) -> StoreResult<Vec<Schedule>> {
        let mut inner = self.inner.lock().await;
        let until = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(120));
        let mut due: Vec<usize> = inner
            .schedules
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.enabled
                    && s.next_run_at.is_some_and(|t| t <= now)
                    && s.claimed_until.map_or(true, |t| t <= now)
            })
            .map(|(i, _)| i)
            .collect();
        due.sort_by_key(|&i| inner.schedules[i].next_run_at);
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for i in due {
            let s = &mut inner.schedules[i];
            s.claimed_by = claimant.to_string();
            s.claimed_until = Some(until);
            s.updated_at = now;
            claimed.push(s.clone());
        }
        Ok(claimed)
    }

    async fn release_schedule_claim(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(s) = inner.schedules.iter_mut().find(|s| s.id == id) {
            s.claimed_by = String::new();
            s.claimed_until = None;
        }
        Ok(())
    }

    async fn record_schedule_run(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(s) = inner.schedules.iter_mut().find(|s| s.id == id) {
            s.last_run_at = Some(last_run_at);
            s.next_run_at = next_run_at;
            s.updated_at = last_run_at;
        }
        Ok(())
    }

    async fn defer_schedule(&self, id: Uuid, until: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(s) = inner.schedules.iter_mut().find(|s| s.id == id) {
            s.next_run_at = Some(until);
            s.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn create_scheduled_run(
        &self,
        schedule_id: Uuid,
        run_id: Uuid,
        status: ScheduledRunStatus,
    ) -> StoreResult<ScheduledRun> {
        let mut inner = self.inner.lock().await;
        let scheduled = ScheduledRun {
            id: Uuid::new_v4(),
            schedule_id,
            run_id,
            status,
            started_at: None,
            finished_at: None,
            error_summary: String::new(),
            created_at: Utc::now(),
        };
        inner.scheduled_runs.push(scheduled.clone());
        Ok(scheduled)
    }

    async fn pending_scheduled_run(&self, schedule_id: Uuid) -> StoreResult<Option<ScheduledRun>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .scheduled_runs
            .iter()
            .find(|sr| sr.schedule_id == schedule_id && sr.status == ScheduledRunStatus::Pending)
            .cloned())
    }

    async fn mark_scheduled_run_started(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(sr) = inner.scheduled_runs.iter_mut().find(|sr| sr.id == id) {
            sr.status = ScheduledRunStatus::Started;
            sr.started_at = Some(now);
        }
        Ok(())
    }

    async fn finish_scheduled_run(
        &self,
        id: Uuid,
        status: ScheduledRunStatus,
        now: DateTime<Utc>,
        error_summary: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(sr) = inner.scheduled_runs.iter_mut().find(|sr| sr.id == id) {
            sr.status = status;
            sr.finished_at = Some(now);
            sr.error_summary = error_summary.to_string();
        }
        Ok(())
    }

    async fn schedule_history(
        &self,
        schedule_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<ScheduledRun>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .scheduled_runs
            .iter()
            .rev()
            .filter(|sr| sr.schedule_id == schedule_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    // -- Worker hosts --

    async fn create_host(&self, input: NewWorkerHost) -> StoreResult<WorkerHost> {
        let mut inner = self.inner.lock().await;
        if inner.hosts.iter().any(|h| h.name == input.name) {
            return Err(StoreError::Conflict(format!(
                "host name already exists: {}",
                input.name
            )));
        }
        let now = Utc::now();
        let host = WorkerHost {
            id: Uuid::new_v4(),
            name: input.name,
            kind: input.kind,
            endpoint: input.endpoint,
            capabilities: input.capabilities,
            ssh: input.ssh,
            enabled: input.enabled,
            healthy: false,
            active_runs_count: 0,
            last_seen_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.hosts.push(host.clone());
        Ok(host)
    }

    async fn get_host(&self, id: Uuid) -> StoreResult<Option<WorkerHost>> {
        let inner = self.inner.lock().await;
        Ok(inner.hosts.iter().find(|h| h.id == id).cloned())
    }

    async fn list_hosts(&self) -> StoreResult<Vec<WorkerHost>> {
        let inner = self.inner.lock().await;
        let mut out = inner.hosts.clone();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn update_host(
        &self,
        id: Uuid,
        update: WorkerHostUpdate,
    ) -> StoreResult<Option<WorkerHost>> {
        let mut inner = self.inner.lock().await;
        let Some(h) = inner.hosts.iter_mut().find(|h| h.id == id) else {
            return Ok(None);
        };
        if let Some(v) = update.name {
            h.name = v;
        }
        if let Some(v) = update.endpoint {
            h.endpoint = v;
        }
        if let Some(v) = update.capabilities {
            h.capabilities = v;
        }
        if let Some(v) = update.ssh {
            h.ssh = v;
        }
        if let Some(v) = update.enabled {
            h.enabled = v;
        }
        h.updated_at = Utc::now();
        Ok(Some(h.clone()))
    }

    async fn delete_host(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(h) = inner.hosts.iter().find(|h| h.id == id) else {
            return Ok(false);
        };
        if h.active_runs_count > 0 {
            return Err(StoreError::Conflict(format!(
                "host has {} active runs",
                h.active_runs_count
            )));
        }
        inner.hosts.retain(|h| h.id != id);
        Ok(true)
    }

    async fn try_acquire_host_slot(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(h) = inner.hosts.iter_mut().find(|h| h.id == id) else {
            return Ok(false);
        };
        if h.enabled && h.healthy && h.active_runs_count < h.capabilities.max_concurrency {
            h.active_runs_count += 1;
            h.updated_at = Utc::now();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release_host_slot(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(h) = inner.hosts.iter_mut().find(|h| h.id == id) {
            h.active_runs_count = (h.active_runs_count - 1).max(0);
            h.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_host_health(
        &self,
        id: Uuid,
        healthy: bool,
        seen_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(h) = inner.hosts.iter_mut().find(|h| h.id == id) {
            h.healthy = healthy;
            if let Some(seen) = seen_at {
                h.last_seen_at = Some(seen);
            }
            h.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn touch_host(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(h) = inner.hosts.iter_mut().find(|h| h.id == id) {
            h.last_seen_at = Some(now);
            h.updated_at = now;
        }
        Ok(())
    }

    async fn mark_stale_hosts_unhealthy(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let mut n = 0;
        for h in inner.hosts.iter_mut() {
            if h.enabled && h.healthy && h.last_seen_at.map_or(true, |seen| seen < cutoff) {
                h.healthy = false;
                n += 1;
            }
        }
        Ok(n)
    }

    // -- Allowlists --

    async fn upsert_allowlist_entry(
        &self,
        input: NewAllowlistEntry,
    ) -> StoreResult<ContainerAllowlistEntry> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        if let Some(entry) = inner
            .allowlist
            .iter_mut()
            .find(|e| e.container_id == input.container_id)
        {
            entry.container_name = input.container_name;
            entry.description = input.description;
            entry.enabled = input.enabled;
            entry.tags = input.tags;
            entry.updated_at = now;
            return Ok(entry.clone());
        }
        let entry = ContainerAllowlistEntry {
            container_id: input.container_id,
            container_name: input.container_name,
            description: input.description,
            enabled: input.enabled,
            tags: input.tags,
            created_at: now,
            updated_at: now,
        };
        inner.allowlist.push(entry.clone());
        Ok(entry)
    }

    async fn get_allowlist_entry(
        &self,
        container_id: &str,
    ) -> StoreResult<Option<ContainerAllowlistEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .allowlist
            .iter()
            .find(|e| e.container_id == container_id)
            .cloned())
    }

    async fn list_allowlist(
        &self,
        enabled_only: bool,
    ) -> StoreResult<Vec<ContainerAllowlistEntry>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner
            .allowlist
            .iter()
            .filter(|e| !enabled_only || e.enabled)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.container_name.cmp(&b.container_name));
        Ok(out)
    }

    async fn delete_allowlist_entry(&self, container_id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.allowlist.len();
        inner.allowlist.retain(|e| e.container_id != container_id);
        Ok(inner.allowlist.len() < before)
    }

    async fn create_worker_image(&self, input: NewWorkerImage) -> StoreResult<WorkerImage> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        if let Some(existing) = inner
            .images
            .iter_mut()
            .find(|i| i.image == input.image && i.tag == input.tag)
        {
            existing.description = input.description;
            existing.enabled = input.enabled;
            existing.requires_gpu = input.requires_gpu;
            existing.cpu_fallback = input.cpu_fallback;
            existing.min_vram_mb = input.min_vram_mb;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let image = WorkerImage {
            id: Uuid::new_v4(),
            image: input.image,
            tag: input.tag,
            description: input.description,
            enabled: input.enabled,
            requires_gpu: input.requires_gpu,
            cpu_fallback: input.cpu_fallback,
            min_vram_mb: input.min_vram_mb,
            created_at: now,
            updated_at: now,
        };
        inner.images.push(image.clone());
        Ok(image)
    }

    async fn find_worker_image(&self, image: &str, tag: &str) -> StoreResult<Option<WorkerImage>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .images
            .iter()
            .find(|i| i.image == image && i.tag == tag)
            .cloned())
    }

    async fn list_worker_images(&self) -> StoreResult<Vec<WorkerImage>> {
        let inner = self.inner.lock().await;
        let mut out = inner.images.clone();
        out.sort_by(|a, b| (&a.image, &a.tag).cmp(&(&b.image, &b.tag)));
        Ok(out)
    }

    async fn delete_worker_image(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.images.len();
        inner.images.retain(|i| i.id != id);
        Ok(inner.images.len() < before)
    }

    // -- GPU state --

    async fn upsert_gpu_state(&self, sample: GpuSample) -> StoreResult<GpuState> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        if let Some(gpu) = inner
            .gpus
            .iter_mut()
            .find(|g| g.host_id == sample.host_id && g.device_index == sample.device_index)
        {
            gpu.name = sample.name;
            gpu.total_vram_mb = sample.total_vram_mb;
            gpu.used_vram_mb = sample.used_vram_mb;
            gpu.free_vram_mb = sample.free_vram_mb;
            gpu.utilization_percent = sample.utilization_percent;
            gpu.available = sample.available;
            gpu.updated_at = now;
            return Ok(gpu.clone());
        }
        let gpu = GpuState {
            id: Uuid::new_v4(),
            host_id: sample.host_id,
            device_index: sample.device_index,
            name: sample.name,
            total_vram_mb: sample.total_vram_mb,
            used_vram_mb: sample.used_vram_mb,
            free_vram_mb: sample.free_vram_mb,
            utilization_percent: sample.utilization_percent,
            available: sample.available,
            active_workers: 0,
            updated_at: now,
        };
        inner.gpus.push(gpu.clone());
        Ok(gpu)
    }

    async fn list_gpu_states(&self, host_id: Option<Uuid>) -> StoreResult<Vec<GpuState>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner
            .gpus
            .iter()
            .filter(|g| host_id.map_or(true, |id| g.host_id == id))
            .cloned()
            .collect();
        out.sort_by_key(|g| (g.host_id, g.device_index));
        Ok(out)
    }

    async fn adjust_gpu_workers(
        &self,
        host_id: Uuid,
        device_index: i32,
        delta: i32,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(gpu) = inner
            .gpus
            .iter_mut()
            .find(|g| g.host_id == host_id && g.device_index == device_index)
        {
            gpu.active_workers = (gpu.active_workers + delta).max(0);
            gpu.updated_at = Utc::now();
        }
        Ok(())
    }

    // -- Artifacts, telemetry, audit --

    async fn insert_artifact(&self, input: NewArtifact) -> StoreResult<RunArtifact> {
        let mut inner = self.inner.lock().await;
        let artifact = RunArtifact {
            id: Uuid::new_v4(),
            run_id: input.run_id,
            kind: input.kind,
            path: input.path,
            size_bytes: input.size_bytes,
            mime_type: input.mime_type,
            created_at: Utc::now(),
        };
        inner.artifacts.push(artifact.clone());
        Ok(artifact)
    }

    async fn list_artifacts(&self, run_id: Uuid) -> StoreResult<Vec<RunArtifact>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .artifacts
            .iter()
            .filter(|a| a.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn get_artifact(&self, id: Uuid) -> StoreResult<Option<RunArtifact>> {
        let inner = self.inner.lock().await;
        Ok(inner.artifacts.iter().find(|a| a.id == id).cloned())
    }

    async fn insert_llm_call(&self, input: NewLlmCall) -> StoreResult<LlmCall> {
        let mut inner = self.inner.lock().await;
        let call = LlmCall {
            id: Uuid::new_v4(),
            run_id: input.run_id,
            job_id: input.job_id,
            model_id: input.model_id,
            endpoint: input.endpoint,
            prompt_tokens: input.prompt_tokens,
            completion_tokens: input.completion_tokens,
            total_tokens: input.total_tokens,
            duration_ms: input.duration_ms,
            success: input.success,
            error_kind: input.error_kind,
            created_at: Utc::now(),
        };
        inner.llm_calls.push(call.clone());
        Ok(call)
    }

    async fn list_llm_calls(&self, run_id: Uuid) -> StoreResult<Vec<LlmCall>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .llm_calls
            .iter()
            .filter(|c| c.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn token_totals(&self) -> StoreResult<TokenTotals> {
        let inner = self.inner.lock().await;
        let mut totals = TokenTotals::default();
        for call in &inner.llm_calls {
            totals.prompt_tokens += call.prompt_tokens;
            totals.completion_tokens += call.completion_tokens;
            totals.total_tokens += call.total_tokens;
            totals.call_count += 1;
        }
        Ok(totals)
    }

    async fn token_totals_by_model(&self) -> StoreResult<Vec<ModelTokenTotals>> {
        let inner = self.inner.lock().await;
        let mut by_model: std::collections::BTreeMap<String, ModelTokenTotals> = Default::default();
        for call in &inner.llm_calls {
            let entry =
                by_model
                    .entry(call.model_id.clone())
                    .or_insert_with(|| ModelTokenTotals {
                        model_id: call.model_id.clone(),
                        prompt_tokens: 0,
                        completion_tokens: 0,
                        total_tokens: 0,
                        call_count: 0,
                    });
            entry.prompt_tokens += call.prompt_tokens;
            entry.completion_tokens += call.completion_tokens;
            entry.total_tokens += call.total_tokens;
            entry.call_count += 1;
        }
        let mut out: Vec<_> = by_model.into_values().collect();
        out.sort_by(|a, b| b.total_tokens.cmp(&a.total_tokens));
        Ok(out)
    }

    async fn usage_by_directive(&self) -> StoreResult<Vec<DirectiveUsage>> {
        let inner = self.inner.lock().await;
        let mut by_name: std::collections::BTreeMap<String, DirectiveUsage> = Default::default();
        for call in &inner.llm_calls {
            let Some(run) = inner.runs.iter().find(|r| r.id == call.run_id) else {
                continue;
            };
            let name = run.directive_snapshot.name.clone();
            let entry = by_name
                .entry(name.clone())
                .or_insert_with(|| DirectiveUsage {
                    directive_name: name,
                    total_tokens: 0,
                    call_count: 0,
                });
            entry.total_tokens += call.total_tokens;
            entry.call_count += 1;
        }
        let mut out: Vec<_> = by_name.into_values().collect();
        out.sort_by(|a, b| b.total_tokens.cmp(&a.total_tokens));
        Ok(out)
    }

    async fn insert_audit(&self, input: NewAudit) -> StoreResult<WorkerAudit> {
        let mut inner = self.inner.lock().await;
        let audit = WorkerAudit {
            id: Uuid::new_v4(),
            run_id: input.run_id,
            job_id: input.job_id,
            operation: input.operation,
            container_id: input.container_id,
            image: input.image,
            gpu_assigned: input.gpu_assigned,
            gpu_reason: input.gpu_reason,
            config_snapshot: input.config_snapshot,
            success: input.success,
            error_message: input.error_message,
            created_at: Utc::now(),
        };
        inner.audits.push(audit.clone());
        Ok(audit)
    }

    async fn list_audit_for_run(&self, run_id: Uuid) -> StoreResult<Vec<WorkerAudit>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .audits
            .iter()
            .filter(|a| a.run_id == run_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn schedule_input(name: &str, next: DateTime<Utc>) -> NewSchedule {
        NewSchedule {
            name: name.to_string(),
            task_kind: TaskKind::LogTriage,
            directive_id: None,
            custom_directive_text: String::new(),
            enabled: true,
            kind: ScheduleKind::Interval,
            interval_minutes: Some(30),
            cron_expr: None,
            timezone: "UTC".to_string(),
            task3_scope: TaskScope::Allowlist,
            max_global: None,
            max_per_job: None,
            next_run_at: Some(next),
        }
    }

    #[tokio::test]
    async fn claim_is_exclusive_between_racers() {
        let store = Arc::new(MemStore::new());
        let now = Utc::now();
        store
            .create_schedule(schedule_input("s0", now - chrono::Duration::seconds(5)))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            store.claim_due_schedules(now, "proc-a", Duration::from_secs(120), 10),
            store.claim_due_schedules(now, "proc-b", Duration::from_secs(120), 10),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.len() + b.len(), 1, "exactly one claimant wins");
    }

    #[tokio::test]
    async fn expired_claim_can_be_retaken() {
        let store = MemStore::new();
        let now = Utc::now();
        store
            .create_schedule(schedule_input("s0", now - chrono::Duration::seconds(5)))
            .await
            .unwrap();

        let first = store
            .claim_due_schedules(now, "proc-a", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // Before the TTL elapses nobody else can claim it.
        let blocked = store
            .claim_due_schedules(now, "proc-b", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(blocked.is_empty());

        // After expiry the row frees up without any release call.
        let later = now + chrono::Duration::seconds(61);
        let retaken = store
            .claim_due_schedules(later, "proc-b", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert_eq!(retaken.len(), 1);
        assert_eq!(retaken[0].claimed_by, "proc-b");
    }

    #[tokio::test]
    async fn host_slot_gated_by_capacity_and_health() {
        let store = MemStore::new();
        let host = store
            .create_host(NewWorkerHost {
                name: "h0".into(),
                kind: HostKind::LocalSocket,
                endpoint: "unix:///var/run/docker.sock".into(),
                capabilities: HostCapabilities {
                    max_concurrency: 1,
                    ..Default::default()
                },
                ssh: None,
                enabled: true,
            })
            .await
            .unwrap();

        // Hosts start unhealthy until the first successful probe.
        assert!(!store.try_acquire_host_slot(host.id).await.unwrap());

        store
            .set_host_health(host.id, true, Some(Utc::now()))
            .await
            .unwrap();
        assert!(store.try_acquire_host_slot(host.id).await.unwrap());
        assert!(!store.try_acquire_host_slot(host.id).await.unwrap());

        store.release_host_slot(host.id).await.unwrap();
        assert!(store.try_acquire_host_slot(host.id).await.unwrap());
    }

    #[tokio::test]
    async fn terminal_run_cannot_be_resurrected() {
        let store = MemStore::new();
        let snapshot = DirectiveSnapshot::custom("", Utc::now());
        let (run, _jobs) = store
            .create_run_with_jobs(NewRun {
                directive_id: None,
                snapshot,
                approval: ApprovalStatus::None,
                worker_host_id: None,
                tasks: vec![TaskKind::LogTriage],
            })
            .await
            .unwrap();

        let now = Utc::now();
        assert!(store.mark_run_running(run.id, now).await.unwrap());
        assert!(store
            .finish_run(
                run.id,
                RunStatus::Success,
                now,
                "# report",
                &serde_json::json!({}),
                ""
            )
            .await
            .unwrap());

        // Second terminal transition is refused, and cancel is a no-op.
        assert!(!store
            .finish_run(
                run.id,
                RunStatus::Failed,
                now,
                "",
                &serde_json::json!({}),
                "late"
            )
            .await
            .unwrap());
        let after_cancel = store.cancel_run(run.id, now).await.unwrap().unwrap();
        assert_eq!(after_cancel.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn delete_host_refused_with_active_runs() {
        let store = MemStore::new();
        let host = store
            .create_host(NewWorkerHost {
                name: "h1".into(),
                kind: HostKind::LocalSocket,
                endpoint: "unix:///var/run/docker.sock".into(),
                capabilities: HostCapabilities::default(),
                ssh: None,
                enabled: true,
            })
            .await
            .unwrap();
        store
            .set_host_health(host.id, true, Some(Utc::now()))
            .await
            .unwrap();
        assert!(store.try_acquire_host_slot(host.id).await.unwrap());

        let err = store.delete_host(host.id).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store.release_host_slot(host.id).await.unwrap();
        assert!(store.delete_host(host.id).await.unwrap());
    }
}
