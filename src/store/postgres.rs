//! PostgreSQL implementation of [`Store`].
//!
//! All claim and counter primitives are single statements so their atomicity
//! comes from Postgres itself: the schedule claim uses
//! `FOR UPDATE SKIP LOCKED` inside an `UPDATE ... WHERE id IN (...)`, and the
//! host slot counter is a gated `UPDATE ... RETURNING`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, Pool};
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::*;

use super::{
    DirectiveUpdate, DirectiveUsage, GpuSample, ModelTokenTotals, NewAllowlistEntry, NewArtifact,
    NewAudit, NewDirective, NewLlmCall, NewRun, NewSchedule, NewWorkerHost, NewWorkerImage,
    RunFilter, ScheduleUpdate, Store, StoreResult, TokenTotals, WorkerHostUpdate,
};

pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Build a pooled store from a Postgres connection string.
    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pg_config: tokio_postgres::Config = database_url
            .parse()
            .map_err(|e: tokio_postgres::Error| StoreError::Database(e.to_string()))?;
        let manager = Manager::new(pg_config, NoTls);
        let pool = Pool::builder(manager)
            .max_size(16)
            .build()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        super::migrations::migrate(&self.pool).await
    }
}

fn parse<T>(raw: String) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse().map_err(StoreError::Database)
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Database(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Database(e.to_string()))
}

fn directive_from_row(row: &Row) -> Result<Directive, StoreError> {
    Ok(Directive {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        task_config: row.get("task_config"),
        directive_text: row.get("directive_text"),
        task_list: from_json(row.get("task_list"))?,
        approval_required: row.get("approval_required"),
        max_concurrent_runs: row.get("max_concurrent_runs"),
        version: row.get("version"),
        enabled: row.get("enabled"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn run_from_row(row: &Row) -> Result<Run, StoreError> {
    Ok(Run {
        id: row.get("id"),
        directive_id: row.get("directive_id"),
        directive_snapshot: from_json(row.get("directive_snapshot"))?,
        status: parse(row.get("status"))?,
        approval: parse(row.get("approval"))?,
        approved_by: row.get("approved_by"),
        approved_at: row.get("approved_at"),
        worker_host_id: row.get("worker_host_id"),
        prompt_tokens: row.get("prompt_tokens"),
        completion_tokens: row.get("completion_tokens"),
        total_tokens: row.get("total_tokens"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        report_markdown: row.get("report_markdown"),
        report_json: row.get("report_json"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
    })
}

fn job_from_row(row: &Row) -> Result<Job, StoreError> {
    Ok(Job {
        id: row.get("id"),
        run_id: row.get("run_id"),
        kind: parse(row.get("kind"))?,
        status: parse(row.get("status"))?,
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        result: row.get("result"),
        error_message: row.get("error_message"),
        prompt_tokens: row.get("prompt_tokens"),
        completion_tokens: row.get("completion_tokens"),
        total_tokens: row.get("total_tokens"),
        created_at: row.get("created_at"),
    })
}

fn schedule_from_row(row: &Row) -> Result<Schedule, StoreError> {
    Ok(Schedule {
        id: row.get("id"),
        name: row.get("name"),
        task_kind: parse(row.get("task_kind"))?,
        directive_id: row.get("directive_id"),
        custom_directive_text: row.get("custom_directive_text"),
        enabled: row.get("enabled"),
        kind: parse(row.get("kind"))?,
        interval_minutes: row.get("interval_minutes"),
        cron_expr: row.get("cron_expr"),
        timezone: row.get("timezone"),
        task3_scope: parse(row.get("task3_scope"))?,
        max_global: row.get("max_global"),
        max_per_job: row.get("max_per_job"),
        last_run_at: row.get("last_run_at"),
        next_run_at: row.get("next_run_at"),
        claimed_by: row.get("claimed_by"),
        claimed_until: row.get("claimed_until"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn scheduled_run_from_row(row: &Row) -> Result<ScheduledRun, StoreError> {
    Ok(ScheduledRun {
        id: row.get("id"),
        schedule_id: row.get("schedule_id"),
        run_id: row.get("run_id"),
        status: parse(row.get("status"))?,
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        error_summary: row.get("error_summary"),
        created_at: row.get("created_at"),
    })
}

fn host_from_row(row: &Row) -> Result<WorkerHost, StoreError> {
    let ssh: Option<serde_json::Value> = row.get("ssh");
    Ok(WorkerHost {
        id: row.get("id"),
        name: row.get("name"),
        kind: parse(row.get("kind"))?,
        endpoint: row.get("endpoint"),
        capabilities: from_json(row.get("capabilities"))?,
        ssh: ssh.map(from_json).transpose()?,
        enabled: row.get("enabled"),
        healthy: row.get("healthy"),
        active_runs_count: row.get("active_runs_count"),
        last_seen_at: row.get("last_seen_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn allowlist_from_row(row: &Row) -> Result<ContainerAllowlistEntry, StoreError> {
    Ok(ContainerAllowlistEntry {
        container_id: row.get("container_id"),
        container_name: row.get("container_name"),
        description: row.get("description"),
        enabled: row.get("enabled"),
        tags: from_json(row.get("tags"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn image_from_row(row: &Row) -> Result<WorkerImage, StoreError> {
    Ok(WorkerImage {
        id: row.get("id"),
        image: row.get("image"),
        tag: row.get("tag"),
        description: row.get("description"),
        enabled: row.get("enabled"),
        requires_gpu: row.get("requires_gpu"),
        cpu_fallback: row.get("cpu_fallback"),
        min_vram_mb: row.get("min_vram_mb"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn gpu_from_row(row: &Row) -> Result<GpuState, StoreError> {
    Ok(GpuState {
        id: row.get("id"),
        host_id: row.get("host_id"),
        device_index: row.get("device_index"),
        name: row.get("name"),
        total_vram_mb: row.get("total_vram_mb"),
        used_vram_mb: row.get("used_vram_mb"),
        free_vram_mb: row.get("free_vram_mb"),
        utilization_percent: row.get("utilization_percent"),
        available: row.get("available"),
        active_workers: row.get("active_workers"),
        updated_at: row.get("updated_at"),
    })
}

fn artifact_from_row(row: &Row) -> Result<RunArtifact, StoreError> {
    Ok(RunArtifact {
        id: row.get("id"),
        run_id: row.get("run_id"),
        kind: parse(row.get("kind"))?,
        path: row.get("path"),
        size_bytes: row.get("size_bytes"),
        mime_type: row.get("mime_type"),
        created_at: row.get("created_at"),
    })
}

fn llm_call_from_row(row: &Row) -> Result<LlmCall, StoreError> {
    Ok(LlmCall {
        id: row.get("id"),
        run_id: row.get("run_id"),
        job_id: row.get("job_id"),
        model_id: row.get("model_id"),
        endpoint: row.get("endpoint"),
        prompt_tokens: row.get("prompt_tokens"),
        completion_tokens: row.get("completion_tokens"),
        total_tokens: row.get("total_tokens"),
        duration_ms: row.get("duration_ms"),
        success: row.get("success"),
        error_kind: row.get("error_kind"),
        created_at: row.get("created_at"),
    })
}

fn audit_from_row(row: &Row) -> Result<WorkerAudit, StoreError> {
    Ok(WorkerAudit {
        id: row.get("id"),
        run_id: row.get("run_id"),
        job_id: row.get("job_id"),
        operation: parse(row.get("operation"))?,
        container_id: row.get("container_id"),
        image: row.get("image"),
        gpu_assigned: row.get("gpu_assigned"),
        gpu_reason: row.get("gpu_reason"),
        config_snapshot: row.get("config_snapshot"),
        success: row.get("success"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl Store for PgStore {
    // -- Directives --

    async fn create_directive(&self, input: NewDirective) -> StoreResult<Directive> {
        let client = self.pool.get().await?;
        let now = Utc::now();
        let row = client
            .query_one(
                r#"
                INSERT INTO directives (
                    id, name, description, task_config, directive_text, task_list,
                    approval_required, max_concurrent_runs, version, enabled,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1, $9, $10, $10)
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &input.name,
                    &input.description,
                    &input.task_config,
                    &input.directive_text,
                    &to_json(&input.task_list)?,
                    &input.approval_required,
                    &input.max_concurrent_runs,
                    &input.enabled,
                    &now,
                ],
            )
            .await?;
        directive_from_row(&row)
    }

    async fn get_directive(&self, id: Uuid) -> StoreResult<Option<Directive>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT * FROM directives WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(directive_from_row).transpose()
    }

    async fn list_directives(&self) -> StoreResult<Vec<Directive>> {
        let client = self.pool.get().await?;
        let rows = client
            .query("SELECT * FROM directives ORDER BY name", &[])
            .await?;
        rows.iter().map(directive_from_row).collect()
    }

    async fn update_directive(
        &self,
        id: Uuid,
        update: DirectiveUpdate,
    ) -> StoreResult<Option<Directive>> {
        let client = self.pool.get().await?;
        let task_list = update.task_list.as_ref().map(to_json).transpose()?;
        let row = client
            .query_opt(
                r#"
                UPDATE directives SET
                    description = COALESCE($2, description),
                    task_config = COALESCE($3, task_config),
                    directive_text = COALESCE($4, directive_text),
                    task_list = COALESCE($5, task_list),
                    approval_required = COALESCE($6, approval_required),
                    max_concurrent_runs = COALESCE($7, max_concurrent_runs),
                    enabled = COALESCE($8, enabled),
                    version = version + 1,
                    updated_at = $9
                WHERE id = $1
                RETURNING *
                "#,
                &[
                    &id,
                    &update.description,
                    &update.task_config,
                    &update.directive_text,
                    &task_list,
                    &update.approval_required,
                    &update.max_concurrent_runs,
                    &update.enabled,
                    &Utc::now(),
                ],
            )
            .await?;
        row.as_ref().map(directive_from_row).transpose()
    }

    async fn delete_directive(&self, id: Uuid) -> StoreResult<bool> {
        let client = self.pool.get().await?;
        let n = client
            .execute("DELETE FROM directives WHERE id = $1", &[&id])
            .await?;
        Ok(n > 0)
    }

    async fn first_enabled_directive(&self) -> StoreResult<Option<Directive>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT * FROM directives WHERE enabled ORDER BY created_at ASC LIMIT 1",
                &[],
            )
            .await?;
        row.as_ref().map(directive_from_row).transpose()
    }

    // -- Runs and jobs --

    async fn create_run_with_jobs(&self, input: NewRun) -> StoreResult<(Run, Vec<Job>)> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let now = Utc::now();
        let run_id = Uuid::new_v4();

        let run_row = tx
            .query_one(
                r#"
                INSERT INTO runs (id, directive_id, directive_snapshot, status, approval, worker_host_id, created_at)
                VALUES ($1, $2, $3, 'pending', $4, $5, $6)
                RETURNING *
                "#,
                &[
                    &run_id,
                    &input.directive_id,
                    &to_json(&input.snapshot)?,
                    &input.approval.as_str(),
                    &input.worker_host_id,
                    &now,
                ],
            )
            .await?;

        let mut jobs = Vec::with_capacity(input.tasks.len());
        for kind in &input.tasks {
            let job_row = tx
                .query_one(
                    r#"
                    INSERT INTO jobs (id, run_id, kind, status, created_at)
                    VALUES ($1, $2, $3, 'pending', $4)
                    RETURNING *
                    "#,
                    &[&Uuid::new_v4(), &run_id, &kind.as_str(), &now],
                )
                .await?;
            jobs.push(job_from_row(&job_row)?);
        }

        tx.commit().await?;
        Ok((run_from_row(&run_row)?, jobs))
    }

    async fn create_launch(
        &self,
        input: NewRun,
        now: DateTime<Utc>,
    ) -> StoreResult<(Run, Vec<Job>)> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let run_id = Uuid::new_v4();

        let run_row = tx
            .query_one(
                r#"
                INSERT INTO runs (id, directive_id, directive_snapshot, status, approval, worker_host_id, created_at)
                VALUES ($1, $2, $3, 'pending', $4, $5, $6)
                RETURNING *
                "#,
                &[
                    &run_id,
                    &input.directive_id,
                    &to_json(&input.snapshot)?,
                    &input.approval.as_str(),
                    &input.worker_host_id,
                    &now,
                ],
            )
            .await?;

        let mut jobs = Vec::with_capacity(input.tasks.len());
        for kind in &input.tasks {
            let job_row = tx
                .query_one(
                    r#"
                    INSERT INTO jobs (id, run_id, kind, status, created_at)
                    VALUES ($1, $2, $3, 'pending', $4)
                    RETURNING *
                    "#,
                    &[&Uuid::new_v4(), &run_id, &kind.as_str(), &now],
                )
                .await?;
            jobs.push(job_from_row(&job_row)?);

            // One-shot schedule (interval kind, no interval) that the claim
            // loop picks up within one poll period.
            let schedule_id = Uuid::new_v4();
            tx.execute(
                r#"
                INSERT INTO schedules
                    (id, name, task_kind, directive_id, enabled, kind, timezone,
                     task3_scope, next_run_at, created_at, updated_at)
                VALUES ($1, $2, $3, $4, TRUE, 'interval', 'UTC', 'allowlist', $5, $6, $6)
                "#,
                &[
                    &schedule_id,
                    &format!("launch-run-{}-{}", run_id, kind),
                    &kind.as_str(),
                    &input.directive_id,
                    &now,
                    &now,
                ],
            )
            .await?;
            tx.execute(
                r#"
                INSERT INTO scheduled_runs (id, schedule_id, run_id, status, created_at)
                VALUES ($1, $2, $3, 'pending', $4)
                "#,
                &[&Uuid::new_v4(), &schedule_id, &run_id, &now],
            )
            .await?;
        }

        tx.commit().await?;
        Ok((run_from_row(&run_row)?, jobs))
    }

    async fn get_run(&self, id: Uuid) -> StoreResult<Option<Run>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT * FROM runs WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, filter: RunFilter) -> StoreResult<Vec<Run>> {
        let client = self.pool.get().await?;
        let status = filter.status.map(|s| s.as_str().to_string());
        let limit = filter.limit.unwrap_or(100);
        let rows = client
            .query(
                r#"
                SELECT * FROM runs
                WHERE ($1::TEXT IS NULL OR status = $1)
                  AND ($2::TIMESTAMPTZ IS NULL OR created_at >= $2)
                ORDER BY created_at DESC
                LIMIT $3
                "#,
                &[&status, &filter.since, &limit],
            )
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn mark_run_running(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let client = self.pool.get().await?;
        let n = client
            .execute(
                "UPDATE runs SET status = 'running', started_at = $2 WHERE id = $1 AND status = 'pending'",
                &[&id, &now],
            )
            .await?;
        Ok(n > 0)
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
        let client = self.pool.get().await?;
        let n = client
            .execute(
                r#"
                UPDATE runs SET
                    status = $2,
                    started_at = COALESCE(started_at, $3),
                    ended_at = $3,
                    report_markdown = $4,
                    report_json = $5,
                    error_message = $6
                WHERE id = $1 AND status IN ('pending', 'running')
                "#,
                &[
                    &id,
                    &status.as_str(),
                    &now,
                    &report_markdown,
                    &report_json,
                    &error_message,
                ],
            )
            .await?;
        Ok(n > 0)
    }

    async fn cancel_run(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Run>> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE runs SET status = 'cancelled', ended_at = $2
                WHERE id = $1 AND status IN ('pending', 'running')
                "#,
                &[&id, &now],
            )
            .await?;
        self.get_run(id).await
    }

    async fn set_run_host(&self, id: Uuid, host_id: Uuid) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE runs SET worker_host_id = $2 WHERE id = $1",
                &[&id, &host_id],
            )
            .await?;
        Ok(())
    }

    async fn set_run_approval(
        &self,
        id: Uuid,
        approval: ApprovalStatus,
        approver: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Run>> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE runs SET approval = $2, approved_by = $3, approved_at = $4
                WHERE id = $1 AND approval = 'pending'
                "#,
                &[&id, &approval.as_str(), &approver, &now],
            )
            .await?;
        self.get_run(id).await
    }

    async fn add_run_tokens(
        &self,
        id: Uuid,
        prompt: i64,
        completion: i64,
        total: i64,
    ) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE runs SET
                    prompt_tokens = prompt_tokens + $2,
                    completion_tokens = completion_tokens + $3,
                    total_tokens = total_tokens + $4
                WHERE id = $1
                "#,
                &[&id, &prompt, &completion, &total],
            )
            .await?;
        Ok(())
    }

    async fn last_successful_run(&self) -> StoreResult<Option<Run>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT * FROM runs WHERE status = 'success' ORDER BY ended_at DESC NULLS LAST LIMIT 1",
                &[],
            )
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn runs_since(&self, cutoff: DateTime<Utc>, exclude: Uuid) -> StoreResult<Vec<Run>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT * FROM runs
                WHERE (ended_at > $1 OR ended_at IS NULL) AND id <> $2
                ORDER BY created_at DESC
                "#,
                &[&cutoff, &exclude],
            )
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn count_running_runs(&self) -> StoreResult<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one("SELECT COUNT(*) FROM runs WHERE status = 'running'", &[])
            .await?;
        Ok(row.get(0))
    }

    async fn count_running_runs_of_kind(&self, kind: TaskKind) -> StoreResult<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                r#"
                SELECT COUNT(DISTINCT r.id) FROM runs r
                JOIN jobs j ON j.run_id = r.id
                WHERE r.status = 'running' AND j.kind = $1
                "#,
                &[&kind.as_str()],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn list_jobs(&self, run_id: Uuid) -> StoreResult<Vec<Job>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT * FROM jobs WHERE run_id = $1 ORDER BY created_at, id",
                &[&run_id],
            )
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn mark_job_running(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let client = self.pool.get().await?;
        let n = client
            .execute(
                "UPDATE jobs SET status = 'running', started_at = $2 WHERE id = $1 AND status = 'pending'",
                &[&id, &now],
            )
            .await?;
        Ok(n > 0)
    }

    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        now: DateTime<Utc>,
        result: &serde_json::Value,
        error_message: &str,
    ) -> StoreResult<bool> {
        let client = self.pool.get().await?;
        let n = client
            .execute(
                r#"
                UPDATE jobs SET
                    status = $2,
                    started_at = COALESCE(started_at, $3),
                    ended_at = $3,
                    result = $4,
                    error_message = $5
                WHERE id = $1 AND status IN ('pending', 'running')
                "#,
                &[&id, &status.as_str(), &now, &result, &error_message],
            )
            .await?;
        Ok(n > 0)
    }

    async fn add_job_tokens(
        &self,
        id: Uuid,
        prompt: i64,
        completion: i64,
        total: i64,
    ) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE jobs SET
                    prompt_tokens = prompt_tokens + $2,
                    completion_tokens = completion_tokens + $3,
                    total_tokens = total_tokens + $4
                WHERE id = $1
                "#,
                &[&id, &prompt, &completion, &total],
            )
            .await?;
        Ok(())
    }

    // -- Schedules --

    async fn create_schedule(&self, input: NewSchedule) -> StoreResult<Schedule> {
        let client = self.pool.get().await?;
        let now = Utc::now();
        let row = client
            .query_one(
                r#"
                INSERT INTO schedules (
                    id, name, task_kind, directive_id, custom_directive_text, enabled,
                    kind, interval_minutes, cron_expr, timezone, task3_scope,
                    max_global, max_per_job, next_run_at, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $15)
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &input.name,
                    &input.task_kind.as_str(),
                    &input.directive_id,
                    &input.custom_directive_text,
                    &input.enabled,
                    &input.kind.as_str(),
                    &input.interval_minutes,
                    &input.cron_expr,
                    &input.timezone,
                    &input.task3_scope.as_str(),
                    &input.max_global,
                    &input.max_per_job,
                    &input.next_run_at,
                    &now,
                ],
            )
            .await?;
        schedule_from_row(&row)
    }

    async fn get_schedule(&self, id: Uuid) -> StoreResult<Option<Schedule>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT * FROM schedules WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn list_schedules(&self) -> StoreResult<Vec<Schedule>> {
        let client = self.pool.get().await?;
        let rows = client
            .query("SELECT * FROM schedules ORDER BY name", &[])
            .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn update_schedule(
        &self,
        id: Uuid,
        update: ScheduleUpdate,
    ) -> StoreResult<Option<Schedule>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                r#"
                UPDATE schedules SET
                    enabled = COALESCE($2, enabled),
                    interval_minutes = CASE WHEN $3 THEN $4 ELSE interval_minutes END,
                    cron_expr = CASE WHEN $5 THEN $6 ELSE cron_expr END,
                    timezone = COALESCE($7, timezone),
                    task3_scope = COALESCE($8, task3_scope),
                    max_global = CASE WHEN $9 THEN $10 ELSE max_global END,
                    max_per_job = CASE WHEN $11 THEN $12 ELSE max_per_job END,
                    next_run_at = CASE WHEN $13 THEN $14 ELSE next_run_at END,
                    updated_at = $15
                WHERE id = $1
                RETURNING *
                "#,
                &[
                    &id,
                    &update.enabled,
                    &update.interval_minutes.is_some(),
                    &update.interval_minutes.flatten(),
                    &update.cron_expr.is_some(),
                    &update.cron_expr.clone().flatten(),
                    &update.timezone,
                    &update.task3_scope.map(|s| s.as_str().to_string()),
                    &update.max_global.is_some(),
                    &update.max_global.flatten(),
                    &update.max_per_job.is_some(),
                    &update.max_per_job.flatten(),
                    &update.next_run_at.is_some(),
                    &update.next_run_at.flatten(),
                    &Utc::now(),
                ],
            )
            .await?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn delete_schedule(&self, id: Uuid) -> StoreResult<bool> {
        let client = self.pool.get().await?;
        let n = client
            .execute("DELETE FROM schedules WHERE id = $1", &[&id])
            .await?;
        Ok(n > 0)
    }

    async fn claim_due_schedules(
        &self,
        now: DateTime<Utc>,
        claimant: &str,
        ttl: Duration,
        limit: i64,
    ) -> StoreResult<Vec<Schedule>> {
        let client = self.pool.get().await?;
        let until = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(120));
        let rows = client
            .query(
                r#"
                UPDATE schedules SET claimed_by = $1, claimed_until = $2, updated_at = $3
                WHERE id IN (
                    SELECT id FROM schedules
                    WHERE enabled
                      AND next_run_at IS NOT NULL
                      AND next_run_at <= $3
                      AND (claimed_until IS NULL OR claimed_until <= $3)
                    ORDER BY next_run_at ASC
                    LIMIT $4
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING *
                "#,
                &[&claimant, &until, &now, &limit],
            )
            .await?;
        let mut claimed: Vec<Schedule> = rows
            .iter()
            .map(schedule_from_row)
            .collect::<Result<_, _>>()?;
        claimed.sort_by_key(|s| s.next_run_at);
        Ok(claimed)
    }

    async fn release_schedule_claim(&self, id: Uuid) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE schedules SET claimed_by = '', claimed_until = NULL WHERE id = $1",
                &[&id],
            )
            .await?;
        Ok(())
    }

    async fn record_schedule_run(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE schedules SET last_run_at = $2, next_run_at = $3, updated_at = $2
                WHERE id = $1
                "#,
                &[&id, &last_run_at, &next_run_at],
            )
            .await?;
        Ok(())
    }

    async fn defer_schedule(&self, id: Uuid, until: DateTime<Utc>) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE schedules SET next_run_at = $2, updated_at = NOW() WHERE id = $1",
                &[&id, &until],
            )
            .await?;
        Ok(())
    }

    async fn create_scheduled_run(
        &self,
        schedule_id: Uuid,
        run_id: Uuid,
        status: ScheduledRunStatus,
    ) -> StoreResult<ScheduledRun> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                r#"
                INSERT INTO scheduled_runs (id, schedule_id, run_id, status, created_at)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &schedule_id,
                    &run_id,
                    &status.as_str(),
                    &Utc::now(),
                ],
            )
            .await?;
        scheduled_run_from_row(&row)
    }

    async fn pending_scheduled_run(&self, schedule_id: Uuid) -> StoreResult<Option<ScheduledRun>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                r#"
                SELECT * FROM scheduled_runs
                WHERE schedule_id = $1 AND status = 'pending'
                ORDER BY created_at ASC
                LIMIT 1
                "#,
                &[&schedule_id],
            )
            .await?;
        row.as_ref().map(scheduled_run_from_row).transpose()
    }

    async fn mark_scheduled_run_started(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE scheduled_runs SET status = 'started', started_at = $2 WHERE id = $1",
                &[&id, &now],
            )
            .await?;
        Ok(())
    }

    async fn finish_scheduled_run(
        &self,
        id: Uuid,
        status: ScheduledRunStatus,
        now: DateTime<Utc>,
        error_summary: &str,
    ) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE scheduled_runs SET status = $2, finished_at = $3, error_summary = $4
                WHERE id = $1
                "#,
                &[&id, &status.as_str(), &now, &error_summary],
            )
            .await?;
        Ok(())
    }

    async fn schedule_history(
        &self,
        schedule_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<ScheduledRun>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT * FROM scheduled_runs
                WHERE schedule_id = $1
                ORDER BY created_at DESC
                LIMIT $2
                "#,
                &[&schedule_id, &limit],
            )
            .await?;
        rows.iter().map(scheduled_run_from_row).collect()
    }

    // -- Worker hosts --

    async fn create_host(&self, input: NewWorkerHost) -> StoreResult<WorkerHost> {
        let client = self.pool.get().await?;
        let ssh = input.ssh.as_ref().map(to_json).transpose()?;
        let row = client
            .query_one(
                r#"
                INSERT INTO worker_hosts (
                    id, name, kind, endpoint, capabilities, ssh, enabled, healthy,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, $8, $8)
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &input.name,
                    &input.kind.as_str(),
                    &input.endpoint,
                    &to_json(&input.capabilities)?,
                    &ssh,
                    &input.enabled,
                    &Utc::now(),
                ],
            )
            .await?;
        host_from_row(&row)
    }

    async fn get_host(&self, id: Uuid) -> StoreResult<Option<WorkerHost>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT * FROM worker_hosts WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(host_from_row).transpose()
    }

    async fn list_hosts(&self) -> StoreResult<Vec<WorkerHost>> {
        let client = self.pool.get().await?;
        let rows = client
            .query("SELECT * FROM worker_hosts ORDER BY name", &[])
            .await?;
        rows.iter().map(host_from_row).collect()
    }

    async fn update_host(
        &self,
        id: Uuid,
        update: WorkerHostUpdate,
    ) -> StoreResult<Option<WorkerHost>> {
        let client = self.pool.get().await?;
        let capabilities = update.capabilities.as_ref().map(to_json).transpose()?;
        let ssh_value = match &update.ssh {
            Some(Some(cfg)) => Some(to_json(cfg)?),
            _ => None,
        };
        let row = client
            .query_opt(
                r#"
                UPDATE worker_hosts SET
                    name = COALESCE($2, name),
                    endpoint = COALESCE($3, endpoint),
                    capabilities = COALESCE($4, capabilities),
                    ssh = CASE WHEN $5 THEN $6 ELSE ssh END,
                    enabled = COALESCE($7, enabled),
                    updated_at = $8
                WHERE id = $1
                RETURNING *
                "#,
                &[
                    &id,
                    &update.name,
                    &update.endpoint,
                    &capabilities,
                    &update.ssh.is_some(),
                    &ssh_value,
                    &update.enabled,
                    &Utc::now(),
                ],
            )
            .await?;
        row.as_ref().map(host_from_row).transpose()
    }

    async fn delete_host(&self, id: Uuid) -> StoreResult<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT active_runs_count FROM worker_hosts WHERE id = $1",
                &[&id],
            )
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let active: i32 = row.get(0);
        if active > 0 {
            return Err(StoreError::Conflict(format!(
                "host has {} active runs",
                active
            )));
        }
        let n = client
            .execute("DELETE FROM worker_hosts WHERE id = $1", &[&id])
            .await?;
        Ok(n > 0)
    }

    async fn try_acquire_host_slot(&self, id: Uuid) -> StoreResult<bool> {
        let client = self.pool.get().await?;
        let n = client
            .execute(
                r#"
                UPDATE worker_hosts SET active_runs_count = active_runs_count + 1, updated_at = NOW()
                WHERE id = $1 AND enabled AND healthy
                  AND active_runs_count <
                      COALESCE(NULLIF(capabilities->>'max_concurrency', '')::INTEGER, 5)
                "#,
                &[&id],
            )
            .await?;
        Ok(n > 0)
    }

    async fn release_host_slot(&self, id: Uuid) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE worker_hosts
                SET active_runs_count = GREATEST(active_runs_count - 1, 0), updated_at = NOW()
                WHERE id = $1
                "#,
                &[&id],
            )
            .await?;
        Ok(())
    }

    async fn set_host_health(
        &self,
        id: Uuid,
        healthy: bool,
        seen_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE worker_hosts SET
                    healthy = $2,
                    last_seen_at = COALESCE($3, last_seen_at),
                    updated_at = NOW()
                WHERE id = $1
                "#,
                &[&id, &healthy, &seen_at],
            )
            .await?;
        Ok(())
    }

    async fn touch_host(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE worker_hosts SET last_seen_at = $2, updated_at = $2 WHERE id = $1",
                &[&id, &now],
            )
            .await?;
        Ok(())
    }

    async fn mark_stale_hosts_unhealthy(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let client = self.pool.get().await?;
        let n = client
            .execute(
                r#"
                UPDATE worker_hosts SET healthy = FALSE, updated_at = NOW()
                WHERE enabled AND healthy AND (last_seen_at IS NULL OR last_seen_at < $1)
                "#,
                &[&cutoff],
            )
            .await?;
        Ok(n)
    }

    // -- Allowlists --

    async fn upsert_allowlist_entry(
        &self,
        input: NewAllowlistEntry,
    ) -> StoreResult<ContainerAllowlistEntry> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                r#"
                INSERT INTO container_allowlist
                    (container_id, container_name, description, enabled, tags, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $6)
                ON CONFLICT (container_id) DO UPDATE SET
                    container_name = EXCLUDED.container_name,
                    description = EXCLUDED.description,
                    enabled = EXCLUDED.enabled,
                    tags = EXCLUDED.tags,
                    updated_at = EXCLUDED.updated_at
                RETURNING *
                "#,
                &[
                    &input.container_id,
                    &input.container_name,
                    &input.description,
                    &input.enabled,
                    &to_json(&input.tags)?,
                    &Utc::now(),
                ],
            )
            .await?;
        allowlist_from_row(&row)
    }

    async fn get_allowlist_entry(
        &self,
        container_id: &str,
    ) -> StoreResult<Option<ContainerAllowlistEntry>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT * FROM container_allowlist WHERE container_id = $1",
                &[&container_id],
            )
            .await?;
        row.as_ref().map(allowlist_from_row).transpose()
    }

    async fn list_allowlist(
        &self,
        enabled_only: bool,
    ) -> StoreResult<Vec<ContainerAllowlistEntry>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT * FROM container_allowlist
                WHERE (NOT $1) OR enabled
                ORDER BY container_name
                "#,
                &[&enabled_only],
            )
            .await?;
        rows.iter().map(allowlist_from_row).collect()
    }

    async fn delete_allowlist_entry(&self, container_id: &str) -> StoreResult<bool> {
        let client = self.pool.get().await?;
        let n = client
            .execute(
                "DELETE FROM container_allowlist WHERE container_id = $1",
                &[&container_id],
            )
            .await?;
        Ok(n > 0)
    }

    async fn create_worker_image(&self, input: NewWorkerImage) -> StoreResult<WorkerImage> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                r#"
                INSERT INTO worker_images
                    (id, image, tag, description, enabled, requires_gpu, cpu_fallback,
                     min_vram_mb, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
                ON CONFLICT (image, tag) DO UPDATE SET
                    description = EXCLUDED.description,
                    enabled = EXCLUDED.enabled,
                    requires_gpu = EXCLUDED.requires_gpu,
                    cpu_fallback = EXCLUDED.cpu_fallback,
                    min_vram_mb = EXCLUDED.min_vram_mb,
                    updated_at = EXCLUDED.updated_at
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &input.image,
                    &input.tag,
                    &input.description,
                    &input.enabled,
                    &input.requires_gpu,
                    &input.cpu_fallback,
                    &input.min_vram_mb,
                    &Utc::now(),
                ],
            )
            .await?;
        image_from_row(&row)
    }

    async fn find_worker_image(&self, image: &str, tag: &str) -> StoreResult<Option<WorkerImage>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT * FROM worker_images WHERE image = $1 AND tag = $2",
                &[&image, &tag],
            )
            .await?;
        row.as_ref().map(image_from_row).transpose()
    }

    async fn list_worker_images(&self) -> StoreResult<Vec<WorkerImage>> {
        let client = self.pool.get().await?;
        let rows = client
            .query("SELECT * FROM worker_images ORDER BY image, tag", &[])
            .await?;
        rows.iter().map(image_from_row).collect()
    }

    async fn delete_worker_image(&self, id: Uuid) -> StoreResult<bool> {
        let client = self.pool.get().await?;
        let n = client
            .execute("DELETE FROM worker_images WHERE id = $1", &[&id])
            .await?;
        Ok(n > 0)
    }

    // -- GPU state --

    async fn upsert_gpu_state(&self, sample: GpuSample) -> StoreResult<GpuState> {
        let client = self.pool.get().await?;
        // active_workers is owned by the dispatcher and survives telemetry
        // refreshes.
        let row = client
            .query_one(
                r#"
                INSERT INTO gpu_states
                    (id, host_id, device_index, name, total_vram_mb, used_vram_mb,
                     free_vram_mb, utilization_percent, available, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (host_id, device_index) DO UPDATE SET
                    name = EXCLUDED.name,
                    total_vram_mb = EXCLUDED.total_vram_mb,
                    used_vram_mb = EXCLUDED.used_vram_mb,
                    free_vram_mb = EXCLUDED.free_vram_mb,
                    utilization_percent = EXCLUDED.utilization_percent,
                    available = EXCLUDED.available,
                    updated_at = EXCLUDED.updated_at
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &sample.host_id,
                    &sample.device_index,
                    &sample.name,
                    &sample.total_vram_mb,
                    &sample.used_vram_mb,
                    &sample.free_vram_mb,
                    &sample.utilization_percent,
                    &sample.available,
                    &Utc::now(),
                ],
            )
            .await?;
        gpu_from_row(&row)
    }

    async fn list_gpu_states(&self, host_id: Option<Uuid>) -> StoreResult<Vec<GpuState>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT * FROM gpu_states
                WHERE $1::UUID IS NULL OR host_id = $1
                ORDER BY host_id, device_index
                "#,
                &[&host_id],
            )
            .await?;
        rows.iter().map(gpu_from_row).collect()
    }

    async fn adjust_gpu_workers(
        &self,
        host_id: Uuid,
        device_index: i32,
        delta: i32,
    ) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE gpu_states
                SET active_workers = GREATEST(active_workers + $3, 0), updated_at = NOW()
                WHERE host_id = $1 AND device_index = $2
                "#,
                &[&host_id, &device_index, &delta],
            )
            .await?;
        Ok(())
    }

    // -- Artifacts, telemetry, audit --

    async fn insert_artifact(&self, input: NewArtifact) -> StoreResult<RunArtifact> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                r#"
                INSERT INTO run_artifacts (id, run_id, kind, path, size_bytes, mime_type, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &input.run_id,
                    &input.kind.as_str(),
                    &input.path,
                    &input.size_bytes,
                    &input.mime_type,
                    &Utc::now(),
                ],
            )
            .await?;
        artifact_from_row(&row)
    }

    async fn list_artifacts(&self, run_id: Uuid) -> StoreResult<Vec<RunArtifact>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT * FROM run_artifacts WHERE run_id = $1 ORDER BY created_at, path",
                &[&run_id],
            )
            .await?;
        rows.iter().map(artifact_from_row).collect()
    }

    async fn get_artifact(&self, id: Uuid) -> StoreResult<Option<RunArtifact>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT * FROM run_artifacts WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(artifact_from_row).transpose()
    }

    async fn insert_llm_call(&self, input: NewLlmCall) -> StoreResult<LlmCall> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                r#"
                INSERT INTO llm_calls
                    (id, run_id, job_id, model_id, endpoint, prompt_tokens,
                     completion_tokens, total_tokens, duration_ms, success, error_kind,
                     created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &input.run_id,
                    &input.job_id,
                    &input.model_id,
                    &input.endpoint,
                    &input.prompt_tokens,
                    &input.completion_tokens,
                    &input.total_tokens,
                    &input.duration_ms,
                    &input.success,
                    &input.error_kind,
                    &Utc::now(),
                ],
            )
            .await?;
        llm_call_from_row(&row)
    }

    async fn list_llm_calls(&self, run_id: Uuid) -> StoreResult<Vec<LlmCall>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT * FROM llm_calls WHERE run_id = $1 ORDER BY created_at",
                &[&run_id],
            )
            .await?;
        rows.iter().map(llm_call_from_row).collect()
    }

    async fn token_totals(&self) -> StoreResult<TokenTotals> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                r#"
                SELECT
                    COALESCE(SUM(prompt_tokens), 0)::BIGINT,
                    COALESCE(SUM(completion_tokens), 0)::BIGINT,
                    COALESCE(SUM(total_tokens), 0)::BIGINT,
                    COUNT(*)
                FROM llm_calls
                "#,
                &[],
            )
            .await?;
        Ok(TokenTotals {
            prompt_tokens: row.get(0),
            completion_tokens: row.get(1),
            total_tokens: row.get(2),
            call_count: row.get(3),
        })
    }

    async fn token_totals_by_model(&self) -> StoreResult<Vec<ModelTokenTotals>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT
                    model_id,
                    COALESCE(SUM(prompt_tokens), 0)::BIGINT,
                    COALESCE(SUM(completion_tokens), 0)::BIGINT,
                    COALESCE(SUM(total_tokens), 0)::BIGINT,
                    COUNT(*)
                FROM llm_calls
                GROUP BY model_id
                ORDER BY 4 DESC
                "#,
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| ModelTokenTotals {
                model_id: row.get(0),
                prompt_tokens: row.get(1),
                completion_tokens: row.get(2),
                total_tokens: row.get(3),
                call_count: row.get(4),
            })
            .collect())
    }

    async fn usage_by_directive(&self) -> StoreResult<Vec<DirectiveUsage>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT
                    r.directive_snapshot->>'name',
                    COALESCE(SUM(l.total_tokens), 0)::BIGINT,
                    COUNT(l.id)
                FROM llm_calls l
                JOIN runs r ON r.id = l.run_id
                GROUP BY 1
                ORDER BY 2 DESC
                "#,
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| DirectiveUsage {
                directive_name: row.get::<_, Option<String>>(0).unwrap_or_default(),
                total_tokens: row.get(1),
                call_count: row.get(2),
            })
            .collect())
    }

    async fn insert_audit(&self, input: NewAudit) -> StoreResult<WorkerAudit> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                r#"
                INSERT INTO worker_audits
                    (id, run_id, job_id, operation, container_id, image, gpu_assigned,
                     gpu_reason, config_snapshot, success, error_message, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &input.run_id,
                    &input.job_id,
                    &input.operation.as_str(),
                    &input.container_id,
                    &input.image,
                    &input.gpu_assigned,
                    &input.gpu_reason,
                    &input.config_snapshot,
                    &input.success,
                    &input.error_message,
                    &Utc::now(),
                ],
            )
            .await?;
        audit_from_row(&row)
    }

    async fn list_audit_for_run(&self, run_id: Uuid) -> StoreResult<Vec<WorkerAudit>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT * FROM worker_audits WHERE run_id = $1 ORDER BY created_at",
                &[&run_id],
            )
            .await?;
        rows.iter().map(audit_from_row).collect()
    }
}
