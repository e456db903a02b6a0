//! Embedded schema migrations.
//!
//! The schema is small enough to keep as one idempotent batch; `migrate`
//! runs it at startup and via the `dockhand migrate` subcommand.

use deadpool_postgres::Pool;

use crate::error::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS directives (
    id                  UUID PRIMARY KEY,
    name                TEXT NOT NULL UNIQUE,
    description         TEXT NOT NULL DEFAULT '',
    task_config         JSONB NOT NULL DEFAULT '{}',
    directive_text      TEXT NOT NULL DEFAULT '',
    task_list           JSONB NOT NULL DEFAULT '[]',
    approval_required   BOOLEAN NOT NULL DEFAULT FALSE,
    max_concurrent_runs INTEGER NOT NULL DEFAULT 5,
    version             INTEGER NOT NULL DEFAULT 1,
    enabled             BOOLEAN NOT NULL DEFAULT TRUE,
    created_at          TIMESTAMPTZ NOT NULL,
    updated_at          TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    id                  UUID PRIMARY KEY,
    directive_id        UUID,
    directive_snapshot  JSONB NOT NULL,
    status              TEXT NOT NULL DEFAULT 'pending',
    approval            TEXT NOT NULL DEFAULT 'none',
    approved_by         TEXT,
    approved_at         TIMESTAMPTZ,
    worker_host_id      UUID,
    prompt_tokens       BIGINT NOT NULL DEFAULT 0,
    completion_tokens   BIGINT NOT NULL DEFAULT 0,
    total_tokens        BIGINT NOT NULL DEFAULT 0,
    started_at          TIMESTAMPTZ,
    ended_at            TIMESTAMPTZ,
    report_markdown     TEXT NOT NULL DEFAULT '',
    report_json         JSONB NOT NULL DEFAULT '{}',
    error_message       TEXT NOT NULL DEFAULT '',
    created_at          TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_status_ended ON runs (status, ended_at DESC);
CREATE INDEX IF NOT EXISTS idx_runs_created ON runs (created_at DESC);

CREATE TABLE IF NOT EXISTS jobs (
    id                UUID PRIMARY KEY,
    run_id            UUID NOT NULL REFERENCES runs (id) ON DELETE CASCADE,
    kind              TEXT NOT NULL,
    status            TEXT NOT NULL DEFAULT 'pending',
    started_at        TIMESTAMPTZ,
    ended_at          TIMESTAMPTZ,
    result            JSONB NOT NULL DEFAULT '{}',
    error_message     TEXT NOT NULL DEFAULT '',
    prompt_tokens     BIGINT NOT NULL DEFAULT 0,
    completion_tokens BIGINT NOT NULL DEFAULT 0,
    total_tokens      BIGINT NOT NULL DEFAULT 0,
    created_at        TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_run ON jobs (run_id, status);
CREATE INDEX IF NOT EXISTS idx_jobs_kind_status_ended ON jobs (kind, status, ended_at DESC);

CREATE TABLE IF NOT EXISTS schedules (
    id                    UUID PRIMARY KEY,
    name                  TEXT NOT NULL UNIQUE,
    task_kind             TEXT NOT NULL,
    directive_id          UUID,
    custom_directive_text TEXT NOT NULL DEFAULT '',
    enabled               BOOLEAN NOT NULL DEFAULT TRUE,
    kind                  TEXT NOT NULL,
    interval_minutes      BIGINT,
    cron_expr             TEXT,
    timezone              TEXT NOT NULL DEFAULT 'UTC',
    task3_scope           TEXT NOT NULL DEFAULT 'allowlist',
    max_global            INTEGER,
    max_per_job           INTEGER,
    last_run_at           TIMESTAMPTZ,
    next_run_at           TIMESTAMPTZ,
    claimed_by            TEXT NOT NULL DEFAULT '',
    claimed_until         TIMESTAMPTZ,
    created_at            TIMESTAMPTZ NOT NULL,
    updated_at            TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules (enabled, next_run_at);
CREATE INDEX IF NOT EXISTS idx_schedules_claim ON schedules (claimed_until);

CREATE TABLE IF NOT EXISTS scheduled_runs (
    id            UUID PRIMARY KEY,
    schedule_id   UUID NOT NULL REFERENCES schedules (id) ON DELETE CASCADE,
    run_id        UUID NOT NULL REFERENCES runs (id) ON DELETE CASCADE,
    status        TEXT NOT NULL DEFAULT 'pending',
    started_at    TIMESTAMPTZ,
    finished_at   TIMESTAMPTZ,
    error_summary TEXT NOT NULL DEFAULT '',
    created_at    TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scheduled_runs_schedule
    ON scheduled_runs (schedule_id, created_at DESC);

CREATE TABLE IF NOT EXISTS worker_hosts (
    id                UUID PRIMARY KEY,
    name              TEXT NOT NULL UNIQUE,
    kind              TEXT NOT NULL,
    endpoint          TEXT NOT NULL,
    capabilities      JSONB NOT NULL DEFAULT '{}',
    ssh               JSONB,
    enabled           BOOLEAN NOT NULL DEFAULT TRUE,
    healthy           BOOLEAN NOT NULL DEFAULT FALSE,
    active_runs_count INTEGER NOT NULL DEFAULT 0,
    last_seen_at      TIMESTAMPTZ,
    created_at        TIMESTAMPTZ NOT NULL,
    updated_at        TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_hosts_routing ON worker_hosts (enabled, healthy, last_seen_at DESC);

CREATE TABLE IF NOT EXISTS container_allowlist (
    container_id   TEXT PRIMARY KEY,
    container_name TEXT NOT NULL,
    description    TEXT NOT NULL DEFAULT '',
    enabled        BOOLEAN NOT NULL DEFAULT TRUE,
    tags           JSONB NOT NULL DEFAULT '[]',
    created_at     TIMESTAMPTZ NOT NULL,
    updated_at     TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS worker_images (
    id           UUID PRIMARY KEY,
    image        TEXT NOT NULL,
    tag          TEXT NOT NULL DEFAULT 'latest',
    description  TEXT NOT NULL DEFAULT '',
    enabled      BOOLEAN NOT NULL DEFAULT TRUE,
    requires_gpu BOOLEAN NOT NULL DEFAULT FALSE,
    cpu_fallback BOOLEAN NOT NULL DEFAULT FALSE,
    min_vram_mb  INTEGER NOT NULL DEFAULT 0,
    created_at   TIMESTAMPTZ NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL,
    UNIQUE (image, tag)
);

CREATE TABLE IF NOT EXISTS gpu_states (
    id                  UUID PRIMARY KEY,
    host_id             UUID NOT NULL REFERENCES worker_hosts (id) ON DELETE CASCADE,
    device_index        INTEGER NOT NULL,
    name                TEXT NOT NULL DEFAULT '',
    total_vram_mb       INTEGER NOT NULL DEFAULT 0,
    used_vram_mb        INTEGER NOT NULL DEFAULT 0,
    free_vram_mb        INTEGER NOT NULL DEFAULT 0,
    utilization_percent DOUBLE PRECISION NOT NULL DEFAULT 0,
    available           BOOLEAN NOT NULL DEFAULT TRUE,
    active_workers      INTEGER NOT NULL DEFAULT 0,
    updated_at          TIMESTAMPTZ NOT NULL,
    UNIQUE (host_id, device_index)
);

CREATE TABLE IF NOT EXISTS run_artifacts (
    id         UUID PRIMARY KEY,
    run_id     UUID NOT NULL REFERENCES runs (id) ON DELETE CASCADE,
    kind       TEXT NOT NULL,
    path       TEXT NOT NULL,
    size_bytes BIGINT NOT NULL DEFAULT 0,
    mime_type  TEXT NOT NULL DEFAULT '',
    created_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_artifacts_run ON run_artifacts (run_id, created_at DESC);

CREATE TABLE IF NOT EXISTS llm_calls (
    id                UUID PRIMARY KEY,
    run_id            UUID NOT NULL REFERENCES runs (id) ON DELETE CASCADE,
    job_id            UUID NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
    model_id          TEXT NOT NULL,
    endpoint          TEXT NOT NULL DEFAULT '',
    prompt_tokens     BIGINT NOT NULL DEFAULT 0,
    completion_tokens BIGINT NOT NULL DEFAULT 0,
    total_tokens      BIGINT NOT NULL DEFAULT 0,
    duration_ms       BIGINT NOT NULL DEFAULT 0,
    success           BOOLEAN NOT NULL DEFAULT TRUE,
    error_kind        TEXT NOT NULL DEFAULT '',
    created_at        TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_llm_calls_job_model ON llm_calls (job_id, model_id);
CREATE INDEX IF NOT EXISTS idx_llm_calls_run ON llm_calls (run_id);

CREATE TABLE IF NOT EXISTS worker_audits (
    id              UUID PRIMARY KEY,
    run_id          UUID NOT NULL REFERENCES runs (id) ON DELETE CASCADE,
    job_id          UUID,
    operation       TEXT NOT NULL,
    container_id    TEXT NOT NULL DEFAULT '',
    image           TEXT NOT NULL DEFAULT '',
    gpu_assigned    TEXT NOT NULL DEFAULT '',
    gpu_reason      TEXT NOT NULL DEFAULT '',
    config_snapshot JSONB NOT NULL DEFAULT '{}',
    success         BOOLEAN NOT NULL DEFAULT TRUE,
    error_message   TEXT NOT NULL DEFAULT '',
    created_at      TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audits_run ON worker_audits (run_id, created_at);
"#;

/// Apply the embedded schema. Idempotent.
pub async fn migrate(pool: &Pool) -> Result<(), StoreError> {
    let client = pool.get().await?;
    client.batch_execute(SCHEMA).await?;
    tracing::info!("schema migrations applied");
    Ok(())
}
