//! Run report generation.
//!
//! Rendered once at rollup and stored on the run; both forms carry
//! references and counts only, never worker output.

use chrono::{DateTime, Utc};

use crate::model::{Job, JobStatus, Run, RunArtifact, RunStatus};

/// Terminal status for a run whose jobs are all terminal.
pub fn rollup_status(jobs: &[Job]) -> RunStatus {
    let successes = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Success)
        .count();
    let failures = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Failed)
        .count();
    if failures == 0 {
        RunStatus::Success
    } else if successes == 0 {
        RunStatus::Failed
    } else {
        RunStatus::Partial
    }
}

fn duration_secs(started: Option<DateTime<Utc>>, ended: Option<DateTime<Utc>>) -> i64 {
    match (started, ended) {
        (Some(s), Some(e)) => (e - s).num_seconds().max(0),
        _ => 0,
    }
}

/// Render the markdown report and its structured JSON mirror.
pub fn render(
    run: &Run,
    status: RunStatus,
    jobs: &[Job],
    artifacts: &[RunArtifact],
) -> (String, serde_json::Value) {
    let mut lines = vec![
        format!("# Run {}", run.id),
        String::new(),
        format!("**Status:** {}", status),
        format!("**Directive:** {}", run.directive_snapshot.name),
        format!(
            "**Tokens:** {} total ({} prompt / {} completion)",
            run.total_tokens, run.prompt_tokens, run.completion_tokens
        ),
        String::new(),
        "## Jobs".to_string(),
        String::new(),
    ];

    let mut job_entries = Vec::with_capacity(jobs.len());
    for job in jobs {
        lines.push(format!("### {}: {}", job.kind, job.status));
        lines.push(format!(
            "- Duration: {}s",
            duration_secs(job.started_at, job.ended_at)
        ));
        lines.push(format!("- Tokens: {}", job.total_tokens));
        if !job.error_message.is_empty() {
            lines.push(format!("- Error: {}", job.error_message));
        }
        lines.push(String::new());

        job_entries.push(serde_json::json!({
            "job_id": job.id,
            "kind": job.kind,
            "status": job.status,
            "duration_secs": duration_secs(job.started_at, job.ended_at),
            "tokens": {
                "prompt": job.prompt_tokens,
                "completion": job.completion_tokens,
                "total": job.total_tokens,
            },
            "error": job.error_message,
            "result": job.result,
        }));
    }

    if !artifacts.is_empty() {
        lines.push("## Artifacts".to_string());
        lines.push(String::new());
        for artifact in artifacts {
            lines.push(format!(
                "- `{}` ({}, {} bytes)",
                artifact.path,
                artifact.kind.as_str(),
                artifact.size_bytes
            ));
        }
        lines.push(String::new());
    }

    let markdown = lines.join("\n");
    let json = serde_json::json!({
        "run_id": run.id,
        "status": status,
        "directive": run.directive_snapshot.name,
        "jobs": job_entries,
        "artifacts": artifacts.iter().map(|a| serde_json::json!({
            "path": a.path,
            "kind": a.kind,
            "size_bytes": a.size_bytes,
        })).collect::<Vec<_>>(),
        "tokens": {
            "prompt": run.prompt_tokens,
            "completion": run.completion_tokens,
            "total": run.total_tokens,
        },
    });

    (markdown, json)
}
