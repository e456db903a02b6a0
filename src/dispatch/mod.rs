//! Worker dispatcher: runs each job of a run in an ephemeral container.
//!
//! For every job the dispatcher checks the image allowlist, places the work
//! on a GPU (or CPU), spawns the container with the fixed mount policy,
//! waits for exit under the directive's timeout, ingests artifact metadata
//! and the telemetry sidecar, and writes audit rows. Jobs fail
//! independently; the run rolls up to success/failed/partial afterwards.

pub mod docker;
pub mod gpu;
pub mod ingest;
pub mod report;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::OrchestratorError;
use crate::model::{
    AuditOperation, Job, JobStatus, Run, RunStatus, TaskKind, WorkerHost, WorkerImage,
};
use crate::safety::Redactor;
use crate::scheduler::RunExecutor;
use crate::store::{NewAudit, NewLlmCall, Store};

use self::docker::{build_container_spec, connect_host, ContainerHandle};
use self::gpu::GpuPlacement;

pub struct WorkerDispatcher {
    store: Arc<dyn Store>,
    tunnels: Arc<crate::hosts::TunnelManager>,
    artifact_root: PathBuf,
    upload_root: Option<PathBuf>,
    connect_timeout: Duration,
    default_job_timeout: Duration,
    redactor: Option<Arc<Redactor>>,
}

impl WorkerDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        tunnels: Arc<crate::hosts::TunnelManager>,
        artifact_root: PathBuf,
        upload_root: Option<PathBuf>,
        connect_timeout: Duration,
        default_job_timeout: Duration,
        redactor: Option<Arc<Redactor>>,
    ) -> Self {
        Self {
            store,
            tunnels,
            artifact_root,
            upload_root,
            connect_timeout,
            default_job_timeout,
            redactor,
        }
    }

    fn scrub(&self, message: &str) -> String {
        match &self.redactor {
            Some(redactor) => redactor.redact(message),
            None => message.to_string(),
        }
    }

    async fn audit(&self, input: NewAudit) {
        if let Err(e) = self.store.insert_audit(input).await {
            tracing::error!(error = %e, "failed to write audit row");
        }
    }

    async fn fail_job(&self, job: &Job, err: &OrchestratorError) {
        let message = self.scrub(&err.to_string());
        if let Err(e) = self
            .store
            .finish_job(
                job.id,
                JobStatus::Failed,
                Utc::now(),
                &serde_json::json!({ "error_kind": err.kind() }),
                &message,
            )
            .await
        {
            tracing::error!(job_id = %job.id, error = %e, "failed to record job failure");
        }
    }

    /// Whether the run was cancelled out from under us.
    async fn run_cancelled(&self, run_id: uuid::Uuid) -> bool {
        matches!(
            self.store.get_run(run_id).await,
            Ok(Some(run)) if run.status == RunStatus::Cancelled
        )
    }

    async fn resolve_image(
        &self,
        run: &Run,
        kind: TaskKind,
    ) -> Result<WorkerImage, OrchestratorError> {
        let (name, tag) = run.directive_snapshot.image_for(kind);
        let reference = format!("{}:{}", name, tag);
        match self.store.find_worker_image(&name, &tag).await? {
            Some(image) if image.enabled => Ok(image),
            _ => Err(OrchestratorError::ImageNotAllowed { image: reference }),
        }
    }

    async fn execute_job(
        &self,
        run: &Run,
        job: &Job,
        host: &WorkerHost,
        recorded_paths: &mut HashSet<String>,
    ) -> Result<(), OrchestratorError> {
        let image = match self.resolve_image(run, job.kind).await {
            Ok(image) => image,
            Err(err) => {
                let (name, tag) = run.directive_snapshot.image_for(job.kind);
                self.audit(NewAudit {
                    run_id: run.id,
                    job_id: Some(job.id),
                    operation: AuditOperation::Error,
                    container_id: String::new(),
                    image: format!("{}:{}", name, tag),
                    gpu_assigned: String::new(),
                    gpu_reason: String::new(),
                    config_snapshot: serde_json::json!({}),
                    success: false,
                    error_message: self.scrub(&err.to_string()),
                })
                .await;
                return Err(err);
            }
        };

        let gpus = self.store.list_gpu_states(Some(host.id)).await?;
        let placement: GpuPlacement = match gpu::select_gpu(&image, &gpus) {
            Ok(placement) => placement,
            Err(err) => {
                self.audit(NewAudit {
                    run_id: run.id,
                    job_id: Some(job.id),
                    operation: AuditOperation::Error,
                    container_id: String::new(),
                    image: image.reference(),
                    gpu_assigned: String::new(),
                    gpu_reason: "no GPU satisfied the VRAM floor".to_string(),
                    config_snapshot: serde_json::json!({}),
                    success: false,
                    error_message: self.scrub(&err.to_string()),
                })
                .await;
                return Err(err);
            }
        };

        let docker = connect_host(host, &self.tunnels, self.connect_timeout)
            .await
            .map_err(|e| OrchestratorError::DispatchFailed {
                reason: e.to_string(),
            })?;

        let spec = build_container_spec(
            job,
            &run.directive_snapshot,
            &image.reference(),
            placement.device_index,
            &self.artifact_root,
            self.upload_root.as_deref(),
        );

        let timeout = run.directive_snapshot.job_timeout(self.default_job_timeout);
        let config_snapshot = serde_json::json!({
            "image": image.reference(),
            "host": host.name,
            "timeout_secs": timeout.as_secs(),
            "requires_gpu": image.requires_gpu,
            "min_vram_mb": image.min_vram_mb,
        });

        self.store.mark_job_running(job.id, Utc::now()).await?;

        let handle = match ContainerHandle::spawn(docker, spec).await {
            Ok(handle) => handle,
            Err(err) => {
                self.audit(NewAudit {
                    run_id: run.id,
                    job_id: Some(job.id),
                    operation: AuditOperation::Error,
                    container_id: String::new(),
                    image: image.reference(),
                    gpu_assigned: placement.assigned(),
                    gpu_reason: placement.reason.clone(),
                    config_snapshot,
                    success: false,
                    error_message: self.scrub(&err.to_string()),
                })
                .await;
                return Err(err);
            }
        };

        self.audit(NewAudit {
            run_id: run.id,
            job_id: Some(job.id),
            operation: AuditOperation::Spawn,
            container_id: handle.container_id.clone(),
            image: image.reference(),
            gpu_assigned: placement.assigned(),
            gpu_reason: placement.reason.clone(),
            config_snapshot: config_snapshot.clone(),
            success: true,
            error_message: String::new(),
        })
        .await;

        if let Some(device) = placement.device_index {
            let _ = self.store.adjust_gpu_workers(host.id, device, 1).await;
        }

        let wait_result = self.wait_with_cancellation(run, &handle, timeout).await;

        if let Some(device) = placement.device_index {
            let _ = self.store.adjust_gpu_workers(host.id, device, -1).await;
        }

        let exit_code = match wait_result {
            Ok(code) => code,
            Err(err) => {
                let operation = if matches!(err, OrchestratorError::Timeout { .. })
                    || matches!(err, OrchestratorError::Cancelled)
                {
                    AuditOperation::Stop
                } else {
                    AuditOperation::Error
                };
                self.audit(NewAudit {
                    run_id: run.id,
                    job_id: Some(job.id),
                    operation,
                    container_id: handle.container_id.clone(),
                    image: image.reference(),
                    gpu_assigned: placement.assigned(),
                    gpu_reason: placement.reason.clone(),
                    config_snapshot,
                    success: false,
                    error_message: self.scrub(&err.to_string()),
                })
                .await;
                // Ingest whatever the worker managed to produce first.
                self.ingest(run, job, recorded_paths).await;
                return Err(err);
            }
        };

        let (artifact_paths, llm_summary) = self.ingest(run, job, recorded_paths).await;

        if exit_code != 0 {
            return Err(OrchestratorError::DispatchFailed {
                reason: format!("worker exited with status {}", exit_code),
            });
        }

        let result = serde_json::json!({
            "exit_code": exit_code,
            "artifacts": artifact_paths,
            "llm_calls": llm_summary.calls,
            "models": llm_summary.models,
        });
        self.store
            .finish_job(job.id, JobStatus::Success, Utc::now(), &result, "")
            .await?;

        tracing::info!(
            run_id = %run.id,
            job_id = %job.id,
            kind = %job.kind,
            "job completed"
        );
        Ok(())
    }

    /// Wait for exit, but poll for operator cancellation so a cancelled run
    /// gets a best-effort container stop instead of running to completion.
    async fn wait_with_cancellation(
        &self,
        run: &Run,
        handle: &ContainerHandle,
        timeout: Duration,
    ) -> Result<i64, OrchestratorError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll = Duration::from_secs(5);

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                handle.stop().await;
                return Err(OrchestratorError::Timeout {
                    seconds: timeout.as_secs(),
                });
            }
            match handle.wait(remaining.min(poll)).await {
                Ok(code) => return Ok(code),
                // Inner poll elapsed; the overall deadline is re-checked at
                // the top of the loop.
                Err(OrchestratorError::Timeout { .. }) => {
                    if self.run_cancelled(run.id).await {
                        handle.stop().await;
                        return Err(OrchestratorError::Cancelled);
                    }
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn ingest(
        &self,
        run: &Run,
        job: &Job,
        recorded_paths: &mut HashSet<String>,
    ) -> (Vec<String>, LlmSummary) {
        let mut new_paths = Vec::new();
        for artifact in ingest::collect_artifacts(&self.artifact_root, run.id).await {
            if !recorded_paths.insert(artifact.path.clone()) {
                continue;
            }
            new_paths.push(artifact.path.clone());
            if let Err(e) = self.store.insert_artifact(artifact).await {
                tracing::error!(run_id = %run.id, error = %e, "failed to record artifact");
            }
        }

        let mut summary = LlmSummary::default();
        if let Some(sidecar) = ingest::consume_telemetry(&self.artifact_root, run.id).await {
            for call in sidecar.llm_calls {
                summary.calls += 1;
                if !summary.models.contains(&call.model_id) {
                    summary.models.push(call.model_id.clone());
                }
                let insert = self
                    .store
                    .insert_llm_call(NewLlmCall {
                        run_id: run.id,
                        job_id: job.id,
                        model_id: call.model_id,
                        endpoint: call.endpoint,
                        prompt_tokens: call.prompt_tokens,
                        completion_tokens: call.completion_tokens,
                        total_tokens: call.total_tokens,
                        duration_ms: call.duration_ms,
                        success: call.success,
                        error_kind: call.error_kind,
                    })
                    .await;
                match insert {
                    Ok(recorded) => {
                        let _ = self
                            .store
                            .add_job_tokens(
                                job.id,
                                recorded.prompt_tokens,
                                recorded.completion_tokens,
                                recorded.total_tokens,
                            )
                            .await;
                        let _ = self
                            .store
                            .add_run_tokens(
                                run.id,
                                recorded.prompt_tokens,
                                recorded.completion_tokens,
                                recorded.total_tokens,
                            )
                            .await;
                    }
                    Err(e) => {
                        tracing::error!(run_id = %run.id, error = %e, "failed to record llm call");
                    }
                }
            }
        }

        (new_paths, summary)
    }

    async fn rollup(&self, run_id: uuid::Uuid) -> Result<RunStatus, OrchestratorError> {
        let now = Utc::now();
        let jobs = self.store.list_jobs(run_id).await?;
        let status = report::rollup_status(&jobs);

        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound { id: run_id })?;
        if run.status == RunStatus::Cancelled {
            return Ok(RunStatus::Cancelled);
        }

        let artifacts = self.store.list_artifacts(run_id).await?;
        let (markdown, json) = report::render(&run, status, &jobs, &artifacts);
        let error_message = jobs
            .iter()
            .find(|j| j.status == JobStatus::Failed)
            .map(|j| j.error_message.clone())
            .unwrap_or_default();

        self.store
            .finish_run(run_id, status, now, &markdown, &json, &error_message)
            .await?;
        Ok(status)
    }
}

/// Per-job LLM telemetry summary for the job's result JSON.
#[derive(Debug, Default)]
struct LlmSummary {
    calls: usize,
    models: Vec<String>,
}

#[async_trait]
impl RunExecutor for WorkerDispatcher {
    async fn execute_run(
        &self,
        run: &Run,
        host: &WorkerHost,
    ) -> Result<RunStatus, OrchestratorError> {
        let jobs = self.store.list_jobs(run.id).await?;
        let mut recorded_paths: HashSet<String> = HashSet::new();
        let mut prerequisite_failure: Option<TaskKind> = None;

        for job in &jobs {
            if self.run_cancelled(run.id).await {
                self.fail_job(job, &OrchestratorError::Cancelled).await;
                continue;
            }
            if let Some(kind) = prerequisite_failure {
                let err = OrchestratorError::DispatchFailed {
                    reason: format!("prerequisite {} failed", kind),
                };
                self.fail_job(job, &err).await;
                continue;
            }

            if let Err(err) = self.execute_job(run, job, host, &mut recorded_paths).await {
                tracing::warn!(
                    run_id = %run.id,
                    job_id = %job.id,
                    kind = %job.kind,
                    error_kind = err.kind(),
                    "job failed"
                );
                self.fail_job(job, &err).await;
                if run.directive_snapshot.job_required(job.kind) {
                    prerequisite_failure = Some(job.kind);
                }
            }
        }

        self.rollup(run.id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::model::{ApprovalStatus, DirectiveSnapshot};
    use crate::store::{MemStore, NewRun};

    fn dispatcher(store: Arc<MemStore>, artifact_root: &std::path::Path) -> WorkerDispatcher {
        WorkerDispatcher::new(
            store,
            Arc::new(crate::hosts::TunnelManager::new(10_000, 20_000)),
            artifact_root.to_path_buf(),
            None,
            Duration::from_secs(1),
            Duration::from_secs(600),
            Some(Arc::new(Redactor::new())),
        )
    }

    async fn seed_run(store: &MemStore, tasks: Vec<TaskKind>) -> (Run, Vec<Job>) {
        store
            .create_run_with_jobs(NewRun {
                directive_id: None,
                snapshot: DirectiveSnapshot::custom("sweep", Utc::now()),
                approval: ApprovalStatus::None,
                worker_host_id: None,
                tasks,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn ingest_records_artifacts_once_and_sums_tokens() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        let (run, jobs) = seed_run(&store, vec![TaskKind::LogTriage]).await;

        let run_dir = ingest::run_dir(tmp.path(), run.id);
        tokio::fs::create_dir_all(&run_dir).await.unwrap();
        tokio::fs::write(run_dir.join("report.md"), b"# triage")
            .await
            .unwrap();
        tokio::fs::write(
            run_dir.join(ingest::TELEMETRY_SIDECAR),
            serde_json::json!({
                "llm_calls": [
                    { "model_id": "mistral-7b", "endpoint": "vllm",
                      "prompt_tokens": 150, "completion_tokens": 50, "total_tokens": 200 },
                    { "model_id": "llama3", "endpoint": "llama_cpp",
                      "prompt_tokens": 30, "completion_tokens": 10, "total_tokens": 40 },
                ]
            })
            .to_string(),
        )
        .await
        .unwrap();

        let d = dispatcher(store.clone(), tmp.path());
        let mut recorded = HashSet::new();
        let (paths, summary) = d.ingest(&run, &jobs[0], &mut recorded).await;

        assert_eq!(paths, vec![format!("run_{}/report.md", run.id)]);
        assert_eq!(summary.calls, 2);
        assert_eq!(summary.models.len(), 2);

        // Job and run totals both equal the sum of the LLMCall rows.
        let calls = store.list_llm_calls(run.id).await.unwrap();
        assert_eq!(calls.len(), 2);
        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.total_tokens, 240);
        assert_eq!(run.prompt_tokens, 180);
        let job = &store.list_jobs(run.id).await.unwrap()[0];
        assert_eq!(job.total_tokens, 240);

        // A second ingest pass finds nothing new: the artifact is already
        // recorded and the sidecar was consumed.
        let (paths, summary) = d.ingest(&run, &jobs[0], &mut recorded).await;
        assert!(paths.is_empty());
        assert_eq!(summary.calls, 0);
        assert_eq!(store.list_llm_calls(run.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rollup_writes_report_and_terminal_status() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        let (run, jobs) = seed_run(&store, vec![TaskKind::LogTriage, TaskKind::GpuReport]).await;
        let now = Utc::now();
        store.mark_run_running(run.id, now).await.unwrap();
        store.mark_job_running(jobs[0].id, now).await.unwrap();
        store
            .finish_job(jobs[0].id, JobStatus::Success, now, &serde_json::json!({}), "")
            .await
            .unwrap();
        store.mark_job_running(jobs[1].id, now).await.unwrap();
        store
            .finish_job(
                jobs[1].id,
                JobStatus::Failed,
                now,
                &serde_json::json!({}),
                "insufficient VRAM: 1024 MB required",
            )
            .await
            .unwrap();

        let d = dispatcher(store.clone(), tmp.path());
        let status = d.rollup(run.id).await.unwrap();
        assert_eq!(status, RunStatus::Partial);

        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Partial);
        assert!(run.report_markdown.contains("log_triage: success"));
        assert!(run.report_markdown.contains("gpu_report: failed"));
        assert_eq!(run.error_message, "insufficient VRAM: 1024 MB required");
        assert!(run.ended_at.is_some());

        // Terminal report is stable across reads.
        let again = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(again.report_markdown, run.report_markdown);
    }

    #[tokio::test]
    async fn rollup_leaves_cancelled_runs_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        let (run, jobs) = seed_run(&store, vec![TaskKind::LogTriage]).await;
        let now = Utc::now();
        store
            .finish_job(jobs[0].id, JobStatus::Failed, now, &serde_json::json!({}), "cancelled")
            .await
            .unwrap();
        store.cancel_run(run.id, now).await.unwrap();

        let d = dispatcher(store.clone(), tmp.path());
        let status = d.rollup(run.id).await.unwrap();
        assert_eq!(status, RunStatus::Cancelled);
        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }
}
