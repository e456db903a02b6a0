//! Run launcher: the API entry that turns a launch request into durable
//! work.
//!
//! The launcher never executes anything. It validates the request, captures
//! the directive by value into the run's snapshot, and materializes
//! run + jobs + due one-shot schedules in one transaction. The claim loop
//! picks the work up within one poll period.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::{ApprovalStatus, DirectiveSnapshot, Run, TaskKind};
use crate::store::{NewRun, Store};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LaunchRequest {
    pub directive_id: Option<Uuid>,
    pub tasks: Option<Vec<TaskKind>>,
    pub target_host_id: Option<Uuid>,
    pub custom_directive_text: Option<String>,
}

pub struct RunLauncher {
    store: Arc<dyn Store>,
}

impl RunLauncher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn launch(&self, request: LaunchRequest) -> Result<Run, OrchestratorError> {
        let now = Utc::now();

        if request.directive_id.is_none()
            && request.tasks.is_none()
            && request
                .custom_directive_text
                .as_deref()
                .map_or(true, str::is_empty)
        {
            return Err(OrchestratorError::validation(
                "directive_id or tasks required",
            ));
        }

        let (directive_id, snapshot) = self.resolve_directive(&request, now).await?;

        let tasks = match &request.tasks {
            Some(tasks) => tasks.clone(),
            None => snapshot.task_list.clone(),
        };
        if tasks.is_empty() {
            return Err(OrchestratorError::validation("tasks must be non-empty"));
        }
        for task in &tasks {
            if !snapshot.task_list.contains(task) {
                return Err(OrchestratorError::validation(format!(
                    "task {} is not allowed by directive {}",
                    task, snapshot.name
                )));
            }
        }

        if let Some(host_id) = request.target_host_id {
            if self.store.get_host(host_id).await?.is_none() {
                return Err(OrchestratorError::HostNotFound { id: Some(host_id) });
            }
        }

        let approval = if snapshot.approval_required {
            ApprovalStatus::Pending
        } else {
            ApprovalStatus::None
        };

        let (run, jobs) = self
            .store
            .create_launch(
                NewRun {
                    directive_id,
                    snapshot,
                    approval,
                    worker_host_id: request.target_host_id,
                    tasks,
                },
                now,
            )
            .await?;

        tracing::info!(
            run_id = %run.id,
            jobs = jobs.len(),
            directive = %run.directive_snapshot.name,
            "launched run"
        );
        Ok(run)
    }

    async fn resolve_directive(
        &self,
        request: &LaunchRequest,
        now: chrono::DateTime<Utc>,
    ) -> Result<(Option<Uuid>, DirectiveSnapshot), OrchestratorError> {
        if let Some(id) = request.directive_id {
            let directive = self
                .store
                .get_directive(id)
                .await?
                .ok_or(OrchestratorError::DirectiveNotFound { id: Some(id) })?;
            return Ok((
                Some(directive.id),
                DirectiveSnapshot::from_directive(&directive, now),
            ));
        }

        if let Some(text) = request
            .custom_directive_text
            .as_deref()
            .filter(|t| !t.is_empty())
        {
            return Ok((None, DirectiveSnapshot::custom(text, now)));
        }

        let directive = self
            .store
            .first_enabled_directive()
            .await?
            .ok_or(OrchestratorError::DirectiveNotFound { id: None })?;
        Ok((
            Some(directive.id),
            DirectiveSnapshot::from_directive(&directive, now),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunStatus, ScheduledRunStatus};
    use crate::store::{MemStore, NewDirective};

    async fn seed_directive(store: &MemStore, name: &str, tasks: Vec<TaskKind>) -> Uuid {
        store
            .create_directive(NewDirective {
                name: name.to_string(),
                description: String::new(),
                task_config: serde_json::json!({}),
                directive_text: "nightly sweep".to_string(),
                task_list: tasks,
                approval_required: false,
                max_concurrent_runs: 5,
                enabled: true,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn launch_materializes_run_jobs_and_due_schedules() {
        let store = Arc::new(MemStore::new());
        let directive_id =
            seed_directive(&store, "nightly", vec![TaskKind::LogTriage, TaskKind::GpuReport]).await;

        let launcher = RunLauncher::new(store.clone());
        let run = launcher
            .launch(LaunchRequest {
                directive_id: Some(directive_id),
                tasks: None,
                target_host_id: None,
                custom_directive_text: None,
            })
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Pending);
        let jobs = store.list_jobs(run.id).await.unwrap();
        assert_eq!(jobs.len(), 2);

        // One due one-shot schedule with a pending binding per task.
        let schedules = store.list_schedules().await.unwrap();
        assert_eq!(schedules.len(), 2);
        for schedule in &schedules {
            assert!(schedule.is_one_shot());
            assert!(schedule.next_run_at.is_some());
            let pending = store.pending_scheduled_run(schedule.id).await.unwrap();
            assert_eq!(pending.unwrap().status, ScheduledRunStatus::Pending);
        }
    }

    #[tokio::test]
    async fn snapshot_is_immune_to_later_directive_edits() {
        let store = Arc::new(MemStore::new());
        let directive_id = seed_directive(&store, "nightly", vec![TaskKind::LogTriage]).await;

        let launcher = RunLauncher::new(store.clone());
        let run = launcher
            .launch(LaunchRequest {
                directive_id: Some(directive_id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(run.directive_snapshot.directive_text, "nightly sweep");

        store
            .update_directive(
                directive_id,
                crate::store::DirectiveUpdate {
                    directive_text: Some("rewritten".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store.delete_directive(directive_id).await.unwrap();

        let reloaded = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(reloaded.directive_snapshot.directive_text, "nightly sweep");
    }

    #[tokio::test]
    async fn rejects_task_outside_directive_task_list() {
        let store = Arc::new(MemStore::new());
        let directive_id = seed_directive(&store, "triage-only", vec![TaskKind::LogTriage]).await;

        let launcher = RunLauncher::new(store.clone());
        let err = launcher
            .launch(LaunchRequest {
                directive_id: Some(directive_id),
                tasks: Some(vec![TaskKind::ServiceMap]),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn rejects_when_nothing_specified() {
        let store = Arc::new(MemStore::new());
        seed_directive(&store, "nightly", vec![TaskKind::LogTriage]).await;

        let launcher = RunLauncher::new(store);
        let err = launcher.launch(LaunchRequest::default()).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn rejects_unknown_target_host() {
        let store = Arc::new(MemStore::new());
        let directive_id = seed_directive(&store, "nightly", vec![TaskKind::LogTriage]).await;

        let launcher = RunLauncher::new(store);
        let err = launcher
            .launch(LaunchRequest {
                directive_id: Some(directive_id),
                target_host_id: Some(Uuid::new_v4()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "host_not_found");
    }

    #[tokio::test]
    async fn unknown_directive_is_reported() {
        let store = Arc::new(MemStore::new());
        let launcher = RunLauncher::new(store);
        let err = launcher
            .launch(LaunchRequest {
                directive_id: Some(Uuid::new_v4()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "directive_not_found");
    }

    #[tokio::test]
    async fn approval_gated_directive_marks_run_pending_approval() {
        let store = Arc::new(MemStore::new());
        let directive = store
            .create_directive(NewDirective {
                name: "gated".to_string(),
                description: String::new(),
                task_config: serde_json::json!({}),
                directive_text: String::new(),
                task_list: vec![TaskKind::LogTriage],
                approval_required: true,
                max_concurrent_runs: 5,
                enabled: true,
            })
            .await
            .unwrap();

        let launcher = RunLauncher::new(store);
        let run = launcher
            .launch(LaunchRequest {
                directive_id: Some(directive.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(run.approval, ApprovalStatus::Pending);
    }
}
