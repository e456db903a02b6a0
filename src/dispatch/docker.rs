//! Docker plumbing for the worker dispatcher.
//!
//! Connections are per-host: a unix socket locally, HTTP for remote TCP
//! endpoints (possibly through an SSH tunnel's local forward). Container
//! specs are built by a pure function so the mount/label/env policy is
//! testable without a daemon.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::models::{DeviceRequest, HostConfig};
use bollard::Docker;
use futures_util::StreamExt;

use crate::error::OrchestratorError;
use crate::hosts::TunnelManager;
use crate::model::{DirectiveSnapshot, HostKind, Job, WorkerHost};

/// Label identifying containers spawned by this orchestrator.
pub const EPHEMERAL_LABEL: &str = "dockhand.ephemeral";

/// Open a Docker client against a host's endpoint, routing through the
/// host's SSH tunnel when one is configured.
pub async fn connect_host(
    host: &WorkerHost,
    tunnels: &TunnelManager,
    timeout: Duration,
) -> Result<Docker, OrchestratorError> {
    let endpoint = tunnels.endpoint_for(host).await?;
    let timeout_secs = timeout.as_secs().max(1);

    let docker = match host.kind {
        HostKind::LocalSocket => {
            let path = endpoint
                .strip_prefix("unix://")
                .unwrap_or(endpoint.as_str());
            Docker::connect_with_unix(path, timeout_secs, bollard::API_DEFAULT_VERSION)
        }
        HostKind::RemoteTcp => {
            let url = endpoint.replacen("tcp://", "http://", 1);
            Docker::connect_with_http(&url, timeout_secs, bollard::API_DEFAULT_VERSION)
        }
    }
    .map_err(|e| OrchestratorError::HostUnhealthy {
        reason: format!("docker connection failed: {}", e),
    })?;

    Ok(docker)
}

/// Ping a host's Docker daemon within `timeout`.
pub async fn ping_host(
    host: &WorkerHost,
    tunnels: &TunnelManager,
    timeout: Duration,
) -> Result<(), OrchestratorError> {
    let docker = connect_host(host, tunnels, timeout).await?;
    tokio::time::timeout(timeout, docker.ping())
        .await
        .map_err(|_| OrchestratorError::HostUnhealthy {
            reason: "docker ping timed out".to_string(),
        })?
        .map_err(|e| OrchestratorError::HostUnhealthy {
            reason: format!("docker ping failed: {}", e),
        })?;
    Ok(())
}

/// Everything needed to create a worker container, minus the daemon.
pub struct ContainerSpec {
    pub name: String,
    pub config: Config<String>,
}

/// Build the fixed-policy container spec for a job.
///
/// Mount policy is not user-configurable: the artifact root is the only
/// writable mount, uploads are read-only when configured, and the Docker
/// socket is never passed through to workers.
pub fn build_container_spec(
    job: &Job,
    snapshot: &DirectiveSnapshot,
    image_reference: &str,
    gpu_device: Option<i32>,
    artifact_root: &Path,
    upload_root: Option<&Path>,
) -> ContainerSpec {
    let mut binds = vec![format!("{}:/logs:rw", artifact_root.display())];
    if let Some(uploads) = upload_root {
        binds.push(format!("{}:/uploads:ro", uploads.display()));
    }

    let mut labels = HashMap::new();
    labels.insert("dockhand.run_id".to_string(), job.run_id.to_string());
    labels.insert("dockhand.job_id".to_string(), job.id.to_string());
    labels.insert("dockhand.task_kind".to_string(), job.kind.to_string());
    labels.insert(EPHEMERAL_LABEL.to_string(), "true".to_string());

    let snapshot_json = serde_json::to_string(snapshot).unwrap_or_else(|_| "{}".to_string());
    let mut env = vec![
        format!("DOCKHAND_RUN_ID={}", job.run_id),
        format!("DOCKHAND_JOB_ID={}", job.id),
        format!("DOCKHAND_TASK_KIND={}", job.kind),
        format!("DOCKHAND_DIRECTIVE_SNAPSHOT={}", snapshot_json),
        format!("DOCKHAND_ARTIFACT_DIR=/logs/run_{}", job.run_id),
    ];

    let device_requests = gpu_device.map(|index| {
        env.push(format!("NVIDIA_VISIBLE_DEVICES={}", index));
        vec![DeviceRequest {
            driver: Some("nvidia".to_string()),
            device_ids: Some(vec![index.to_string()]),
            capabilities: Some(vec![vec!["gpu".to_string()]]),
            ..Default::default()
        }]
    });

    let host_config = HostConfig {
        binds: Some(binds),
        network_mode: Some("bridge".to_string()),
        auto_remove: Some(true),
        device_requests,
        ..Default::default()
    };

    let config = Config {
        image: Some(image_reference.to_string()),
        env: Some(env),
        labels: Some(labels),
        host_config: Some(host_config),
        ..Default::default()
    };

    ContainerSpec {
        name: format!("dockhand-{}-{}", job.kind, job.id),
        config,
    }
}

/// A spawned container whose teardown is guaranteed.
///
/// Every spawn is paired with either a natural exit (observed by
/// [`ContainerHandle::wait`]) or an explicit [`ContainerHandle::stop`] on the
/// error path. Dropping the handle without either is a bug the dispatcher
/// never commits: its job loop stops the container on timeout, cancellation,
/// and every error branch.
pub struct ContainerHandle {
    docker: Docker,
    pub container_id: String,
}

impl ContainerHandle {
    /// Create and start a container.
    pub async fn spawn(docker: Docker, spec: ContainerSpec) -> Result<Self, OrchestratorError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let created = docker
            .create_container(Some(options), spec.config)
            .await
            .map_err(|e| OrchestratorError::DispatchFailed {
                reason: format!("create container: {}", e),
            })?;

        let container_id = created.id;
        if let Err(e) = docker.start_container::<String>(&container_id, None).await {
            // Creation succeeded but start failed; don't leak the container.
            let _ = docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(OrchestratorError::DispatchFailed {
                reason: format!("start container: {}", e),
            });
        }

        Ok(Self {
            docker,
            container_id,
        })
    }

    /// Wait for the container to exit, up to `timeout`.
    ///
    /// Returns `Timeout` without touching the container; the caller decides
    /// whether the deadline is final (stop it) or just a poll interval. A
    /// clean exit needs no teardown because the container auto-removes.
    pub async fn wait(&self, timeout: Duration) -> Result<i64, OrchestratorError> {
        let mut wait_stream = self
            .docker
            .wait_container(&self.container_id, None::<WaitContainerOptions<String>>);

        match tokio::time::timeout(timeout, wait_stream.next()).await {
            Ok(Some(Ok(response))) => Ok(response.status_code),
            Ok(Some(Err(e))) => Err(OrchestratorError::DispatchFailed {
                reason: format!("wait for container: {}", e),
            }),
            Ok(None) => Err(OrchestratorError::DispatchFailed {
                reason: "container wait stream ended unexpectedly".to_string(),
            }),
            Err(_) => Err(OrchestratorError::Timeout {
                seconds: timeout.as_secs(),
            }),
        }
    }

    /// Best-effort stop and remove. Failures are logged, not propagated:
    /// auto-remove usually got there first.
    pub async fn stop(&self) {
        if let Err(e) = self
            .docker
            .stop_container(&self.container_id, Some(StopContainerOptions { t: 10 }))
            .await
        {
            tracing::warn!(
                container_id = %self.container_id,
                error = %e,
                "failed to stop container (may already be gone)"
            );
        }
        if let Err(e) = self
            .docker
            .remove_container(
                &self.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            tracing::debug!(
                container_id = %self.container_id,
                error = %e,
                "failed to remove container (auto-remove likely handled it)"
            );
        }
    }
}

/// Remove exited containers left behind by a previous orchestrator process.
pub async fn reap_orphans(docker: &Docker) -> usize {
    let mut filters = HashMap::new();
    filters.insert(
        "label".to_string(),
        vec![format!("{}=true", EPHEMERAL_LABEL)],
    );
    filters.insert("status".to_string(), vec!["exited".to_string()]);

    let containers = match docker
        .list_containers(Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        }))
        .await
    {
        Ok(containers) => containers,
        Err(e) => {
            tracing::warn!(error = %e, "failed to list orphaned workers");
            return 0;
        }
    };

    let mut removed = 0;
    for container in containers {
        let Some(id) = container.id else { continue };
        match docker
            .remove_container(
                &id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                removed += 1;
                tracing::info!(container_id = %id, "removed orphaned worker");
            }
            Err(e) => {
                tracing::warn!(container_id = %id, error = %e, "failed to remove orphaned worker");
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::model::{JobStatus, TaskKind};

    fn test_job() -> Job {
        Job {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            kind: TaskKind::LogTriage,
            status: JobStatus::Pending,
            started_at: None,
            ended_at: None,
            result: serde_json::json!({}),
            error_message: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn spec_mounts_are_fixed_policy() {
        let job = test_job();
        let snapshot = DirectiveSnapshot::custom("", Utc::now());
        let spec = build_container_spec(
            &job,
            &snapshot,
            "dockhand/log-triage:latest",
            None,
            Path::new("/srv/dockhand/logs"),
            Some(Path::new("/srv/dockhand/uploads")),
        );

        let host_config = spec.config.host_config.unwrap();
        let binds = host_config.binds.unwrap();
        assert_eq!(
            binds,
            vec![
                "/srv/dockhand/logs:/logs:rw".to_string(),
                "/srv/dockhand/uploads:/uploads:ro".to_string(),
            ]
        );
        // No docker socket passthrough, no published ports.
        assert!(!binds.iter().any(|b| b.contains("docker.sock")));
        assert!(spec.config.exposed_ports.is_none());
        assert_eq!(host_config.network_mode.as_deref(), Some("bridge"));
        assert_eq!(host_config.auto_remove, Some(true));
    }

    #[test]
    fn spec_env_carries_run_and_job_identity() {
        let job = test_job();
        let snapshot = DirectiveSnapshot::custom("triage the overnight logs", Utc::now());
        let spec = build_container_spec(
            &job,
            &snapshot,
            "dockhand/log-triage:latest",
            None,
            Path::new("/logs-root"),
            None,
        );

        let env = spec.config.env.unwrap();
        assert!(env.contains(&format!("DOCKHAND_RUN_ID={}", job.run_id)));
        assert!(env.contains(&format!("DOCKHAND_JOB_ID={}", job.id)));
        assert!(env.contains(&format!("DOCKHAND_ARTIFACT_DIR=/logs/run_{}", job.run_id)));
        assert!(env
            .iter()
            .any(|e| e.starts_with("DOCKHAND_DIRECTIVE_SNAPSHOT=")));
    }

    #[test]
    fn gpu_placement_adds_device_request() {
        let job = test_job();
        let snapshot = DirectiveSnapshot::custom("", Utc::now());
        let spec = build_container_spec(
            &job,
            &snapshot,
            "dockhand/gpu-report:latest",
            Some(1),
            Path::new("/logs-root"),
            None,
        );

        let requests = spec.config.host_config.unwrap().device_requests.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].device_ids, Some(vec!["1".to_string()]));
        assert!(spec
            .config
            .env
            .unwrap()
            .contains(&"NVIDIA_VISIBLE_DEVICES=1".to_string()));
    }

    #[test]
    fn container_name_is_unique_per_job() {
        let job_a = test_job();
        let job_b = test_job();
        let snapshot = DirectiveSnapshot::custom("", Utc::now());
        let spec_a =
            build_container_spec(&job_a, &snapshot, "img:1", None, Path::new("/l"), None);
        let spec_b =
            build_container_spec(&job_b, &snapshot, "img:1", None, Path::new("/l"), None);
        assert_ne!(spec_a.name, spec_b.name);
    }
}
