//! Shared fixtures for unit and integration tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::api::AppState;
use crate::hosts::{HealthChecker, TunnelManager};
use crate::launcher::RunLauncher;
use crate::model::{Directive, HostCapabilities, HostKind, TaskKind, WorkerHost, WorkerImage};
use crate::store::{MemStore, NewDirective, NewWorkerHost, NewWorkerImage, Store};

/// An [`AppState`] over a fresh [`MemStore`], suitable for driving the full
/// router without Postgres or Docker.
pub fn mem_state() -> (Arc<MemStore>, AppState) {
    mem_state_with_artifact_root(std::env::temp_dir())
}

pub fn mem_state_with_artifact_root(artifact_root: std::path::PathBuf) -> (Arc<MemStore>, AppState) {
    let store: Arc<MemStore> = Arc::new(MemStore::new());
    let tunnels = Arc::new(TunnelManager::new(10_000, 20_000));
    let staleness = Duration::from_secs(300);
    let state = AppState {
        store: store.clone(),
        launcher: Arc::new(RunLauncher::new(store.clone())),
        health: Arc::new(HealthChecker::new(
            store.clone(),
            tunnels.clone(),
            Duration::from_secs(1),
            staleness,
        )),
        tunnels,
        artifact_root,
        staleness,
    };
    (store, state)
}

pub async fn seed_directive(store: &dyn Store, name: &str, tasks: Vec<TaskKind>) -> Directive {
    store
        .create_directive(NewDirective {
            name: name.to_string(),
            description: format!("{} directive", name),
            task_config: serde_json::json!({}),
            directive_text: "collect and summarize".to_string(),
            task_list: tasks,
            approval_required: false,
            max_concurrent_runs: 5,
            enabled: true,
        })
        .await
        .expect("seed directive")
}

pub async fn seed_healthy_host(store: &dyn Store, name: &str, gpus: bool) -> WorkerHost {
    let host = store
        .create_host(NewWorkerHost {
            name: name.to_string(),
            kind: HostKind::LocalSocket,
            endpoint: "unix:///var/run/docker.sock".to_string(),
            capabilities: HostCapabilities {
                gpus,
                gpu_count: if gpus { 2 } else { 0 },
                max_concurrency: 5,
                labels: Vec::new(),
            },
            ssh: None,
            enabled: true,
        })
        .await
        .expect("seed host");
    store
        .set_host_health(host.id, true, Some(Utc::now()))
        .await
        .expect("probe host");
    store.get_host(host.id).await.expect("reload host").expect("host exists")
}

pub async fn seed_image(store: &dyn Store, image: &str, requires_gpu: bool) -> WorkerImage {
    store
        .create_worker_image(NewWorkerImage {
            image: image.to_string(),
            tag: "latest".to_string(),
            description: String::new(),
            enabled: true,
            requires_gpu,
            cpu_fallback: false,
            min_vram_mb: if requires_gpu { 1024 } else { 0 },
        })
        .await
        .expect("seed image")
}

