//! Integration tests for the HTTP surface, driven through the full router
//! with the in-memory store.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use tower::ServiceExt;

use dockhand::api::router;
use dockhand::model::{ApprovalStatus, ArtifactKind, DirectiveSnapshot, RunStatus, TaskKind};
use dockhand::store::{NewArtifact, NewRun, Store};
use dockhand::testing::{mem_state, mem_state_with_artifact_root, seed_directive, seed_healthy_host};

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_endpoint_is_open() {
    let (_store, state) = mem_state();
    let response = router(state).oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn launch_with_nothing_specified_is_rejected() {
    let (_store, state) = mem_state();
    let response = router(state)
        .oneshot(post_json("/runs/launch", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["kind"], "validation");
    assert!(body["message"].as_str().unwrap().len() > 0);
}

#[tokio::test]
async fn launch_and_read_back_the_run() {
    let (store, state) = mem_state();
    let directive = seed_directive(store.as_ref(), "nightly", vec![TaskKind::LogTriage]).await;

    let app = router(state);
    let response = app
        .clone()
        .oneshot(post_json(
            "/runs/launch",
            serde_json::json!({ "directive_id": directive.id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    assert_eq!(created["status"], "pending");
    assert_eq!(created["directive"], "nightly");
    let run_id = created["id"].as_str().unwrap().to_string();

    // Listing returns summaries without report bodies.
    let list = json_body(app.clone().oneshot(get("/runs")).await.unwrap()).await;
    let runs = list.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].get("report_markdown").is_none());

    // Detail includes the jobs.
    let detail = json_body(
        app.clone()
            .oneshot(get(&format!("/runs/{}", run_id)))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(detail["jobs"].as_array().unwrap().len(), 1);
    assert_eq!(detail["jobs"][0]["kind"], "log_triage");

    // Report is empty until terminal.
    let report = json_body(
        app.oneshot(get(&format!("/runs/{}/report", run_id)))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(report["markdown"], "");
}

#[tokio::test]
async fn unknown_run_maps_to_404_envelope() {
    let (_store, state) = mem_state();
    let response = router(state)
        .oneshot(get(&format!("/runs/{}", uuid::Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["kind"], "run_not_found");
}

#[tokio::test]
async fn cancel_is_a_no_op_on_terminal_runs() {
    let (store, state) = mem_state();
    let (run, _jobs) = store
        .create_run_with_jobs(NewRun {
            directive_id: None,
            snapshot: DirectiveSnapshot::custom("", Utc::now()),
            approval: ApprovalStatus::None,
            worker_host_id: None,
            tasks: vec![TaskKind::LogTriage],
        })
        .await
        .unwrap();
    store.mark_run_running(run.id, Utc::now()).await.unwrap();
    store
        .finish_run(
            run.id,
            RunStatus::Success,
            Utc::now(),
            "# done",
            &serde_json::json!({}),
            "",
        )
        .await
        .unwrap();

    let response = router(state)
        .oneshot(post_json(
            &format!("/runs/{}/cancel", run.id),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "success");
}

#[tokio::test]
async fn host_responses_never_carry_ssh_credentials() {
    let (_store, state) = mem_state();
    let app = router(state);

    let response = app
        .clone()
        .oneshot(post_json(
            "/worker-hosts",
            serde_json::json!({
                "name": "gpu-box",
                "kind": "remote_tcp",
                "endpoint": "tcp://10.0.0.9:2376",
                "capabilities": { "gpus": true, "gpu_count": 2, "max_concurrency": 3 },
                "ssh": {
                    "host": "10.0.0.9",
                    "port": 22,
                    "user": "ops",
                    "key_path": "/keys/id_ed25519"
                }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let raw = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(!raw.contains("id_ed25519"));
    assert!(!raw.contains("\"ops\""));
    let created: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(created["has_ssh_config"], true);
    assert!(created.get("ssh").is_none());

    // The list view is equally silent.
    let response = app.oneshot(get("/worker-hosts")).await.unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let raw = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(!raw.contains("key_path"));
    assert!(raw.contains("has_ssh_config"));
}

#[tokio::test]
async fn public_endpoints_are_rejected_for_remote_hosts() {
    let (_store, state) = mem_state();
    let response = router(state)
        .oneshot(post_json(
            "/worker-hosts",
            serde_json::json!({
                "name": "outside",
                "kind": "remote_tcp",
                "endpoint": "tcp://8.8.8.8:2376"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn host_delete_refused_while_runs_are_active() {
    let (store, state) = mem_state();
    let host = seed_healthy_host(store.as_ref(), "busy", false).await;
    assert!(store.try_acquire_host_slot(host.id).await.unwrap());

    let app = router(state);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/worker-hosts/{}", host.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    store.release_host_slot(host.id).await.unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/worker-hosts/{}", host.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn run_now_on_disabled_schedule_is_validation() {
    let (store, state) = mem_state();
    let app = router(state);

    let response = app
        .clone()
        .oneshot(post_json(
            "/schedules",
            serde_json::json!({
                "name": "hourly-triage",
                "task_kind": "log_triage",
                "kind": "interval",
                "interval_minutes": 60,
                "enabled": false
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let schedule = json_body(response).await;
    let id = schedule["id"].as_str().unwrap();
    assert!(store
        .get_schedule(id.parse().unwrap())
        .await
        .unwrap()
        .is_some());

    let response = app
        .oneshot(post_json(
            &format!("/schedules/{}/run-now", id),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn schedule_creation_validates_recurrence() {
    let (_store, state) = mem_state();
    let app = router(state);

    // Interval without minutes.
    let response = app
        .clone()
        .oneshot(post_json(
            "/schedules",
            serde_json::json!({
                "name": "broken",
                "task_kind": "gpu_report",
                "kind": "interval"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Both recurrence fields set.
    let response = app
        .oneshot(post_json(
            "/schedules",
            serde_json::json!({
                "name": "broken2",
                "task_kind": "gpu_report",
                "kind": "cron",
                "cron_expr": "0 0 * * * *",
                "interval_minutes": 5
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn artifact_download_streams_bytes_and_honors_the_root() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, state) = mem_state_with_artifact_root(tmp.path().to_path_buf());

    let (run, _jobs) = store
        .create_run_with_jobs(NewRun {
            directive_id: None,
            snapshot: DirectiveSnapshot::custom("", Utc::now()),
            approval: ApprovalStatus::None,
            worker_host_id: None,
            tasks: vec![TaskKind::LogTriage],
        })
        .await
        .unwrap();

    let run_dir = tmp.path().join(format!("run_{}", run.id));
    std::fs::create_dir_all(&run_dir).unwrap();
    std::fs::write(run_dir.join("report.md"), b"# nightly report").unwrap();

    let good = store
        .insert_artifact(NewArtifact {
            run_id: run.id,
            kind: ArtifactKind::Report,
            path: format!("run_{}/report.md", run.id),
            size_bytes: 16,
            mime_type: "text/markdown".to_string(),
        })
        .await
        .unwrap();
    let escaping = store
        .insert_artifact(NewArtifact {
            run_id: run.id,
            kind: ArtifactKind::Other,
            path: "../outside.txt".to_string(),
            size_bytes: 0,
            mime_type: String::new(),
        })
        .await
        .unwrap();

    let app = router(state);
    let response = app
        .clone()
        .oneshot(get(&format!("/artifacts/{}/download", good.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/markdown"
    );
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"# nightly report");

    let response = app
        .oneshot(get(&format!("/artifacts/{}/download", escaping.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn token_stats_aggregate_counts_only() {
    let (store, state) = mem_state();
    let (run, jobs) = store
        .create_run_with_jobs(NewRun {
            directive_id: None,
            snapshot: DirectiveSnapshot::custom("", Utc::now()),
            approval: ApprovalStatus::None,
            worker_host_id: None,
            tasks: vec![TaskKind::LogTriage],
        })
        .await
        .unwrap();
    for tokens in [(100, 40), (50, 10)] {
        store
            .insert_llm_call(dockhand::store::NewLlmCall {
                run_id: run.id,
                job_id: jobs[0].id,
                model_id: "mistral-7b".to_string(),
                endpoint: "vllm".to_string(),
                prompt_tokens: tokens.0,
                completion_tokens: tokens.1,
                total_tokens: tokens.0 + tokens.1,
                duration_ms: 900,
                success: true,
                error_kind: String::new(),
            })
            .await
            .unwrap();
    }

    let app = router(state);
    let stats = json_body(app.clone().oneshot(get("/token-stats")).await.unwrap()).await;
    assert_eq!(stats["total_tokens"], 200);
    assert_eq!(stats["total_prompt_tokens"], 150);
    assert_eq!(stats["call_count"], 2);

    let cost = json_body(app.oneshot(get("/cost-report")).await.unwrap()).await;
    assert!(cost["by_model"]["mistral-7b"]["estimated_cost"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn mcp_get_lists_tools() {
    let (_store, state) = mem_state();
    let response = router(state).oneshot(get("/mcp")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["transport"], "sse");
    let names: Vec<&str> = body["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"launch_run"));
    assert!(names.contains(&"list_runs"));
}

#[tokio::test]
async fn mcp_emits_exactly_one_event_then_terminates() {
    let (store, state) = mem_state();
    seed_directive(store.as_ref(), "nightly", vec![TaskKind::LogTriage]).await;

    let response = router(state)
        .oneshot(post_json(
            "/mcp",
            serde_json::json!({ "tool": "list_runs", "params": {} }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let raw = String::from_utf8(bytes.to_vec()).unwrap();
    assert_eq!(raw.matches("data: ").count(), 1);
    let payload: serde_json::Value =
        serde_json::from_str(raw.trim_start_matches("data: ").trim()).unwrap();
    assert!(payload["runs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn mcp_unknown_tool_yields_validation_error_event() {
    let (_store, state) = mem_state();
    let response = router(state)
        .oneshot(post_json(
            "/mcp",
            serde_json::json!({ "tool": "drop_tables", "params": {} }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let raw = String::from_utf8(bytes.to_vec()).unwrap();
    let payload: serde_json::Value =
        serde_json::from_str(raw.trim_start_matches("data: ").trim()).unwrap();
    assert_eq!(payload["error"]["kind"], "validation");
}

#[tokio::test]
async fn mcp_launch_run_creates_a_pending_run() {
    let (store, state) = mem_state();
    let directive = seed_directive(store.as_ref(), "nightly", vec![TaskKind::LogTriage]).await;

    let response = router(state)
        .oneshot(post_json(
            "/mcp",
            serde_json::json!({
                "tool": "launch_run",
                "params": { "directive_id": directive.id }
            }),
        ))
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let raw = String::from_utf8(bytes.to_vec()).unwrap();
    let payload: serde_json::Value =
        serde_json::from_str(raw.trim_start_matches("data: ").trim()).unwrap();
    assert_eq!(payload["ok"], true);
    assert_eq!(payload["run"]["status"], "pending");

    let runs = store.list_runs(Default::default()).await.unwrap();
    assert_eq!(runs.len(), 1);
}
