//! Request/response API and the streaming tool surface.
//!
//! Both surfaces dispatch into the same handlers over [`AppState`]. No
//! response ever carries prompt/response text, SSH credentials, or artifact
//! bodies; artifacts are metadata plus an explicit download route.

pub mod allowlist;
pub mod directives;
pub mod error;
pub mod hosts;
pub mod mcp;
pub mod runs;
pub mod schedules;
pub mod stats;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::hosts::{HealthChecker, TunnelManager};
use crate::launcher::RunLauncher;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub launcher: Arc<RunLauncher>,
    pub health: Arc<HealthChecker>,
    pub tunnels: Arc<TunnelManager>,
    pub artifact_root: PathBuf,
    pub staleness: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Runs
        .route("/runs/launch", post(runs::launch))
        .route("/runs", get(runs::list))
        .route("/runs/since-last-success", get(runs::since_last_success))
        .route("/runs/{id}", get(runs::detail))
        .route("/runs/{id}/report", get(runs::report))
        .route("/runs/{id}/artifacts", get(runs::artifacts))
        .route("/runs/{id}/audit", get(runs::audit))
        .route("/runs/{id}/cancel", post(runs::cancel))
        .route("/runs/{id}/approve", post(runs::approve))
        .route("/runs/{id}/deny", post(runs::deny))
        .route("/artifacts/{id}/download", get(runs::download_artifact))
        // Directives
        .route(
            "/directives",
            get(directives::list).post(directives::create),
        )
        .route(
            "/directives/{id}",
            get(directives::detail)
                .patch(directives::update)
                .delete(directives::remove),
        )
        // Schedules
        .route("/schedules", get(schedules::list).post(schedules::create))
        .route(
            "/schedules/{id}",
            get(schedules::detail)
                .patch(schedules::update)
                .delete(schedules::remove),
        )
        .route("/schedules/{id}/run-now", post(schedules::run_now))
        .route("/schedules/{id}/enable", post(schedules::enable))
        .route("/schedules/{id}/disable", post(schedules::disable))
        .route("/schedules/{id}/history", get(schedules::history))
        // Worker hosts
        .route("/worker-hosts", get(hosts::list).post(hosts::create))
        .route(
            "/worker-hosts/{id}",
            get(hosts::detail).patch(hosts::update).delete(hosts::remove),
        )
        .route("/worker-hosts/{id}/health", get(hosts::health))
        // Allowlists
        .route(
            "/container-allowlist",
            get(allowlist::list_containers).post(allowlist::upsert_container),
        )
        .route(
            "/container-allowlist/{container_id}",
            get(allowlist::get_container).delete(allowlist::remove_container),
        )
        .route(
            "/worker-images",
            get(allowlist::list_images).post(allowlist::create_image),
        )
        .route("/worker-images/{id}", delete(allowlist::remove_image))
        // Telemetry
        .route("/token-stats", get(stats::token_stats))
        .route("/cost-report", get(stats::cost_report))
        .route("/usage-by-directive", get(stats::usage_by_directive))
        .route("/gpu-state", get(stats::gpu_state).put(stats::put_gpu_state))
        // Streaming tool surface
        .route("/mcp", get(mcp::describe).post(mcp::invoke))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Serve the API on the given port.
pub async fn serve(state: AppState, port: u16) -> Result<(), std::io::Error> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await
}
