//! Worker host selection.
//!
//! Routing is deterministic so that equal fleets behave reproducibly:
//! candidates are ordered by `(active_runs_count, last_seen_at desc, id)`
//! and the first host whose slot counter can actually be bumped wins. The
//! gated increment lives in the store, so two routers racing for the last
//! slot resolve there, not here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::WorkerHost;
use crate::store::Store;

pub struct HostRouter {
    store: Arc<dyn Store>,
    staleness: Duration,
}

impl HostRouter {
    pub fn new(store: Arc<dyn Store>, staleness: Duration) -> Self {
        Self { store, staleness }
    }

    /// Select a host for a run and acquire one of its slots.
    ///
    /// The caller owns the returned slot and must release it via
    /// [`HostRouter::release`] once the run reaches a terminal state.
    pub async fn select_host(
        &self,
        target_host_id: Option<Uuid>,
        requires_gpu: bool,
    ) -> Result<WorkerHost, OrchestratorError> {
        if let Some(id) = target_host_id {
            return self.select_explicit(id, requires_gpu).await;
        }

        let now = Utc::now();
        let mut candidates: Vec<WorkerHost> = Vec::new();
        let mut excluded: Vec<String> = Vec::new();

        for host in self.store.list_hosts().await? {
            let mut reasons: Vec<&str> = Vec::new();
            if !host.enabled {
                reasons.push("disabled");
            }
            if !host.healthy {
                reasons.push("unhealthy");
            }
            if host.is_stale(now, self.staleness) {
                reasons.push("stale");
            }
            if !host.has_capacity() {
                reasons.push("at_capacity");
            }
            if requires_gpu && !host.has_gpu() {
                reasons.push("no_gpu");
            }
            if reasons.is_empty() {
                candidates.push(host);
            } else {
                excluded.push(format!("{}: {}", host.name, reasons.join(",")));
            }
        }

        candidates.sort_by(|a, b| {
            a.active_runs_count
                .cmp(&b.active_runs_count)
                .then(b.last_seen_at.cmp(&a.last_seen_at))
                .then(a.id.cmp(&b.id))
        });

        for host in candidates {
            if self.store.try_acquire_host_slot(host.id).await? {
                tracing::info!(
                    host = %host.name,
                    active_runs = host.active_runs_count + 1,
                    gpu = host.has_gpu(),
                    "selected worker host"
                );
                return Ok(host);
            }
        }

        Err(OrchestratorError::NoEligibleHost {
            reason: if excluded.is_empty() {
                "no worker hosts registered".to_string()
            } else {
                format!("all hosts excluded ({})", excluded.join("; "))
            },
        })
    }

    async fn select_explicit(
        &self,
        id: Uuid,
        requires_gpu: bool,
    ) -> Result<WorkerHost, OrchestratorError> {
        let host = self
            .store
            .get_host(id)
            .await?
            .ok_or(OrchestratorError::NoEligibleHost {
                reason: "target host not found".to_string(),
            })?;

        if !host.enabled {
            return Err(OrchestratorError::NoEligibleHost {
                reason: format!("target host {} is disabled", host.name),
            });
        }
        if requires_gpu && !host.has_gpu() {
            return Err(OrchestratorError::NoEligibleHost {
                reason: format!("target host {} has no GPUs", host.name),
            });
        }
        if !self.store.try_acquire_host_slot(host.id).await? {
            return Err(OrchestratorError::NoEligibleHost {
                reason: format!("target host {} has no free slots", host.name),
            });
        }
        tracing::info!(host = %host.name, "using explicit target host");
        Ok(host)
    }

    /// Release the slot taken by `select_host`.
    pub async fn release(&self, host_id: Uuid) -> Result<(), OrchestratorError> {
        self.store.release_host_slot(host_id).await?;
        Ok(())
    }
}
