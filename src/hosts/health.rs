//! Worker host health probing.
//!
//! A probe opens a Docker client against the host endpoint (through the SSH
//! tunnel when configured) and pings the daemon. Success refreshes
//! `last_seen_at`; failure marks the host unhealthy but leaves the last
//! probe time alone, so staleness keeps accumulating.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::dispatch::docker::ping_host;
use crate::error::OrchestratorError;
use crate::hosts::TunnelManager;
use crate::model::WorkerHost;
use crate::store::Store;

#[derive(Debug, Default, serde::Serialize)]
pub struct HealthSweep {
    pub healthy: Vec<String>,
    pub unhealthy: Vec<String>,
    pub disabled: Vec<String>,
}

pub struct HealthChecker {
    store: Arc<dyn Store>,
    tunnels: Arc<TunnelManager>,
    probe_timeout: Duration,
    staleness: Duration,
}

impl HealthChecker {
    pub fn new(
        store: Arc<dyn Store>,
        tunnels: Arc<TunnelManager>,
        probe_timeout: Duration,
        staleness: Duration,
    ) -> Self {
        Self {
            store,
            tunnels,
            probe_timeout,
            staleness,
        }
    }

    /// Probe one host and persist the outcome. Returns whether it is
    /// healthy, or the probe error for reporting on the health endpoint.
    pub async fn check_host(&self, host: &WorkerHost) -> Result<(), OrchestratorError> {
        match ping_host(host, &self.tunnels, self.probe_timeout).await {
            Ok(()) => {
                self.store
                    .set_host_health(host.id, true, Some(Utc::now()))
                    .await?;
                tracing::debug!(host = %host.name, "host healthy");
                Ok(())
            }
            Err(probe_err) => {
                self.store.set_host_health(host.id, false, None).await?;
                tracing::warn!(host = %host.name, error = %probe_err, "host probe failed");
                Err(probe_err)
            }
        }
    }

    /// Probe every enabled host and expire stale ones.
    pub async fn sweep(&self) -> Result<HealthSweep, OrchestratorError> {
        let mut result = HealthSweep::default();
        for host in self.store.list_hosts().await? {
            if !host.enabled {
                result.disabled.push(host.name.clone());
                continue;
            }
            match self.check_host(&host).await {
                Ok(()) => result.healthy.push(host.name.clone()),
                Err(_) => result.unhealthy.push(host.name.clone()),
            }
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.staleness)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let expired = self.store.mark_stale_hosts_unhealthy(cutoff).await?;
        if expired > 0 {
            tracing::warn!(count = expired, "marked stale hosts unhealthy");
        }

        tracing::info!(
            healthy = result.healthy.len(),
            unhealthy = result.unhealthy.len(),
            disabled = result.disabled.len(),
            "health sweep complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HostCapabilities, HostKind};
    use crate::store::{MemStore, NewWorkerHost, Store};

    #[tokio::test]
    async fn sweep_skips_disabled_and_expires_stale() {
        let store = Arc::new(MemStore::new());
        let disabled = store
            .create_host(NewWorkerHost {
                name: "off".into(),
                kind: HostKind::LocalSocket,
                endpoint: "unix:///nonexistent/docker.sock".into(),
                capabilities: HostCapabilities::default(),
                ssh: None,
                enabled: false,
            })
            .await
            .unwrap();
        let stale = store
            .create_host(NewWorkerHost {
                name: "stale".into(),
                kind: HostKind::LocalSocket,
                endpoint: "unix:///nonexistent/docker.sock".into(),
                capabilities: HostCapabilities::default(),
                ssh: None,
                enabled: true,
            })
            .await
            .unwrap();
        // Healthy long ago, never probed since.
        store
            .set_host_health(stale.id, true, Some(Utc::now() - chrono::Duration::hours(1)))
            .await
            .unwrap();

        let checker = HealthChecker::new(
            store.clone(),
            Arc::new(TunnelManager::new(10_000, 10_100)),
            Duration::from_millis(200),
            Duration::from_secs(300),
        );
        let sweep = checker.sweep().await.unwrap();

        assert_eq!(sweep.disabled, vec!["off".to_string()]);
        // The probe against a nonexistent socket fails.
        assert_eq!(sweep.unhealthy, vec!["stale".to_string()]);
        assert!(sweep.healthy.is_empty());

        let stale = store.get_host(stale.id).await.unwrap().unwrap();
        assert!(!stale.healthy);
        let disabled = store.get_host(disabled.id).await.unwrap().unwrap();
        assert!(!disabled.healthy);
    }
}
