//! SSH tunnel management for remote Docker endpoints.
//!
//! When a `remote_tcp` host carries an SSH config, the dispatcher and the
//! health checker reach its Docker daemon through a local port forward
//! instead of dialing the TCP endpoint directly. Tunnels are per-host
//! singletons owned by one [`TunnelManager`] handle; they stay up across
//! health checks and dispatches and are torn down when the host is deleted
//! or the process shuts down.

use std::collections::HashMap;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::WorkerHost;

struct Tunnel {
    local_port: u16,
    child: Child,
}

pub struct TunnelManager {
    port_start: u16,
    port_end: u16,
    tunnels: Mutex<HashMap<Uuid, Tunnel>>,
}

impl TunnelManager {
    pub fn new(port_start: u16, port_end: u16) -> Self {
        Self {
            port_start,
            port_end,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the Docker URL to use for a host.
    ///
    /// Hosts without SSH config keep their stored endpoint. Hosts with SSH
    /// config get (or reuse) a long-lived forward and a
    /// `tcp://127.0.0.1:<local_port>` URL.
    pub async fn endpoint_for(&self, host: &WorkerHost) -> Result<String, OrchestratorError> {
        let Some(ssh) = &host.ssh else {
            return Ok(host.endpoint.clone());
        };

        let mut tunnels = self.tunnels.lock().await;
        if let Some(tunnel) = tunnels.get_mut(&host.id) {
            // A dead child means the forward collapsed; rebuild it.
            match tunnel.child.try_wait() {
                Ok(None) => return Ok(format!("tcp://127.0.0.1:{}", tunnel.local_port)),
                _ => {
                    tunnels.remove(&host.id);
                }
            }
        }

        let local_port = self.allocate_port()?;
        let remote_port = super::endpoint_port(&host.endpoint);
        let forward = format!("{}:127.0.0.1:{}", local_port, remote_port);

        tracing::info!(
            host = %host.name,
            local_port,
            "opening SSH tunnel to remote Docker endpoint"
        );

        let child = Command::new("ssh")
            .arg("-N")
            .arg("-L")
            .arg(&forward)
            .arg("-p")
            .arg(ssh.port.to_string())
            .arg("-i")
            .arg(&ssh.key_path)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg(format!("{}@{}", ssh.user, ssh.host))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OrchestratorError::HostUnhealthy {
                reason: format!("failed to spawn ssh forward: {}", e),
            })?;

        tunnels.insert(host.id, Tunnel { local_port, child });
        Ok(format!("tcp://127.0.0.1:{}", local_port))
    }

    /// Tear down the tunnel for a host, if one exists.
    pub async fn close(&self, host_id: Uuid) {
        if let Some(mut tunnel) = self.tunnels.lock().await.remove(&host_id) {
            let _ = tunnel.child.start_kill();
        }
    }

    /// Tear down every tunnel (process shutdown).
    pub async fn close_all(&self) {
        let mut tunnels = self.tunnels.lock().await;
        for (_, mut tunnel) in tunnels.drain() {
            let _ = tunnel.child.start_kill();
        }
    }

    fn allocate_port(&self) -> Result<u16, OrchestratorError> {
        for port in self.port_start..self.port_end {
            if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
                return Ok(port);
            }
        }
        Err(OrchestratorError::internal(
            "no free local port for SSH tunnel",
        ))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::{HostCapabilities, HostKind};

    fn host_without_ssh() -> WorkerHost {
        WorkerHost {
            id: Uuid::new_v4(),
            name: "direct".into(),
            kind: HostKind::RemoteTcp,
            endpoint: "tcp://10.0.0.5:2376".into(),
            capabilities: HostCapabilities::default(),
            ssh: None,
            enabled: true,
            healthy: true,
            active_runs_count: 0,
            last_seen_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn passthrough_without_ssh_config() {
        let manager = TunnelManager::new(10_000, 10_100);
        let url = manager.endpoint_for(&host_without_ssh()).await.unwrap();
        assert_eq!(url, "tcp://10.0.0.5:2376");
    }

    #[test]
    fn allocates_a_port_in_range() {
        let manager = TunnelManager::new(10_000, 10_100);
        let port = manager.allocate_port().unwrap();
        assert!((10_000..10_100).contains(&port));
    }

    #[tokio::test]
    async fn close_is_a_no_op_for_unknown_host() {
        let manager = TunnelManager::new(10_000, 10_100);
        manager.close(Uuid::new_v4()).await;
        manager.close_all().await;
    }
}
