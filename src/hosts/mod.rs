//! Worker host routing, health, and remote access.

pub mod health;
pub mod router;
pub mod tunnel;

pub use health::HealthChecker;
pub use router::HostRouter;
pub use tunnel::TunnelManager;

use crate::error::OrchestratorError;
use crate::model::HostKind;

/// Validate a host endpoint URL. Remote TCP endpoints are restricted to
/// private-range (RFC 1918) or loopback IPv4 addresses; the orchestrator is
/// a LAN tool and must never dial out.
pub fn validate_endpoint(kind: HostKind, endpoint: &str) -> Result<(), OrchestratorError> {
    match kind {
        HostKind::LocalSocket => {
            if !endpoint.starts_with("unix://") {
                return Err(OrchestratorError::validation(
                    "local_socket endpoint must be a unix:// URL",
                ));
            }
            Ok(())
        }
        HostKind::RemoteTcp => {
            let rest = endpoint.strip_prefix("tcp://").ok_or_else(|| {
                OrchestratorError::validation("remote_tcp endpoint must be a tcp:// URL")
            })?;
            let host = rest.split(':').next().unwrap_or_default();
            let addr: std::net::Ipv4Addr = host.parse().map_err(|_| {
                OrchestratorError::validation(
                    "remote_tcp endpoint must use a literal IPv4 address",
                )
            })?;
            if addr.is_private() || addr.is_loopback() {
                Ok(())
            } else {
                Err(OrchestratorError::validation(
                    "remote_tcp endpoint must be a private-range address",
                ))
            }
        }
    }
}

/// Extract the TCP port of a `tcp://` endpoint (default Docker TLS port).
pub(crate) fn endpoint_port(endpoint: &str) -> u16 {
    endpoint
        .strip_prefix("tcp://")
        .and_then(|rest| rest.rsplit_once(':'))
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or(2376)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_private_and_loopback_tcp() {
        assert!(validate_endpoint(HostKind::RemoteTcp, "tcp://10.0.0.5:2376").is_ok());
        assert!(validate_endpoint(HostKind::RemoteTcp, "tcp://192.168.1.20:2375").is_ok());
        assert!(validate_endpoint(HostKind::RemoteTcp, "tcp://127.0.0.1:12000").is_ok());
    }

    #[test]
    fn rejects_public_addresses_and_hostnames() {
        assert!(validate_endpoint(HostKind::RemoteTcp, "tcp://8.8.8.8:2376").is_err());
        assert!(validate_endpoint(HostKind::RemoteTcp, "tcp://example.com:2376").is_err());
        assert!(validate_endpoint(HostKind::RemoteTcp, "unix:///var/run/docker.sock").is_err());
    }

    #[test]
    fn local_socket_requires_unix_url() {
        assert!(validate_endpoint(HostKind::LocalSocket, "unix:///var/run/docker.sock").is_ok());
        assert!(validate_endpoint(HostKind::LocalSocket, "/var/run/docker.sock").is_err());
    }

    #[test]
    fn endpoint_port_parses_with_default() {
        assert_eq!(endpoint_port("tcp://10.0.0.5:2375"), 2375);
        assert_eq!(endpoint_port("tcp://10.0.0.5"), 2376);
    }
}
