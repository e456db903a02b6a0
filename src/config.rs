//! Orchestrator configuration.
//!
//! Everything is environment-driven: `DATABASE_URL` plus a set of optional
//! knobs with conservative defaults. `.env` files are loaded via `dotenvy`
//! before resolution.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Process-wide configuration, resolved once at startup and passed down as
/// owned handles (no ambient globals).
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string.
    pub database_url: String,
    /// Port the request/response API listens on.
    pub api_port: u16,
    /// Artifact root, mounted into workers read-write as `/logs`.
    pub artifact_root: PathBuf,
    /// Optional upload root, mounted read-only as `/uploads`.
    pub upload_root: Option<PathBuf>,
    /// When true (the default), every log line and persisted error message
    /// passes through the redactor.
    pub redacted_mode: bool,
    pub scheduler: SchedulerConfig,
    pub hosts: HostConfig,
}

/// Claim-loop knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Poll period between ticks.
    pub interval: Duration,
    /// How long a claim is held before a crashed claimant's rows free up.
    /// Must comfortably exceed the poll interval.
    pub claim_ttl: Duration,
    /// Max schedules claimed per tick.
    pub claim_batch: i64,
    /// Backoff applied when a concurrency gate rejects a dispatch.
    pub gate_backoff: Duration,
    /// Default per-job wall-clock timeout when the directive snapshot
    /// doesn't set one.
    pub job_timeout: Duration,
}

/// Host routing and health knobs.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Hosts not probed successfully within this window are stale.
    pub staleness: Duration,
    /// Timeout for a single health probe.
    pub health_timeout: Duration,
    /// Local port range for SSH tunnel forwarding.
    pub tunnel_port_start: u16,
    pub tunnel_port_end: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            database_url: required_env("DATABASE_URL")?,
            api_port: parse_env("API_PORT", 8800)?,
            artifact_root: PathBuf::from(string_env("ARTIFACT_ROOT", "./logs")),
            upload_root: optional_env("UPLOAD_ROOT").map(PathBuf::from),
            redacted_mode: bool_env("DEBUG_REDACTED_MODE", true)?,
            scheduler: SchedulerConfig {
                interval: Duration::from_secs(parse_env("SCHEDULER_INTERVAL_SECS", 30)?),
                claim_ttl: Duration::from_secs(parse_env("SCHEDULER_CLAIM_TTL_SECS", 120)?),
                claim_batch: parse_env("SCHEDULER_CLAIM_BATCH", 10)?,
                gate_backoff: Duration::from_secs(parse_env("SCHEDULER_GATE_BACKOFF_SECS", 60)?),
                job_timeout: Duration::from_secs(parse_env("JOB_TIMEOUT_SECS", 600)?),
            },
            hosts: HostConfig {
                staleness: Duration::from_secs(parse_env("HOST_STALENESS_SECS", 300)?),
                health_timeout: Duration::from_secs(parse_env("HEALTH_TIMEOUT_SECS", 5)?),
                tunnel_port_start: parse_env("TUNNEL_PORT_START", 10_000)?,
                tunnel_port_end: parse_env("TUNNEL_PORT_END", 20_000)?,
            },
        })
    }
}

fn required_env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar { name })
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn string_env(name: &str, default: &str) -> String {
    optional_env(name).unwrap_or_else(|| default.to_string())
}

fn parse_env<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(name) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidVar {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn bool_env(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(name) {
        Some(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidVar {
                name,
                reason: format!("expected a boolean, got {:?}", other),
            }),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_env_accepts_common_spellings() {
        std::env::set_var("DOCKHAND_TEST_BOOL", "On");
        assert!(bool_env("DOCKHAND_TEST_BOOL", false).unwrap());
        std::env::set_var("DOCKHAND_TEST_BOOL", "0");
        assert!(!bool_env("DOCKHAND_TEST_BOOL", true).unwrap());
        std::env::remove_var("DOCKHAND_TEST_BOOL");
        assert!(bool_env("DOCKHAND_TEST_BOOL", true).unwrap());
    }

    #[test]
    fn parse_env_reports_the_variable() {
        std::env::set_var("DOCKHAND_TEST_PORT", "not-a-port");
        let err = parse_env::<u16>("DOCKHAND_TEST_PORT", 8800).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidVar {
                name: "DOCKHAND_TEST_PORT",
                ..
            }
        ));
        std::env::remove_var("DOCKHAND_TEST_PORT");
    }
}
