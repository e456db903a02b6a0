//! Error types for the orchestrator.
//!
//! Every failure that crosses a component boundary (launcher → scheduler →
//! dispatcher → API) is an [`OrchestratorError`] carrying one of the stable
//! error kinds. The kind string is what clients see in the error envelope
//! and what gets recorded on ScheduledRun/Job rows; messages stay short and
//! never contain log content, prompts, or credentials.

use uuid::Uuid;

/// Orchestration error with a stable, client-visible kind.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{message}")]
    Validation { message: String },

    #[error("directive not found")]
    DirectiveNotFound { id: Option<Uuid> },

    #[error("worker host not found")]
    HostNotFound { id: Option<Uuid> },

    #[error("run not found")]
    RunNotFound { id: Uuid },

    #[error("schedule not found")]
    ScheduleNotFound { id: Uuid },

    #[error("artifact not found")]
    ArtifactNotFound { id: Uuid },

    #[error("no eligible host: {reason}")]
    NoEligibleHost { reason: String },

    #[error("image not allowed: {image}")]
    ImageNotAllowed { image: String },

    #[error("insufficient VRAM: {required_mb} MB required")]
    InsufficientVram { required_mb: i32 },

    #[error("dispatch failed: {reason}")]
    DispatchFailed { reason: String },

    #[error("job exceeded {seconds}s wall-clock timeout")]
    Timeout { seconds: u64 },

    #[error("run cancelled")]
    Cancelled,

    #[error("host unhealthy: {reason}")]
    HostUnhealthy { reason: String },

    #[error("store error: {reason}")]
    Store { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl OrchestratorError {
    /// Stable kind identifier exposed in the API error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::DirectiveNotFound { .. } => "directive_not_found",
            Self::HostNotFound { .. } => "host_not_found",
            Self::RunNotFound { .. } => "run_not_found",
            Self::ScheduleNotFound { .. } => "schedule_not_found",
            Self::ArtifactNotFound { .. } => "artifact_not_found",
            Self::NoEligibleHost { .. } => "no_eligible_host",
            Self::ImageNotAllowed { .. } => "image_not_allowed",
            Self::InsufficientVram { .. } => "insufficient_vram",
            Self::DispatchFailed { .. } => "dispatch_failed",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::HostUnhealthy { .. } => "host_unhealthy",
            Self::Store { .. } | Self::Internal { .. } => "internal",
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }
}

/// Configuration loading error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {name}")]
    MissingVar { name: &'static str },

    #[error("invalid value for {name}: {reason}")]
    InvalidVar { name: &'static str, reason: String },
}

/// Store-level error, converted to `OrchestratorError::Store` at the
/// component boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => OrchestratorError::Internal {
                reason: "row not found".to_string(),
            },
            StoreError::Conflict(reason) => OrchestratorError::Validation { message: reason },
            StoreError::Database(reason) => OrchestratorError::Store { reason },
        }
    }
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        StoreError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_identifiers() {
        assert_eq!(
            OrchestratorError::validation("tasks must be non-empty").kind(),
            "validation"
        );
        assert_eq!(
            OrchestratorError::ImageNotAllowed {
                image: "evil:latest".into()
            }
            .kind(),
            "image_not_allowed"
        );
        assert_eq!(
            OrchestratorError::Store {
                reason: "pool exhausted".into()
            }
            .kind(),
            "internal"
        );
    }

    #[test]
    fn timeout_message_names_the_limit() {
        let err = OrchestratorError::Timeout { seconds: 600 };
        assert_eq!(err.to_string(), "job exceeded 600s wall-clock timeout");
    }
}
