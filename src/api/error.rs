//! API error envelope.
//!
//! Every failure serializes as `{"kind": "...", "message": "..."}` with an
//! HTTP status derived from the stable kind identifier.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::{OrchestratorError, StoreError};

pub type ApiResult<T> = Result<T, ApiError>;

pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        Self(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e.into())
    }
}

fn status_for(kind: &str) -> StatusCode {
    match kind {
        "validation" => StatusCode::BAD_REQUEST,
        "directive_not_found" | "host_not_found" | "run_not_found" | "schedule_not_found"
        | "artifact_not_found" => StatusCode::NOT_FOUND,
        "no_eligible_host" | "cancelled" => StatusCode::CONFLICT,
        "image_not_allowed" => StatusCode::FORBIDDEN,
        "host_unhealthy" => StatusCode::SERVICE_UNAVAILABLE,
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(kind, error = %self.0, "internal error");
        }
        let body = Json(serde_json::json!({
            "kind": kind,
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_statuses() {
        assert_eq!(status_for("validation"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for("run_not_found"), StatusCode::NOT_FOUND);
        assert_eq!(status_for("no_eligible_host"), StatusCode::CONFLICT);
        assert_eq!(status_for("internal"), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_for("host_unhealthy"), StatusCode::SERVICE_UNAVAILABLE);
    }
}
