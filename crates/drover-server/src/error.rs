//! API error type: maps the store taxonomy onto HTTP statuses and renders
//! structured JSON error bodies.

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use uuid::Uuid;

use drover_db::StoreError;

/// An error ready to leave the service as an HTTP response.
///
/// Body shape: `{"error": {"kind": ..., "message": ...}, "request_id": ...}`.
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "validation_error",
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            kind: "conflict",
            message: msg.into(),
        }
    }

    /// The service is draining; task creation and claims are refused.
    pub fn shutdown_in_progress() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            kind: "shutdown_in_progress",
            message: "service is shutting down".to_string(),
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            kind: "store_error",
            message: msg.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(msg) => Self::validation(msg),
            StoreError::NotFound(msg) => Self::not_found(msg),
            StoreError::Conflict(msg) => Self::conflict(msg),
            // Transient retries happen in the store; whatever reaches this
            // point is surfaced as unavailability.
            StoreError::Database(e) => Self::unavailable(format!("{e:#}")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "error": {
                "kind": self.kind,
                "message": self.message,
            },
            "request_id": Uuid::new_v4(),
        });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_mapping() {
        let api: ApiError = StoreError::validation("bad").into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
        assert_eq!(api.kind, "validation_error");

        let api: ApiError = StoreError::not_found("gone").into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);

        let api: ApiError = StoreError::conflict("busy").into();
        assert_eq!(api.status, StatusCode::CONFLICT);
    }

    #[test]
    fn shutdown_maps_to_503() {
        let api = ApiError::shutdown_in_progress();
        assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(api.kind, "shutdown_in_progress");
    }
}
