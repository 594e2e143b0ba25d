//! API error types and HTTP response mapping.
//!
//! Every user-visible failure maps 1:1 to a stable snake_case code; clients
//! branch on `code`, never on the message text.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use oxbow_flow::Error as FlowError;

/// API result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// Standard JSON error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message (safe for clients).
    pub message: String,
}

/// HTTP API error with stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Returns an error response for invalid input.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    /// Returns an error response for authentication failures.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    /// Returns an error response when the Authorization header is missing.
    #[must_use]
    pub fn missing_auth() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Authorization header required",
        )
    }

    /// Returns an error response for authorization failures.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    /// Returns an error response for missing resources.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    /// Returns an error response for conflicts.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
    }

    /// Returns an internal error response.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the stable machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }

    /// Returns the human-readable error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiErrorBody {
                code: self.code.to_string(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<FlowError> for ApiError {
    fn from(value: FlowError) -> Self {
        match &value {
            FlowError::InvalidRequest(message) => Self::bad_request(message.clone()),
            FlowError::InvalidBody { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_body", value.to_string())
            }
            FlowError::InvalidSignature { .. } => Self::new(
                StatusCode::UNAUTHORIZED,
                "invalid_signature",
                value.to_string(),
            ),
            FlowError::ReplayBlocked { .. } => {
                Self::new(StatusCode::CONFLICT, "replay_blocked", value.to_string())
            }
            FlowError::ReplayWindowExceeded { .. } => Self::new(
                StatusCode::REQUEST_TIMEOUT,
                "replay_window_exceeded",
                value.to_string(),
            ),
            FlowError::QueueFull { .. } => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "queue_full",
                value.to_string(),
            ),
            FlowError::BudgetExceeded { .. } => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "budget_exceeded",
                value.to_string(),
            ),
            FlowError::CircuitOpen { .. } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "circuit_open",
                value.to_string(),
            ),
            FlowError::TaskNotFound { .. } => Self::not_found(value.to_string()),
            FlowError::InvalidTransition { .. } => Self::conflict(value.to_string()),
            FlowError::LeaseLost { .. }
            | FlowError::Storage { .. }
            | FlowError::Serialization { .. }
            | FlowError::Core(_) => Self::internal(value.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxbow_flow::task::Provider;

    #[test]
    fn flow_errors_map_to_stable_codes() {
        let err: ApiError = FlowError::ReplayBlocked {
            webhook_source: "github".into(),
            external_id: "d-1".into(),
        }
        .into();
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "replay_blocked");

        let err: ApiError = FlowError::ReplayWindowExceeded { skew_seconds: 900 }.into();
        assert_eq!(err.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(err.code(), "replay_window_exceeded");

        let err: ApiError = FlowError::BudgetExceeded {
            provider: Provider::Anthropic,
            remaining: 0.1,
            reserved: 0.4,
        }
        .into();
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.code(), "budget_exceeded");

        let err: ApiError = FlowError::CircuitOpen {
            service: "anthropic".into(),
            retry_at: None,
        }
        .into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "circuit_open");
    }

    #[test]
    fn internal_errors_do_not_leak_a_stable_code() {
        let err: ApiError = FlowError::storage("db down").into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), "internal");
    }
}
