//! Error types for the dispatch and reliability engine.

use chrono::{DateTime, Utc};

use oxbow_core::TaskId;

use crate::task::Provider;

/// The result type used throughout oxbow-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in dispatch and queue operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The client request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A webhook signature did not verify.
    #[error("invalid signature for webhook source {webhook_source}")]
    InvalidSignature {
        /// The webhook source whose signature failed.
        webhook_source: String,
    },

    /// A webhook with the same `(source, external_id)` was already recorded.
    #[error("replay blocked: {webhook_source}/{external_id} already recorded")]
    ReplayBlocked {
        /// The webhook source.
        webhook_source: String,
        /// The duplicate external event ID.
        external_id: String,
    },

    /// A webhook timestamp fell outside the freshness window.
    #[error("replay window exceeded: timestamp skew of {skew_seconds}s")]
    ReplayWindowExceeded {
        /// Absolute skew between the timestamp header and server time.
        skew_seconds: i64,
    },

    /// A webhook body could not be parsed into a task.
    #[error("invalid webhook body: {message}")]
    InvalidBody {
        /// Description of the parse failure.
        message: String,
    },

    /// The queue is at its admission cap.
    #[error("queue full: depth {depth} at capacity {capacity}")]
    QueueFull {
        /// Observed queue depth.
        depth: usize,
        /// The configured admission cap.
        capacity: usize,
    },

    /// The daily budget for a provider is exhausted.
    #[error("daily budget exceeded for {provider}: remaining ${remaining:.2}, reserved ${reserved:.2}")]
    BudgetExceeded {
        /// The provider whose ledger is exhausted.
        provider: Provider,
        /// Remaining budget at rejection time.
        remaining: f64,
        /// The reservation that was refused.
        reserved: f64,
    },

    /// The circuit protecting a dependency is open.
    #[error("circuit open for {service}")]
    CircuitOpen {
        /// The protected dependency.
        service: String,
        /// When a probe will next be allowed, if known.
        retry_at: Option<DateTime<Utc>>,
    },

    /// A lease token no longer matches the held lock.
    #[error("lease lost for task {task_id}")]
    LeaseLost {
        /// The task whose lease expired or was taken over.
        task_id: TaskId,
    },

    /// The task does not exist.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was looked up.
        task_id: TaskId,
    },

    /// A task or run was in a state that forbids the operation.
    #[error("invalid state transition: {message}")]
    InvalidTransition {
        /// Description of the rejected transition.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from oxbow-core.
    #[error("core error: {0}")]
    Core(#[from] oxbow_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns the stable machine-readable code for client-facing errors.
    ///
    /// Internal errors (storage, serialization) intentionally have no stable
    /// code; the HTTP layer maps them to a generic 500.
    #[must_use]
    pub fn client_code(&self) -> Option<&'static str> {
        match self {
            Self::InvalidRequest(_) | Self::InvalidTransition { .. } => Some("invalid_request"),
            Self::InvalidSignature { .. } => Some("invalid_signature"),
            Self::ReplayBlocked { .. } => Some("replay_blocked"),
            Self::ReplayWindowExceeded { .. } => Some("replay_window_exceeded"),
            Self::InvalidBody { .. } => Some("invalid_body"),
            Self::QueueFull { .. } => Some("queue_full"),
            Self::BudgetExceeded { .. } => Some("budget_exceeded"),
            Self::CircuitOpen { .. } => Some("circuit_open"),
            Self::TaskNotFound { .. } => Some("not_found"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_codes_are_stable() {
        let err = Error::QueueFull {
            depth: 10,
            capacity: 10,
        };
        assert_eq!(err.client_code(), Some("queue_full"));

        let err = Error::ReplayBlocked {
            webhook_source: "github".into(),
            external_id: "d-1".into(),
        };
        assert_eq!(err.client_code(), Some("replay_blocked"));

        let err = Error::storage("boom");
        assert_eq!(err.client_code(), None);
    }

    #[test]
    fn display_includes_context() {
        let err = Error::BudgetExceeded {
            provider: Provider::Anthropic,
            remaining: 0.2,
            reserved: 0.4,
        };
        let msg = err.to_string();
        assert!(msg.contains("anthropic"));
        assert!(msg.contains("$0.20"));
    }
}
