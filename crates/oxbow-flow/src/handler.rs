//! The typed handler boundary invoked by workers.
//!
//! Handler *bodies* — calling model providers, opening pull requests,
//! running deploys — live outside this crate. The engine only routes each
//! [`TaskKind`](crate::task::TaskKind) to its registered [`TaskHandler`]
//! and interprets the result: success with reported spend and declared
//! effects, a retryable failure, or a terminal one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use oxbow_core::{RunId, TaskId};

use crate::outbox::NewOutboxEntry;
use crate::run::{RunMetrics, RunReport};
use crate::task::{Provider, Task, TaskKind};

/// Context passed to a handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// The task being executed.
    pub task_id: TaskId,
    /// The run row recording this attempt.
    pub run_id: RunId,
    /// Attempt number (1-indexed).
    pub attempt: u32,
    /// Correlation ID carried from submission.
    pub trace_id: Option<String>,
    /// The attempt's deadline (the lease deadline at start).
    pub deadline: DateTime<Utc>,
    /// Cancelled when the lease is lost or the process is shutting down.
    /// Handlers must treat this as a hard abort signal for all children.
    pub cancellation: CancellationToken,
}

/// Model spend reported by a handler.
#[derive(Debug, Clone)]
pub struct ModelUsage {
    /// The provider whose budget ledger is debited.
    pub provider: Provider,
    /// The model invoked.
    pub model: String,
    /// Tokens consumed.
    pub tokens: u64,
    /// Cost in USD.
    pub cost_usd: f64,
}

/// A successful handler result.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutcome {
    /// Result summary recorded on the run.
    pub result: Option<Value>,
    /// Model spend, if a model was invoked.
    pub usage: Option<ModelUsage>,
    /// External side-effects to commit atomically with the finalize.
    pub effects: Vec<NewOutboxEntry>,
    /// Dependencies touched, recorded with their circuit breakers.
    pub services: Vec<String>,
}

impl HandlerOutcome {
    /// A bare success.
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    /// Sets the result summary.
    #[must_use]
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Records model spend.
    #[must_use]
    pub fn with_usage(mut self, usage: ModelUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Declares an external side-effect.
    #[must_use]
    pub fn with_effect(mut self, effect: NewOutboxEntry) -> Self {
        self.effects.push(effect);
        self
    }

    /// Records a touched dependency.
    #[must_use]
    pub fn touching(mut self, service: impl Into<String>) -> Self {
        self.services.push(service.into());
        self
    }

    /// Builds the run report for the finalizing transaction.
    #[must_use]
    pub fn to_report(&self, duration_seconds: f64) -> RunReport {
        RunReport {
            metrics: RunMetrics {
                duration_seconds,
                result: self.result.clone(),
            },
            model_used: self.usage.as_ref().map(|u| u.model.clone()),
            tokens: self.usage.as_ref().map(|u| u.tokens),
            cost_usd: self.usage.as_ref().map(|u| u.cost_usd),
        }
    }
}

/// A handler failure, classified for the retry state machine.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Transient: transport failures, HTTP 5xx, HTTP 429, explicit retry.
    #[error("retryable handler failure: {message}")]
    Retryable {
        /// Description of the failure.
        message: String,
        /// The dependency that failed, for circuit accounting.
        service: Option<String>,
    },
    /// Permanent: validation failures, HTTP 4xx other than 429.
    #[error("terminal handler failure: {message}")]
    Terminal {
        /// Description of the failure.
        message: String,
        /// The dependency that failed, for circuit accounting.
        service: Option<String>,
    },
}

impl HandlerError {
    /// Creates a retryable failure.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            service: None,
        }
    }

    /// Creates a terminal failure.
    #[must_use]
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal {
            message: message.into(),
            service: None,
        }
    }

    /// Classifies an HTTP status per the retry policy: 5xx and 429 are
    /// retryable, every other 4xx is terminal.
    #[must_use]
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status >= 500 || status == 429 {
            Self::Retryable {
                message,
                service: None,
            }
        } else {
            Self::Terminal {
                message,
                service: None,
            }
        }
    }

    /// Attributes the failure to a dependency.
    #[must_use]
    pub fn with_service(self, service: impl Into<String>) -> Self {
        match self {
            Self::Retryable { message, .. } => Self::Retryable {
                message,
                service: Some(service.into()),
            },
            Self::Terminal { message, .. } => Self::Terminal {
                message,
                service: Some(service.into()),
            },
        }
    }

    /// Returns true if the failure is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// The dependency that failed, if attributed.
    #[must_use]
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::Retryable { service, .. } | Self::Terminal { service, .. } => service.as_deref(),
        }
    }
}

/// Result type of a handler invocation.
pub type HandlerResult = std::result::Result<HandlerOutcome, HandlerError>;

/// A typed task handler.
///
/// Implementations deserialize and validate their own payload; the engine
/// treats it as opaque JSON.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Executes the task. Must observe `ctx.cancellation` at suspension
    /// points and abort promptly when it fires.
    async fn call(&self, task: &Task, ctx: &HandlerContext) -> HandlerResult;
}

/// Routes each task kind to its registered handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a kind, replacing any existing one.
    pub fn register(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Looks up the handler for a kind.
    #[must_use]
    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Returns how many kinds have handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<&str> = self.handlers.keys().map(TaskKind::as_str).collect();
        f.debug_struct("HandlerRegistry").field("kinds", &kinds).finish()
    }
}

// ---------------------------------------------------------------------------
// Typed payloads for the closed kind set. Validated by handlers, not here.
// ---------------------------------------------------------------------------

/// Payload for `code_pr` tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodePrPayload {
    /// Repository to modify.
    pub repo_url: String,
    /// Base branch for the pull request.
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    /// Goals the change must accomplish.
    pub goals: Vec<String>,
    /// Constraints the change must respect.
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Command validating the change, if any.
    #[serde(default)]
    pub test_command: Option<String>,
    /// Pull request title.
    pub pr_title: String,
}

fn default_base_branch() -> String {
    "main".to_string()
}

/// Payload for `centerpoint_sync` tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CenterpointSyncPayload {
    /// `full`, `incremental`, or `status`.
    pub sync_type: String,
    /// Entities to sync; empty means all.
    #[serde(default)]
    pub entities: Vec<String>,
    /// Lower bound for incremental syncs.
    #[serde(default)]
    pub since_timestamp: Option<DateTime<Utc>>,
}

/// Payload for `mrg_deploy` tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MrgDeployPayload {
    /// `staging` or `production`.
    pub environment: String,
    /// Version to deploy; latest when absent.
    #[serde(default)]
    pub version: Option<String>,
    /// Services to deploy; empty means all.
    #[serde(default)]
    pub services: Vec<String>,
    /// Roll back automatically on failure.
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
}

const fn default_true() -> bool {
    true
}

/// Payload for `gen_content` tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenContentPayload {
    /// Generation prompt.
    pub prompt: String,
    /// Model override.
    #[serde(default)]
    pub model: Option<String>,
    /// Output token cap.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Output format, e.g. `markdown`.
    #[serde(default)]
    pub output_format: Option<String>,
}

const fn default_max_tokens() -> u32 {
    4000
}

/// Payload for `aurea_action` tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AureaActionPayload {
    /// The workflow to run.
    pub workflow: String,
    /// Ordered steps with their per-step parameters.
    pub steps: Vec<Value>,
    /// Shared workflow context.
    #[serde(default)]
    pub context: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn http_status_classification() {
        assert!(HandlerError::from_http_status(503, "unavailable").is_retryable());
        assert!(HandlerError::from_http_status(500, "ise").is_retryable());
        assert!(HandlerError::from_http_status(429, "rate limited").is_retryable());
        assert!(!HandlerError::from_http_status(400, "bad request").is_retryable());
        assert!(!HandlerError::from_http_status(404, "not found").is_retryable());
        assert!(!HandlerError::from_http_status(422, "invalid").is_retryable());
    }

    #[test]
    fn error_carries_attributed_service() {
        let err = HandlerError::retryable("connect timeout").with_service("anthropic");
        assert_eq!(err.service(), Some("anthropic"));
        assert!(err.is_retryable());
    }

    #[test]
    fn outcome_builds_run_report() {
        let outcome = HandlerOutcome::success()
            .with_result(json!({"words": 120}))
            .with_usage(ModelUsage {
                provider: Provider::Anthropic,
                model: "claude-sonnet-4".into(),
                tokens: 900,
                cost_usd: 0.015,
            })
            .touching("anthropic");

        let report = outcome.to_report(2.5);
        assert!((report.metrics.duration_seconds - 2.5).abs() < f64::EPSILON);
        assert_eq!(report.model_used.as_deref(), Some("claude-sonnet-4"));
        assert_eq!(report.tokens, Some(900));
    }

    #[test]
    fn registry_routes_by_kind() {
        struct Noop;

        #[async_trait]
        impl TaskHandler for Noop {
            async fn call(&self, _task: &Task, _ctx: &HandlerContext) -> HandlerResult {
                Ok(HandlerOutcome::success())
            }
        }

        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register(TaskKind::GenContent, Arc::new(Noop));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(TaskKind::GenContent).is_some());
        assert!(registry.get(TaskKind::CodePr).is_none());
    }

    #[test]
    fn gen_content_payload_defaults() {
        let payload: GenContentPayload =
            serde_json::from_value(json!({"prompt": "write a haiku"})).unwrap();
        assert_eq!(payload.max_tokens, 4000);
        assert!(payload.model.is_none());
    }
}
