//! Task records and the task status state machine.
//!
//! A [`Task`] is the unit of work the service accepts, queues, and
//! dispatches. Payloads are opaque JSON at this layer; the closed set of
//! [`TaskKind`]s routes each task to its typed handler, which owns payload
//! validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use oxbow_core::TaskId;

use crate::error::{Error, Result};

/// Default retry budget when the submitter does not override it.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// The closed set of task kinds this service dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Automated code change culminating in a pull request.
    CodePr,
    /// Data synchronization against the CenterPoint system.
    CenterpointSync,
    /// Deployment of MyRoofGenius services.
    MrgDeploy,
    /// Model-backed content generation.
    GenContent,
    /// Composite multi-step action.
    AureaAction,
}

impl TaskKind {
    /// Every kind, in routing order.
    pub const ALL: [Self; 5] = [
        Self::CodePr,
        Self::CenterpointSync,
        Self::MrgDeploy,
        Self::GenContent,
        Self::AureaAction,
    ];

    /// Returns the wire name of this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CodePr => "code_pr",
            Self::CenterpointSync => "centerpoint_sync",
            Self::MrgDeploy => "mrg_deploy",
            Self::GenContent => "gen_content",
            Self::AureaAction => "aurea_action",
        }
    }

    /// The dependency whose circuit gates admission for this kind.
    #[must_use]
    pub const fn dominant_dependency(&self) -> &'static str {
        match self {
            Self::CodePr => "github",
            Self::CenterpointSync => "centerpoint",
            Self::MrgDeploy => "mrg",
            Self::GenContent => "anthropic",
            Self::AureaAction => "aurea",
        }
    }

    /// The provider cost class for kinds that incur model spend.
    ///
    /// The reserved amount is the admission-time estimate a single execution
    /// is expected to cost; actual spend is committed post-completion from
    /// the handler's report.
    #[must_use]
    pub const fn cost_class(&self) -> Option<CostClass> {
        match self {
            Self::GenContent => Some(CostClass {
                provider: Provider::Anthropic,
                reserved_usd: 0.40,
            }),
            Self::CodePr => Some(CostClass {
                provider: Provider::Anthropic,
                reserved_usd: 0.25,
            }),
            Self::CenterpointSync | Self::MrgDeploy | Self::AureaAction => None,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "code_pr" => Ok(Self::CodePr),
            "centerpoint_sync" => Ok(Self::CenterpointSync),
            "mrg_deploy" => Ok(Self::MrgDeploy),
            "gen_content" => Ok(Self::GenContent),
            "aurea_action" => Ok(Self::AureaAction),
            other => Err(Error::InvalidRequest(format!("unknown task kind: {other}"))),
        }
    }
}

/// A model provider whose spend is metered by the budget ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Anthropic models.
    Anthropic,
    /// OpenAI models.
    Openai,
    /// Google models.
    Google,
}

impl Provider {
    /// Every known provider.
    pub const ALL: [Self; 3] = [Self::Anthropic, Self::Openai, Self::Google];

    /// Returns the wire name of this provider.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Openai => "openai",
            Self::Google => "google",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::Openai),
            "google" => Ok(Self::Google),
            other => Err(Error::InvalidRequest(format!("unknown provider: {other}"))),
        }
    }
}

/// Admission-time cost estimate for a cost-incurring task kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostClass {
    /// The provider the spend is ledgered against.
    pub provider: Provider,
    /// The amount reserved against the daily budget at admission.
    pub reserved_usd: f64,
}

/// Dispatch priority. Lower values dequeue first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    /// Interactive or operator-initiated work.
    pub const CRITICAL: Self = Self(1);
    /// Latency-sensitive background work.
    pub const HIGH: Self = Self(10);
    /// The default.
    pub const NORMAL: Self = Self(100);
    /// Bulk and maintenance work.
    pub const LOW: Self = Self(1000);

    /// Returns the next-lower standard level, saturating at [`Self::LOW`].
    ///
    /// Used when draining the DLQ so that re-driven work does not starve
    /// fresh submissions.
    #[must_use]
    pub const fn demoted(self) -> Self {
        match self.0 {
            i32::MIN..=1 => Self::HIGH,
            2..=10 => Self::NORMAL,
            _ => Self::LOW,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task execution status.
///
/// Transitions are monotonic with one exception: a task whose lease expired
/// moves from `running` back to `queued` so another worker may claim it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted and waiting in the queue.
    Queued,
    /// Leased by a worker and executing.
    Running,
    /// Completed successfully. Terminal.
    Done,
    /// Exhausted retries or failed terminally. Terminal.
    Failed,
    /// Canceled by an operator. Terminal.
    Canceled,
}

impl TaskStatus {
    /// Returns the wire name of this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Returns true if no further transitions are allowed.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }

    /// The set of statuses this status may transition to.
    #[must_use]
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::Queued => vec![Self::Running, Self::Canceled],
            // Running -> Queued is the re-lease path after lease expiry or a
            // retryable failure.
            Self::Running => vec![Self::Queued, Self::Done, Self::Failed, Self::Canceled],
            Self::Done | Self::Failed | Self::Canceled => vec![],
        }
    }

    /// Validates a transition to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] when the transition is not
    /// permitted by the state machine.
    pub fn check_transition(&self, target: Self) -> Result<()> {
        if self.valid_transitions().contains(&target) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                message: format!("{} -> {}", self.as_str(), target.as_str()),
            })
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client request to create a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// The task kind.
    #[serde(rename = "type")]
    pub kind: TaskKind,
    /// Opaque handler payload.
    pub payload: Value,
    /// Dispatch priority (lower dequeues first).
    #[serde(default)]
    pub priority: Priority,
    /// Client-supplied deduplication key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Correlation ID propagated into handler spans.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl TaskRequest {
    /// Creates a request with default priority and no idempotency key.
    #[must_use]
    pub fn new(kind: TaskKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            priority: Priority::default(),
            idempotency_key: None,
            trace_id: None,
        }
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A task record as owned by the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,
    /// The task kind.
    #[serde(rename = "type")]
    pub kind: TaskKind,
    /// Opaque handler payload.
    pub payload: Value,
    /// Dispatch priority.
    pub priority: Priority,
    /// Current status.
    pub status: TaskStatus,
    /// Number of retries consumed so far.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Client-supplied deduplication key, unique when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Correlation ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// When the task was accepted.
    pub enqueued_at: DateTime<Utc>,
    /// When the most recent attempt started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// The most recent error message, preserved across retries and DLQ moves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Deadline of the currently held lease, if the task is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_deadline: Option<DateTime<Utc>>,
}

impl Task {
    /// Builds a fresh queued task from a client request.
    #[must_use]
    pub fn from_request(request: TaskRequest, max_retries: u32) -> Self {
        Self {
            id: TaskId::generate(),
            kind: request.kind,
            payload: request.payload,
            priority: request.priority,
            status: TaskStatus::Queued,
            retry_count: 0,
            max_retries,
            idempotency_key: request.idempotency_key,
            trace_id: request.trace_id,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            lease_deadline: None,
        }
    }

    /// Returns true if the task has reached a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if another retry is permitted after a failure.
    #[must_use]
    pub const fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_wire_names_round_trip() {
        for kind in TaskKind::ALL {
            let parsed: TaskKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);

            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let result: Result<TaskKind> = "webhook_process".parse();
        assert!(result.is_err());
    }

    #[test]
    fn cost_classes_cover_model_backed_kinds() {
        assert!(TaskKind::GenContent.cost_class().is_some());
        assert!(TaskKind::CodePr.cost_class().is_some());
        assert!(TaskKind::MrgDeploy.cost_class().is_none());
    }

    #[test]
    fn priority_ordering_and_demotion() {
        assert!(Priority::CRITICAL < Priority::HIGH);
        assert!(Priority::HIGH < Priority::NORMAL);
        assert!(Priority::NORMAL < Priority::LOW);

        assert_eq!(Priority::CRITICAL.demoted(), Priority::HIGH);
        assert_eq!(Priority::HIGH.demoted(), Priority::NORMAL);
        assert_eq!(Priority::NORMAL.demoted(), Priority::LOW);
        assert_eq!(Priority::LOW.demoted(), Priority::LOW);
    }

    #[test]
    fn status_transitions_are_monotonic_except_relief() {
        // The one allowed backward edge: running -> queued on lease loss.
        TaskStatus::Running.check_transition(TaskStatus::Queued).unwrap();
        TaskStatus::Queued.check_transition(TaskStatus::Running).unwrap();

        assert!(TaskStatus::Done.check_transition(TaskStatus::Running).is_err());
        assert!(TaskStatus::Failed.check_transition(TaskStatus::Queued).is_err());
        assert!(TaskStatus::Queued.check_transition(TaskStatus::Done).is_err());
    }

    #[test]
    fn task_from_request_defaults() {
        let request = TaskRequest::new(TaskKind::GenContent, json!({"prompt": "hello"}))
            .with_idempotency_key("k1");
        let task = Task::from_request(request, 3);

        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.priority, Priority::NORMAL);
        assert_eq!(task.idempotency_key.as_deref(), Some("k1"));
        assert!(task.can_retry());
    }

    #[test]
    fn request_deserializes_wire_shape() {
        let request: TaskRequest = serde_json::from_value(json!({
            "type": "gen_content",
            "payload": {"prompt": "hi"},
            "idempotency_key": "k1"
        }))
        .unwrap();
        assert_eq!(request.kind, TaskKind::GenContent);
        assert_eq!(request.priority, Priority::NORMAL);
    }
}
