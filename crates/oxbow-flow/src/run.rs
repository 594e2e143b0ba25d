//! Run records: one row per execution attempt of a task.
//!
//! Tasks and runs reference each other only in one direction: a [`Run`]
//! holds its `task_id`; the task's latest-run view is computed on read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use oxbow_core::{RunId, TaskId};

/// Run execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The attempt is executing.
    Started,
    /// The attempt completed successfully.
    Success,
    /// The attempt failed.
    Failed,
    /// The attempt exceeded its deadline or lost its lease.
    Timeout,
    /// The attempt was canceled.
    Canceled,
}

impl RunStatus {
    /// Returns the wire name of this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
        }
    }

    /// Returns true once the attempt has ended.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution metrics recorded on a finished run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Wall-clock duration of the attempt.
    pub duration_seconds: f64,
    /// Handler-reported result summary, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// A single execution attempt of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier.
    pub id: RunId,
    /// The task this attempt belongs to.
    pub task_id: TaskId,
    /// Attempt number, 1-indexed and strictly increasing per task.
    pub attempt: u32,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Current status.
    pub status: RunStatus,
    /// Execution metrics.
    #[serde(default)]
    pub metrics: RunMetrics,
    /// Structured error information for failed attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Value>,
    /// The model used, when the handler invoked one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    /// Tokens consumed, when the handler invoked a model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    /// Cost in USD, when the handler reported spend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl Run {
    /// Creates a freshly-started run for the given attempt number.
    #[must_use]
    pub fn started(task_id: TaskId, attempt: u32) -> Self {
        Self {
            id: RunId::generate(),
            task_id,
            attempt,
            started_at: Utc::now(),
            ended_at: None,
            status: RunStatus::Started,
            metrics: RunMetrics::default(),
            error_details: None,
            model_used: None,
            tokens: None,
            cost_usd: None,
        }
    }
}

/// Handler-reported facts recorded when a run is finalized successfully.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Execution metrics.
    pub metrics: RunMetrics,
    /// The model used, if any.
    pub model_used: Option<String>,
    /// Tokens consumed, if any.
    pub tokens: Option<u64>,
    /// Cost in USD, if any.
    pub cost_usd: Option<f64>,
}
