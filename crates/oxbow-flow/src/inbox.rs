//! Inbox records: durable dedup of inbound external events.
//!
//! Each accepted or rejected webhook leaves a row keyed by
//! `(source, external_id)`; the unique key is what turns a replayed
//! delivery into a `replay_blocked` rejection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use oxbow_core::{InboxEntryId, TaskId};

/// Inbox entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    /// Recorded, not yet linked to a task.
    Received,
    /// Linked to a task that has not finished.
    Processing,
    /// The linked task completed.
    Processed,
    /// Rejected at the gate. Never becomes processed.
    Rejected,
}

impl InboxStatus {
    /// Returns the wire name of this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for InboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded inbound webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEntry {
    /// Unique entry identifier.
    pub id: InboxEntryId,
    /// The webhook source (e.g. `github`).
    pub source: String,
    /// The source's delivery/event identifier.
    pub external_id: String,
    /// SHA-256 of the presented signature header, for audit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_hash: Option<String>,
    /// When the delivery was received.
    pub received_at: DateTime<Utc>,
    /// When the linked task completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    /// The delivery payload.
    pub payload: Value,
    /// The task created from this delivery, when accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Current status.
    pub status: InboxStatus,
    /// Why the delivery was rejected, when it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

/// Fields for inserting a new inbox entry.
#[derive(Debug, Clone)]
pub struct NewInboxEntry {
    /// The webhook source.
    pub source: String,
    /// The source's delivery/event identifier.
    pub external_id: String,
    /// SHA-256 of the presented signature header.
    pub signature_hash: Option<String>,
    /// The delivery payload.
    pub payload: Value,
    /// Initial status.
    pub status: InboxStatus,
    /// Rejection reason for entries recorded as rejected.
    pub rejection_reason: Option<String>,
}

impl NewInboxEntry {
    /// Builds the stored entry.
    #[must_use]
    pub fn into_entry(self, task_id: Option<TaskId>) -> InboxEntry {
        InboxEntry {
            id: InboxEntryId::generate(),
            source: self.source,
            external_id: self.external_id,
            signature_hash: self.signature_hash,
            received_at: Utc::now(),
            processed_at: None,
            payload: self.payload,
            task_id,
            status: self.status,
            rejection_reason: self.rejection_reason,
        }
    }
}
