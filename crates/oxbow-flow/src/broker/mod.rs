//! Queue broker: priority dequeue with leases, locks, and dead-lettering.
//!
//! The broker holds the transient dispatch state: a priority-ordered queue,
//! a per-task lock table with TTLs, and depth counters. Durable truth about
//! tasks lives in the store; the broker only decides *who runs what next*.
//!
//! ## Leasing model
//!
//! Dequeue is peek-lock: [`QueueBroker::lease_next`] picks the highest
//! priority visible entry and acquires `lock:{task_id}` with a fresh
//! [`LeaseToken`] and a TTL. The entry stays in the queue, invisible while
//! the lock is live, so a crashed worker's task becomes leasable again the
//! moment its lock expires — the next leaser takes the expired lock over.
//! [`QueueBroker::release`] with a matching token removes both the lock and
//! the entry; a mismatched token reports [`LeaseStatus::Lost`] and touches
//! nothing.
//!
//! ## Ordering guarantee
//!
//! Within one priority bucket, FIFO by effective enqueue time (`visible_at`
//! for delayed re-enqueues); across buckets, strict priority. No fairness
//! across kinds beyond priority.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use oxbow_core::{LeaseToken, TaskId};

use crate::error::Result;
use crate::task::{Priority, TaskKind};

/// Default lock TTL (`TASK_LEASE_SECONDS`).
pub const DEFAULT_LEASE: Duration = Duration::from_secs(900);

/// An entry waiting in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEnvelope {
    /// The task to dispatch.
    pub task_id: TaskId,
    /// The task kind, for routing and metrics.
    pub kind: TaskKind,
    /// Dispatch priority (lower dequeues first).
    pub priority: Priority,
    /// When the task was first enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// When the entry becomes visible to consumers. Backoff re-enqueues
    /// push this into the future; priority is preserved.
    pub visible_at: DateTime<Utc>,
    /// The attempt this dequeue will start (1-indexed).
    pub attempt: u32,
}

impl QueueEnvelope {
    /// Creates an immediately-visible first-attempt envelope.
    #[must_use]
    pub fn new(task_id: TaskId, kind: TaskKind, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            kind,
            priority,
            enqueued_at: now,
            visible_at: now,
            attempt: 1,
        }
    }

    /// Delays visibility by `delay`, used for backoff re-enqueues.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.visible_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self
    }

    /// Sets the attempt number for a re-enqueue.
    #[must_use]
    pub const fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// Result of enqueueing an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// The envelope was accepted.
    Enqueued,
    /// The broker is at its hard capacity.
    QueueFull,
}

impl EnqueueResult {
    /// Returns true if the envelope was accepted.
    #[must_use]
    pub const fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued)
    }
}

/// A held lease on a task.
#[derive(Debug, Clone)]
pub struct Lease {
    /// The leased envelope.
    pub envelope: QueueEnvelope,
    /// The token proving ownership. Required for extend and release.
    pub token: LeaseToken,
    /// When the lock expires unless extended.
    pub deadline: DateTime<Utc>,
}

/// Outcome of a token-checked lock operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// The token matched; the operation applied.
    Held,
    /// The token did not match (expired and taken over, or already
    /// released). Nothing was changed.
    Lost,
}

impl LeaseStatus {
    /// Returns true if the lease was still held.
    #[must_use]
    pub const fn is_held(&self) -> bool {
        matches!(self, Self::Held)
    }
}

/// A task parked in the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    /// The dead-lettered task.
    pub task_id: TaskId,
    /// Its kind; DLQs are segmented per kind.
    pub kind: TaskKind,
    /// Priority at the time of death.
    pub priority: Priority,
    /// Retries consumed before dead-lettering.
    pub retry_count: u32,
    /// The final error, preserved for operators.
    pub last_error: Option<String>,
    /// When the task was moved to the DLQ.
    pub moved_at: DateTime<Utc>,
}

/// Broker-side counters for `/metrics` and `/health`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BrokerStats {
    /// Entries waiting and visible or delayed (not currently leased).
    pub queue_depth: usize,
    /// Unexpired locks.
    pub active_leases: usize,
    /// Per-kind DLQ depths.
    pub dlq_depth: Vec<(TaskKind, usize)>,
}

/// Priority queue with TTL'd per-task locks.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync`; the dispatcher, HTTP surface, and
/// operator tooling call concurrently.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Enqueues an envelope.
    async fn enqueue(&self, envelope: QueueEnvelope) -> Result<EnqueueResult>;

    /// Blocks up to `max_wait` for the next visible entry, atomically
    /// acquiring its lock.
    ///
    /// Returns `None` when nothing became leasable within the wait. An
    /// entry whose previous lock expired is taken over transparently.
    async fn lease_next(&self, consumer_id: &str, max_wait: Duration) -> Result<Option<Lease>>;

    /// Extends a held lease by `ttl` from now iff `token` matches.
    async fn extend_lease(
        &self,
        task_id: &TaskId,
        token: &LeaseToken,
        ttl: Duration,
    ) -> Result<LeaseStatus>;

    /// Releases the lock and removes the leased entry iff `token` matches.
    async fn release(&self, task_id: &TaskId, token: &LeaseToken) -> Result<LeaseStatus>;

    /// Approximate number of queued (unleased) entries.
    async fn depth(&self) -> Result<usize>;

    /// Parks a task in its kind's dead-letter queue.
    async fn push_dlq(&self, entry: DlqEntry) -> Result<()>;

    /// Lists dead-lettered tasks for a kind, oldest first.
    async fn list_dlq(&self, kind: TaskKind, limit: usize) -> Result<Vec<DlqEntry>>;

    /// Removes up to `max` entries from a kind's DLQ, oldest first.
    ///
    /// The caller (operator tooling) is responsible for re-enqueueing.
    async fn drain_dlq(&self, kind: TaskKind, max: usize) -> Result<Vec<DlqEntry>>;

    /// Returns broker counters.
    async fn stats(&self) -> Result<BrokerStats>;

    /// Cheap reachability probe for `/health`.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
