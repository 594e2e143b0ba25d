//! Pluggable durable storage for orchestration state.
//!
//! The [`Store`] trait owns every persisted entity: tasks, runs, outbox,
//! inbox, budget ledgers, circuit states, and API keys. Methods are shaped
//! as *transactions*, not row accessors: every task-status mutation also
//! writes its Run row in the same logical transaction, and run-finalizing
//! success writes outbox entries atomically with the finalize.
//!
//! ## Design Principles
//!
//! - **Transactional operations**: `begin_attempt` / `finalize_success` /
//!   `record_retry` / `finalize_failure` are the only ways task status moves
//! - **Unique-insert outcomes**: idempotency-key and inbox conflicts are
//!   returned as values ([`TaskInsert`], [`InboxInsert`]), not errors, so
//!   races collapse into the duplicate path
//! - **Testability**: an in-memory implementation ships in [`memory`];
//!   production backends are a deployment concern behind the same trait

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use oxbow_core::{ApiKeyId, OutboxEntryId, RunId, TaskId};

use crate::apikey::ApiKey;
use crate::budget::BudgetLedger;
use crate::circuit::CircuitRecord;
use crate::error::Result;
use crate::inbox::{InboxEntry, NewInboxEntry};
use crate::outbox::{NewOutboxEntry, OutboxEntry};
use crate::run::{Run, RunReport, RunStatus};
use crate::task::{Priority, Task};

/// Outcome of inserting a task with an idempotency key.
#[derive(Debug, Clone)]
pub enum TaskInsert {
    /// The task was inserted.
    Created(Task),
    /// Another task already holds the idempotency key.
    Duplicate(Task),
}

impl TaskInsert {
    /// Returns the stored task either way.
    #[must_use]
    pub fn into_task(self) -> Task {
        match self {
            Self::Created(task) | Self::Duplicate(task) => task,
        }
    }

    /// Returns true if a new row was inserted.
    #[must_use]
    pub const fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Outcome of recording an inbound webhook.
#[derive(Debug, Clone)]
pub enum InboxInsert {
    /// The delivery was new; the entry and its task were stored together.
    Created {
        /// The recorded inbox entry.
        entry: InboxEntry,
        /// The task created from the delivery.
        task: Task,
    },
    /// The `(source, external_id)` pair was already recorded.
    Replay(InboxEntry),
}

/// Storage abstraction for orchestration state.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from the
/// HTTP surface, the worker pool, and the outbox relay.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Tasks ---

    /// Inserts a task, deduplicating on its idempotency key.
    ///
    /// A concurrent insert that loses the unique-key race resolves to
    /// [`TaskInsert::Duplicate`] carrying the winning row.
    async fn create_task(&self, task: Task) -> Result<TaskInsert>;

    /// Gets a task by ID. Returns `None` if it does not exist.
    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>>;

    /// Looks up a task by idempotency key.
    async fn find_task_by_idempotency_key(&self, key: &str) -> Result<Option<Task>>;

    /// Transitions a task to `running` and opens its next Run row.
    ///
    /// Any dangling `started` run from a previous lease is closed as
    /// `timeout` in the same transaction, keeping the one-active-run
    /// invariant. Attempt numbers strictly increase per task.
    async fn begin_attempt(&self, task_id: &TaskId, lease_deadline: DateTime<Utc>) -> Result<Run>;

    /// Finalizes a successful attempt.
    ///
    /// Marks the run `success`, the task `done`, and inserts the declared
    /// outbox entries — all in one transaction. Inbox entries linked to the
    /// task move to `processed`.
    async fn finalize_success(
        &self,
        task_id: &TaskId,
        run_id: &RunId,
        report: &RunReport,
        effects: Vec<NewOutboxEntry>,
    ) -> Result<()>;

    /// Records a retryable failure: the run ends with `status`, the task
    /// returns to `queued` with `retry_count` incremented and `last_error`
    /// preserved. Returns the updated task.
    async fn record_retry(
        &self,
        task_id: &TaskId,
        run_id: &RunId,
        status: RunStatus,
        error: &str,
    ) -> Result<Task>;

    /// Finalizes a terminal failure: the run ends with `status` and the
    /// task moves to `failed` with `last_error` preserved.
    async fn finalize_failure(
        &self,
        task_id: &TaskId,
        run_id: &RunId,
        status: RunStatus,
        error: &str,
    ) -> Result<()>;

    /// Dead-letters a task that exhausted its retries: the run ends with
    /// `status`, the task moves to `failed` with `retry_count` incremented
    /// and `last_error` preserved. Returns the updated task.
    async fn dead_letter(
        &self,
        task_id: &TaskId,
        run_id: &RunId,
        status: RunStatus,
        error: &str,
    ) -> Result<Task>;

    /// Cancels a non-terminal task, closing any started run as `canceled`.
    async fn cancel_task(&self, task_id: &TaskId) -> Result<Task>;

    /// Operator re-drive of a dead-lettered task: `failed` back to `queued`
    /// with `retry_count` reset and the given priority. The DLQ drain tool
    /// is the only caller.
    async fn revive_task(&self, task_id: &TaskId, priority: Priority) -> Result<Task>;

    /// Lists all runs of a task, oldest first.
    async fn list_runs(&self, task_id: &TaskId) -> Result<Vec<Run>>;

    /// Lists the most recent runs across tasks, newest first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<Run>>;

    // --- Inbox ---

    /// Records an inbound webhook and its task in one transaction.
    ///
    /// A `(source, external_id)` conflict resolves to
    /// [`InboxInsert::Replay`] and stores nothing.
    async fn insert_inbox_task(&self, inbox: NewInboxEntry, task: Task) -> Result<InboxInsert>;

    /// Best-effort record of a rejected delivery. An existing entry for the
    /// same `(source, external_id)` is left untouched.
    async fn record_inbox_rejection(&self, inbox: NewInboxEntry) -> Result<()>;

    /// Gets an inbox entry by its unique key.
    async fn get_inbox_entry(&self, source: &str, external_id: &str)
        -> Result<Option<InboxEntry>>;

    // --- Outbox ---

    /// Inserts pre-built outbox entries (operator re-drive and tests; the
    /// normal path is `finalize_success`).
    async fn insert_outbox_entries(&self, entries: Vec<OutboxEntry>) -> Result<()>;

    /// Gets an outbox entry by ID.
    async fn get_outbox_entry(&self, id: &OutboxEntryId) -> Result<Option<OutboxEntry>>;

    /// Lists pending entries whose next attempt is due, oldest due first.
    async fn pending_outbox(&self, due_at: DateTime<Utc>, limit: usize)
        -> Result<Vec<OutboxEntry>>;

    /// Marks an entry delivered.
    async fn mark_outbox_delivered(&self, id: &OutboxEntryId) -> Result<()>;

    /// Records a delivery failure. `next_attempt_at = None` marks the entry
    /// terminally `failed`.
    async fn record_outbox_failure(
        &self,
        id: &OutboxEntryId,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Deletes delivered entries older than `cutoff`. Returns the count.
    async fn purge_delivered_outbox(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    // --- Budget ledgers ---

    /// Returns the ledger row for `(provider, date)`, creating it with the
    /// given budget on first touch.
    async fn fetch_or_create_ledger(
        &self,
        provider: crate::task::Provider,
        date: NaiveDate,
        budget_usd: f64,
    ) -> Result<BudgetLedger>;

    /// Atomically adds spend to a ledger row, creating it if needed.
    async fn commit_spend(
        &self,
        provider: crate::task::Provider,
        date: NaiveDate,
        budget_usd: f64,
        cost_usd: f64,
        tokens: u64,
    ) -> Result<BudgetLedger>;

    /// Lists ledgers for a date.
    async fn list_ledgers(&self, date: NaiveDate) -> Result<Vec<BudgetLedger>>;

    // --- Circuit breakers ---

    /// Gets the circuit record for a service.
    async fn get_circuit(&self, service: &str) -> Result<Option<CircuitRecord>>;

    /// Upserts a circuit record.
    async fn put_circuit(&self, record: CircuitRecord) -> Result<()>;

    /// Lists all circuit records.
    async fn list_circuits(&self) -> Result<Vec<CircuitRecord>>;

    // --- API keys ---

    /// Inserts an API key record.
    async fn insert_api_key(&self, key: ApiKey) -> Result<()>;

    /// Gets an API key by ID.
    async fn get_api_key(&self, id: &ApiKeyId) -> Result<Option<ApiKey>>;

    /// Looks up an API key by its salted hash.
    async fn find_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>>;

    /// Updates `last_used_at`. Callers fire this opportunistically and must
    /// not block request handling on it.
    async fn touch_api_key(&self, id: &ApiKeyId, at: DateTime<Utc>) -> Result<()>;

    /// Activates or revokes a key. Returns the updated record.
    async fn set_api_key_active(&self, id: &ApiKeyId, active: bool) -> Result<Option<ApiKey>>;

    /// Sets or clears a key's expiry. Returns the updated record.
    async fn set_api_key_expiry(
        &self,
        id: &ApiKeyId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Option<ApiKey>>;

    /// Lists keys, optionally including revoked ones.
    async fn list_api_keys(&self, include_inactive: bool) -> Result<Vec<ApiKey>>;

    // --- Health ---

    /// Cheap reachability probe for `/health`.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Convenience for counting runs without cloning, used by invariant checks.
pub async fn run_count(store: &dyn Store, task_id: &TaskId) -> Result<usize> {
    Ok(store.list_runs(task_id).await?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskKind, TaskRequest};
    use serde_json::json;

    #[test]
    fn task_insert_accessors() {
        let task = Task::from_request(TaskRequest::new(TaskKind::GenContent, json!({})), 3);
        let insert = TaskInsert::Created(task.clone());
        assert!(insert.is_created());
        assert_eq!(insert.into_task().id, task.id);

        let insert = TaskInsert::Duplicate(task.clone());
        assert!(!insert.is_created());
    }

    #[tokio::test]
    async fn run_count_helper() {
        let store = memory::MemoryStore::new();
        let task = Task::from_request(TaskRequest::new(TaskKind::GenContent, json!({})), 3);
        let task = store.create_task(task).await.unwrap().into_task();

        assert_eq!(run_count(&store, &task.id).await.unwrap(), 0);
        store.begin_attempt(&task.id, Utc::now()).await.unwrap();
        assert_eq!(run_count(&store, &task.id).await.unwrap(), 1);
    }
}
