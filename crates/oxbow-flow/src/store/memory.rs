//! In-memory store implementation.
//!
//! This module provides [`MemoryStore`], a thread-safe in-memory
//! implementation of the [`Store`] trait suitable for testing and
//! single-process deployments.
//!
//! ## Limitations
//!
//! - **Single-process only**: State is not shared across process boundaries
//! - **No persistence**: All state is lost when the process exits

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use oxbow_core::{ApiKeyId, OutboxEntryId, RunId, TaskId};

use super::{InboxInsert, Store, TaskInsert};
use crate::apikey::ApiKey;
use crate::budget::BudgetLedger;
use crate::circuit::CircuitRecord;
use crate::error::{Error, Result};
use crate::inbox::{InboxEntry, InboxStatus, NewInboxEntry};
use crate::outbox::{NewOutboxEntry, OutboxEntry, OutboxStatus};
use crate::run::{Run, RunReport, RunStatus};
use crate::task::{Priority, Provider, Task, TaskStatus};

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("store lock poisoned")
}

#[derive(Debug, Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    /// Unique index: idempotency_key -> task id.
    idempotency: HashMap<String, TaskId>,
    /// Append-ordered run rows.
    runs: Vec<Run>,
    /// Unique index: (source, external_id) -> entry.
    inbox: HashMap<(String, String), InboxEntry>,
    outbox: HashMap<OutboxEntryId, OutboxEntry>,
    ledgers: HashMap<(Provider, NaiveDate), BudgetLedger>,
    circuits: HashMap<String, CircuitRecord>,
    api_keys: HashMap<ApiKeyId, ApiKey>,
}

/// In-memory store.
///
/// All tables live behind a single `RwLock` so that multi-table operations
/// (`begin_attempt`, `finalize_success`, `insert_inbox_task`) are atomic,
/// matching the transactional contract of the trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn task_count(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.tasks.len())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_task(&self, task: Task) -> Result<TaskInsert> {
        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(key) = &task.idempotency_key {
            if let Some(existing_id) = state.idempotency.get(key) {
                let existing = state
                    .tasks
                    .get(existing_id)
                    .cloned()
                    .ok_or_else(|| Error::storage("idempotency index points at missing task"))?;
                return Ok(TaskInsert::Duplicate(existing));
            }
            state.idempotency.insert(key.clone(), task.id);
        }

        state.tasks.insert(task.id, task.clone());
        Ok(TaskInsert::Created(task))
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.tasks.get(task_id).cloned())
    }

    async fn find_task_by_idempotency_key(&self, key: &str) -> Result<Option<Task>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .idempotency
            .get(key)
            .and_then(|id| state.tasks.get(id))
            .cloned())
    }

    async fn begin_attempt(&self, task_id: &TaskId, lease_deadline: DateTime<Utc>) -> Result<Run> {
        let mut state = self.state.write().map_err(poison_err)?;
        let State { tasks, runs, .. } = &mut *state;

        let task = tasks
            .get_mut(task_id)
            .ok_or(Error::TaskNotFound { task_id: *task_id })?;

        match task.status {
            TaskStatus::Queued | TaskStatus::Running => {}
            other => {
                return Err(Error::InvalidTransition {
                    message: format!("cannot start attempt on {other} task"),
                });
            }
        }

        let now = Utc::now();
        let mut last_attempt = 0;
        for run in runs.iter_mut().filter(|r| r.task_id == *task_id) {
            last_attempt = last_attempt.max(run.attempt);
            // A previous worker lost its lease without reporting back.
            if run.status == RunStatus::Started {
                run.status = RunStatus::Timeout;
                run.ended_at = Some(now);
            }
        }

        let run = Run::started(*task_id, last_attempt + 1);
        task.status = TaskStatus::Running;
        task.started_at = Some(run.started_at);
        task.lease_deadline = Some(lease_deadline);
        runs.push(run.clone());

        Ok(run)
    }

    async fn finalize_success(
        &self,
        task_id: &TaskId,
        run_id: &RunId,
        report: &RunReport,
        effects: Vec<NewOutboxEntry>,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let State {
            tasks,
            runs,
            inbox,
            outbox,
            ..
        } = &mut *state;

        let task = tasks
            .get_mut(task_id)
            .ok_or(Error::TaskNotFound { task_id: *task_id })?;
        task.status.check_transition(TaskStatus::Done)?;

        let run = runs
            .iter_mut()
            .find(|r| r.id == *run_id)
            .ok_or_else(|| Error::storage(format!("run not found: {run_id}")))?;

        let now = Utc::now();
        run.status = RunStatus::Success;
        run.ended_at = Some(now);
        run.metrics = report.metrics.clone();
        run.model_used = report.model_used.clone();
        run.tokens = report.tokens;
        run.cost_usd = report.cost_usd;

        task.status = TaskStatus::Done;
        task.completed_at = Some(now);
        task.lease_deadline = None;
        task.last_error = None;

        for effect in effects {
            let entry = effect.into_entry(*task_id);
            outbox.insert(entry.id, entry);
        }

        for entry in inbox
            .values_mut()
            .filter(|e| e.task_id == Some(*task_id) && e.status == InboxStatus::Processing)
        {
            entry.status = InboxStatus::Processed;
            entry.processed_at = Some(now);
        }

        Ok(())
    }

    async fn record_retry(
        &self,
        task_id: &TaskId,
        run_id: &RunId,
        status: RunStatus,
        error: &str,
    ) -> Result<Task> {
        let mut state = self.state.write().map_err(poison_err)?;
        let State { tasks, runs, .. } = &mut *state;

        let task = tasks
            .get_mut(task_id)
            .ok_or(Error::TaskNotFound { task_id: *task_id })?;
        task.status.check_transition(TaskStatus::Queued)?;

        let run = runs
            .iter_mut()
            .find(|r| r.id == *run_id)
            .ok_or_else(|| Error::storage(format!("run not found: {run_id}")))?;

        let now = Utc::now();
        run.status = status;
        run.ended_at = Some(now);
        run.error_details = Some(serde_json::json!({ "message": error }));

        task.status = TaskStatus::Queued;
        task.retry_count += 1;
        task.last_error = Some(error.to_string());
        task.lease_deadline = None;

        Ok(task.clone())
    }

    async fn finalize_failure(
        &self,
        task_id: &TaskId,
        run_id: &RunId,
        status: RunStatus,
        error: &str,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let State { tasks, runs, .. } = &mut *state;

        let task = tasks
            .get_mut(task_id)
            .ok_or(Error::TaskNotFound { task_id: *task_id })?;
        task.status.check_transition(TaskStatus::Failed)?;

        let run = runs
            .iter_mut()
            .find(|r| r.id == *run_id)
            .ok_or_else(|| Error::storage(format!("run not found: {run_id}")))?;

        let now = Utc::now();
        run.status = status;
        run.ended_at = Some(now);
        run.error_details = Some(serde_json::json!({ "message": error }));

        task.status = TaskStatus::Failed;
        task.completed_at = Some(now);
        task.last_error = Some(error.to_string());
        task.lease_deadline = None;

        Ok(())
    }

    async fn dead_letter(
        &self,
        task_id: &TaskId,
        run_id: &RunId,
        status: RunStatus,
        error: &str,
    ) -> Result<Task> {
        let mut state = self.state.write().map_err(poison_err)?;
        let State { tasks, runs, .. } = &mut *state;

        let task = tasks
            .get_mut(task_id)
            .ok_or(Error::TaskNotFound { task_id: *task_id })?;
        task.status.check_transition(TaskStatus::Failed)?;

        let run = runs
            .iter_mut()
            .find(|r| r.id == *run_id)
            .ok_or_else(|| Error::storage(format!("run not found: {run_id}")))?;

        let now = Utc::now();
        run.status = status;
        run.ended_at = Some(now);
        run.error_details = Some(serde_json::json!({ "message": error }));

        task.status = TaskStatus::Failed;
        task.retry_count += 1;
        task.completed_at = Some(now);
        task.last_error = Some(error.to_string());
        task.lease_deadline = None;

        Ok(task.clone())
    }

    async fn cancel_task(&self, task_id: &TaskId) -> Result<Task> {
        let mut state = self.state.write().map_err(poison_err)?;
        let State { tasks, runs, .. } = &mut *state;

        let task = tasks
            .get_mut(task_id)
            .ok_or(Error::TaskNotFound { task_id: *task_id })?;
        task.status.check_transition(TaskStatus::Canceled)?;

        let now = Utc::now();
        for run in runs
            .iter_mut()
            .filter(|r| r.task_id == *task_id && r.status == RunStatus::Started)
        {
            run.status = RunStatus::Canceled;
            run.ended_at = Some(now);
        }

        task.status = TaskStatus::Canceled;
        task.completed_at = Some(now);
        task.lease_deadline = None;

        Ok(task.clone())
    }

    async fn revive_task(&self, task_id: &TaskId, priority: Priority) -> Result<Task> {
        let mut state = self.state.write().map_err(poison_err)?;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or(Error::TaskNotFound { task_id: *task_id })?;

        if task.status != TaskStatus::Failed {
            return Err(Error::InvalidTransition {
                message: format!("cannot revive {} task", task.status),
            });
        }

        task.status = TaskStatus::Queued;
        task.retry_count = 0;
        task.priority = priority;
        task.completed_at = None;
        task.enqueued_at = Utc::now();

        Ok(task.clone())
    }

    async fn list_runs(&self, task_id: &TaskId) -> Result<Vec<Run>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.task_id == *task_id)
            .cloned()
            .collect())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.runs.iter().rev().take(limit).cloned().collect())
    }

    async fn insert_inbox_task(&self, inbox: NewInboxEntry, task: Task) -> Result<InboxInsert> {
        let mut state = self.state.write().map_err(poison_err)?;

        let key = (inbox.source.clone(), inbox.external_id.clone());
        if let Some(existing) = state.inbox.get(&key) {
            return Ok(InboxInsert::Replay(existing.clone()));
        }

        if let Some(idem) = &task.idempotency_key {
            state.idempotency.insert(idem.clone(), task.id);
        }

        let entry = inbox.into_entry(Some(task.id));
        state.inbox.insert(key, entry.clone());
        state.tasks.insert(task.id, task.clone());

        Ok(InboxInsert::Created { entry, task })
    }

    async fn record_inbox_rejection(&self, inbox: NewInboxEntry) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;

        let key = (inbox.source.clone(), inbox.external_id.clone());
        if state.inbox.contains_key(&key) {
            return Ok(());
        }

        let entry = inbox.into_entry(None);
        state.inbox.insert(key, entry);
        Ok(())
    }

    async fn get_inbox_entry(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<InboxEntry>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .inbox
            .get(&(source.to_string(), external_id.to_string()))
            .cloned())
    }

    async fn insert_outbox_entries(&self, entries: Vec<OutboxEntry>) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        for entry in entries {
            state.outbox.insert(entry.id, entry);
        }
        Ok(())
    }

    async fn get_outbox_entry(&self, id: &OutboxEntryId) -> Result<Option<OutboxEntry>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.outbox.get(id).cloned())
    }

    async fn pending_outbox(
        &self,
        due_at: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut due: Vec<OutboxEntry> = state
            .outbox
            .values()
            .filter(|e| e.status == OutboxStatus::Pending && e.next_attempt_at <= due_at)
            .cloned()
            .collect();
        due.sort_by_key(|e| e.next_attempt_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_outbox_delivered(&self, id: &OutboxEntryId) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let entry = state
            .outbox
            .get_mut(id)
            .ok_or_else(|| Error::storage(format!("outbox entry not found: {id}")))?;
        entry.status = OutboxStatus::Delivered;
        entry.delivered_at = Some(Utc::now());
        Ok(())
    }

    async fn record_outbox_failure(
        &self,
        id: &OutboxEntryId,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let entry = state
            .outbox
            .get_mut(id)
            .ok_or_else(|| Error::storage(format!("outbox entry not found: {id}")))?;

        entry.retry_count += 1;
        entry.last_error = Some(error.to_string());
        match next_attempt_at {
            Some(at) => entry.next_attempt_at = at,
            None => entry.status = OutboxStatus::Failed,
        }
        Ok(())
    }

    async fn purge_delivered_outbox(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().map_err(poison_err)?;
        let before = state.outbox.len();
        state.outbox.retain(|_, e| {
            !(e.status == OutboxStatus::Delivered && e.delivered_at.is_some_and(|at| at < cutoff))
        });
        Ok(before - state.outbox.len())
    }

    async fn fetch_or_create_ledger(
        &self,
        provider: Provider,
        date: NaiveDate,
        budget_usd: f64,
    ) -> Result<BudgetLedger> {
        let mut state = self.state.write().map_err(poison_err)?;
        let ledger = state
            .ledgers
            .entry((provider, date))
            .or_insert_with(|| BudgetLedger::new(provider, date, budget_usd));
        Ok(ledger.clone())
    }

    async fn commit_spend(
        &self,
        provider: Provider,
        date: NaiveDate,
        budget_usd: f64,
        cost_usd: f64,
        tokens: u64,
    ) -> Result<BudgetLedger> {
        let mut state = self.state.write().map_err(poison_err)?;
        let ledger = state
            .ledgers
            .entry((provider, date))
            .or_insert_with(|| BudgetLedger::new(provider, date, budget_usd));

        ledger.spent_usd += cost_usd;
        ledger.tokens += tokens;
        ledger.requests += 1;
        ledger.last_updated = Utc::now();

        Ok(ledger.clone())
    }

    async fn list_ledgers(&self, date: NaiveDate) -> Result<Vec<BudgetLedger>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut ledgers: Vec<BudgetLedger> = state
            .ledgers
            .values()
            .filter(|l| l.date == date)
            .cloned()
            .collect();
        ledgers.sort_by_key(|l| l.provider.as_str());
        Ok(ledgers)
    }

    async fn get_circuit(&self, service: &str) -> Result<Option<CircuitRecord>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.circuits.get(service).cloned())
    }

    async fn put_circuit(&self, record: CircuitRecord) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.circuits.insert(record.service.clone(), record);
        Ok(())
    }

    async fn list_circuits(&self) -> Result<Vec<CircuitRecord>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut records: Vec<CircuitRecord> = state.circuits.values().cloned().collect();
        records.sort_by(|a, b| a.service.cmp(&b.service));
        Ok(records)
    }

    async fn insert_api_key(&self, key: ApiKey) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.api_keys.insert(key.id, key);
        Ok(())
    }

    async fn get_api_key(&self, id: &ApiKeyId) -> Result<Option<ApiKey>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.api_keys.get(id).cloned())
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .api_keys
            .values()
            .find(|k| k.key_hash == key_hash)
            .cloned())
    }

    async fn touch_api_key(&self, id: &ApiKeyId, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if let Some(key) = state.api_keys.get_mut(id) {
            key.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn set_api_key_active(&self, id: &ApiKeyId, active: bool) -> Result<Option<ApiKey>> {
        let mut state = self.state.write().map_err(poison_err)?;
        Ok(state.api_keys.get_mut(id).map(|key| {
            key.is_active = active;
            key.clone()
        }))
    }

    async fn set_api_key_expiry(
        &self,
        id: &ApiKeyId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Option<ApiKey>> {
        let mut state = self.state.write().map_err(poison_err)?;
        Ok(state.api_keys.get_mut(id).map(|key| {
            key.expires_at = expires_at;
            key.clone()
        }))
    }

    async fn list_api_keys(&self, include_inactive: bool) -> Result<Vec<ApiKey>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut keys: Vec<ApiKey> = state
            .api_keys
            .values()
            .filter(|k| include_inactive || k.is_active)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }
}
