//! The dispatcher / worker pool.
//!
//! Each process runs one [`WorkerPool`] with `MAX_CONCURRENCY` slots. The
//! pool leases tasks from the broker, opens a Run row, invokes the typed
//! handler under a heartbeat that extends the lease every third of its TTL,
//! and interprets the result through the retry / backoff / dead-letter
//! state machine. The lock is released on every exit path; a heartbeat
//! that finds the lease gone cancels the handler and mutates nothing,
//! because another worker owns the task by then.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use oxbow_core::TaskId;

use crate::broker::{DlqEntry, Lease, LeaseStatus, QueueBroker, QueueEnvelope};
use crate::budget::BudgetAccountant;
use crate::circuit::CircuitRegistry;
use crate::error::{Error, Result};
use crate::handler::{HandlerContext, HandlerError, HandlerOutcome, HandlerRegistry};
use crate::metrics::FlowMetrics;
use crate::retry::BackoffPolicy;
use crate::run::{Run, RunStatus};
use crate::store::Store;
use crate::task::{Task, TaskKind};

/// Default concurrent slots per worker process (`MAX_CONCURRENCY`).
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Tunables for the worker pool.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Concurrent slots in this process.
    pub max_concurrency: usize,
    /// Lock TTL and heartbeat base (`TASK_LEASE_SECONDS`).
    pub lease: Duration,
    /// Bounded wait per dequeue poll.
    pub dequeue_wait: Duration,
    /// Hard deadline per attempt. The heartbeat keeps the lease alive for
    /// handlers that outlive one TTL; this caps how long that may go on.
    pub max_task_duration: Duration,
    /// Backoff policy for retryable failures.
    pub backoff: BackoffPolicy,
    /// Grace for in-flight handlers at shutdown; defaults to the lease.
    pub shutdown_grace: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            lease: crate::broker::DEFAULT_LEASE,
            dequeue_wait: Duration::from_secs(1),
            max_task_duration: Duration::from_secs(3600),
            backoff: BackoffPolicy::default(),
            shutdown_grace: None,
        }
    }
}

/// How one attempt ended, before the store is told.
enum AttemptOutcome {
    Success(HandlerOutcome),
    Failed(HandlerError),
    /// Deadline exceeded while the lease was still held.
    TimedOut,
    /// The heartbeat found the lease gone; another worker owns the task.
    LeaseLost,
    /// No handler is registered for the kind.
    NoHandler,
}

/// The dispatcher: leases, executes, and settles tasks.
pub struct WorkerPool {
    store: Arc<dyn Store>,
    broker: Arc<dyn QueueBroker>,
    registry: Arc<HandlerRegistry>,
    circuits: Arc<CircuitRegistry>,
    budget: Arc<BudgetAccountant>,
    config: WorkerConfig,
    metrics: FlowMetrics,
    shutdown: CancellationToken,
    consumer_id: String,
}

impl WorkerPool {
    /// Creates a pool over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn QueueBroker>,
        registry: Arc<HandlerRegistry>,
        circuits: Arc<CircuitRegistry>,
        budget: Arc<BudgetAccountant>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            broker,
            registry,
            circuits,
            budget,
            config,
            metrics: FlowMetrics::new(),
            shutdown: CancellationToken::new(),
            consumer_id: format!("oxbow-worker-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Token that stops the pool when cancelled. New leases stop
    /// immediately; in-flight handlers get the shutdown grace.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// This pool's consumer identity, for logs and lease attribution.
    #[must_use]
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Runs the dispatch loop until the shutdown token fires, then drains
    /// in-flight work within the grace period.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            consumer_id = %self.consumer_id,
            max_concurrency = self.config.max_concurrency,
            lease_secs = self.config.lease.as_secs(),
            "worker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut inflight: JoinSet<()> = JoinSet::new();

        loop {
            // Reap finished slots so the set does not grow unbounded.
            while inflight.try_join_next().is_some() {}

            let permit = tokio::select! {
                () = self.shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let leased = tokio::select! {
                () = self.shutdown.cancelled() => {
                    drop(permit);
                    break;
                }
                leased = self.broker.lease_next(&self.consumer_id, self.config.dequeue_wait) => leased,
            };

            match leased {
                Ok(Some(lease)) => {
                    let pool = Arc::clone(&self);
                    inflight.spawn(async move {
                        let _permit = permit;
                        let task_id = lease.envelope.task_id;
                        if let Err(error) = pool.process(lease).await {
                            tracing::error!(%task_id, %error, "task processing failed");
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    self.publish_broker_gauges().await;
                }
                Err(error) => {
                    // Broker trouble is a system error: back the loop off,
                    // never a task.
                    drop(permit);
                    tracing::error!(%error, "lease poll failed; backing off dispatch loop");
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        let grace = self.config.shutdown_grace.unwrap_or(self.config.lease);
        tracing::info!(grace_secs = grace.as_secs(), "draining in-flight tasks");
        let drain = async {
            while inflight.join_next().await.is_some() {}
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!("shutdown grace exceeded; aborting remaining handlers");
            inflight.shutdown().await;
        }
        tracing::info!(consumer_id = %self.consumer_id, "worker pool stopped");
    }

    /// Executes one leased task end to end.
    async fn process(&self, lease: Lease) -> Result<()> {
        let task_id = lease.envelope.task_id;

        let Some(task) = self.store.get_task(&task_id).await? else {
            // Queue entry without a task row; drop it.
            self.broker.release(&task_id, &lease.token).await?;
            return Err(Error::TaskNotFound { task_id });
        };
        if task.is_terminal() {
            // Canceled (or otherwise finished) while waiting in the queue.
            self.broker.release(&task_id, &lease.token).await?;
            return Ok(());
        }

        let run = match self.store.begin_attempt(&task_id, lease.deadline).await {
            Ok(run) => run,
            Err(error) => {
                // System error: release so another worker can try; the task
                // is not finalized.
                self.broker.release(&task_id, &lease.token).await?;
                return Err(error);
            }
        };

        let cancel = CancellationToken::new();
        let heartbeat = tokio::spawn(Self::heartbeat(
            self.broker.clone(),
            task_id,
            task.kind,
            lease.token,
            self.config.lease,
            cancel.clone(),
            self.metrics,
        ));

        let deadline = Utc::now()
            + chrono::Duration::from_std(self.config.max_task_duration)
                .unwrap_or(chrono::Duration::hours(1));
        let ctx = HandlerContext {
            task_id,
            run_id: run.id,
            attempt: run.attempt,
            trace_id: task.trace_id.clone(),
            deadline,
            cancellation: cancel.clone(),
        };

        let started = Instant::now();
        let outcome = self.invoke(&task, &ctx, &cancel).await;
        let duration = started.elapsed().as_secs_f64();
        heartbeat.abort();

        let settle_result = self.settle(&task, &run, outcome, duration).await;

        // Release on every exit path. A lost lease reports Lost harmlessly.
        self.broker.release(&task_id, &lease.token).await?;
        self.publish_broker_gauges().await;

        settle_result
    }

    /// Runs the handler under deadline and cancellation.
    async fn invoke(
        &self,
        task: &Task,
        ctx: &HandlerContext,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let Some(handler) = self.registry.get(task.kind) else {
            return AttemptOutcome::NoHandler;
        };

        tokio::select! {
            () = cancel.cancelled() => AttemptOutcome::LeaseLost,
            result = tokio::time::timeout(self.config.max_task_duration, handler.call(task, ctx)) => match result {
                Ok(Ok(outcome)) => AttemptOutcome::Success(outcome),
                Ok(Err(error)) => AttemptOutcome::Failed(error),
                Err(_) => AttemptOutcome::TimedOut,
            }
        }
    }

    /// Applies an attempt outcome to the store, broker, budget, and
    /// circuit breakers.
    async fn settle(
        &self,
        task: &Task,
        run: &Run,
        outcome: AttemptOutcome,
        duration: f64,
    ) -> Result<()> {
        let kind = task.kind.as_str();

        match outcome {
            AttemptOutcome::Success(outcome) => {
                let report = outcome.to_report(duration);
                self.store
                    .finalize_success(&task.id, &run.id, &report, outcome.effects.clone())
                    .await?;

                if let Some(usage) = &outcome.usage {
                    let ledger = self
                        .budget
                        .commit(usage.provider, usage.cost_usd, usage.tokens)
                        .await?;
                    self.metrics
                        .set_budget_spent(usage.provider.as_str(), ledger.spent_usd);
                }

                let services = if outcome.services.is_empty() {
                    vec![task.kind.dominant_dependency().to_string()]
                } else {
                    outcome.services.clone()
                };
                for service in &services {
                    self.circuits.record_success(service).await?;
                }

                self.metrics.record_task(kind, "done");
                self.metrics.observe_task_duration(kind, "done", duration);
                tracing::info!(
                    task_id = %task.id,
                    kind,
                    attempt = run.attempt,
                    duration_secs = duration,
                    "task completed"
                );
                Ok(())
            }

            AttemptOutcome::Failed(error) if error.is_retryable() => {
                let service = error
                    .service()
                    .unwrap_or(task.kind.dominant_dependency())
                    .to_string();
                self.circuits.record_failure(&service).await?;
                self.retry_or_dead_letter(task, run, RunStatus::Failed, &error.to_string())
                    .await
            }

            AttemptOutcome::Failed(error) => {
                if let Some(service) = error.service() {
                    self.circuits.record_failure(service).await?;
                }
                let message = error.to_string();
                self.store
                    .finalize_failure(&task.id, &run.id, RunStatus::Failed, &message)
                    .await?;
                self.metrics.record_task(kind, "failed");
                self.metrics.observe_task_duration(kind, "failed", duration);
                tracing::error!(task_id = %task.id, kind, %message, "task failed terminally");
                Ok(())
            }

            AttemptOutcome::TimedOut => {
                self.circuits
                    .record_failure(task.kind.dominant_dependency())
                    .await?;
                self.retry_or_dead_letter(task, run, RunStatus::Timeout, "attempt deadline exceeded")
                    .await
            }

            AttemptOutcome::LeaseLost => {
                // Another worker owns the task; the dangling run is closed
                // by its begin_attempt. Mutate nothing here.
                tracing::warn!(
                    task_id = %task.id,
                    kind,
                    attempt = run.attempt,
                    "lease lost mid-attempt; abandoning"
                );
                Ok(())
            }

            AttemptOutcome::NoHandler => {
                let message = format!("no handler registered for kind {}", task.kind);
                self.store
                    .finalize_failure(&task.id, &run.id, RunStatus::Failed, &message)
                    .await?;
                self.metrics.record_task(kind, "failed");
                tracing::error!(task_id = %task.id, kind, "no handler registered");
                Ok(())
            }
        }
    }

    /// Retryable failure: backoff re-enqueue while budget remains, else DLQ.
    async fn retry_or_dead_letter(
        &self,
        task: &Task,
        run: &Run,
        run_status: RunStatus,
        message: &str,
    ) -> Result<()> {
        let kind = task.kind.as_str();

        if task.retry_count + 1 < task.max_retries {
            let delay = self.config.backoff.delay_for(task.retry_count);
            let updated = self
                .store
                .record_retry(&task.id, &run.id, run_status, message)
                .await?;

            let envelope = QueueEnvelope::new(task.id, task.kind, task.priority)
                .with_delay(delay)
                .with_attempt(updated.retry_count + 1);
            self.broker.enqueue(envelope).await?;

            self.metrics.record_retry(kind);
            tracing::warn!(
                task_id = %task.id,
                kind,
                retry_count = updated.retry_count,
                max_retries = updated.max_retries,
                delay_ms = delay.as_millis() as u64,
                %message,
                "task failed, retry scheduled"
            );
        } else {
            let updated = self
                .store
                .dead_letter(&task.id, &run.id, run_status, message)
                .await?;
            self.broker
                .push_dlq(DlqEntry {
                    task_id: task.id,
                    kind: task.kind,
                    priority: task.priority,
                    retry_count: updated.retry_count,
                    last_error: updated.last_error.clone(),
                    moved_at: Utc::now(),
                })
                .await?;

            self.metrics.record_task(kind, "failed");
            tracing::error!(
                task_id = %task.id,
                kind,
                retry_count = updated.retry_count,
                %message,
                "retries exhausted, task dead-lettered"
            );
        }
        Ok(())
    }

    /// Extends the lease every third of its TTL; cancels the handler the
    /// moment the lease is gone.
    async fn heartbeat(
        broker: Arc<dyn QueueBroker>,
        task_id: TaskId,
        kind: TaskKind,
        token: oxbow_core::LeaseToken,
        ttl: Duration,
        cancel: CancellationToken,
        metrics: FlowMetrics,
    ) {
        let interval = ttl / 3;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(interval) => {}
            }
            match broker.extend_lease(&task_id, &token, ttl).await {
                Ok(LeaseStatus::Held) => {
                    tracing::trace!(%task_id, "lease extended");
                }
                Ok(LeaseStatus::Lost) => {
                    metrics.record_lease_loss(kind.as_str());
                    tracing::warn!(%task_id, "lease lost; canceling handler");
                    cancel.cancel();
                    return;
                }
                Err(error) => {
                    // A broker we cannot reach cannot extend the lease
                    // either; treat as lost.
                    tracing::warn!(%task_id, %error, "heartbeat failed; canceling handler");
                    cancel.cancel();
                    return;
                }
            }
        }
    }

    async fn publish_broker_gauges(&self) {
        if let Ok(stats) = self.broker.stats().await {
            self.metrics.set_queue_depth(stats.queue_depth);
            self.metrics.set_active_leases(stats.active_leases);
            for (kind, depth) in &stats.dlq_depth {
                self.metrics.set_dlq_depth(kind.as_str(), *depth);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionConfig, AdmissionController};
    use crate::broker::memory::{BrokerConfig, InMemoryBroker};
    use crate::budget::BudgetConfig;
    use crate::circuit::CircuitBreakerConfig;
    use crate::gate::{GateConfig, SubmissionGate};
    use crate::handler::{HandlerResult, TaskHandler};
    use crate::store::memory::MemoryStore;
    use crate::task::{TaskRequest, TaskStatus};
    use async_trait::async_trait;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        broker: Arc<InMemoryBroker>,
        gate: SubmissionGate,
        pool: Arc<WorkerPool>,
    }

    fn fixture_with(registry: HandlerRegistry, worker_config: WorkerConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new(BrokerConfig {
            lease_ttl: worker_config.lease,
            capacity: None,
        }));
        let budget = Arc::new(BudgetAccountant::new(store.clone(), BudgetConfig::default()));
        let circuits = Arc::new(CircuitRegistry::new(
            store.clone(),
            CircuitBreakerConfig::default(),
        ));
        let admission = Arc::new(AdmissionController::new(
            broker.clone(),
            budget.clone(),
            circuits.clone(),
            AdmissionConfig::default(),
        ));
        let gate = SubmissionGate::new(
            store.clone(),
            broker.clone(),
            admission,
            GateConfig::default(),
        );
        let pool = Arc::new(WorkerPool::new(
            store.clone(),
            broker.clone(),
            Arc::new(registry),
            circuits,
            budget,
            worker_config,
        ));

        Fixture {
            store,
            broker,
            gate,
            pool,
        }
    }

    struct Succeeds;

    #[async_trait]
    impl TaskHandler for Succeeds {
        async fn call(&self, _task: &Task, _ctx: &HandlerContext) -> HandlerResult {
            Ok(HandlerOutcome::success().with_result(json!({"ok": true})))
        }
    }

    async fn run_pool_until<F, Fut>(pool: Arc<WorkerPool>, predicate: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let shutdown = pool.shutdown_token();
        let handle = tokio::spawn(pool.run());

        for _ in 0..200 {
            if predicate().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn lease_execute_release_completes_task() {
        let mut registry = HandlerRegistry::new();
        registry.register(TaskKind::GenContent, Arc::new(Succeeds));
        let f = fixture_with(
            registry,
            WorkerConfig {
                dequeue_wait: Duration::from_millis(20),
                ..WorkerConfig::default()
            },
        );

        let submission = f
            .gate
            .submit(TaskRequest::new(TaskKind::GenContent, json!({"prompt": "x"})))
            .await
            .unwrap();
        let task_id = submission.task.id;

        let store = f.store.clone();
        run_pool_until(f.pool.clone(), || {
            let store = store.clone();
            async move {
                store
                    .get_task(&task_id)
                    .await
                    .unwrap()
                    .is_some_and(|t| t.status == TaskStatus::Done)
            }
        })
        .await;

        let task = f.store.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert!(task.completed_at.is_some());

        let runs = f.store.list_runs(&task_id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);

        // The lock and queue entry are gone.
        assert_eq!(f.broker.depth().await.unwrap(), 0);
        let stats = f.broker.stats().await.unwrap();
        assert_eq!(stats.active_leases, 0);
    }

    #[tokio::test]
    async fn unregistered_kind_fails_terminally() {
        let f = fixture_with(
            HandlerRegistry::new(),
            WorkerConfig {
                dequeue_wait: Duration::from_millis(20),
                ..WorkerConfig::default()
            },
        );

        let submission = f
            .gate
            .submit(TaskRequest::new(TaskKind::MrgDeploy, json!({"environment": "staging"})))
            .await
            .unwrap();
        let task_id = submission.task.id;

        let store = f.store.clone();
        run_pool_until(f.pool.clone(), || {
            let store = store.clone();
            async move {
                store
                    .get_task(&task_id)
                    .await
                    .unwrap()
                    .is_some_and(|t| t.status == TaskStatus::Failed)
            }
        })
        .await;

        let task = f.store.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.last_error.as_deref().unwrap_or("").contains("no handler"));
        assert_eq!(task.retry_count, 0);
    }
}
