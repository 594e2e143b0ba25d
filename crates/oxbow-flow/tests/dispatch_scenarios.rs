//! End-to-end dispatch scenarios against in-memory backends: dedup,
//! retry-then-succeed, lease-loss recovery, circuit trips, and budget
//! cutoff.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use oxbow_flow::admission::{AdmissionConfig, AdmissionController};
use oxbow_flow::broker::memory::{BrokerConfig, InMemoryBroker};
use oxbow_flow::broker::QueueBroker;
use oxbow_flow::budget::{BudgetAccountant, BudgetConfig};
use oxbow_flow::circuit::{CircuitBreakerConfig, CircuitRegistry};
use oxbow_flow::error::Error;
use oxbow_flow::gate::{GateConfig, SubmissionGate};
use oxbow_flow::handler::{
    HandlerContext, HandlerError, HandlerOutcome, HandlerRegistry, HandlerResult, ModelUsage,
    TaskHandler,
};
use oxbow_flow::retry::BackoffPolicy;
use oxbow_flow::run::RunStatus;
use oxbow_flow::store::memory::MemoryStore;
use oxbow_flow::store::Store;
use oxbow_flow::task::{Provider, Task, TaskKind, TaskRequest, TaskStatus};
use oxbow_flow::worker::{WorkerConfig, WorkerPool};

struct Harness {
    store: Arc<MemoryStore>,
    broker: Arc<InMemoryBroker>,
    circuits: Arc<CircuitRegistry>,
    gate: SubmissionGate,
    pool: Arc<WorkerPool>,
}

struct HarnessOptions {
    daily_budget_usd: f64,
    circuit_timeout: Duration,
    lease_ttl: Duration,
    max_retries: u32,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            daily_budget_usd: 100.0,
            circuit_timeout: Duration::from_secs(600),
            lease_ttl: Duration::from_secs(900),
            max_retries: 3,
        }
    }
}

fn harness(registry: HandlerRegistry, options: HarnessOptions) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(InMemoryBroker::new(BrokerConfig {
        lease_ttl: options.lease_ttl,
        capacity: None,
    }));
    let budget = Arc::new(BudgetAccountant::new(
        store.clone(),
        BudgetConfig {
            daily_budget_usd: options.daily_budget_usd,
            ..BudgetConfig::default()
        },
    ));
    let circuits = Arc::new(CircuitRegistry::new(
        store.clone(),
        CircuitBreakerConfig {
            open_timeout: options.circuit_timeout,
            ..CircuitBreakerConfig::default()
        },
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
        GateConfig {
            max_retries: options.max_retries,
        },
    );
    let pool = Arc::new(WorkerPool::new(
        store.clone(),
        broker.clone(),
        Arc::new(registry),
        circuits.clone(),
        budget,
        WorkerConfig {
            lease: options.lease_ttl,
            dequeue_wait: Duration::from_millis(20),
            backoff: BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(40)),
            ..WorkerConfig::default()
        },
    ));

    Harness {
        store,
        broker,
        circuits,
        gate,
        pool,
    }
}

/// Runs the pool until the predicate holds or ~4s pass, then stops it.
async fn drive<F, Fut>(pool: Arc<WorkerPool>, predicate: F)
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

async fn task_reaches(store: Arc<MemoryStore>, id: oxbow_core::TaskId, status: TaskStatus) -> bool {
    store
        .get_task(&id)
        .await
        .unwrap()
        .is_some_and(|t| t.status == status)
}

// ---------------------------------------------------------------------------
// Scenario 1: concurrent submissions with one idempotency key.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_submits_with_one_key_create_one_task() {
    let h = Arc::new(harness(HandlerRegistry::new(), HarnessOptions::default()));

    let request = || {
        TaskRequest::new(TaskKind::GenContent, json!({"prompt": "dedup me"}))
            .with_idempotency_key("k1")
    };

    let (a, b, c, d) = tokio::join!(
        h.gate.submit(request()),
        h.gate.submit(request()),
        h.gate.submit(request()),
        h.gate.submit(request()),
    );

    let ids: Vec<_> = [a, b, c, d]
        .into_iter()
        .map(|r| r.unwrap().task.id)
        .collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]), "all submissions share one id");

    // Exactly one task row holds the key.
    assert_eq!(h.store.task_count().unwrap(), 1);
    let stored = h
        .store
        .find_task_by_idempotency_key("k1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.id, ids[0]);

    // And exactly one queue entry exists.
    assert_eq!(h.broker.depth().await.unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Scenario 2: 503 on attempts 1 and 2, success on 3.
// ---------------------------------------------------------------------------

struct FlakyThenOk {
    calls: AtomicU32,
}

#[async_trait]
impl TaskHandler for FlakyThenOk {
    async fn call(&self, _task: &Task, _ctx: &HandlerContext) -> HandlerResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= 2 {
            Err(HandlerError::from_http_status(503, "upstream unavailable"))
        } else {
            Ok(HandlerOutcome::success().with_result(json!({"call": call})))
        }
    }
}

#[tokio::test]
async fn retry_then_succeed_records_three_runs() {
    let mut registry = HandlerRegistry::new();
    registry.register(
        TaskKind::GenContent,
        Arc::new(FlakyThenOk {
            calls: AtomicU32::new(0),
        }),
    );
    let h = harness(registry, HarnessOptions::default());

    let submission = h
        .gate
        .submit(TaskRequest::new(TaskKind::GenContent, json!({"prompt": "x"})))
        .await
        .unwrap();
    let task_id = submission.task.id;

    let store = h.store.clone();
    drive(h.pool.clone(), move || {
        task_reaches(store.clone(), task_id, TaskStatus::Done)
    })
    .await;

    let task = h.store.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.retry_count, 2);

    let runs = h.store.list_runs(&task_id).await.unwrap();
    assert_eq!(runs.len(), 3);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[1].status, RunStatus::Failed);
    assert_eq!(runs[2].status, RunStatus::Success);

    // Attempts strictly increase and stay within the retry budget.
    let attempts: Vec<u32> = runs.iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(task.retry_count <= task.max_retries);
    assert!(runs.len() as u32 <= task.retry_count + 1);

    // No run is left started after the task is done.
    assert!(runs.iter().all(|r| r.status != RunStatus::Started));
}

// ---------------------------------------------------------------------------
// Retries exhaust into the DLQ with the final error preserved.
// ---------------------------------------------------------------------------

struct AlwaysFails;

#[async_trait]
impl TaskHandler for AlwaysFails {
    async fn call(&self, _task: &Task, _ctx: &HandlerContext) -> HandlerResult {
        Err(HandlerError::from_http_status(503, "still down"))
    }
}

#[tokio::test]
async fn exhausted_retries_dead_letter_the_task() {
    let mut registry = HandlerRegistry::new();
    registry.register(TaskKind::GenContent, Arc::new(AlwaysFails));
    let h = harness(
        registry,
        HarnessOptions {
            max_retries: 2,
            ..HarnessOptions::default()
        },
    );

    let submission = h
        .gate
        .submit(TaskRequest::new(TaskKind::GenContent, json!({"prompt": "x"})))
        .await
        .unwrap();
    let task_id = submission.task.id;

    let store = h.store.clone();
    drive(h.pool.clone(), move || {
        task_reaches(store.clone(), task_id, TaskStatus::Failed)
    })
    .await;

    let task = h.store.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert!(task.last_error.as_deref().unwrap_or("").contains("still down"));

    let dlq = h.broker.list_dlq(TaskKind::GenContent, 10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].task_id, task_id);
    assert_eq!(dlq[0].retry_count, 2);
}

// ---------------------------------------------------------------------------
// Scenario 3: lease loss. The slow worker's token stops working; the task
// completes exactly once under the second worker.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lease_loss_recovery_completes_exactly_once() {
    let h = harness(
        HandlerRegistry::new(),
        HarnessOptions {
            lease_ttl: Duration::from_millis(60),
            ..HarnessOptions::default()
        },
    );

    let submission = h
        .gate
        .submit(TaskRequest::new(TaskKind::GenContent, json!({"prompt": "x"})))
        .await
        .unwrap();
    let task_id = submission.task.id;

    // Worker 1 leases and starts an attempt, then stalls past the TTL
    // without heartbeating.
    let lease1 = h
        .broker
        .lease_next("worker-1", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    let run1 = h
        .store
        .begin_attempt(&task_id, lease1.deadline)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(90)).await;

    // Worker 2 takes over the expired lease and completes the task.
    let lease2 = h
        .broker
        .lease_next("worker-2", Duration::from_millis(200))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lease2.envelope.task_id, task_id);
    let run2 = h
        .store
        .begin_attempt(&task_id, lease2.deadline)
        .await
        .unwrap();
    h.store
        .finalize_success(&task_id, &run2.id, &Default::default(), vec![])
        .await
        .unwrap();
    let released = h.broker.release(&task_id, &lease2.token).await.unwrap();
    assert!(released.is_held());

    // Worker 1 wakes up: its token no longer extends or releases.
    let extend = h
        .broker
        .extend_lease(&task_id, &lease1.token, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(!extend.is_held());
    let release = h.broker.release(&task_id, &lease1.token).await.unwrap();
    assert!(!release.is_held());

    // The task completed exactly once; worker 1's run was closed as a
    // timeout by worker 2's begin_attempt.
    let task = h.store.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Done);

    let runs = h.store.list_runs(&task_id).await.unwrap();
    assert_eq!(runs.len(), 2);
    let first = runs.iter().find(|r| r.id == run1.id).unwrap();
    assert_eq!(first.status, RunStatus::Timeout);
    assert_eq!(
        runs.iter().filter(|r| r.status == RunStatus::Success).count(),
        1
    );

    // Held lock gone, nothing left in the queue.
    assert_eq!(h.broker.depth().await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Scenario 4: repeated provider failures trip the breaker; a probe is
// allowed after the timeout.
// ---------------------------------------------------------------------------

struct ProviderDown;

#[async_trait]
impl TaskHandler for ProviderDown {
    async fn call(&self, _task: &Task, _ctx: &HandlerContext) -> HandlerResult {
        Err(HandlerError::terminal("model API rejected the request").with_service("anthropic"))
    }
}

#[tokio::test]
async fn circuit_trips_after_repeated_failures_then_allows_probe() {
    let mut registry = HandlerRegistry::new();
    registry.register(TaskKind::GenContent, Arc::new(ProviderDown));
    let h = harness(registry, HarnessOptions::default());

    let mut ids = Vec::new();
    for i in 0..10 {
        let submission = h
            .gate
            .submit(TaskRequest::new(
                TaskKind::GenContent,
                json!({"prompt": format!("job {i}")}),
            ))
            .await
            .unwrap();
        ids.push(submission.task.id);
    }

    let store = h.store.clone();
    let all_failed = {
        let ids = ids.clone();
        move || {
            let store = store.clone();
            let ids = ids.clone();
            async move {
                for id in &ids {
                    if !task_reaches(store.clone(), *id, TaskStatus::Failed).await {
                        return false;
                    }
                }
                true
            }
        }
    };
    drive(h.pool.clone(), all_failed).await;

    // The 11th submission is rejected at admission.
    let err = h
        .gate
        .submit(TaskRequest::new(TaskKind::GenContent, json!({"prompt": "one more"})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { service, .. } if service == "anthropic"));

    // After the open timeout a single probe is allowed through. The
    // deadline is rewound directly instead of waiting ten minutes.
    let mut record = h
        .store
        .get_circuit("anthropic")
        .await
        .unwrap()
        .expect("circuit record exists after failures");
    record.next_retry_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
    h.store.put_circuit(record).await.unwrap();

    let probe = h
        .gate
        .submit(TaskRequest::new(TaskKind::GenContent, json!({"prompt": "probe"})))
        .await
        .unwrap();
    assert_eq!(probe.task.status, TaskStatus::Queued);

    // The probe slot is single-occupancy until it reports back.
    let err = h
        .gate
        .submit(TaskRequest::new(TaskKind::GenContent, json!({"prompt": "blocked"})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));

    // A successful probe closes the circuit for good.
    h.circuits.record_success("anthropic").await.unwrap();
    h.gate
        .submit(TaskRequest::new(TaskKind::GenContent, json!({"prompt": "open again"})))
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Scenario 5: daily budget cutoff at $1.00 with $0.40 per call.
// ---------------------------------------------------------------------------

struct CostsFortyCents;

#[async_trait]
impl TaskHandler for CostsFortyCents {
    async fn call(&self, _task: &Task, _ctx: &HandlerContext) -> HandlerResult {
        Ok(HandlerOutcome::success()
            .with_usage(ModelUsage {
                provider: Provider::Anthropic,
                model: "claude-sonnet-4".to_string(),
                tokens: 1000,
                cost_usd: 0.40,
            })
            .touching("anthropic"))
    }
}

#[tokio::test]
async fn budget_cutoff_rejects_the_third_call() {
    let mut registry = HandlerRegistry::new();
    registry.register(TaskKind::GenContent, Arc::new(CostsFortyCents));
    let h = harness(
        registry,
        HarnessOptions {
            daily_budget_usd: 1.0,
            ..HarnessOptions::default()
        },
    );

    let mut ids = Vec::new();
    for i in 0..2 {
        let submission = h
            .gate
            .submit(TaskRequest::new(
                TaskKind::GenContent,
                json!({"prompt": format!("call {i}")}),
            ))
            .await
            .unwrap();
        ids.push(submission.task.id);
    }

    let store = h.store.clone();
    let both_done = {
        let ids = ids.clone();
        move || {
            let store = store.clone();
            let ids = ids.clone();
            async move {
                for id in &ids {
                    if !task_reaches(store.clone(), *id, TaskStatus::Done).await {
                        return false;
                    }
                }
                true
            }
        }
    };
    drive(h.pool.clone(), both_done).await;
    for id in &ids {
        assert!(task_reaches(h.store.clone(), *id, TaskStatus::Done).await);
    }

    // $0.80 spent of $1.00; the $0.40 reservation no longer fits.
    let err = h
        .gate
        .submit(TaskRequest::new(TaskKind::GenContent, json!({"prompt": "call 3"})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BudgetExceeded { .. }));

    // Run rows account for the committed spend.
    let runs = h.store.recent_runs(10).await.unwrap();
    let total: f64 = runs.iter().filter_map(|r| r.cost_usd).sum();
    assert!((total - 0.80).abs() < 1e-9);
}

// ---------------------------------------------------------------------------
// Outbox entries from a successful run are delivered exactly once by the
// idempotent sink.
// ---------------------------------------------------------------------------

struct EmitsEffect;

#[async_trait]
impl TaskHandler for EmitsEffect {
    async fn call(&self, task: &Task, _ctx: &HandlerContext) -> HandlerResult {
        Ok(HandlerOutcome::success().with_effect(
            oxbow_flow::outbox::NewOutboxEntry::new(
                "notify",
                "ops-channel",
                json!({"task_id": task.id.to_string()}),
            ),
        ))
    }
}

#[tokio::test]
async fn successful_run_emits_outbox_effects() {
    use oxbow_flow::outbox::{OutboxRelay, RecordingSink, RelayConfig};

    let mut registry = HandlerRegistry::new();
    registry.register(TaskKind::GenContent, Arc::new(EmitsEffect));
    let h = harness(registry, HarnessOptions::default());

    let submission = h
        .gate
        .submit(TaskRequest::new(TaskKind::GenContent, json!({"prompt": "x"})))
        .await
        .unwrap();
    let task_id = submission.task.id;

    let store = h.store.clone();
    drive(h.pool.clone(), move || {
        task_reaches(store.clone(), task_id, TaskStatus::Done)
    })
    .await;

    let sink = Arc::new(RecordingSink::new());
    let relay = OutboxRelay::new(
        h.store.clone(),
        sink.clone(),
        RelayConfig::default(),
        tokio_util::sync::CancellationToken::new(),
    );

    assert_eq!(relay.tick().await.unwrap(), 1);
    assert_eq!(sink.delivered_count(), 1);

    // A second tick re-delivers nothing.
    assert_eq!(relay.tick().await.unwrap(), 0);
    assert_eq!(sink.delivered_count(), 1);
}
