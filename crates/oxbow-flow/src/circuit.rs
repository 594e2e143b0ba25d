//! Per-dependency circuit breakers.
//!
//! Each downstream dependency (model provider, source host, deploy target)
//! gets a rolling error-rate gate. State lives in the durable store so it
//! survives restarts; updates are serialized per service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::store::Store;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; outcomes are counted.
    Closed,
    /// All calls rejected until the retry deadline.
    Open,
    /// One probe call allowed through.
    HalfOpen,
}

impl CircuitState {
    /// Returns the wire name of this state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted circuit state for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitRecord {
    /// The protected dependency.
    pub service: String,
    /// Current state.
    pub state: CircuitState,
    /// Rolling call outcomes, newest last (`true` = success).
    pub window: Vec<bool>,
    /// Lifetime failure count.
    pub failure_count: u64,
    /// Lifetime success count.
    pub success_count: u64,
    /// Failure rate over the rolling window.
    pub error_rate: f64,
    /// Most recent failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Most recent success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    /// When the circuit last opened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    /// When the next probe becomes allowed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Current open duration in milliseconds; doubles on each failed probe.
    pub open_timeout_ms: u64,
    /// When the half-open probe slot was claimed. Cleared by
    /// `record_success` / `record_failure` / `release_probe`; a claim older
    /// than the probe timeout is stale and may be taken over.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_claimed_at: Option<DateTime<Utc>>,
}

impl CircuitRecord {
    fn closed(service: &str, initial_timeout: Duration) -> Self {
        Self {
            service: service.to_string(),
            state: CircuitState::Closed,
            window: Vec::new(),
            failure_count: 0,
            success_count: 0,
            error_rate: 0.0,
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
            next_retry_at: None,
            open_timeout_ms: initial_timeout.as_millis() as u64,
            probe_claimed_at: None,
        }
    }

    fn push_outcome(&mut self, success: bool, window_size: usize) {
        self.window.push(success);
        if self.window.len() > window_size {
            let overflow = self.window.len() - window_size;
            self.window.drain(..overflow);
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        self.error_rate = if self.window.is_empty() {
            0.0
        } else {
            failures as f64 / self.window.len() as f64
        };
    }
}

/// Tunables for the breaker registry.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Failure rate that trips a closed circuit (`CIRCUIT_BREAKER_THRESHOLD`).
    pub failure_threshold: f64,
    /// Initial open duration (`CIRCUIT_BREAKER_TIMEOUT`).
    pub open_timeout: Duration,
    /// Cap on the doubled open duration.
    pub max_open_timeout: Duration,
    /// Rolling window size.
    pub window_size: usize,
    /// Minimum samples before the threshold applies.
    pub min_samples: usize,
    /// How long a claimed probe slot is honored without a reported
    /// outcome. A claimant that crashed before executing would otherwise
    /// hold the slot forever.
    pub probe_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.1,
            open_timeout: Duration::from_secs(600),
            max_open_timeout: Duration::from_secs(3600),
            window_size: 20,
            min_samples: 5,
            probe_timeout: Duration::from_secs(600),
        }
    }
}

/// Registry of per-service circuit breakers backed by the durable store.
pub struct CircuitRegistry {
    store: Arc<dyn Store>,
    config: CircuitBreakerConfig,
    metrics: FlowMetrics,
    /// Per-service serialization of read-modify-write cycles.
    guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CircuitRegistry {
    /// Creates a registry over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: CircuitBreakerConfig) -> Self {
        Self {
            store,
            config,
            metrics: FlowMetrics::new(),
            guards: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true while a claimed probe slot is still honored.
    fn probe_active(&self, record: &CircuitRecord, now: DateTime<Utc>) -> bool {
        let timeout = chrono::Duration::from_std(self.config.probe_timeout)
            .unwrap_or(chrono::Duration::seconds(600));
        record.probe_claimed_at.is_some_and(|at| now < at + timeout)
    }

    async fn guard(&self, service: &str) -> Arc<Mutex<()>> {
        let mut guards = self.guards.lock().await;
        guards
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load(&self, service: &str) -> Result<CircuitRecord> {
        Ok(self
            .store
            .get_circuit(service)
            .await?
            .unwrap_or_else(|| CircuitRecord::closed(service, self.config.open_timeout)))
    }

    /// Gate check before work touching `service` is admitted.
    ///
    /// An open circuit whose retry deadline has passed transitions to
    /// half-open and claims the single probe slot for the caller. The
    /// claim is a lease, not a latch: it is released by
    /// `record_success` / `record_failure`, by [`release_probe`]
    /// (admitted work that was discarded before execution), or by the
    /// probe timeout (claimant crashed).
    ///
    /// [`release_probe`]: Self::release_probe
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] while the circuit rejects calls.
    pub async fn check(&self, service: &str) -> Result<()> {
        let guard = self.guard(service).await;
        let _held = guard.lock().await;

        let mut record = self.load(service).await?;
        let now = Utc::now();
        match record.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if record.next_retry_at.is_some_and(|at| now >= at) {
                    record.state = CircuitState::HalfOpen;
                    record.probe_claimed_at = Some(now);
                    tracing::info!(service, "circuit half-open, probe allowed");
                    self.metrics.set_circuit_open(service, false);
                    self.store.put_circuit(record).await?;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen {
                        service: service.to_string(),
                        retry_at: record.next_retry_at,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_active(&record, now) {
                    Err(Error::CircuitOpen {
                        service: service.to_string(),
                        retry_at: record.next_retry_at,
                    })
                } else {
                    record.probe_claimed_at = Some(now);
                    self.store.put_circuit(record).await?;
                    Ok(())
                }
            }
        }
    }

    /// Releases a claimed probe slot without recording an outcome.
    ///
    /// Called when admission succeeded but the unit of work was discarded
    /// before anything executed (idempotency-key duplicate, webhook
    /// replay, failed enqueue). No probe will report back for it, so the
    /// slot must not stay claimed.
    pub async fn release_probe(&self, service: &str) -> Result<()> {
        let guard = self.guard(service).await;
        let _held = guard.lock().await;

        let Some(mut record) = self.store.get_circuit(service).await? else {
            return Ok(());
        };
        if record.state == CircuitState::HalfOpen && record.probe_claimed_at.is_some() {
            record.probe_claimed_at = None;
            tracing::debug!(service, "half-open probe slot released");
            self.store.put_circuit(record).await?;
        }
        Ok(())
    }

    /// Records a successful call against `service`.
    ///
    /// A half-open probe success closes the circuit and resets its counters.
    pub async fn record_success(&self, service: &str) -> Result<()> {
        let guard = self.guard(service).await;
        let _held = guard.lock().await;

        let mut record = self.load(service).await?;
        record.push_outcome(true, self.config.window_size);
        record.success_count += 1;
        record.last_success_at = Some(Utc::now());

        if record.state == CircuitState::HalfOpen {
            tracing::info!(service, "circuit closed after successful probe");
            record.state = CircuitState::Closed;
            record.window.clear();
            record.error_rate = 0.0;
            record.opened_at = None;
            record.next_retry_at = None;
            record.open_timeout_ms = self.config.open_timeout.as_millis() as u64;
        }
        record.probe_claimed_at = None;

        self.metrics
            .set_circuit_open(service, record.state == CircuitState::Open);
        self.store.put_circuit(record).await
    }

    /// Records a failed call against `service`, tripping the circuit when
    /// the rolling failure rate crosses the threshold.
    pub async fn record_failure(&self, service: &str) -> Result<()> {
        let guard = self.guard(service).await;
        let _held = guard.lock().await;

        let now = Utc::now();
        let mut record = self.load(service).await?;
        record.push_outcome(false, self.config.window_size);
        record.failure_count += 1;
        record.last_failure_at = Some(now);

        match record.state {
            CircuitState::HalfOpen => {
                // Probe failed: reopen with a doubled timeout.
                let doubled = (record.open_timeout_ms * 2)
                    .min(self.config.max_open_timeout.as_millis() as u64)
                    .max(1);
                record.open_timeout_ms = doubled;
                record.state = CircuitState::Open;
                record.opened_at = Some(now);
                record.next_retry_at = Some(now + chrono::Duration::milliseconds(doubled as i64));
                tracing::warn!(service, timeout_ms = doubled, "circuit reopened after failed probe");
            }
            CircuitState::Closed => {
                if record.window.len() >= self.config.min_samples
                    && record.error_rate > self.config.failure_threshold
                {
                    record.state = CircuitState::Open;
                    record.opened_at = Some(now);
                    record.next_retry_at =
                        Some(now + chrono::Duration::milliseconds(record.open_timeout_ms as i64));
                    tracing::warn!(
                        service,
                        error_rate = record.error_rate,
                        "circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
        record.probe_claimed_at = None;

        self.metrics
            .set_circuit_open(service, record.state == CircuitState::Open);
        self.store.put_circuit(record).await
    }

    /// Returns all known circuit records, for operators.
    pub async fn snapshot(&self) -> Result<Vec<CircuitRecord>> {
        self.store.list_circuits().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn registry() -> CircuitRegistry {
        CircuitRegistry::new(
            Arc::new(MemoryStore::new()),
            CircuitBreakerConfig {
                open_timeout: Duration::from_millis(50),
                ..CircuitBreakerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn closed_circuit_admits_calls() {
        let registry = registry();
        registry.check("anthropic").await.unwrap();
        registry.record_success("anthropic").await.unwrap();
        registry.check("anthropic").await.unwrap();
    }

    #[tokio::test]
    async fn failures_past_threshold_open_the_circuit() {
        let registry = registry();

        for _ in 0..10 {
            registry.record_failure("anthropic").await.unwrap();
        }

        let err = registry.check("anthropic").await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn below_min_samples_does_not_trip() {
        let registry = registry();

        // Four failures: 100% error rate but under the sample floor.
        for _ in 0..4 {
            registry.record_failure("github").await.unwrap();
        }
        registry.check("github").await.unwrap();
    }

    #[tokio::test]
    async fn open_circuit_allows_single_probe_after_timeout() {
        let registry = registry();
        for _ in 0..10 {
            registry.record_failure("anthropic").await.unwrap();
        }
        assert!(registry.check("anthropic").await.is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;

        // First check after the deadline claims the probe slot.
        registry.check("anthropic").await.unwrap();
        // A concurrent second caller is still rejected.
        assert!(registry.check("anthropic").await.is_err());
    }

    #[tokio::test]
    async fn probe_success_closes_and_resets() {
        let registry = registry();
        for _ in 0..10 {
            registry.record_failure("anthropic").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.check("anthropic").await.unwrap();
        registry.record_success("anthropic").await.unwrap();

        let records = registry.snapshot().await.unwrap();
        let record = records.iter().find(|r| r.service == "anthropic").unwrap();
        assert_eq!(record.state, CircuitState::Closed);
        assert!(record.window.is_empty());
        assert_eq!(record.open_timeout_ms, 50);
        registry.check("anthropic").await.unwrap();
    }

    #[tokio::test]
    async fn released_probe_slot_is_reclaimable() {
        let registry = registry();
        for _ in 0..10 {
            registry.record_failure("anthropic").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Claim the probe, then discard the admitted work.
        registry.check("anthropic").await.unwrap();
        assert!(registry.check("anthropic").await.is_err());
        registry.release_probe("anthropic").await.unwrap();

        // The slot is free again; no outcome was recorded.
        registry.check("anthropic").await.unwrap();
        assert!(registry.check("anthropic").await.is_err());
    }

    #[tokio::test]
    async fn stale_probe_claim_expires() {
        let registry = CircuitRegistry::new(
            Arc::new(MemoryStore::new()),
            CircuitBreakerConfig {
                open_timeout: Duration::from_millis(50),
                probe_timeout: Duration::from_millis(40),
                ..CircuitBreakerConfig::default()
            },
        );
        for _ in 0..10 {
            registry.record_failure("anthropic").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Claimant takes the probe slot and then crashes silently.
        registry.check("anthropic").await.unwrap();
        assert!(registry.check("anthropic").await.is_err());

        // Once the claim goes stale the slot can be taken over.
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.check("anthropic").await.unwrap();
    }

    #[tokio::test]
    async fn release_without_claim_is_a_no_op() {
        let registry = registry();
        registry.release_probe("anthropic").await.unwrap();
        registry.check("anthropic").await.unwrap();
    }

    #[tokio::test]
    async fn probe_failure_doubles_the_timeout() {
        let config = CircuitBreakerConfig {
            open_timeout: Duration::from_secs(600),
            ..CircuitBreakerConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let registry = CircuitRegistry::new(store.clone(), config);

        for _ in 0..10 {
            registry.record_failure("anthropic").await.unwrap();
        }

        // Force the retry deadline into the past, then probe and fail.
        let mut record = store.get_circuit("anthropic").await.unwrap().unwrap();
        record.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
        store.put_circuit(record).await.unwrap();

        registry.check("anthropic").await.unwrap();
        registry.record_failure("anthropic").await.unwrap();

        let record = store.get_circuit("anthropic").await.unwrap().unwrap();
        assert_eq!(record.state, CircuitState::Open);
        assert_eq!(record.open_timeout_ms, 1_200_000);
    }

    #[tokio::test]
    async fn doubled_timeout_is_capped_at_one_hour() {
        let config = CircuitBreakerConfig::default();
        let store = Arc::new(MemoryStore::new());
        let registry = CircuitRegistry::new(store.clone(), config);

        for _ in 0..10 {
            registry.record_failure("anthropic").await.unwrap();
        }

        for _ in 0..4 {
            let mut record = store.get_circuit("anthropic").await.unwrap().unwrap();
            record.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
            store.put_circuit(record).await.unwrap();

            registry.check("anthropic").await.unwrap();
            registry.record_failure("anthropic").await.unwrap();
        }

        let record = store.get_circuit("anthropic").await.unwrap().unwrap();
        assert_eq!(record.open_timeout_ms, 3_600_000);
    }
}
