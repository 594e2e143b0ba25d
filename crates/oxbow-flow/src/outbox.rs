//! Outbox: durable external side-effects with at-least-once delivery.
//!
//! Handlers declare effects (notifications, downstream API calls, webhook
//! dispatches) as part of their outcome; the store writes them in the same
//! transaction that finalizes the run, and [`OutboxRelay`] drains pending
//! entries to an idempotent [`EffectSink`] keyed by outbox id. Combined with
//! an idempotent sink this yields exactly-once effective delivery.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use oxbow_core::{OutboxEntryId, TaskId};

use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::retry::BackoffPolicy;
use crate::store::Store;

/// Default retry budget for outbox deliveries.
pub const DEFAULT_OUTBOX_MAX_RETRIES: u32 = 5;

/// Retention for delivered entries before purge.
pub const DELIVERED_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Outbox entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting for delivery.
    Pending,
    /// Delivered to the sink.
    Delivered,
    /// Delivery retries exhausted. Terminal.
    Failed,
}

impl OutboxStatus {
    /// Returns the wire name of this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable external side-effect awaiting delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Unique entry identifier; doubles as the sink idempotency key.
    pub id: OutboxEntryId,
    /// The task whose success produced this effect.
    pub task_id: TaskId,
    /// Effect discriminator (e.g. `notify`, `webhook_dispatch`).
    pub effect_type: String,
    /// Destination of the effect (URL, channel, system name).
    pub target: String,
    /// Effect payload.
    pub payload: Value,
    /// Current status.
    pub status: OutboxStatus,
    /// Delivery attempts consumed.
    pub retry_count: u32,
    /// Delivery retry budget.
    pub max_retries: u32,
    /// When the entry was created (inside the finalizing transaction).
    pub created_at: DateTime<Utc>,
    /// When the next delivery attempt becomes due.
    pub next_attempt_at: DateTime<Utc>,
    /// When the entry was delivered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    /// The most recent delivery error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// An effect declared by a handler, not yet persisted.
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    /// Effect discriminator.
    pub effect_type: String,
    /// Destination of the effect.
    pub target: String,
    /// Effect payload.
    pub payload: Value,
    /// Delivery retry budget.
    pub max_retries: u32,
}

impl NewOutboxEntry {
    /// Creates an effect with the default retry budget.
    #[must_use]
    pub fn new(effect_type: impl Into<String>, target: impl Into<String>, payload: Value) -> Self {
        Self {
            effect_type: effect_type.into(),
            target: target.into(),
            payload,
            max_retries: DEFAULT_OUTBOX_MAX_RETRIES,
        }
    }

    /// Builds the stored entry for a finalizing task.
    #[must_use]
    pub fn into_entry(self, task_id: TaskId) -> OutboxEntry {
        let now = Utc::now();
        OutboxEntry {
            id: OutboxEntryId::generate(),
            task_id,
            effect_type: self.effect_type,
            target: self.target,
            payload: self.payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries,
            created_at: now,
            next_attempt_at: now,
            delivered_at: None,
            last_error: None,
        }
    }
}

/// A destination for outbox deliveries.
///
/// Implementations must be idempotent keyed by [`OutboxEntry::id`]: the
/// relay guarantees at-least-once delivery, so the same entry may arrive
/// more than once across crashes.
#[async_trait]
pub trait EffectSink: Send + Sync {
    /// Delivers one entry.
    ///
    /// # Errors
    ///
    /// Returns an error when delivery failed and should be retried.
    async fn deliver(&self, entry: &OutboxEntry) -> Result<()>;
}

/// In-memory sink recording delivered entry IDs. Suitable for tests and
/// local development; idempotent by construction.
#[derive(Debug, Default)]
pub struct RecordingSink {
    delivered: std::sync::Mutex<HashSet<OutboxEntryId>>,
}

impl RecordingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many distinct entries have been delivered.
    #[must_use]
    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().map(|d| d.len()).unwrap_or(0)
    }

    /// Returns true if the given entry was delivered.
    #[must_use]
    pub fn contains(&self, id: &OutboxEntryId) -> bool {
        self.delivered.lock().map(|d| d.contains(id)).unwrap_or(false)
    }
}

#[async_trait]
impl EffectSink for RecordingSink {
    async fn deliver(&self, entry: &OutboxEntry) -> Result<()> {
        let mut delivered = self
            .delivered
            .lock()
            .map_err(|_| Error::storage("recording sink lock poisoned"))?;
        // Re-delivery of an already-seen id is a no-op.
        delivered.insert(entry.id);
        Ok(())
    }
}

/// Sink that logs deliveries instead of performing them.
///
/// The default when no destination sink is wired; deployments register a
/// real sink (webhook dispatch, notification fan-out) in its place.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EffectSink for LogSink {
    async fn deliver(&self, entry: &OutboxEntry) -> Result<()> {
        tracing::info!(
            outbox_id = %entry.id,
            task_id = %entry.task_id,
            effect_type = %entry.effect_type,
            target = %entry.target,
            "outbox effect delivered to log sink"
        );
        Ok(())
    }
}

/// Configuration for the outbox relay loop.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Interval between polls for pending entries.
    pub poll_interval: Duration,
    /// Maximum entries fetched per poll.
    pub batch_size: usize,
    /// Backoff applied between delivery attempts of one entry.
    pub backoff: BackoffPolicy,
    /// How long delivered entries are retained before purge.
    pub retention: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 50,
            backoff: BackoffPolicy::default(),
            retention: DELIVERED_RETENTION,
        }
    }
}

/// Drains pending outbox entries to the configured sink.
pub struct OutboxRelay {
    store: Arc<dyn Store>,
    sink: Arc<dyn EffectSink>,
    config: RelayConfig,
    metrics: FlowMetrics,
    shutdown: CancellationToken,
}

impl OutboxRelay {
    /// Creates a relay over the given store and sink.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        sink: Arc<dyn EffectSink>,
        config: RelayConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            sink,
            config,
            metrics: FlowMetrics::new(),
            shutdown,
        }
    }

    /// Runs the relay loop until shutdown.
    pub async fn run(&self) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "outbox relay started"
        );
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
            if let Err(error) = self.tick().await {
                tracing::warn!(%error, "outbox relay tick failed");
            }
        }
        tracing::info!("outbox relay stopped");
    }

    /// Processes one batch of due entries and purges aged delivered rows.
    ///
    /// Returns the number of entries delivered this tick.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unreachable. Per-entry delivery
    /// failures are consumed and recorded on the entry.
    pub async fn tick(&self) -> Result<usize> {
        let now = Utc::now();
        let pending = self.store.pending_outbox(now, self.config.batch_size).await?;

        let mut delivered = 0usize;
        for entry in pending {
            match self.sink.deliver(&entry).await {
                Ok(()) => {
                    self.store.mark_outbox_delivered(&entry.id).await?;
                    self.metrics.record_outbox_delivery("delivered");
                    delivered += 1;
                }
                Err(error) => {
                    let attempts = entry.retry_count + 1;
                    let next = if attempts > entry.max_retries {
                        self.metrics.record_outbox_delivery("failed");
                        tracing::error!(
                            outbox_id = %entry.id,
                            task_id = %entry.task_id,
                            effect_type = %entry.effect_type,
                            %error,
                            "outbox delivery failed permanently"
                        );
                        None
                    } else {
                        let delay = self.config.backoff.delay_for(entry.retry_count);
                        self.metrics.record_outbox_delivery("retried");
                        tracing::warn!(
                            outbox_id = %entry.id,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            %error,
                            "outbox delivery failed, will retry"
                        );
                        Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default())
                    };
                    self.store
                        .record_outbox_failure(&entry.id, &error.to_string(), next)
                        .await?;
                }
            }
        }

        let retention =
            chrono::Duration::from_std(self.config.retention).unwrap_or(chrono::Duration::days(7));
        let purged = self.store.purge_delivered_outbox(now - retention).await?;
        if purged > 0 {
            tracing::debug!(purged, "purged delivered outbox entries");
        }

        Ok(delivered)
    }
}
