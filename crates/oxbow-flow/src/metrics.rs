//! Observability metrics for the dispatch engine.
//!
//! Metrics are exported through the `metrics` crate facade; the API crate
//! installs the Prometheus recorder and serves `/metrics`.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `oxbow_tasks_total` | Counter | `kind`, `status` | Tasks reaching a terminal status |
//! | `oxbow_task_duration_seconds` | Histogram | `kind`, `status` | Attempt duration |
//! | `oxbow_retries_total` | Counter | `kind` | Backoff re-enqueues |
//! | `oxbow_lease_losses_total` | Counter | `kind` | Heartbeats that found the lease gone |
//! | `oxbow_queue_depth` | Gauge | - | Queued (unleased) entries |
//! | `oxbow_active_leases` | Gauge | - | Unexpired locks |
//! | `oxbow_dlq_depth` | Gauge | `kind` | Dead-lettered tasks |
//! | `oxbow_outbox_deliveries_total` | Counter | `result` | Relay delivery outcomes |
//! | `oxbow_budget_spent_usd` | Gauge | `provider` | Spend committed today |
//! | `oxbow_circuit_open` | Gauge | `service` | 1 while a circuit is open |

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: tasks reaching a terminal status.
    pub const TASKS_TOTAL: &str = "oxbow_tasks_total";
    /// Histogram: attempt duration in seconds.
    pub const TASK_DURATION_SECONDS: &str = "oxbow_task_duration_seconds";
    /// Counter: backoff re-enqueues.
    pub const RETRIES_TOTAL: &str = "oxbow_retries_total";
    /// Counter: heartbeats that found the lease gone.
    pub const LEASE_LOSSES_TOTAL: &str = "oxbow_lease_losses_total";
    /// Gauge: queued (unleased) entries.
    pub const QUEUE_DEPTH: &str = "oxbow_queue_depth";
    /// Gauge: unexpired locks.
    pub const ACTIVE_LEASES: &str = "oxbow_active_leases";
    /// Gauge: dead-lettered tasks per kind.
    pub const DLQ_DEPTH: &str = "oxbow_dlq_depth";
    /// Counter: relay delivery outcomes.
    pub const OUTBOX_DELIVERIES_TOTAL: &str = "oxbow_outbox_deliveries_total";
    /// Gauge: spend committed today per provider.
    pub const BUDGET_SPENT_USD: &str = "oxbow_budget_spent_usd";
    /// Gauge: 1 while a circuit is open.
    pub const CIRCUIT_OPEN: &str = "oxbow_circuit_open";
}

/// Label keys used across metrics.
pub mod labels {
    /// Task kind.
    pub const KIND: &str = "kind";
    /// Terminal status (done, failed, canceled) or attempt outcome.
    pub const STATUS: &str = "status";
    /// Delivery result (delivered, retried, failed).
    pub const RESULT: &str = "result";
    /// Model provider.
    pub const PROVIDER: &str = "provider";
    /// Protected dependency.
    pub const SERVICE: &str = "service";
}

/// High-level interface for recording engine metrics.
///
/// Cheap to clone and share across worker slots.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a task reaching a terminal status.
    pub fn record_task(&self, kind: &str, status: &str) {
        counter!(
            names::TASKS_TOTAL,
            labels::KIND => kind.to_string(),
            labels::STATUS => status.to_string(),
        )
        .increment(1);
    }

    /// Records an attempt's duration.
    pub fn observe_task_duration(&self, kind: &str, status: &str, duration_secs: f64) {
        histogram!(
            names::TASK_DURATION_SECONDS,
            labels::KIND => kind.to_string(),
            labels::STATUS => status.to_string(),
        )
        .record(duration_secs);
    }

    /// Records a backoff re-enqueue.
    pub fn record_retry(&self, kind: &str) {
        counter!(names::RETRIES_TOTAL, labels::KIND => kind.to_string()).increment(1);
    }

    /// Records a heartbeat that found its lease gone.
    pub fn record_lease_loss(&self, kind: &str) {
        counter!(names::LEASE_LOSSES_TOTAL, labels::KIND => kind.to_string()).increment(1);
    }

    /// Updates the queue depth gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_queue_depth(&self, depth: usize) {
        gauge!(names::QUEUE_DEPTH).set(depth as f64);
    }

    /// Updates the active lease gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_active_leases(&self, count: usize) {
        gauge!(names::ACTIVE_LEASES).set(count as f64);
    }

    /// Updates a kind's DLQ depth gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_dlq_depth(&self, kind: &str, depth: usize) {
        gauge!(names::DLQ_DEPTH, labels::KIND => kind.to_string()).set(depth as f64);
    }

    /// Records an outbox delivery outcome.
    pub fn record_outbox_delivery(&self, result: &str) {
        counter!(
            names::OUTBOX_DELIVERIES_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Updates a provider's spend gauge.
    pub fn set_budget_spent(&self, provider: &str, spent_usd: f64) {
        gauge!(
            names::BUDGET_SPENT_USD,
            labels::PROVIDER => provider.to_string(),
        )
        .set(spent_usd);
    }

    /// Updates a service's circuit-open gauge.
    pub fn set_circuit_open(&self, service: &str, open: bool) {
        gauge!(names::CIRCUIT_OPEN, labels::SERVICE => service.to_string())
            .set(if open { 1.0 } else { 0.0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_recorder_does_not_panic() {
        let metrics = FlowMetrics::new();
        metrics.record_task("gen_content", "done");
        metrics.observe_task_duration("gen_content", "done", 1.5);
        metrics.record_retry("gen_content");
        metrics.record_lease_loss("code_pr");
        metrics.set_queue_depth(10);
        metrics.set_active_leases(3);
        metrics.set_dlq_depth("gen_content", 1);
        metrics.record_outbox_delivery("delivered");
        metrics.set_budget_spent("anthropic", 12.5);
        metrics.set_circuit_open("github", true);
    }
}
