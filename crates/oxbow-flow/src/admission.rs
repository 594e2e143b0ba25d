//! Admission control: what gets to enter the queue at all.
//!
//! Three gates run before any enqueue, in order: queue depth, daily budget
//! for cost-classed kinds, and the circuit of the kind's dominant
//! dependency. A rejected task is never enqueued and never creates a Run
//! row — rejection happens before the task exists anywhere durable.

use std::sync::Arc;

use crate::broker::QueueBroker;
use crate::budget::BudgetAccountant;
use crate::circuit::CircuitRegistry;
use crate::error::{Error, Result};
use crate::task::TaskKind;

/// Default admission cap (`MAX_QUEUE_DEPTH`).
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 10_000;

/// Tunables for admission control.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionConfig {
    /// Maximum queue depth before submissions are rejected.
    pub max_queue_depth: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
        }
    }
}

/// Gates submissions on queue depth, budget, and circuit state.
pub struct AdmissionController {
    broker: Arc<dyn QueueBroker>,
    budget: Arc<BudgetAccountant>,
    circuits: Arc<CircuitRegistry>,
    config: AdmissionConfig,
}

impl AdmissionController {
    /// Creates a controller over the given collaborators.
    #[must_use]
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        budget: Arc<BudgetAccountant>,
        circuits: Arc<CircuitRegistry>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            broker,
            budget,
            circuits,
            config,
        }
    }

    /// Checks all gates for a submission of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`], [`Error::BudgetExceeded`], or
    /// [`Error::CircuitOpen`] for the first gate that rejects.
    pub async fn admit(&self, kind: TaskKind) -> Result<()> {
        let depth = self.broker.depth().await?;
        if depth >= self.config.max_queue_depth {
            return Err(Error::QueueFull {
                depth,
                capacity: self.config.max_queue_depth,
            });
        }

        if let Some(cost_class) = kind.cost_class() {
            self.budget
                .reserve(cost_class.provider, cost_class.reserved_usd)
                .await?;
        }

        self.circuits.check(kind.dominant_dependency()).await?;

        Ok(())
    }

    /// Releases the half-open probe slot claimed by a prior
    /// [`admit`](Self::admit) whose unit of work was discarded before
    /// execution (idempotency-key duplicate, webhook replay, failed
    /// enqueue). Nothing will report an outcome for it, so the slot must
    /// be handed back.
    pub async fn release_probe(&self, kind: TaskKind) -> Result<()> {
        self.circuits
            .release_probe(kind.dominant_dependency())
            .await
    }
}
