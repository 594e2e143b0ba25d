//! In-memory broker implementation.
//!
//! This module provides [`InMemoryBroker`], a thread-safe in-memory
//! implementation of the [`QueueBroker`] trait suitable for testing and
//! single-process deployments.
//!
//! ## Limitations
//!
//! - **Single-process only**: Leases are not visible across process
//!   boundaries
//! - **No persistence**: Queue contents are rebuilt from the store on
//!   restart by re-enqueueing `queued` tasks

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use oxbow_core::{LeaseToken, TaskId};

use super::{
    BrokerStats, DlqEntry, EnqueueResult, Lease, LeaseStatus, QueueBroker, QueueEnvelope,
    DEFAULT_LEASE,
};
use crate::error::{Error, Result};
use crate::task::TaskKind;

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("broker lock poisoned")
}

/// Ordering key: strict priority first, then effective enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: i32,
    visible_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Debug, Clone)]
struct LockEntry {
    token: LeaseToken,
    expires_at: DateTime<Utc>,
    /// The queue entry this lock covers, so release can remove exactly it.
    key: QueueKey,
}

#[derive(Debug, Default)]
struct Inner {
    queue: BTreeMap<QueueKey, QueueEnvelope>,
    locks: HashMap<TaskId, LockEntry>,
    dlq: HashMap<TaskKind, VecDeque<DlqEntry>>,
    seq: u64,
}

/// Configuration for the in-memory broker.
#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    /// Lock TTL granted on lease and on each extension.
    pub lease_ttl: Duration,
    /// Hard cap on queued entries; `None` is unbounded. Admission control
    /// normally rejects first; this is the backstop.
    pub capacity: Option<usize>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            lease_ttl: DEFAULT_LEASE,
            capacity: None,
        }
    }
}

/// In-memory priority queue with TTL'd per-task locks.
#[derive(Debug)]
pub struct InMemoryBroker {
    inner: Mutex<Inner>,
    notify: Notify,
    config: BrokerConfig,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl InMemoryBroker {
    /// Creates a broker with the given configuration.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            config,
        }
    }

    /// The configured lock TTL.
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        self.config.lease_ttl
    }

    fn lease_chrono_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.lease_ttl).unwrap_or(chrono::Duration::seconds(900))
    }

    /// One pass over the queue: either acquires a lease or reports the next
    /// instant at which something may become leasable.
    fn try_lease(&self, consumer_id: &str) -> Result<LeaseAttempt> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        let now = Utc::now();

        let mut candidate: Option<(QueueKey, QueueEnvelope)> = None;
        let mut next_event: Option<DateTime<Utc>> = None;
        let track = |at: DateTime<Utc>, slot: &mut Option<DateTime<Utc>>| {
            *slot = Some(slot.map_or(at, |cur| cur.min(at)));
        };

        for (key, envelope) in &inner.queue {
            if envelope.visible_at > now {
                track(envelope.visible_at, &mut next_event);
                continue;
            }
            match inner.locks.get(&envelope.task_id) {
                Some(lock) if lock.expires_at > now => {
                    track(lock.expires_at, &mut next_event);
                }
                // Unleased, or the previous holder's TTL ran out: take over.
                _ => {
                    candidate = Some((*key, envelope.clone()));
                    break;
                }
            }
        }

        let Some((key, envelope)) = candidate else {
            return Ok(LeaseAttempt::Empty { next_event });
        };

        let token = LeaseToken::generate();
        let expires_at = now + self.lease_chrono_ttl();
        inner.locks.insert(
            envelope.task_id,
            LockEntry {
                token,
                expires_at,
                key,
            },
        );

        tracing::debug!(
            consumer_id,
            task_id = %envelope.task_id,
            kind = %envelope.kind,
            attempt = envelope.attempt,
            "leased task"
        );

        Ok(LeaseAttempt::Acquired(Lease {
            envelope,
            token,
            deadline: expires_at,
        }))
    }
}

enum LeaseAttempt {
    Acquired(Lease),
    Empty {
        next_event: Option<DateTime<Utc>>,
    },
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    async fn enqueue(&self, envelope: QueueEnvelope) -> Result<EnqueueResult> {
        {
            let mut inner = self.inner.lock().map_err(poison_err)?;
            if let Some(capacity) = self.config.capacity {
                if inner.queue.len() >= capacity {
                    return Ok(EnqueueResult::QueueFull);
                }
            }
            inner.seq += 1;
            let key = QueueKey {
                priority: envelope.priority.0,
                visible_at: envelope.visible_at,
                seq: inner.seq,
            };
            inner.queue.insert(key, envelope);
        }
        self.notify.notify_one();
        Ok(EnqueueResult::Enqueued)
    }

    async fn lease_next(&self, consumer_id: &str, max_wait: Duration) -> Result<Option<Lease>> {
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let next_event = match self.try_lease(consumer_id)? {
                LeaseAttempt::Acquired(lease) => return Ok(Some(lease)),
                LeaseAttempt::Empty { next_event } => next_event,
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut sleep_for = deadline - now;
            if let Some(at) = next_event {
                let until = (at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_millis(1))
                    .max(Duration::from_millis(1));
                sleep_for = sleep_for.min(until);
            }

            tokio::select! {
                () = self.notify.notified() => {}
                () = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn extend_lease(
        &self,
        task_id: &TaskId,
        token: &LeaseToken,
        ttl: Duration,
    ) -> Result<LeaseStatus> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        let now = Utc::now();

        match inner.locks.get_mut(task_id) {
            Some(lock) if lock.token == *token && lock.expires_at > now => {
                lock.expires_at =
                    now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(900));
                Ok(LeaseStatus::Held)
            }
            _ => Ok(LeaseStatus::Lost),
        }
    }

    async fn release(&self, task_id: &TaskId, token: &LeaseToken) -> Result<LeaseStatus> {
        let mut inner = self.inner.lock().map_err(poison_err)?;

        match inner.locks.get(task_id) {
            Some(lock) if lock.token == *token => {
                let key = lock.key;
                inner.locks.remove(task_id);
                inner.queue.remove(&key);
                self.notify.notify_one();
                Ok(LeaseStatus::Held)
            }
            _ => Ok(LeaseStatus::Lost),
        }
    }

    async fn depth(&self) -> Result<usize> {
        let inner = self.inner.lock().map_err(poison_err)?;
        let now = Utc::now();
        let leased = inner
            .locks
            .values()
            .filter(|lock| lock.expires_at > now)
            .count();
        Ok(inner.queue.len().saturating_sub(leased))
    }

    async fn push_dlq(&self, entry: DlqEntry) -> Result<()> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        inner.dlq.entry(entry.kind).or_default().push_back(entry);
        Ok(())
    }

    async fn list_dlq(&self, kind: TaskKind, limit: usize) -> Result<Vec<DlqEntry>> {
        let inner = self.inner.lock().map_err(poison_err)?;
        Ok(inner
            .dlq
            .get(&kind)
            .map(|q| q.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn drain_dlq(&self, kind: TaskKind, max: usize) -> Result<Vec<DlqEntry>> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        let Some(queue) = inner.dlq.get_mut(&kind) else {
            return Ok(Vec::new());
        };
        let take = max.min(queue.len());
        Ok(queue.drain(..take).collect())
    }

    async fn stats(&self) -> Result<BrokerStats> {
        let inner = self.inner.lock().map_err(poison_err)?;
        let now = Utc::now();
        let active_leases = inner
            .locks
            .values()
            .filter(|lock| lock.expires_at > now)
            .count();
        let mut dlq_depth: Vec<(TaskKind, usize)> = inner
            .dlq
            .iter()
            .map(|(kind, q)| (*kind, q.len()))
            .collect();
        dlq_depth.sort_by_key(|(kind, _)| kind.as_str());

        Ok(BrokerStats {
            queue_depth: inner.queue.len().saturating_sub(active_leases),
            active_leases,
            dlq_depth,
        })
    }
}
