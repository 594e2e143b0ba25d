//! Intake gates: idempotent task submission and webhook acceptance.
//!
//! [`SubmissionGate`] is the single entry point for client submissions.
//! Deduplication resolves against the unique index on idempotency keys; a
//! submitter that loses the unique-insert race falls back to the winning
//! row, so N concurrent submissions with one key yield one task and N
//! identical responses.
//!
//! [`WebhookGate`] fronts inbound webhooks with three checks in order:
//! HMAC signature (constant-time), timestamp freshness (±5 minutes), and
//! `(source, external_id)` replay uniqueness. An accepted delivery creates
//! its task and inbox row in one store transaction.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use oxbow_core::signature::sha256_hex;
use oxbow_core::WebhookSigner;

use crate::admission::AdmissionController;
use crate::broker::{EnqueueResult, QueueBroker, QueueEnvelope};
use crate::error::{Error, Result};
use crate::inbox::{InboxEntry, InboxStatus, NewInboxEntry};
use crate::store::{InboxInsert, Store, TaskInsert};
use crate::task::{Priority, Task, TaskRequest, DEFAULT_MAX_RETRIES};

/// Webhook timestamp freshness window in seconds.
pub const REPLAY_TOLERANCE_SECONDS: i64 = 300;

/// Tunables shared by both gates.
#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    /// Retry budget stamped on accepted tasks (`TASK_MAX_RETRIES`).
    pub max_retries: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Result of a client submission.
#[derive(Debug, Clone)]
pub struct Submission {
    /// The task (freshly created or the idempotent original).
    pub task: Task,
    /// True when an existing task was returned without side effect.
    pub deduplicated: bool,
}

/// Idempotent client submission gate.
pub struct SubmissionGate {
    store: Arc<dyn Store>,
    broker: Arc<dyn QueueBroker>,
    admission: Arc<AdmissionController>,
    config: GateConfig,
}

impl SubmissionGate {
    /// Creates a gate over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn QueueBroker>,
        admission: Arc<AdmissionController>,
        config: GateConfig,
    ) -> Self {
        Self {
            store,
            broker,
            admission,
            config,
        }
    }

    /// Submits a task, deduplicating on its idempotency key.
    ///
    /// # Errors
    ///
    /// Propagates admission rejections (`queue_full`, `budget_exceeded`,
    /// `circuit_open`) and storage failures. Duplicates are not errors.
    #[tracing::instrument(skip(self, request), fields(kind = %request.kind))]
    pub async fn submit(&self, request: TaskRequest) -> Result<Submission> {
        let kind = request.kind;

        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(existing) = self.store.find_task_by_idempotency_key(key).await? {
                tracing::info!(task_id = %existing.id, key, "duplicate submission deduplicated");
                return Ok(Submission {
                    task: existing,
                    deduplicated: true,
                });
            }
        }

        self.admission.admit(kind).await?;

        let task = Task::from_request(request, self.config.max_retries);
        match self.store.create_task(task).await? {
            TaskInsert::Created(task) => {
                if let Err(error) = self.enqueue_task(&task).await {
                    // Admitted but never going to run; hand back the probe
                    // slot a half-open circuit may have granted.
                    self.admission.release_probe(kind).await?;
                    return Err(error);
                }
                tracing::info!(task_id = %task.id, kind = %task.kind, "task accepted");
                Ok(Submission {
                    task,
                    deduplicated: false,
                })
            }
            // Lost the unique-insert race: someone else created the row
            // between our lookup and our insert. Return theirs — and
            // release the probe slot this admission claimed, since the
            // discarded submission will never report an outcome.
            TaskInsert::Duplicate(existing) => {
                self.admission.release_probe(kind).await?;
                Ok(Submission {
                    task: existing,
                    deduplicated: true,
                })
            }
        }
    }

    async fn enqueue_task(&self, task: &Task) -> Result<()> {
        let envelope = QueueEnvelope::new(task.id, task.kind, task.priority);
        match self.broker.enqueue(envelope).await? {
            EnqueueResult::Enqueued => Ok(()),
            EnqueueResult::QueueFull => {
                let depth = self.broker.depth().await.unwrap_or(0);
                Err(Error::QueueFull {
                    depth,
                    capacity: depth,
                })
            }
        }
    }
}

/// The shape webhook bodies must carry to become tasks.
#[derive(Debug, Deserialize)]
struct WebhookBody {
    #[serde(rename = "type")]
    kind: crate::task::TaskKind,
    payload: Value,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    trace_id: Option<String>,
}

/// An accepted webhook delivery.
#[derive(Debug, Clone)]
pub struct AcceptedWebhook {
    /// The task created from the delivery.
    pub task: Task,
    /// The recorded inbox entry.
    pub inbox: InboxEntry,
}

/// Webhook intake gate: signature, freshness, and replay checks.
pub struct WebhookGate {
    store: Arc<dyn Store>,
    broker: Arc<dyn QueueBroker>,
    admission: Arc<AdmissionController>,
    signer: WebhookSigner,
    config: GateConfig,
}

impl WebhookGate {
    /// Creates a gate verifying with the given shared-secret signer.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn QueueBroker>,
        admission: Arc<AdmissionController>,
        signer: WebhookSigner,
        config: GateConfig,
    ) -> Self {
        Self {
            store,
            broker,
            admission,
            signer,
            config,
        }
    }

    /// Accepts or rejects one webhook delivery.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSignature`]: HMAC verification failed
    /// - [`Error::ReplayWindowExceeded`]: timestamp outside ±5 minutes
    /// - [`Error::ReplayBlocked`]: `(source, external_id)` already recorded
    /// - [`Error::InvalidBody`]: body is not a task-bearing JSON document
    /// - Admission rejections, recorded on the inbox entry
    #[tracing::instrument(skip(self, body, signature, timestamp))]
    pub async fn accept(
        &self,
        source: &str,
        external_id: &str,
        body: &[u8],
        signature: &str,
        timestamp: &str,
    ) -> Result<AcceptedWebhook> {
        // 1. Signature first; nothing below is trustworthy without it.
        self.signer
            .verify(body, Some(timestamp), signature)
            .map_err(|_| Error::InvalidSignature {
                webhook_source: source.to_string(),
            })?;
        let signature_hash = Some(sha256_hex(signature.as_bytes()));

        // 2. Freshness window.
        let ts: i64 = timestamp.parse().map_err(|_| {
            Error::InvalidRequest("timestamp header is not a unix epoch".to_string())
        })?;
        let skew = (Utc::now().timestamp() - ts).abs();
        if skew > REPLAY_TOLERANCE_SECONDS {
            self.record_rejection(
                source,
                external_id,
                signature_hash.clone(),
                serde_json::json!({}),
                "replay_window_exceeded",
            )
            .await;
            return Err(Error::ReplayWindowExceeded { skew_seconds: skew });
        }

        // 3. Parse the body into a task request.
        let parsed: WebhookBody = match serde_json::from_slice(body) {
            Ok(parsed) => parsed,
            Err(error) => {
                let raw = serde_json::json!({
                    "raw": String::from_utf8_lossy(body),
                });
                self.record_rejection(source, external_id, signature_hash, raw, "invalid_body")
                    .await;
                return Err(Error::InvalidBody {
                    message: error.to_string(),
                });
            }
        };

        // 4. Replay check before admission: a delivery already recorded
        // must not consume admission side effects (a half-open circuit's
        // probe slot in particular). The unique insert below still guards
        // the race.
        if let Some(existing) = self.store.get_inbox_entry(source, external_id).await? {
            tracing::warn!(source, external_id, "webhook replay blocked");
            return Err(Error::ReplayBlocked {
                webhook_source: source.to_string(),
                external_id: existing.external_id,
            });
        }

        // 5. Admission, recorded on rejection so the delivery is auditable.
        if let Err(error) = self.admission.admit(parsed.kind).await {
            let reason = error.client_code().unwrap_or("admission_failed");
            self.record_rejection(
                source,
                external_id,
                signature_hash,
                parsed.payload.clone(),
                reason,
            )
            .await;
            return Err(error);
        }

        // 6. Replay-unique insert of inbox entry and task, one transaction.
        let request = TaskRequest {
            kind: parsed.kind,
            payload: parsed.payload.clone(),
            priority: parsed.priority.unwrap_or_default(),
            idempotency_key: None,
            trace_id: parsed.trace_id,
        };
        let task = Task::from_request(request, self.config.max_retries);
        let inbox = NewInboxEntry {
            source: source.to_string(),
            external_id: external_id.to_string(),
            signature_hash,
            payload: parsed.payload,
            status: InboxStatus::Processing,
            rejection_reason: None,
        };

        let (entry, task) = match self.store.insert_inbox_task(inbox, task).await? {
            InboxInsert::Created { entry, task } => (entry, task),
            InboxInsert::Replay(existing) => {
                // Lost the unique-insert race to a concurrent delivery.
                // This admission claimed a probe slot nothing will report
                // back for; hand it back.
                self.admission.release_probe(parsed.kind).await?;
                tracing::warn!(source, external_id, "webhook replay blocked");
                return Err(Error::ReplayBlocked {
                    webhook_source: source.to_string(),
                    external_id: existing.external_id,
                });
            }
        };

        let envelope = QueueEnvelope::new(task.id, task.kind, task.priority);
        if !self.broker.enqueue(envelope).await?.is_enqueued() {
            self.admission.release_probe(task.kind).await?;
            let depth = self.broker.depth().await.unwrap_or(0);
            return Err(Error::QueueFull {
                depth,
                capacity: depth,
            });
        }

        tracing::info!(source, external_id, task_id = %task.id, "webhook accepted");
        Ok(AcceptedWebhook { task, inbox: entry })
    }

    async fn record_rejection(
        &self,
        source: &str,
        external_id: &str,
        signature_hash: Option<String>,
        payload: Value,
        reason: &str,
    ) {
        let rejection = NewInboxEntry {
            source: source.to_string(),
            external_id: external_id.to_string(),
            signature_hash,
            payload,
            status: InboxStatus::Rejected,
            rejection_reason: Some(reason.to_string()),
        };
        // Best-effort: a rejection we fail to record must not mask the
        // rejection itself.
        if let Err(error) = self.store.record_inbox_rejection(rejection).await {
            tracing::warn!(source, external_id, %error, "failed to record inbox rejection");
        }
    }
}
