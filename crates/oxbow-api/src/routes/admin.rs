//! Operator surface: runs, DLQ, API keys, circuits, budgets.
//!
//! Every endpoint here requires the `admin` role.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use oxbow_core::{ApiKeyId, ApiKeyHasher};
use oxbow_flow::apikey::{ApiKey, ApiKeyRole};
use oxbow_flow::broker::{DlqEntry, QueueBroker, QueueEnvelope};
use oxbow_flow::budget::BudgetLedger;
use oxbow_flow::circuit::CircuitRecord;
use oxbow_flow::run::Run;
use oxbow_flow::store::Store;
use oxbow_flow::task::TaskKind;

use crate::auth::AuthenticatedKey;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

fn parse_kind(kind: &str) -> Result<TaskKind, ApiError> {
    kind.parse()
        .map_err(|_| ApiError::bad_request(format!("unknown task kind: {kind}")))
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Query for `GET /admin/runs`.
#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    /// Maximum rows returned.
    #[serde(default = "default_runs_limit")]
    pub limit: usize,
}

const fn default_runs_limit() -> usize {
    100
}

/// `GET /admin/runs`: most recent runs across tasks.
pub async fn recent_runs(
    State(state): State<AppState>,
    auth: AuthenticatedKey,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Json<Vec<Run>>> {
    auth.require(ApiKeyRole::Admin)?;
    let runs = state.store.recent_runs(query.limit.min(1000)).await?;
    Ok(Json(runs))
}

// ---------------------------------------------------------------------------
// Dead-letter queue
// ---------------------------------------------------------------------------

/// Query for `GET /admin/dlq/:kind`.
#[derive(Debug, Deserialize)]
pub struct DlqQuery {
    /// Maximum rows returned.
    #[serde(default = "default_runs_limit")]
    pub limit: usize,
}

/// `GET /admin/dlq/:kind`: dead-lettered tasks for a kind.
pub async fn list_dlq(
    State(state): State<AppState>,
    auth: AuthenticatedKey,
    Path(kind): Path<String>,
    Query(query): Query<DlqQuery>,
) -> ApiResult<Json<Vec<DlqEntry>>> {
    auth.require(ApiKeyRole::Admin)?;
    let kind = parse_kind(&kind)?;
    let entries = state.broker.list_dlq(kind, query.limit.min(1000)).await?;
    Ok(Json(entries))
}

/// Body for `POST /admin/dlq/:kind/drain`.
#[derive(Debug, Deserialize)]
pub struct DrainRequest {
    /// Maximum entries to re-drive.
    #[serde(default = "default_drain_max")]
    pub max: usize,
    /// Demote priority one level so re-driven work does not starve fresh
    /// submissions.
    #[serde(default = "default_demote")]
    pub demote: bool,
}

// A body-less drain must behave like `{}`: the derived Default would
// yield `{max: 0, demote: false}` and silently drain nothing.
impl Default for DrainRequest {
    fn default() -> Self {
        Self {
            max: default_drain_max(),
            demote: default_demote(),
        }
    }
}

const fn default_drain_max() -> usize {
    100
}

const fn default_demote() -> bool {
    true
}

/// Response for a drain operation.
#[derive(Debug, Serialize)]
pub struct DrainResponse {
    /// Entries re-driven into the queue.
    pub drained: usize,
    /// Entries that could not be revived (left out of both queues).
    pub skipped: usize,
}

/// `POST /admin/dlq/:kind/drain`: re-drive dead-lettered tasks.
///
/// Revived tasks restart with `retry_count` 0 and, by default, a demoted
/// priority.
pub async fn drain_dlq(
    State(state): State<AppState>,
    auth: AuthenticatedKey,
    Path(kind): Path<String>,
    body: Option<Json<DrainRequest>>,
) -> ApiResult<Json<DrainResponse>> {
    auth.require(ApiKeyRole::Admin)?;
    let kind = parse_kind(&kind)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let entries = state.broker.drain_dlq(kind, request.max).await?;
    let mut drained = 0usize;
    let mut skipped = 0usize;

    for entry in entries {
        let priority = if request.demote {
            entry.priority.demoted()
        } else {
            entry.priority
        };
        match state.store.revive_task(&entry.task_id, priority).await {
            Ok(task) => {
                state
                    .broker
                    .enqueue(QueueEnvelope::new(task.id, task.kind, task.priority))
                    .await?;
                drained += 1;
            }
            Err(error) => {
                tracing::warn!(task_id = %entry.task_id, %error, "skipping unrevivable DLQ entry");
                skipped += 1;
            }
        }
    }

    tracing::info!(kind = %kind, drained, skipped, "DLQ drained");
    Ok(Json(DrainResponse { drained, skipped }))
}

// ---------------------------------------------------------------------------
// API keys
// ---------------------------------------------------------------------------

/// Body for `POST /admin/keys`.
#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    /// Human-readable key name.
    pub name: String,
    /// Role granted to the key.
    pub role: ApiKeyRole,
    /// Expiry in days from now; never expires when absent.
    #[serde(default)]
    pub expires_in_days: Option<i64>,
}

/// Response carrying a freshly minted key. The raw key appears here and
/// nowhere else, ever.
#[derive(Debug, Serialize)]
pub struct CreatedKey {
    /// The key record ID.
    pub id: ApiKeyId,
    /// The key name.
    pub name: String,
    /// The granted role.
    pub role: ApiKeyRole,
    /// The raw bearer key. Shown exactly once.
    pub raw_key: String,
}

/// `POST /admin/keys`: mint a new API key.
pub async fn create_key(
    State(state): State<AppState>,
    auth: AuthenticatedKey,
    Json(request): Json<CreateKeyRequest>,
) -> ApiResult<Response> {
    auth.require(ApiKeyRole::Admin)?;

    let raw_key = ApiKeyHasher::generate_raw_key();
    let expires_at = request
        .expires_in_days
        .map(|days| Utc::now() + chrono::Duration::days(days));
    let key = ApiKey::new(
        state.hasher.hash(&raw_key),
        request.name.clone(),
        request.role,
        expires_at,
    );
    let created = CreatedKey {
        id: key.id,
        name: key.name.clone(),
        role: key.role,
        raw_key,
    };
    state.store.insert_api_key(key).await?;

    tracing::info!(name = %created.name, role = %created.role, "API key created");
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

/// Query for `GET /admin/keys`.
#[derive(Debug, Default, Deserialize)]
pub struct ListKeysQuery {
    /// Include revoked keys.
    #[serde(default)]
    pub include_inactive: bool,
}

/// `GET /admin/keys`: list key records (hashes are never serialized).
pub async fn list_keys(
    State(state): State<AppState>,
    auth: AuthenticatedKey,
    Query(query): Query<ListKeysQuery>,
) -> ApiResult<Json<Vec<ApiKey>>> {
    auth.require(ApiKeyRole::Admin)?;
    let keys = state.store.list_api_keys(query.include_inactive).await?;
    Ok(Json(keys))
}

fn parse_key_id(id: &str) -> Result<ApiKeyId, ApiError> {
    id.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid key id: {id}")))
}

/// `DELETE /admin/keys/:id`: revoke a key.
pub async fn revoke_key(
    State(state): State<AppState>,
    auth: AuthenticatedKey,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    auth.require(ApiKeyRole::Admin)?;
    let id = parse_key_id(&id)?;

    state
        .store
        .set_api_key_active(&id, false)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("key not found: {id}")))?;

    tracing::info!(key_id = %id, "API key revoked");
    Ok(StatusCode::NO_CONTENT)
}

/// Body for `POST /admin/keys/:id/rotate`.
#[derive(Debug, Deserialize)]
pub struct RotateKeyRequest {
    /// How long the old key keeps working alongside the new one.
    #[serde(default = "default_overlap_minutes")]
    pub overlap_minutes: i64,
}

impl Default for RotateKeyRequest {
    fn default() -> Self {
        Self {
            overlap_minutes: default_overlap_minutes(),
        }
    }
}

const fn default_overlap_minutes() -> i64 {
    60
}

/// `POST /admin/keys/:id/rotate`: mint a replacement key and schedule the
/// old one to expire after the overlap window.
pub async fn rotate_key(
    State(state): State<AppState>,
    auth: AuthenticatedKey,
    Path(id): Path<String>,
    body: Option<Json<RotateKeyRequest>>,
) -> ApiResult<Response> {
    auth.require(ApiKeyRole::Admin)?;
    let id = parse_key_id(&id)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let old = state
        .store
        .get_api_key(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("key not found: {id}")))?;

    let raw_key = ApiKeyHasher::generate_raw_key();
    let new_key = ApiKey::new(
        state.hasher.hash(&raw_key),
        format!("{}-rotated", old.name),
        old.role,
        old.expires_at,
    );
    let created = CreatedKey {
        id: new_key.id,
        name: new_key.name.clone(),
        role: new_key.role,
        raw_key,
    };
    state.store.insert_api_key(new_key).await?;

    let revoke_at = Utc::now() + chrono::Duration::minutes(request.overlap_minutes.max(0));
    state.store.set_api_key_expiry(&id, Some(revoke_at)).await?;

    tracing::info!(old_key = %id, new_key = %created.id, %revoke_at, "API key rotated");
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

// ---------------------------------------------------------------------------
// Circuits & budgets
// ---------------------------------------------------------------------------

/// `GET /admin/circuits`: all circuit breaker records.
pub async fn list_circuits(
    State(state): State<AppState>,
    auth: AuthenticatedKey,
) -> ApiResult<Json<Vec<CircuitRecord>>> {
    auth.require(ApiKeyRole::Admin)?;
    let records = state.circuits.snapshot().await?;
    Ok(Json(records))
}

/// `GET /admin/budgets`: today's per-provider spend ledgers.
pub async fn list_budgets(
    State(state): State<AppState>,
    auth: AuthenticatedKey,
) -> ApiResult<Json<Vec<BudgetLedger>>> {
    auth.require(ApiKeyRole::Admin)?;
    let ledgers = state.budget.snapshot_today().await?;
    Ok(Json(ledgers))
}
