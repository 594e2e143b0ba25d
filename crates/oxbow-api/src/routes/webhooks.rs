//! Webhook intake.
//!
//! Webhooks authenticate by HMAC signature, not API key. Required headers:
//!
//! - `X-Signature` (or GitHub's `X-Hub-Signature-256`): `sha256=<hex>` over
//!   `"{timestamp}.{body}"`
//! - `X-Timestamp`: unix epoch seconds, within ±5 minutes
//! - `X-Event-Id` (or GitHub's `X-GitHub-Delivery`): the source's unique
//!   delivery ID, used for replay dedup

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use oxbow_core::TaskId;

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Response body for accepted deliveries.
#[derive(Debug, Serialize)]
pub struct WebhookAccepted {
    /// Always `accepted`.
    pub status: &'static str,
    /// The task created from the delivery.
    pub task_id: TaskId,
}

fn header<'a>(headers: &'a HeaderMap, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| headers.get(*name).and_then(|value| value.to_str().ok()))
}

/// `POST /webhooks/:source`: accept a signed webhook delivery.
///
/// `202` accepted, `401` invalid signature, `409` replay, `408` stale.
pub async fn accept_webhook(
    State(state): State<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let signature = header(&headers, &["x-signature", "x-hub-signature-256"])
        .ok_or_else(|| ApiError::unauthorized("missing signature header"))?;
    let timestamp = header(&headers, &["x-timestamp"])
        .ok_or_else(|| ApiError::bad_request("missing X-Timestamp header"))?;
    let external_id = header(&headers, &["x-event-id", "x-github-delivery"])
        .ok_or_else(|| ApiError::bad_request("missing X-Event-Id header"))?;

    let accepted = state
        .webhooks
        .accept(&source, external_id, &body, signature, timestamp)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookAccepted {
            status: "accepted",
            task_id: accepted.task.id,
        }),
    )
        .into_response())
}
