//! Server-sent status streaming for a task.
//!
//! The stream polls the store once a second and emits `status` events as
//! the task moves through its lifecycle, closing with a final `done` or
//! `error` event. Streams are capped at ten minutes.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde_json::json;
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::wrappers::UnboundedReceiverStream;

use oxbow_core::TaskId;
use oxbow_flow::apikey::ApiKeyRole;
use oxbow_flow::store::Store;
use oxbow_flow::task::TaskStatus;

use crate::auth::AuthenticatedKey;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Poll interval for status changes.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Hard cap on stream lifetime.
const STREAM_TIMEOUT: Duration = Duration::from_secs(600);

/// `GET /stream/:id`: SSE status updates until the task finishes.
pub async fn stream_task(
    State(state): State<AppState>,
    auth: AuthenticatedKey,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    auth.require(ApiKeyRole::Readonly)?;

    let task_id: TaskId = id
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid task id: {id}")))?;

    // 404 before the stream starts, not as a stream error.
    state
        .store
        .get_task(&task_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("task not found: {task_id}")))?;

    let (tx, rx) = unbounded_channel::<Result<Event, Infallible>>();
    let store = state.store.clone();

    tokio::spawn(async move {
        let started = tokio::time::Instant::now();
        let mut last_status: Option<TaskStatus> = None;

        loop {
            if started.elapsed() > STREAM_TIMEOUT {
                let _ = tx.send(Ok(Event::default()
                    .event("error")
                    .data(json!({"error": "stream timeout"}).to_string())));
                return;
            }

            match store.get_task(&task_id).await {
                Ok(Some(task)) => {
                    if last_status != Some(task.status) {
                        last_status = Some(task.status);
                        let event = Event::default()
                            .event("status")
                            .data(json!({"status": task.status}).to_string());
                        if tx.send(Ok(event)).is_err() {
                            return;
                        }
                    }

                    match task.status {
                        TaskStatus::Done => {
                            let _ = tx.send(Ok(Event::default()
                                .event("done")
                                .data(json!({"task_id": task.id}).to_string())));
                            return;
                        }
                        TaskStatus::Failed | TaskStatus::Canceled => {
                            let _ = tx.send(Ok(Event::default().event("error").data(
                                json!({
                                    "task_id": task.id,
                                    "status": task.status,
                                    "error": task.last_error,
                                })
                                .to_string(),
                            )));
                            return;
                        }
                        TaskStatus::Queued | TaskStatus::Running => {}
                    }
                }
                Ok(None) => {
                    let _ = tx.send(Ok(Event::default()
                        .event("error")
                        .data(json!({"error": "task disappeared"}).to_string())));
                    return;
                }
                Err(error) => {
                    tracing::warn!(%task_id, %error, "status poll failed");
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    });

    Ok(Sse::new(UnboundedReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}
