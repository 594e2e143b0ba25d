//! Task submission and status.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use oxbow_core::TaskId;
use oxbow_flow::apikey::ApiKeyRole;
use oxbow_flow::store::Store;
use oxbow_flow::task::{Task, TaskKind, TaskRequest, TaskStatus};

use crate::auth::AuthenticatedKey;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Response body for accepted (or deduplicated) submissions.
#[derive(Debug, Serialize)]
pub struct TaskAccepted {
    /// The task ID (the existing one on idempotent duplicates).
    pub task_id: TaskId,
    /// Current task status.
    pub status: TaskStatus,
}

/// Client-facing task snapshot.
#[derive(Debug, Serialize)]
pub struct TaskView {
    /// Task ID.
    pub id: TaskId,
    /// Task kind.
    #[serde(rename = "type")]
    pub kind: TaskKind,
    /// Current status.
    pub status: TaskStatus,
    /// Retries consumed.
    pub retry_count: u32,
    /// When the most recent attempt started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// The most recent error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            kind: task.kind,
            status: task.status,
            retry_count: task.retry_count,
            started_at: task.started_at,
            completed_at: task.completed_at,
            last_error: task.last_error,
        }
    }
}

/// `POST /tasks`: submit a task.
///
/// Returns `201` with the new task ID, or `409` carrying the existing ID
/// when the idempotency key matched a prior submission.
pub async fn submit_task(
    State(state): State<AppState>,
    auth: AuthenticatedKey,
    Json(request): Json<TaskRequest>,
) -> ApiResult<Response> {
    auth.require(ApiKeyRole::Service)?;

    let submission = state.submission.submit(request).await?;
    let status = if submission.deduplicated {
        StatusCode::CONFLICT
    } else {
        StatusCode::CREATED
    };
    let body = Json(TaskAccepted {
        task_id: submission.task.id,
        status: submission.task.status,
    });

    Ok((status, body).into_response())
}

/// `GET /tasks/:id`: task status snapshot.
pub async fn get_task(
    State(state): State<AppState>,
    auth: AuthenticatedKey,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskView>> {
    auth.require(ApiKeyRole::Readonly)?;

    let task_id: TaskId = id
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid task id: {id}")))?;

    let task = state
        .store
        .get_task(&task_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("task not found: {task_id}")))?;

    Ok(Json(TaskView::from(task)))
}
