//! Thin CRUD over the Task Store (spec §4.4): a task is created, dispatched
//! on a background executor, and polled to completion by the caller.

use std::path::PathBuf;
use std::time::Duration;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::api::resolve_session;
use crate::core::errors::ErrorKind;
use crate::core::task_store::{TaskSpec, TaskStatus};
use crate::core::types::RunOptions;
use crate::middleware::auth::Credential;
use crate::models::error::ApiResult;
use crate::state::AppState;

/// Maps a dispatch failure onto the task store's closed failure-reason
/// vocabulary (`cancelled` and `server_restart` are written directly by
/// `TaskStore::cancel`/`mark_orphaned_failed`, never from here).
fn failure_reason(kind: ErrorKind, message: &str) -> String {
    match kind {
        ErrorKind::Timeout | ErrorKind::QueueTimeout => "timeout".to_string(),
        _ => format!("error:{message}"),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

pub async fn create_task(
    State(state): State<AppState>,
    Extension(Credential(credential)): Extension<Credential>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<impl IntoResponse> {
    let spec = TaskSpec {
        prompt: req.prompt,
        model: req.model,
        allowed_tools: req.allowed_tools,
        working_directory: req.working_directory,
        session_id: req.session_id,
        max_turns: req.max_turns,
    };

    let (task, cancel) = state.tasks.create(spec, &credential).await?;
    spawn_execution(state, credential, task.clone(), cancel);

    Ok((StatusCode::ACCEPTED, Json(task)))
}

pub async fn get_task(
    State(state): State<AppState>,
    Extension(Credential(credential)): Extension<Credential>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = state.tasks.get(&id, &credential).await?;
    Ok(Json(task))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Extension(Credential(credential)): Extension<Credential>,
) -> ApiResult<impl IntoResponse> {
    let tasks = state.tasks.list(&credential).await?;
    Ok(Json(tasks))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Extension(Credential(credential)): Extension<Credential>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    // Ownership check: `TaskStore::cancel` takes no credential, so callers
    // could otherwise cancel any task by guessing an ID.
    state.tasks.get(&id, &credential).await?;
    let cancelled = state.tasks.cancel(&id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

/// Resolves the task's session (if any), submits it to the Worker Pool, and
/// records the outcome. Runs detached from the HTTP request that created it.
fn spawn_execution(state: AppState, credential: String, task: crate::core::task_store::Task, cancel: CancellationToken) {
    tokio::spawn(async move {
        let session = match resolve_session(&state, &credential, task.session_id.as_deref()).await {
            Ok(session) => session,
            Err(e) => {
                warn!(task_id = %task.id, error = ?e, "failed to resolve task session");
                let reason = failure_reason(e.0.kind, &e.0.message);
                let _ = state.tasks.set_failed(&task.id, &reason).await;
                return;
            },
        };

        let mut opts = RunOptions::new(
            task.prompt.clone(),
            Duration::from_millis(state.settings.dispatch.request_timeout_millis),
            cancel,
        );
        opts.model = task.model.clone();
        opts.allowed_tools = task.allowed_tools.clone();
        opts.working_directory = task.working_directory.clone().map(PathBuf::from);
        opts.max_turns = task.max_turns;

        if let Some(session) = &session {
            state.sessions.acquire(&session.id).await;
            opts.resume_session_id = session.upstream_session_id.clone();
        }

        let req_id = format!("task-{}", task.id);
        let result = state.pool.submit(opts, &req_id).await;

        if let Some(session) = &session {
            state.sessions.release(&session.id).await;
        }

        match result {
            Ok(run_result) => {
                let _ = state
                    .tasks
                    .set_completed(&task.id, &run_result.result, run_result.upstream_session_id.as_deref())
                    .await;
                if session.is_none()
                    && let Some(upstream) = run_result.upstream_session_id
                {
                    let _ = state.sessions.create(Some(upstream), &credential).await;
                }
            },
            Err(e) => {
                // An explicit `POST /v1/tasks/:id/cancel` may have already
                // written `failed: cancelled` before this submission
                // unwound; check the row's current status rather than
                // guessing from the error message, which varies by where
                // in the submission the cancellation was observed.
                let still_running = state
                    .tasks
                    .get(&task.id, &credential)
                    .await
                    .map(|t| t.status == TaskStatus::Running)
                    .unwrap_or(false);
                if still_running {
                    let reason = failure_reason(e.kind, &e.message);
                    let _ = state.tasks.set_failed(&task.id, &reason).await;
                }
            },
        }
    });
}
