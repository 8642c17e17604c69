pub mod anthropic;
pub mod direct;
pub mod health;
pub mod models;
pub mod openai;
pub mod sessions;
pub mod tasks;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::errors::CoreError;
use crate::core::session_store::Session;
use crate::core::types::{RunOptions, RunResult, StreamChunk};
use crate::models::error::ApiError;
use crate::state::AppState;

pub(crate) fn invalid(message: impl Into<String>) -> ApiError {
    ApiError::from(CoreError::invalid_request(message))
}

/// Looks up the caller's named session, if any. Done up front — before a
/// streaming response commits its headers — so a bad session ID surfaces as
/// a normal error response rather than failing mid-stream.
pub(crate) async fn resolve_session(
    state: &AppState,
    credential: &str,
    session_id: Option<&str>,
) -> Result<Option<Session>, ApiError> {
    match session_id {
        Some(id) => Ok(Some(state.sessions.get(id, credential).await?)),
        None => Ok(None),
    }
}

/// Shared dispatch path for every protocol surface (spec §2 Dataflow): if
/// the caller named a session, hold its lock for the duration of the call
/// and resume from its upstream token; on completion, persist any upstream
/// token the CLI returned — creating a session on first use, touching it on
/// resume — and always release the lock, even on failure.
pub async fn dispatch(
    state: &AppState,
    credential: &str,
    session: Option<Session>,
    mut opts: RunOptions,
) -> Result<(RunResult, Option<String>), ApiError> {
    if let Some(session) = &session {
        state.sessions.acquire(&session.id).await;
        opts.resume_session_id = session.upstream_session_id.clone();
    }

    let req_id = Uuid::new_v4().to_string();
    let result = state.pool.submit(opts, &req_id).await;

    if let Some(session) = &session {
        state.sessions.release(&session.id).await;
    }

    let result = result?;
    let external_session_id = persist_session(state, credential, session.as_ref(), &result).await?;
    Ok((result, external_session_id))
}

/// Streaming counterpart of [`dispatch`]: runs the submission on a
/// background task so the caller can forward `StreamChunk`s as they arrive,
/// and performs the same lock/persist bookkeeping once it completes.
pub fn dispatch_streaming(
    state: AppState,
    credential: String,
    session: Option<Session>,
    mut opts: RunOptions,
) -> (tokio::sync::mpsc::Receiver<StreamChunk>, CancellationToken) {
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    opts.on_chunk = Some(tx);
    opts.stream = true;
    let cancel = opts.cancel.clone();

    tokio::spawn(async move {
        if let Some(session) = &session {
            state.sessions.acquire(&session.id).await;
            opts.resume_session_id = session.upstream_session_id.clone();
        }

        let req_id = Uuid::new_v4().to_string();
        let result = state.pool.submit(opts, &req_id).await;

        if let Some(session) = &session {
            state.sessions.release(&session.id).await;
        }

        if let Ok(result) = &result {
            let _ = persist_session(&state, &credential, session.as_ref(), result).await;
        }
    });

    (rx, cancel)
}

struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Fires `cancel` the moment the returned stream is dropped without running
/// to completion — the HTTP layer's half of spec §5's "client disconnect"
/// cancellation producer. A disconnect makes hyper stop polling the
/// response body, which drops this generator and its `_guard` local.
pub fn with_disconnect_guard<S>(stream: S, cancel: CancellationToken) -> impl Stream<Item = S::Item>
where
    S: Stream + Send + 'static,
{
    async_stream::stream! {
        let _guard = CancelOnDrop(cancel);
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            yield item;
        }
    }
}

async fn persist_session(
    state: &AppState,
    credential: &str,
    session: Option<&Session>,
    result: &RunResult,
) -> Result<Option<String>, ApiError> {
    match (session, &result.upstream_session_id) {
        (Some(session), _) => {
            let _ = state.sessions.touch(&session.id, credential).await;
            Ok(Some(session.id.clone()))
        },
        (None, Some(upstream)) => {
            let created = state.sessions.create(Some(upstream.clone()), credential).await?;
            Ok(Some(created.id))
        },
        (None, None) => Ok(None),
    }
}
