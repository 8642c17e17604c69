//! The least lossy surface: `POST /v1/query` maps directly onto `RunOptions`.

use std::path::PathBuf;
use std::time::Duration;

use axum::{Extension, Json, extract::State, response::IntoResponse};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{dispatch, dispatch_streaming, resolve_session, with_disconnect_guard};
use crate::core::types::RunOptions;
use crate::middleware::auth::Credential;
use crate::models::direct::{QueryRequest, QueryResponse};
use crate::models::error::ApiResult;
use crate::state::AppState;
use crate::utils::streaming::create_sse_stream;

pub async fn query(
    State(state): State<AppState>,
    Extension(Credential(credential)): Extension<Credential>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<impl IntoResponse> {
    info!(model = req.model.as_deref().unwrap_or("default"), "direct query received");

    let session = resolve_session(&state, &credential, req.session_id.as_deref()).await?;

    let mut opts = RunOptions::new(
        req.prompt,
        Duration::from_millis(state.settings.dispatch.request_timeout_millis),
        CancellationToken::new(),
    );
    opts.model = req.model.or_else(|| state.settings.dispatch.default_model.clone());
    opts.allowed_tools = req.allowed_tools;
    opts.working_directory = req
        .working_directory
        .map(PathBuf::from)
        .or_else(|| state.settings.dispatch.default_workspace_dir.clone().map(PathBuf::from));
    opts.max_turns = req.max_turns;

    if req.stream {
        let (rx, cancel) = dispatch_streaming(state, credential, session, opts);
        let stream = with_disconnect_guard(tokio_stream::wrappers::ReceiverStream::new(rx), cancel);
        Ok(create_sse_stream(stream).into_response())
    } else {
        let (result, session_id) = dispatch(&state, &credential, session, opts).await?;
        Ok(Json(QueryResponse {
            result: result.result,
            session_id,
            model: result.model,
        })
        .into_response())
    }
}
