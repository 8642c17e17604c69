//! Thin CRUD over the Session Store (spec §4.3). Dispatch surfaces create
//! and touch sessions implicitly; these routes let a caller list, inspect,
//! reserve, or delete them directly.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension,
};
use serde::Deserialize;

use crate::middleware::auth::Credential;
use crate::models::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub upstream_session_id: Option<String>,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(Credential(credential)): Extension<Credential>,
) -> ApiResult<impl IntoResponse> {
    let sessions = state.sessions.list(&credential).await?;
    Ok(Json(sessions))
}

pub async fn create_session(
    State(state): State<AppState>,
    Extension(Credential(credential)): Extension<Credential>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    let session = state.sessions.create(req.upstream_session_id, &credential).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn get_session(
    State(state): State<AppState>,
    Extension(Credential(credential)): Extension<Credential>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = state.sessions.get(&id, &credential).await?;
    Ok(Json(session))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Extension(Credential(credential)): Extension<Credential>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.sessions.delete(&id, &credential).await?;
    Ok(StatusCode::NO_CONTENT)
}
