//! Liveness and pool introspection: `GET /health`, `GET /stats` (spec §10.5).

use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub healthy: bool,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let healthy = state.pool.healthy();
    Json(HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        healthy,
    })
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pool.stats())
}
