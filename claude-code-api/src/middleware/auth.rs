//! Minimal bearer-credential extraction. The credential presented on each
//! request *is* the identity — no JWT issuance, no session of our own
//! (spec §9: "ownership fingerprint... a security property, not a
//! performance optimization").

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};

use crate::models::error::ApiError;
use crate::state::AppState;

/// The raw bearer token, stashed as a request extension. Surfaces that need
/// an owner fingerprint hash it themselves via `session_store::fingerprint`.
#[derive(Debug, Clone)]
pub struct Credential(pub String);

pub async fn extract_credential(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let settings = &state.settings;
    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned);

    let credential = match token {
        Some(t) => Credential(t),
        None if settings.auth.enabled => {
            return Err(ApiError::unauthorized("missing bearer credential"));
        },
        None => Credential("anonymous".to_string()),
    };

    req.extensions_mut().insert(credential);
    Ok(next.run(req).await)
}
