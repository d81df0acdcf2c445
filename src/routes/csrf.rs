use std::sync::Arc;

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};

use crate::error::PipelineResult;
use crate::middleware::csrf::CsrfGuard;

/// Seeds a client with its first CSRF token.
///
/// The guard itself never creates a token for a request that lacks one; browsers call
/// this once (a safe GET) and then send the cookie plus the mirrored header on every
/// unsafe request. Each successful unsafe request rotates the token from there on.
pub async fn issue_token(State(guard): State<Arc<CsrfGuard>>) -> PipelineResult<Response> {
    let token = guard.issue()?;
    let mut res = Json(serde_json::json!({ "token": token.as_str() })).into_response();
    guard.attach(res.headers_mut(), &token)?;
    Ok(res)
}
