//! HTTP route handlers served behind the edge pipeline.
//!
//! - `health`: liveness and build information
//! - `csrf`: first-token issuance for browser clients

pub mod csrf;
pub mod health;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::config::AppConfig;
use crate::middleware::csrf::CsrfGuard;
use crate::middleware::rate_limit::RateLimiter;
use crate::pipeline::Pipeline;

/// Built-in routes wrapped in the standard edge pipeline.
pub fn router(cfg: &AppConfig, limiter: Arc<dyn RateLimiter>) -> Router {
    let guard = Arc::new(CsrfGuard::from_config(&cfg.csrf));
    let routes = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/version", get(health::version))
        .route("/csrf-token", get(csrf::issue_token))
        .with_state(guard);
    Pipeline::standard(cfg, limiter).wrap(routes)
}
