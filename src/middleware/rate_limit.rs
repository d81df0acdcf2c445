//! Rate limiting hook.
//!
//! The pipeline does not implement a limiting algorithm. It calls out to whatever
//! [`RateLimiter`] the application injects and relays its verdict. A denying limiter
//! owns the response the client sees.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract::Request, http::request::Parts, middleware::Next, response::Response};

use crate::pipeline::Stage;

/// Verdict of a [`RateLimiter`].
#[derive(Debug)]
pub enum Admission {
    Allow,
    /// Reject with this terminal response.
    Deny(Response),
}

/// Decides whether a request may proceed.
///
/// The limiter sees the request head only; the body stays with the pipeline.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Judges one request.
    ///
    /// # Arguments
    ///
    /// * `req` - The request head (method, URI, headers, extensions)
    ///
    /// # Returns
    ///
    /// `Admission::Allow` to continue, or `Admission::Deny` with the response the
    /// client receives unchanged.
    async fn admit(&self, req: &Parts) -> Admission;
}

/// Limiter that admits every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn admit(&self, _req: &Parts) -> Admission {
        Admission::Allow
    }
}

#[derive(Clone)]
pub struct RateLimitStage {
    limiter: Arc<dyn RateLimiter>,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn handle(&self, req: Request, next: Next) -> Response {
        let (parts, body) = req.into_parts();
        match self.limiter.admit(&parts).await {
            Admission::Allow => next.run(Request::from_parts(parts, body)).await,
            Admission::Deny(res) => {
                tracing::warn!(path = %parts.uri.path(), status = %res.status(), "Request rejected by rate limiter");
                res
            }
        }
    }
}
