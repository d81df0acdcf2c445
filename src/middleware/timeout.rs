//! Per-request deadline.
//!
//! The downstream chain races a timer. The first to finish decides the response. When
//! the timer wins, the request's [`CancellationToken`] is cancelled and the client gets
//! `504 Gateway Timeout`. The downstream future is dropped at its next suspension
//! point, but anything it already handed to another task keeps running unless that task
//! watches the token. Side effects committed before the deadline are not undone.

use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::pipeline::Stage;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct RequestTimeoutGuard {
    timeout: Duration,
}

impl Default for RequestTimeoutGuard {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl RequestTimeoutGuard {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Stage for RequestTimeoutGuard {
    fn name(&self) -> &'static str {
        "timeout"
    }

    async fn handle(&self, mut req: Request, next: Next) -> Response {
        let cancel = CancellationToken::new();
        // Handlers pick this up with `Extension<CancellationToken>`.
        req.extensions_mut().insert(cancel.clone());
        let path = req.uri().path().to_owned();

        tokio::select! {
            res = next.run(req) => res,
            _ = tokio::time::sleep(self.timeout) => {
                cancel.cancel();
                tracing::warn!(%path, timeout_ms = self.timeout.as_millis() as u64, "Request timed out");
                PipelineError::Timeout.into_response()
            }
        }
    }
}
