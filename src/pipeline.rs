//! Ordered composition of edge stages.
//!
//! A [`Pipeline`] is an explicit list of [`Stage`]s. Each stage receives the request and
//! the remaining chain as an [`axum::middleware::Next`]; it either answers on its own
//! (short-circuit) or calls `next.run(req)` and post-processes what comes back. The first
//! stage in the list is the outermost: stages see the request in list order and the
//! response in reverse order.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::Request,
    middleware::{from_fn, Next},
    response::{IntoResponse, Response},
    Router,
};
use tower_http::catch_panic::CatchPanicLayer;

use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::middleware::{
    compression::CompressionNegotiator,
    csrf::CsrfGuard,
    rate_limit::{RateLimitStage, RateLimiter},
    security_headers::{HeaderPolicy, HeaderTables},
    timeout::RequestTimeoutGuard,
    transport::TransportRedirector,
};

/// One link in the edge chain.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Short, stable name used in logs.
    fn name(&self) -> &'static str;

    /// Handle `req`, optionally delegating to the rest of the chain through `next`.
    async fn handle(&self, req: Request, next: Next) -> Response;
}

#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage. It runs after (inside) every stage added before it.
    pub fn stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// The canonical edge chain:
    /// HTTPS upgrade, origin gate and headers, rate limiting, CSRF, deadline, compression.
    pub fn standard(cfg: &AppConfig, limiter: Arc<dyn RateLimiter>) -> Self {
        Self::new()
            .stage(TransportRedirector::new(cfg.is_development()))
            .stage(HeaderPolicy::new(HeaderTables::from_config(&cfg.security)))
            .stage(RateLimitStage::new(limiter))
            .stage(CsrfGuard::from_config(&cfg.csrf))
            .stage(RequestTimeoutGuard::new(cfg.request_timeout()))
            .stage(CompressionNegotiator::new(cfg.compression.min_size))
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Installs the chain around `router`.
    ///
    /// Axum applies the last `.layer()` call outermost, so stages are layered in
    /// reverse. A panic boundary sits outside every stage.
    pub fn wrap<S>(self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let mut router = router;
        for stage in self.stages.into_iter().rev() {
            router = router.layer(from_fn(move |req: Request, next: Next| {
                let stage = stage.clone();
                async move {
                    tracing::trace!(stage = stage.name(), "entering stage");
                    stage.handle(req, next).await
                }
            }));
        }
        router.layer(CatchPanicLayer::custom(panic_response))
    }
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic payload".to_string()
    };
    PipelineError::Internal(anyhow::anyhow!("panic in request pipeline: {}", detail)).into_response()
}
