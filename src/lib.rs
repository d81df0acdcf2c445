//! # EdgeGuard
//!
//! An ordered chain of HTTP edge middleware for axum applications. It sits in front of
//! the route handlers and enforces transport security, origin checks, CSRF protection,
//! rate limiting (through an injected limiter), request deadlines and response
//! compression.
//!
//! ## Architecture
//!
//! The application is built using:
//! - **Axum**: HTTP server, routing and the `Next` continuation each stage receives
//! - **Tokio**: async runtime, timers and cancellation tokens
//! - **async-compression**: brotli and gzip codecs
//! - **Serde**: configuration and JSON error bodies
//!
//! ## Core Components
//!
//! - [`config`]: Application configuration management
//! - [`error`]: Error taxonomy and the JSON error envelope
//! - [`middleware`]: The individual stages
//! - [`pipeline`]: The [`Stage`](pipeline::Stage) trait and ordered [`Pipeline`](pipeline::Pipeline)
//! - [`routes`]: Built-in endpoints served behind the pipeline
//!
//! ## Request flow
//!
//! HTTPS upgrade → origin gate → rate limiter → CSRF validation → deadline →
//! compression → handler, then back out in reverse: compression, CSRF rotation,
//! response headers.

pub mod config;
pub mod error;
pub mod middleware;
pub mod pipeline;
pub mod routes;

#[cfg(test)]
mod tests;

pub use error::{PipelineError, PipelineResult};
pub use pipeline::{Pipeline, Stage};
