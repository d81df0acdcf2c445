//! The edge stages.
//!
//! Each module provides one [`Stage`](crate::pipeline::Stage) plus the pure helpers it
//! is built from, so every decision can be tested without a running router:
//!
//! - `transport`: forced HTTPS upgrade
//! - `security_headers`: origin gate, security/cache/CORS headers
//! - `rate_limit`: hook for an injected rate limiter
//! - `csrf`: double-submit token validation and rotation
//! - `timeout`: per-request deadline with cooperative cancellation
//! - `compression`: brotli/gzip negotiation on finished responses

pub mod compression;
pub mod csrf;
pub mod rate_limit;
pub mod security_headers;
pub mod timeout;
pub mod transport;

pub use compression::CompressionNegotiator;
pub use csrf::CsrfGuard;
pub use rate_limit::{Admission, RateLimitStage, RateLimiter, Unlimited};
pub use security_headers::{HeaderPolicy, HeaderTables};
pub use timeout::RequestTimeoutGuard;
pub use transport::TransportRedirector;
