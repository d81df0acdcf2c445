//! Forced HTTPS upgrade.
//!
//! Plain-HTTP requests are answered with `301 Moved Permanently` pointing at the same
//! URL over HTTPS, unless the host is a loopback address or the process runs in
//! development mode.

use std::net::IpAddr;

use async_trait::async_trait;
use axum::{
    extract::Request,
    http::{header, uri::Authority, HeaderMap, HeaderValue, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::PipelineError;
use crate::pipeline::Stage;

#[derive(Debug, Clone, Copy)]
pub struct TransportRedirector {
    development: bool,
}

impl TransportRedirector {
    pub fn new(development: bool) -> Self {
        Self { development }
    }

    /// Computes the HTTPS location for a plain-HTTP request.
    ///
    /// The scheme comes from the URI, then `X-Forwarded-Proto`, and defaults to `http`.
    /// The host comes from the URI authority, then the `Host` header.
    ///
    /// # Arguments
    ///
    /// * `uri` - The request URI; path and query are carried over unchanged
    /// * `headers` - The request headers
    ///
    /// # Returns
    ///
    /// `Some(location)` if the request must be redirected, or `None` for HTTPS
    /// requests, loopback hosts, development mode and requests without a host.
    pub fn upgrade_target(&self, uri: &Uri, headers: &HeaderMap) -> Option<String> {
        if self.development || request_scheme(uri, headers) != "http" {
            return None;
        }
        let authority = request_authority(uri, headers)?;
        if is_loopback_host(authority.host()) {
            return None;
        }
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        Some(format!("https://{}{}", authority.as_str(), path_and_query))
    }
}

#[async_trait]
impl Stage for TransportRedirector {
    fn name(&self) -> &'static str {
        "transport_redirect"
    }

    async fn handle(&self, req: Request, next: Next) -> Response {
        let Some(target) = self.upgrade_target(req.uri(), req.headers()) else {
            return next.run(req).await;
        };
        tracing::debug!(location = %target, "Upgrading plain HTTP request");
        match HeaderValue::from_str(&target) {
            Ok(location) => (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response(),
            Err(e) => {
                PipelineError::Internal(anyhow::anyhow!("invalid redirect location {:?}: {}", target, e))
                    .into_response()
            }
        }
    }
}

/// Scheme from the absolute request URI, then `X-Forwarded-Proto`, else plain HTTP.
fn request_scheme<'a>(uri: &'a Uri, headers: &'a HeaderMap) -> &'a str {
    if let Some(scheme) = uri.scheme_str() {
        return scheme;
    }
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .unwrap_or("http")
}

fn request_authority(uri: &Uri, headers: &HeaderMap) -> Option<Authority> {
    if let Some(authority) = uri.authority() {
        return Some(authority.clone());
    }
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<Authority>().ok())
}

pub fn is_loopback_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}
