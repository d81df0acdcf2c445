//! Origin gate and response header policy.
//!
//! Request phase: a request whose `Origin` is not on the allow-list is refused with
//! `403 Forbidden` before anything downstream runs.
//!
//! Response phase, for every path outside the internal-asset prefix, these writers run
//! against the same header map in order, and a later writer overrides an earlier one for
//! the same header (last writer wins):
//!
//! 1. fixed security headers
//! 2. `Content-Type` from the path extension, only when the handler did not set one
//! 3. `Cache-Control` for sensitive prefixes and cacheable extensions
//! 4. `ETag` for `.css` / `.js` paths, derived from the path string
//!
//! CORS headers are added whenever an allowed `Origin` was present, including on
//! internal-asset paths. Fingerprinting headers are always stripped.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use axum::{
    extract::Request,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};

use crate::config::SecurityConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::Stage;

const SECURITY_HEADERS: &[(&str, &str)] = &[
    (
        "content-security-policy",
        "default-src 'self'; script-src 'self' 'unsafe-inline' 'unsafe-eval'; style-src 'self' 'unsafe-inline'; \
         img-src 'self' data:; font-src 'self'; object-src 'none'; upgrade-insecure-requests; \
         frame-ancestors 'none'; connect-src 'self' https://api.openai.com; media-src 'self' data: blob:; manifest-src 'self';",
    ),
    ("cross-origin-embedder-policy", "require-corp"),
    ("cross-origin-opener-policy", "same-origin"),
    ("expect-ct", "max-age=86400, enforce"),
    ("origin-agent-cluster", "?1"),
    (
        "permissions-policy",
        "accelerometer=(), camera=(), encrypted-media=(), gyroscope=(), interest-cohort=(), microphone=(), \
         magnetometer=(), midi=(), payment=(), picture-in-picture=(), publickey-credentials-get=(), sync-xhr=(), \
         usb=(), xr-spatial-tracking=(), geolocation=()",
    ),
    ("referrer-policy", "no-referrer"),
    ("strict-transport-security", "max-age=63072000; includeSubDomains; preload"),
    ("x-content-type-options", "nosniff"),
    ("x-dns-prefetch-control", "off"),
    ("x-download-options", "noopen"),
    ("x-frame-options", "SAMEORIGIN"),
    ("x-permitted-cross-domain-policies", "none"),
    ("x-xss-protection", "0"),
];

const CONTENT_TYPES: &[(&str, &str)] = &[
    (".css", "text/css; charset=utf-8"),
    (".html", "text/html; charset=utf-8"),
    (".jpeg", "image/jpeg"),
    (".jpg", "image/jpeg"),
    (".js", "application/javascript"),
    (".json", "application/json"),
    (".mp3", "audio/mpeg"),
    (".png", "image/png"),
    (".svg", "image/svg+xml"),
    (".webmanifest", "application/manifest+json"),
];

const CACHEABLE_EXTENSIONS: &[&str] = &[".css", ".jpg", ".js", ".png", ".svg"];
const SENSITIVE_PREFIXES: &[&str] = &["/api"];
const FINGERPRINT_HEADERS: &[&str] = &["x-powered-by", "server"];

const CORS_ALLOW_HEADERS_PREFLIGHT: &str = "Content-Type, Authorization";
const CORS_ALLOW_HEADERS: &str = "Content-Type, Content-Length, Accept-Encoding, X-CSRF-Token, Authorization, \
     accept, origin, Cache-Control, X-Requested-With";

/// Lookup tables behind the header policy. Built once at startup.
#[derive(Debug, Clone)]
pub struct HeaderTables {
    pub allowed_origins: HashSet<String>,
    pub content_types: HashMap<String, String>,
    pub cacheable_extensions: HashSet<String>,
    pub sensitive_prefixes: Vec<String>,
    /// Paths under this prefix get CORS headers only.
    pub internal_asset_prefix: String,
}

impl Default for HeaderTables {
    fn default() -> Self {
        Self::from_config(&SecurityConfig::default())
    }
}

impl HeaderTables {
    pub fn from_config(cfg: &SecurityConfig) -> Self {
        Self {
            allowed_origins: cfg.allowed_origins.iter().cloned().collect(),
            content_types: CONTENT_TYPES.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            cacheable_extensions: CACHEABLE_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            sensitive_prefixes: SENSITIVE_PREFIXES.iter().map(|p| p.to_string()).collect(),
            internal_asset_prefix: cfg.internal_asset_prefix.clone(),
        }
    }

    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.contains(origin)
    }

    fn is_sensitive(&self, path: &str) -> bool {
        self.sensitive_prefixes.iter().any(|p| {
            path == p.as_str() || path.strip_prefix(p.as_str()).map(|rest| rest.starts_with('/')).unwrap_or(false)
        })
    }
}

/// Extension of the last path segment including the dot, lowercased.
pub fn path_extension(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next().unwrap_or(path);
    let idx = segment.rfind('.')?;
    Some(segment[idx..].to_ascii_lowercase())
}

pub fn set_security_headers(headers: &mut HeaderMap) {
    for &(name, value) in SECURITY_HEADERS {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
}

pub fn set_content_type(headers: &mut HeaderMap, path: &str, tables: &HeaderTables) -> PipelineResult<()> {
    if headers.contains_key(header::CONTENT_TYPE) {
        return Ok(());
    }
    let Some(ct) = path_extension(path).and_then(|ext| tables.content_types.get(&ext)) else {
        return Ok(());
    };
    let value = HeaderValue::from_str(ct).map_err(|e| anyhow::anyhow!("invalid content type {:?}: {}", ct, e))?;
    headers.insert(header::CONTENT_TYPE, value);
    Ok(())
}

pub fn set_cache_control(headers: &mut HeaderMap, path: &str, tables: &HeaderTables) {
    if tables.is_sensitive(path) {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store, max-age=0"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
        return;
    }
    if path_extension(path).map(|ext| tables.cacheable_extensions.contains(&ext)).unwrap_or(false) {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=31536000, immutable"));
        // Remove pragma if previously set by proxies
        headers.remove(header::PRAGMA);
    }
}

/// Cache-busting tag for stylesheets and scripts. Hashes the path, not the body.
pub fn set_etag(headers: &mut HeaderMap, path: &str) -> PipelineResult<()> {
    if !matches!(path_extension(path).as_deref(), Some(".css") | Some(".js")) {
        return Ok(());
    }
    let digest = Sha256::digest(path.as_bytes());
    let hex: String = digest[..16].iter().map(|b| format!("{:02x}", b)).collect();
    let value = HeaderValue::from_str(&format!("\"{}\"", hex))
        .map_err(|e| anyhow::anyhow!("invalid etag for {:?}: {}", path, e))?;
    headers.insert(header::ETAG, value);
    Ok(())
}

/// Writes the CORS response headers for an allowed origin.
///
/// # Arguments
///
/// * `headers` - Response headers to modify
/// * `method` - The request method; preflight (`OPTIONS`) gets the short allow-headers list
/// * `origin` - The request's `Origin`, echoed back verbatim
pub fn set_cors_headers(headers: &mut HeaderMap, method: &Method, origin: &HeaderValue) {
    let allow_headers = if *method == Method::OPTIONS { CORS_ALLOW_HEADERS_PREFLIGHT } else { CORS_ALLOW_HEADERS };
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(allow_headers));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    headers.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("POST, GET"));
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
}

pub fn strip_fingerprint_headers(headers: &mut HeaderMap) {
    for name in FINGERPRINT_HEADERS {
        headers.remove(*name);
    }
}

/// Runs every non-CORS header writer in order; a later writer overrides an earlier one.
///
/// # Arguments
///
/// * `headers` - Response headers to modify
/// * `path` - The request path, used for MIME, cache and ETag decisions
/// * `tables` - Lookup tables for the policy
///
/// # Returns
///
/// An internal error if a table value cannot be encoded as a header value.
pub fn apply_headers(headers: &mut HeaderMap, path: &str, tables: &HeaderTables) -> PipelineResult<()> {
    set_security_headers(headers);
    set_content_type(headers, path, tables)?;
    set_cache_control(headers, path, tables);
    set_etag(headers, path)?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct HeaderPolicy {
    tables: HeaderTables,
}

impl HeaderPolicy {
    pub fn new(tables: HeaderTables) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &HeaderTables {
        &self.tables
    }

    /// Applies the response phase of the policy.
    ///
    /// # Arguments
    ///
    /// * `headers` - Headers of the finished response
    /// * `method` - The request method
    /// * `path` - The request path
    /// * `origin` - The request's `Origin`, already checked against the allow-list
    ///
    /// # Returns
    ///
    /// `Ok(())` on success. An error here becomes a `500` for the client.
    pub fn finish(
        &self,
        headers: &mut HeaderMap,
        method: &Method,
        path: &str,
        origin: Option<&HeaderValue>,
    ) -> PipelineResult<()> {
        if let Some(origin) = origin {
            set_cors_headers(headers, method, origin);
        }
        if !path.starts_with(&self.tables.internal_asset_prefix) {
            apply_headers(headers, path, &self.tables)?;
        }
        strip_fingerprint_headers(headers);
        Ok(())
    }
}

#[async_trait]
impl Stage for HeaderPolicy {
    fn name(&self) -> &'static str {
        "header_policy"
    }

    async fn handle(&self, req: Request, next: Next) -> Response {
        let origin = req.headers().get(header::ORIGIN).cloned();
        if let Some(o) = origin.as_ref() {
            let allowed = o.to_str().map(|s| self.tables.is_origin_allowed(s)).unwrap_or(false);
            if !allowed {
                tracing::warn!(origin = ?o, path = %req.uri().path(), "Rejected request from disallowed origin");
                return PipelineError::OriginRejected.into_response();
            }
        }

        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let mut res = next.run(req).await;

        match self.finish(res.headers_mut(), &method, &path, origin.as_ref()) {
            Ok(()) => res,
            Err(e) => e.into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> HeaderPolicy {
        HeaderPolicy::default()
    }

    #[test]
    fn test_path_extension() {
        assert_eq!(path_extension("/static/app.JS").as_deref(), Some(".js"));
        assert_eq!(path_extension("/a.b/c").as_deref(), None);
        assert_eq!(path_extension("/").as_deref(), None);
        assert_eq!(path_extension("/site.webmanifest").as_deref(), Some(".webmanifest"));
    }

    #[test]
    fn test_security_headers_applied() {
        let mut headers = HeaderMap::new();
        policy().finish(&mut headers, &Method::GET, "/page", None).unwrap();
        assert_eq!(headers["x-frame-options"], "SAMEORIGIN");
        assert_eq!(headers["strict-transport-security"], "max-age=63072000; includeSubDomains; preload");
        assert_eq!(headers["x-content-type-options"], "nosniff");
        let csp = headers["content-security-policy"].to_str().unwrap();
        assert!(csp.starts_with("default-src 'self'; "));
        assert!(csp.contains("; connect-src 'self' https://api.openai.com; "));
        assert!(csp.ends_with("manifest-src 'self';"));
        assert!(!headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[test]
    fn test_content_type_inferred_only_when_missing() {
        let tables = HeaderTables::default();
        let mut headers = HeaderMap::new();
        set_content_type(&mut headers, "/styles/site.css", &tables).unwrap();
        assert_eq!(headers[header::CONTENT_TYPE], "text/css; charset=utf-8");

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        set_content_type(&mut headers, "/styles/site.css", &tables).unwrap();
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");

        let mut headers = HeaderMap::new();
        set_content_type(&mut headers, "/archive.tar", &tables).unwrap();
        assert!(!headers.contains_key(header::CONTENT_TYPE));
    }

    #[test]
    fn test_cache_control() {
        let tables = HeaderTables::default();
        let mut headers = HeaderMap::new();
        set_cache_control(&mut headers, "/api/users", &tables);
        assert_eq!(headers[header::CACHE_CONTROL], "no-store, max-age=0");
        assert_eq!(headers[header::PRAGMA], "no-cache");
        assert_eq!(headers[header::EXPIRES], "0");

        let mut headers = HeaderMap::new();
        set_cache_control(&mut headers, "/logo.png", &tables);
        assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=31536000, immutable");

        let mut headers = HeaderMap::new();
        set_cache_control(&mut headers, "/apiary", &tables);
        set_cache_control(&mut headers, "/page", &tables);
        assert!(!headers.contains_key(header::CACHE_CONTROL));
    }

    #[test]
    fn test_etag_hashes_path() {
        let mut a = HeaderMap::new();
        let mut b = HeaderMap::new();
        let mut c = HeaderMap::new();
        set_etag(&mut a, "/app.js").unwrap();
        set_etag(&mut b, "/app.js").unwrap();
        set_etag(&mut c, "/other.css").unwrap();
        assert_eq!(a[header::ETAG], b[header::ETAG]);
        assert_ne!(a[header::ETAG], c[header::ETAG]);
        let tag = a[header::ETAG].to_str().unwrap();
        assert!(tag.starts_with('"') && tag.ends_with('"'));
        assert_eq!(tag.len(), 34);

        let mut none = HeaderMap::new();
        set_etag(&mut none, "/logo.png").unwrap();
        assert!(!none.contains_key(header::ETAG));
    }

    #[test]
    fn test_cors_allow_headers_depend_on_method() {
        let origin = HeaderValue::from_static("http://localhost:8000");
        let mut preflight = HeaderMap::new();
        set_cors_headers(&mut preflight, &Method::OPTIONS, &origin);
        assert_eq!(preflight[header::ACCESS_CONTROL_ALLOW_HEADERS], "Content-Type, Authorization");

        let mut post = HeaderMap::new();
        set_cors_headers(&mut post, &Method::POST, &origin);
        assert!(post[header::ACCESS_CONTROL_ALLOW_HEADERS].to_str().unwrap().contains("X-CSRF-Token"));
        assert_eq!(post[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://localhost:8000");
        assert_eq!(post[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(post[header::ACCESS_CONTROL_ALLOW_METHODS], "POST, GET");
        assert_eq!(post[header::ACCESS_CONTROL_MAX_AGE], "86400");
    }

    #[test]
    fn test_internal_assets_get_cors_only() {
        let origin = HeaderValue::from_static("http://localhost");
        let mut headers = HeaderMap::new();
        headers.insert("x-powered-by", HeaderValue::from_static("framework/1.0"));
        policy().finish(&mut headers, &Method::GET, "/_internal/chunk.js", Some(&origin)).unwrap();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://localhost");
        assert!(!headers.contains_key("x-frame-options"));
        assert!(!headers.contains_key(header::ETAG));
        assert!(!headers.contains_key("x-powered-by"));
    }

    #[test]
    fn test_alternate_tables() {
        let mut tables = HeaderTables::default();
        tables.allowed_origins = ["https://app.example".to_string()].into_iter().collect();
        tables.content_types.insert(".wasm".to_string(), "application/wasm".to_string());
        let policy = HeaderPolicy::new(tables);
        assert!(policy.tables().is_origin_allowed("https://app.example"));
        assert!(!policy.tables().is_origin_allowed("http://localhost"));

        let mut headers = HeaderMap::new();
        policy.finish(&mut headers, &Method::GET, "/pkg/app.wasm", None).unwrap();
        assert_eq!(headers[header::CONTENT_TYPE], "application/wasm");
    }

    #[tokio::test]
    async fn test_unencodable_table_value_becomes_generic_500() {
        use crate::pipeline::Pipeline;
        use axum::{body::Body, http::StatusCode, routing::get, Router};
        use http_body_util::BodyExt;
        use tower::ServiceExt;

        let mut tables = HeaderTables::default();
        tables.content_types.insert(".css".to_string(), "text/css\nx-injected: 1".to_string());
        // The handler leaves Content-Type unset so the table value is used.
        let router = Router::new().route("/site.css", get(|| async { Response::new(Body::from("body{}")) }));
        let app = Pipeline::new().stage(HeaderPolicy::new(tables)).wrap(router);

        let res = app
            .oneshot(Request::builder().uri("/site.css").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(res.headers().get("x-injected").is_none());

        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(body["error"]["message"], "An internal server error occurred");
        let text = String::from_utf8_lossy(&bytes);
        assert!(!text.contains("content type"));
        assert!(!text.contains("text/css"));
    }
}
