//! Cross-Site Request Forgery (CSRF) protection middleware.
//!
//! Double-submit cookie pattern with self-describing tokens. A token looks like
//! `<payload>.<issued-at unix millis>`; nothing is stored server-side. An unsafe request
//! outside the exempt prefix must carry the same token in the CSRF cookie and in the
//! CSRF header, and the cookie copy must be younger than the max age. Every request that
//! passes gets a fresh token on the way out, both as a cookie and as a response header.

use async_trait::async_trait;
use axum::{
    extract::Request,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::config::CsrfConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::Stage;

pub const CSRF_COOKIE_NAME: &str = "csrf_token";
pub const CSRF_HEADER: &str = "x-csrf-token";
pub const MAX_AGE_SECS: u64 = 3600;
/// Random bytes per token, and characters of encoded payload kept.
pub const TOKEN_LENGTH: usize = 32;

#[derive(Debug, Clone)]
pub struct CsrfSettings {
    pub cookie_name: String,
    pub header_name: HeaderName,
    pub max_age_secs: u64,
    /// Paths under this prefix are never checked.
    pub exempt_prefix: String,
}

impl Default for CsrfSettings {
    fn default() -> Self {
        Self {
            cookie_name: CSRF_COOKIE_NAME.to_string(),
            header_name: HeaderName::from_static(CSRF_HEADER),
            max_age_secs: MAX_AGE_SECS,
            exempt_prefix: "/api/".to_string(),
        }
    }
}

impl CsrfSettings {
    /// Decides whether a request must present matching CSRF tokens.
    ///
    /// # Arguments
    ///
    /// * `method` - The request method; `GET`, `HEAD` and `OPTIONS` never need a token
    /// * `path` - The request path, compared against the exempt prefix
    ///
    /// # Returns
    ///
    /// `true` if the request goes through validation. An empty exempt prefix exempts nothing.
    pub fn requires_validation(&self, method: &Method, path: &str) -> bool {
        if is_safe_method(method) {
            return false;
        }
        self.exempt_prefix.is_empty() || !path.starts_with(&self.exempt_prefix)
    }
}

pub fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// An opaque CSRF token, `<payload>.<issued-at millis>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfToken(String);

impl CsrfToken {
    /// Mints a token from the OS random source.
    pub fn generate(now_ms: i64) -> PipelineResult<Self> {
        Self::generate_with(&mut OsRng, now_ms)
    }

    pub fn generate_with<R: RngCore>(rng: &mut R, now_ms: i64) -> PipelineResult<Self> {
        let mut seed = [0u8; TOKEN_LENGTH];
        rng.try_fill_bytes(&mut seed)
            .map_err(|e| anyhow::anyhow!("failed to generate CSRF token: {}", e))?;
        let digest = Sha256::digest(seed);
        let mut payload = URL_SAFE_NO_PAD.encode(digest);
        payload.truncate(TOKEN_LENGTH);
        Ok(Self(format!("{}.{}", payload, now_ms)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn issued_at_ms(&self) -> Option<i64> {
        token_timestamp(&self.0)
    }
}

impl std::fmt::Display for CsrfToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn token_timestamp(token: &str) -> Option<i64> {
    let (_, ts) = token.rsplit_once('.')?;
    ts.parse::<i64>().ok()
}

/// Compares two byte strings without an early exit on the first differing byte.
///
/// # Arguments
///
/// * `a` - First input
/// * `b` - Second input
///
/// # Returns
///
/// `true` if both inputs are identical. The running time depends only on the lengths.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Validates a double-submitted CSRF token pair.
///
/// The steps run in order and the first failure wins: both copies present and
/// non-empty, cookie copy younger than `max_age_secs`, then constant-time equality.
/// A cookie token whose timestamp does not parse counts as expired.
///
/// # Arguments
///
/// * `cookie_token` - Token read from the CSRF cookie
/// * `header_token` - Token read from the CSRF request header
/// * `now_ms` - Current wall-clock time in unix milliseconds
/// * `max_age_secs` - Maximum accepted token age
///
/// # Returns
///
/// `Ok(())` if the pair is valid, otherwise `CsrfMissing`, `CsrfExpired` or
/// `CsrfMismatch`, all of which render as `403 Forbidden`.
pub fn validate_tokens(
    cookie_token: Option<&str>,
    header_token: Option<&str>,
    now_ms: i64,
    max_age_secs: u64,
) -> PipelineResult<()> {
    let (cookie_token, header_token) = match (cookie_token, header_token) {
        (Some(c), Some(h)) if !c.is_empty() && !h.is_empty() => (c, h),
        _ => return Err(PipelineError::CsrfMissing),
    };

    let Some(issued_at) = token_timestamp(cookie_token) else {
        return Err(PipelineError::CsrfExpired);
    };
    let max_age_ms = i64::try_from(max_age_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
    if now_ms.saturating_sub(issued_at) > max_age_ms {
        return Err(PipelineError::CsrfExpired);
    }

    if !constant_time_eq(cookie_token.as_bytes(), header_token.as_bytes()) {
        return Err(PipelineError::CsrfMismatch);
    }
    Ok(())
}

/// Reads a cookie from the request headers.
///
/// # Arguments
///
/// * `headers` - The request headers; every `Cookie` header is searched
/// * `name` - Cookie name to look for
///
/// # Returns
///
/// The first value found, with surrounding quotes removed, or `None`.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k.trim() == name).then(|| v.trim().trim_matches('"').to_string())
        })
}

type Mint = fn(i64) -> PipelineResult<CsrfToken>;

#[derive(Debug, Clone)]
pub struct CsrfGuard {
    settings: CsrfSettings,
    mint: Mint,
}

impl Default for CsrfGuard {
    fn default() -> Self {
        Self::new(CsrfSettings::default())
    }
}

impl CsrfGuard {
    pub fn new(settings: CsrfSettings) -> Self {
        Self { settings, mint: CsrfToken::generate }
    }

    /// Swaps the token source.
    #[cfg(test)]
    pub(crate) fn with_mint(mut self, mint: Mint) -> Self {
        self.mint = mint;
        self
    }

    pub fn from_config(cfg: &CsrfConfig) -> Self {
        let header_name = HeaderName::from_bytes(cfg.header_name.as_bytes()).unwrap_or_else(|e| {
            tracing::warn!("Invalid csrf.header_name {:?} ({}), using {}", cfg.header_name, e, CSRF_HEADER);
            HeaderName::from_static(CSRF_HEADER)
        });
        Self::new(CsrfSettings {
            cookie_name: cfg.cookie_name.clone(),
            header_name,
            max_age_secs: cfg.max_age_secs,
            exempt_prefix: cfg.exempt_prefix.clone(),
        })
    }

    pub fn settings(&self) -> &CsrfSettings {
        &self.settings
    }

    /// Mints a new token stamped with the current time.
    pub fn issue(&self) -> PipelineResult<CsrfToken> {
        (self.mint)(now_millis())
    }

    pub fn set_cookie_value(&self, token: &CsrfToken) -> String {
        format!(
            "{}={}; Max-Age={}; Path=/; HttpOnly; Secure; SameSite=Strict",
            self.settings.cookie_name, token, self.settings.max_age_secs
        )
    }

    /// Hands `token` to the client.
    ///
    /// # Arguments
    ///
    /// * `headers` - Response headers; existing `Set-Cookie` values are kept
    /// * `token` - The token to send
    ///
    /// # Returns
    ///
    /// `Ok(())` once the cookie is appended and the CSRF header is set, or an internal
    /// error if either value cannot be encoded as a header.
    pub fn attach(&self, headers: &mut HeaderMap, token: &CsrfToken) -> PipelineResult<()> {
        let cookie = HeaderValue::from_str(&self.set_cookie_value(token))
            .map_err(|e| anyhow::anyhow!("invalid CSRF cookie value: {}", e))?;
        let mirrored = HeaderValue::from_str(token.as_str())
            .map_err(|e| anyhow::anyhow!("invalid CSRF header value: {}", e))?;
        headers.append(header::SET_COOKIE, cookie);
        headers.insert(self.settings.header_name.clone(), mirrored);
        Ok(())
    }

    fn check(&self, headers: &HeaderMap) -> PipelineResult<()> {
        let cookie_token = read_cookie(headers, &self.settings.cookie_name);
        let header_token = headers.get(&self.settings.header_name).and_then(|v| v.to_str().ok());
        validate_tokens(cookie_token.as_deref(), header_token, now_millis(), self.settings.max_age_secs)
    }

    fn rotate(&self, res: &mut Response) -> PipelineResult<()> {
        let token = self.issue()?;
        self.attach(res.headers_mut(), &token)
    }
}

#[async_trait]
impl Stage for CsrfGuard {
    fn name(&self) -> &'static str {
        "csrf"
    }

    async fn handle(&self, req: Request, next: Next) -> Response {
        if !self.settings.requires_validation(req.method(), req.uri().path()) {
            return next.run(req).await;
        }

        if let Err(rejection) = self.check(req.headers()) {
            tracing::warn!(
                method = %req.method(),
                path = %req.uri().path(),
                "CSRF validation failed: {}",
                rejection
            );
            return rejection.into_response();
        }

        let mut res = next.run(req).await;
        match self.rotate(&mut res) {
            Ok(()) => res,
            Err(e) => e.into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: i64 = 3_600_000;

    /// Random source that always fails.
    struct BrokenRng;

    impl RngCore for BrokenRng {
        fn next_u32(&mut self) -> u32 {
            0
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, _dest: &mut [u8]) {}
        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> {
            Err(rand::Error::new(std::io::Error::new(std::io::ErrorKind::Other, "no entropy")))
        }
    }

    #[test]
    fn test_generated_token_shape() {
        let now = 1_700_000_000_000;
        let token = CsrfToken::generate(now).unwrap();
        let (payload, ts) = token.as_str().rsplit_once('.').unwrap();
        assert_eq!(payload.len(), TOKEN_LENGTH);
        assert!(payload.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(ts, now.to_string());
        assert_eq!(token.issued_at_ms(), Some(now));
    }

    #[test]
    fn test_generated_tokens_differ() {
        let a = CsrfToken::generate(0).unwrap();
        let b = CsrfToken::generate(0).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fresh_token_validates_immediately() {
        for _ in 0..16 {
            let now = now_millis();
            let token = CsrfToken::generate(now).unwrap();
            assert!(validate_tokens(Some(token.as_str()), Some(token.as_str()), now, MAX_AGE_SECS).is_ok());
        }
    }

    #[test]
    fn test_missing_tokens() {
        let t = "abcDEF123.1000";
        assert!(matches!(validate_tokens(None, Some(t), 1000, MAX_AGE_SECS), Err(PipelineError::CsrfMissing)));
        assert!(matches!(validate_tokens(Some(t), None, 1000, MAX_AGE_SECS), Err(PipelineError::CsrfMissing)));
        assert!(matches!(validate_tokens(Some(""), Some(t), 1000, MAX_AGE_SECS), Err(PipelineError::CsrfMissing)));
        assert!(matches!(validate_tokens(None, None, 1000, MAX_AGE_SECS), Err(PipelineError::CsrfMissing)));
    }

    #[test]
    fn test_expired_regardless_of_equality() {
        let now = 10 * HOUR_MS;
        let old = format!("abcDEF123.{}", now - HOUR_MS - 1);
        assert!(matches!(
            validate_tokens(Some(&old), Some(&old), now, MAX_AGE_SECS),
            Err(PipelineError::CsrfExpired)
        ));
        assert!(matches!(
            validate_tokens(Some(&old), Some("different"), now, MAX_AGE_SECS),
            Err(PipelineError::CsrfExpired)
        ));
        // Exactly at the limit is still valid
        let edge = format!("abcDEF123.{}", now - HOUR_MS);
        assert!(validate_tokens(Some(&edge), Some(&edge), now, MAX_AGE_SECS).is_ok());
    }

    #[test]
    fn test_unreadable_timestamp_counts_as_expired() {
        for bad in ["abcDEF123", "abcDEF123.", "abcDEF123.soon"] {
            assert!(matches!(
                validate_tokens(Some(bad), Some(bad), 0, MAX_AGE_SECS),
                Err(PipelineError::CsrfExpired)
            ));
        }
    }

    #[test]
    fn test_mismatch() {
        let now = 5_000;
        let cookie = format!("abcDEF123.{}", now);
        let same_len = format!("abcDEF124.{}", now);
        let longer = format!("abcDEF1234.{}", now);
        assert!(matches!(
            validate_tokens(Some(&cookie), Some(&same_len), now, MAX_AGE_SECS),
            Err(PipelineError::CsrfMismatch)
        ));
        assert!(matches!(
            validate_tokens(Some(&cookie), Some(&longer), now, MAX_AGE_SECS),
            Err(PipelineError::CsrfMismatch)
        ));
    }

    #[test]
    fn test_constant_time_eq_equivalence_classes() {
        assert!(constant_time_eq(b"", b""));
        assert!(constant_time_eq(b"same-token", b"same-token"));
        // Differ at first, middle and last byte
        assert!(!constant_time_eq(b"Xame-token", b"same-token"));
        assert!(!constant_time_eq(b"same_token", b"same-token"));
        assert!(!constant_time_eq(b"same-tokeX", b"same-token"));
        // Unequal length, including a prefix
        assert!(!constant_time_eq(b"same", b"same-token"));
        assert!(!constant_time_eq(b"same-token-longer", b"same-token"));
    }

    #[test]
    fn test_safe_methods_and_api_paths_skip() {
        let settings = CsrfSettings::default();
        for m in [Method::GET, Method::HEAD, Method::OPTIONS] {
            assert!(!settings.requires_validation(&m, "/submit"));
        }
        for m in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            assert!(settings.requires_validation(&m, "/submit"));
            assert!(!settings.requires_validation(&m, "/api/items"));
        }
        // "/api" itself is not under the exempt prefix
        assert!(settings.requires_validation(&Method::POST, "/api"));
    }

    #[test]
    fn test_read_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("theme=dark; csrf_token=abc.123"));
        headers.append(header::COOKIE, HeaderValue::from_static("csrf_token=later.456"));
        assert_eq!(read_cookie(&headers, "csrf_token").as_deref(), Some("abc.123"));
        assert_eq!(read_cookie(&headers, "theme").as_deref(), Some("dark"));
        assert!(read_cookie(&headers, "session").is_none());
    }

    #[test]
    fn test_random_source_failure_is_internal() {
        let err = CsrfToken::generate_with(&mut BrokenRng, 0).unwrap_err();
        assert!(matches!(err, PipelineError::Internal(_)));
    }

    #[test]
    fn test_attach_sets_cookie_and_header() {
        let guard = CsrfGuard::default();
        let token = CsrfToken("payload.42".to_string());
        let mut headers = HeaderMap::new();
        headers.append(header::SET_COOKIE, HeaderValue::from_static("session=keep"));
        guard.attach(&mut headers, &token).unwrap();

        let cookies: Vec<_> = headers.get_all(header::SET_COOKIE).iter().map(|v| v.to_str().unwrap()).collect();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[1], "csrf_token=payload.42; Max-Age=3600; Path=/; HttpOnly; Secure; SameSite=Strict");
        assert_eq!(headers.get(CSRF_HEADER).unwrap(), "payload.42");
    }

    fn failing_mint(now_ms: i64) -> PipelineResult<CsrfToken> {
        CsrfToken::generate_with(&mut BrokenRng, now_ms)
    }

    #[tokio::test]
    async fn test_rotation_failure_becomes_generic_500() {
        use crate::pipeline::Pipeline;
        use axum::{body::Body, http::StatusCode, routing::post, Router};
        use http_body_util::BodyExt;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use tower::ServiceExt;

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/submit",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    "saved"
                }
            }),
        );
        let guard = CsrfGuard::default().with_mint(failing_mint);
        let app = Pipeline::new().stage(guard).wrap(router);

        let token = CsrfToken::generate(now_millis()).unwrap();
        let req = Request::builder()
            .method("POST")
            .uri("/submit")
            .header(header::COOKIE, format!("{}={}", CSRF_COOKIE_NAME, token))
            .header(CSRF_HEADER, token.as_str())
            .body(Body::empty())
            .unwrap();
        let res = app.oneshot(req).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(res.headers().get(header::SET_COOKIE).is_none());
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["message"], "An internal server error occurred");
        assert!(!String::from_utf8_lossy(&bytes).contains("entropy"));
    }

    #[test]
    fn test_empty_exempt_prefix_exempts_nothing() {
        let settings = CsrfSettings { exempt_prefix: String::new(), ..CsrfSettings::default() };
        assert!(settings.requires_validation(&Method::POST, "/submit"));
        assert!(settings.requires_validation(&Method::POST, "/api/items"));
        assert!(!settings.requires_validation(&Method::GET, "/submit"));
    }
}
