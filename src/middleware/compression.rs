//! Response compression negotiation.
//!
//! Works on the finished response: the body is collected in full, compressed with the
//! best coding the client accepts, and swapped in. Brotli wins over gzip and only one
//! coding is ever applied. Brotli is gated by a minimum body size; gzip is not.
//! A codec failure never fails the request, the original bytes go out instead.
//! Empty bodies, `HEAD` requests and `204` / `304` responses are left alone.
//!
//! Encoding runs on the blocking pool, so the request task yields while the codec works
//! and an enclosing deadline can still fire.

use async_compression::{
    tokio::bufread::{BrotliEncoder, GzipEncoder},
    Level,
};
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body, Bytes},
    extract::Request,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::io::AsyncReadExt;

use crate::error::PipelineError;
use crate::pipeline::Stage;

pub const MIN_SIZE: usize = 1024;
/// Brotli quality for response bodies.
pub const BROTLI_QUALITY: i32 = 4;

const COMPRESSIBLE_TYPES: &[&str] = &[
    "text/",
    "application/json",
    "application/xml",
    "application/javascript",
    "application/xhtml+xml",
    "image/svg+xml",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Brotli,
    Gzip,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Brotli => "br",
            Encoding::Gzip => "gzip",
        }
    }
}

/// Checks whether a response is a compression candidate, judged from its headers.
///
/// # Arguments
///
/// * `headers` - The response headers
///
/// # Returns
///
/// `false` if the response is already encoded, has no `Content-Type`, is an event
/// stream, or carries a type outside the compressible list.
pub fn is_compressible(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::CONTENT_ENCODING) {
        return false;
    }
    let Some(content_type) = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let content_type = content_type.trim().to_ascii_lowercase();
    if content_type.starts_with("text/event-stream") {
        return false;
    }
    COMPRESSIBLE_TYPES.iter().any(|t| content_type.starts_with(t))
}

/// Picks the response coding from the client's `Accept-Encoding`.
///
/// # Arguments
///
/// * `request_headers` - The request headers; all `Accept-Encoding` values are read
///
/// # Returns
///
/// `Some(Encoding::Brotli)` when `br` is accepted, else `Some(Encoding::Gzip)` when
/// `gzip` is accepted, else `None`. A coding listed with `q=0` is refused.
pub fn negotiate(request_headers: &HeaderMap) -> Option<Encoding> {
    let mut br = false;
    let mut gzip = false;
    for value in request_headers.get_all(header::ACCEPT_ENCODING).iter().filter_map(|v| v.to_str().ok()) {
        for item in value.split(',') {
            let mut parts = item.split(';');
            let coding = parts.next().unwrap_or("").trim().to_ascii_lowercase();
            let refused = parts.any(|p| {
                let p = p.trim();
                p.strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .map(|q| q <= 0.0)
                    .unwrap_or(false)
            });
            if refused {
                continue;
            }
            match coding.as_str() {
                "br" => br = true,
                "gzip" => gzip = true,
                _ => {}
            }
        }
    }
    if br {
        Some(Encoding::Brotli)
    } else if gzip {
        Some(Encoding::Gzip)
    } else {
        None
    }
}

/// Compresses a whole body off the async worker threads.
///
/// # Arguments
///
/// * `encoding` - Coding to apply; brotli runs at [`BROTLI_QUALITY`]
/// * `input` - The uncompressed body
///
/// # Returns
///
/// The encoded bytes, or an I/O error if the codec or the blocking task fails.
pub async fn compress(encoding: Encoding, input: Bytes) -> std::io::Result<Vec<u8>> {
    let handle = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || handle.block_on(encode(encoding, &input)))
        .await
        .map_err(std::io::Error::other)?
}

async fn encode(encoding: Encoding, input: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() / 2);
    match encoding {
        Encoding::Brotli => {
            BrotliEncoder::with_quality(input, Level::Precise(BROTLI_QUALITY))
                .read_to_end(&mut out)
                .await?;
        }
        Encoding::Gzip => {
            GzipEncoder::new(input).read_to_end(&mut out).await?;
        }
    }
    Ok(out)
}

fn merge_vary(headers: &mut HeaderMap) {
    let already = headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| {
            let v = v.trim();
            v == "*" || v.eq_ignore_ascii_case("accept-encoding")
        });
    if !already {
        headers.append(header::VARY, HeaderValue::from_static("accept-encoding"));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompressionNegotiator {
    min_size: usize,
}

impl Default for CompressionNegotiator {
    fn default() -> Self {
        Self::new(MIN_SIZE)
    }
}

impl CompressionNegotiator {
    pub fn new(min_size: usize) -> Self {
        Self { min_size }
    }

    /// Rewrites `res` for the coding the client asked for, when it qualifies.
    pub async fn negotiate_response(&self, encoding: Option<Encoding>, res: Response) -> Response {
        let Some(encoding) = encoding else {
            return res;
        };
        if matches!(res.status(), StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED)
            || !is_compressible(res.headers())
        {
            return res;
        }

        let (mut parts, body) = res.into_parts();
        let bytes: Bytes = match to_bytes(body, usize::MAX).await {
            Ok(b) => b,
            Err(e) => {
                return PipelineError::Internal(anyhow::anyhow!("failed to collect response body: {}", e))
                    .into_response();
            }
        };

        if bytes.is_empty() {
            return Response::from_parts(parts, Body::from(bytes));
        }
        if encoding == Encoding::Brotli && bytes.len() <= self.min_size {
            tracing::debug!(size = bytes.len(), min = self.min_size, "Body below brotli threshold");
            return Response::from_parts(parts, Body::from(bytes));
        }

        let compressed = match compress(encoding, bytes.clone()).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(encoding = encoding.as_str(), "Compression failed, sending identity: {}", e);
                return Response::from_parts(parts, Body::from(bytes));
            }
        };

        tracing::debug!(
            encoding = encoding.as_str(),
            original = bytes.len(),
            compressed = compressed.len(),
            "Compressed response"
        );
        parts.headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoding.as_str()));
        parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(compressed.len()));
        merge_vary(&mut parts.headers);
        Response::from_parts(parts, Body::from(compressed))
    }
}

#[async_trait]
impl Stage for CompressionNegotiator {
    fn name(&self) -> &'static str {
        "compression"
    }

    async fn handle(&self, req: Request, next: Next) -> Response {
        let encoding = if *req.method() == Method::HEAD { None } else { negotiate(req.headers()) };
        let res = next.run(req).await;
        self.negotiate_response(encoding, res).await
    }
}
