use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Every way a pipeline stage can end a request early.
///
/// Client protocol violations carry a short, safe reason. Internal faults keep
/// their detail for the log only; the client sees a generic message and an
/// error id to correlate with the log line.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The request's `Origin` is not on the allow-list.
    #[error("Forbidden")]
    OriginRejected,
    /// Cookie token or header token absent.
    #[error("CSRF token missing")]
    CsrfMissing,
    /// Cookie token has no readable timestamp or is older than the max age.
    #[error("CSRF token expired")]
    CsrfExpired,
    /// Cookie token and header token differ.
    #[error("CSRF token validation failed")]
    CsrfMismatch,
    /// The downstream chain did not finish before the deadline.
    #[error("Request timed out")]
    Timeout,
    /// Anything unexpected inside a stage.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::OriginRejected
            | PipelineError::CsrfMissing
            | PipelineError::CsrfExpired
            | PipelineError::CsrfMismatch => StatusCode::FORBIDDEN,
            PipelineError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::OriginRejected => "ORIGIN_REJECTED",
            PipelineError::CsrfMissing => "CSRF_TOKEN_MISSING",
            PipelineError::CsrfExpired => "CSRF_TOKEN_EXPIRED",
            PipelineError::CsrfMismatch => "CSRF_TOKEN_MISMATCH",
            PipelineError::Timeout => "GATEWAY_TIMEOUT",
            PipelineError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let (message, details) = match self {
            PipelineError::Internal(e) => {
                let error_id = uuid::Uuid::new_v4();
                tracing::error!(%error_id, "Internal pipeline error: {:?}", e);
                (
                    "An internal server error occurred".to_string(),
                    Some(json!({ "error_id": error_id.to_string() })),
                )
            }
            other => (other.to_string(), None),
        };

        let mut body = json!({
            "error": {
                "code": code,
                "message": message,
            },
            "status": status.as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        if let Some(details) = details {
            body["error"]["details"] = details;
        }

        (status, Json(body)).into_response()
    }
}

/// A type alias for `Result<T, PipelineError>`, used by the stage internals.
pub type PipelineResult<T> = Result<T, PipelineError>;
