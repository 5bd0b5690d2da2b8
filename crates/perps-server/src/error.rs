use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use perps_core::{Metric, UnavailableReason};
use serde::Serialize;
use std::path::PathBuf;

// ============================================================================
// Provider errors - never leave the aggregator
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not available: {0}")]
    Unavailable(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else if e.is_decode() {
            ProviderError::Malformed(e.to_string())
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

impl From<&ProviderError> for UnavailableReason {
    fn from(e: &ProviderError) -> Self {
        match e {
            ProviderError::Timeout(_) => UnavailableReason::Timeout,
            ProviderError::Unavailable(_) => UnavailableReason::NotSupported,
            ProviderError::Malformed(_) => UnavailableReason::MalformedResponse,
            ProviderError::Http { .. }
            | ProviderError::Transport(_)
            | ProviderError::QueryFailed(_) => UnavailableReason::UpstreamError,
        }
    }
}

impl ProviderError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProviderError::Timeout(_))
    }

    pub fn to_metric<T>(&self) -> Metric<T> {
        Metric::unavailable_with(UnavailableReason::from(self), self.to_string())
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

// ============================================================================
// Cache store errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("No cache yet at {}", .0.display())]
    Missing(PathBuf),

    #[error("Corrupt cache: {0}")]
    Corrupt(String),

    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// HTTP-facing errors for the dashboard
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("No cached data available yet, waiting for the first refresh")]
    CacheMissing,

    #[error("Cached data is unreadable: {0}")]
    CacheCorrupt(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("External API error: {0}")]
    ExternalApi(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CacheError> for AppError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Missing(_) => AppError::CacheMissing,
            CacheError::Corrupt(msg) => AppError::CacheCorrupt(msg),
            CacheError::Io(e) => AppError::Internal(e.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::CacheMissing => {
                tracing::warn!(error_code = "CACHE_MISSING", "Cache artifact not written yet");
                (StatusCode::SERVICE_UNAVAILABLE, "CACHE_MISSING")
            }
            AppError::CacheCorrupt(msg) => {
                tracing::error!(message = %msg, error_code = "CACHE_CORRUPT", "Cache artifact unreadable");
                (StatusCode::SERVICE_UNAVAILABLE, "CACHE_CORRUPT")
            }
            AppError::NotFound(what) => {
                tracing::info!(what = %what, error_code = "NOT_FOUND", "Resource not found");
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            AppError::InvalidParam(param) => {
                tracing::warn!(param = %param, error_code = "INVALID_PARAM", "Invalid parameter");
                (StatusCode::BAD_REQUEST, "INVALID_PARAM")
            }
            AppError::ExternalApi(msg) => {
                tracing::error!(message = %msg, error_code = "EXTERNAL_API_ERROR", "External API error");
                (StatusCode::BAD_GATEWAY, "EXTERNAL_API_ERROR")
            }
            AppError::Internal(msg) => {
                tracing::error!(message = %msg, error_code = "INTERNAL_ERROR", "Internal error occurred");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };

        tracing::debug!(
            status_code = %status.as_u16(),
            error_code = %code,
            error_message = %self.to_string(),
            "Returning error response"
        );

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_errors_map_to_reasons() {
        let timeout = ProviderError::Timeout("dune execution 01H after 300s".into());
        assert_eq!(UnavailableReason::from(&timeout), UnavailableReason::Timeout);

        let http = ProviderError::Http { status: 502, body: "bad gateway".into() };
        assert_eq!(UnavailableReason::from(&http), UnavailableReason::UpstreamError);

        let metric: Metric<u64> = ProviderError::Malformed("missing rows".into()).to_metric();
        assert_eq!(metric.reason(), Some(UnavailableReason::MalformedResponse));
    }

    #[test]
    fn test_cache_errors_become_degraded_responses() {
        let response = AppError::from(CacheError::Missing(PathBuf::from("data/cache.json"))).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = AppError::from(CacheError::Corrupt("eof".into())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
