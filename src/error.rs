//! Error types for the Ratewarden gateway.

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::antibot::Rejection;

/// Main error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Invalid process configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule or runtime setting failed validation at admin-write time
    #[error("Invalid rule: {0}")]
    Validation(String),

    #[error("Rule not found: {0}")]
    RuleNotFound(Uuid),

    /// No active rule matches the request
    #[error("No route matches {0}")]
    NoRoute(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("Request queue is full")]
    QueueFull { retry_after_secs: u64 },

    /// Anti-bot check failed
    #[error("Request rejected: {}", .0.reason())]
    AntiBot(Rejection),

    /// Idempotency key was seen before
    #[error("Duplicate request")]
    DuplicateRequest,

    #[error("Payload too large")]
    PayloadTooLarge,

    /// Backend could not be reached
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    /// Queued request cancelled by shutdown
    #[error("Gateway is shutting down")]
    ShuttingDown,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// HTTP status this error is reported with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) | GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::RuleNotFound(_) | GatewayError::NoRoute(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimitExceeded { .. } | GatewayError::QueueFull { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::AntiBot(_) => StatusCode::FORBIDDEN,
            GatewayError::DuplicateRequest => StatusCode::CONFLICT,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Whether a rate limit or anti-bot check turned the request away, as
    /// opposed to routing, body or upstream failures.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimitExceeded { .. }
                | GatewayError::QueueFull { .. }
                | GatewayError::AntiBot(_)
                | GatewayError::DuplicateRequest
        )
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (status, Json(json!({ "error": self.to_string() }))).into_response();
        let headers = response.headers_mut();

        match &self {
            GatewayError::AntiBot(rejection) => {
                headers.insert(
                    HeaderName::from_static("x-rejection-reason"),
                    HeaderValue::from_static(rejection.reason()),
                );
            }
            GatewayError::DuplicateRequest => {
                headers.insert(
                    HeaderName::from_static("x-duplicate-request"),
                    HeaderValue::from_static("true"),
                );
            }
            GatewayError::RateLimitExceeded { retry_after_secs }
            | GatewayError::QueueFull { retry_after_secs } => {
                headers.insert(
                    HeaderName::from_static("x-ratelimit-queued"),
                    HeaderValue::from_static("false"),
                );
                headers.insert(
                    axum::http::header::RETRY_AFTER,
                    HeaderValue::from(*retry_after_secs),
                );
            }
            _ => {}
        }

        response
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
