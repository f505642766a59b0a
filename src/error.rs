//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - [`AppError`]: failures of HTTP handlers, converted into JSON HTTP responses
//!   through actix's `ResponseError` trait.
//! - [`UpstreamError`]: failures of the generative-language call. These are
//!   always recoverable; the session coordinator turns them into an `error`
//!   envelope for the client and the channel stays usable.
//!
//! ## JSON Response Format (AppError):
//! ```json
//! {
//!   "error": {
//!     "type": "service_unavailable",
//!     "message": "Maximum concurrent sessions (100) reached",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **ServiceUnavailable**: Capacity exhausted, try again later (503 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Maps each error to an HTTP status code and a consistent JSON body.
///
/// - Internal → 500
/// - ServiceUnavailable → 503
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            AppError::Internal(_) => actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ServiceUnavailable(_) => actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::ServiceUnavailable(msg) => ("service_unavailable", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failure of one generative-language call.
///
/// Every variant renders a human-readable message that is safe to show the
/// end user; it is sent verbatim as the `message` of an `error` envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamError {
    /// No API key was configured
    MissingCredentials,
    /// The API answered with a non-2xx status
    Status(u16),
    /// The request did not complete within the configured timeout
    Timeout,
    /// Connection, TLS or transport failure
    Network(String),
    /// 2xx response without `candidates[0].content` text
    EmptyResponse,
    /// 2xx response whose body is not the expected JSON shape
    MalformedResponse(String),
    /// The call itself failed unexpectedly (for example a panic in the adapter)
    Internal(String),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::MissingCredentials => write!(f, "Gemini API key is not configured"),
            UpstreamError::Status(code) => write!(f, "Gemini API error: {}", code),
            UpstreamError::Timeout => write!(f, "Gemini API request timed out"),
            UpstreamError::Network(msg) => write!(f, "Failed to reach Gemini API: {}", msg),
            UpstreamError::EmptyResponse => write!(f, "No response from Gemini API"),
            UpstreamError::MalformedResponse(msg) => {
                write!(f, "Unexpected response from Gemini API: {}", msg)
            }
            UpstreamError::Internal(msg) => {
                write!(f, "Failed to process audio with Gemini API: {}", msg)
            }
        }
    }
}

impl std::error::Error for UpstreamError {}

/// The request URL carries the API key as a query parameter, so it is
/// stripped before the error is rendered.
impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        let err = err.without_url();
        if err.is_timeout() {
            UpstreamError::Timeout
        } else if err.is_decode() {
            UpstreamError::MalformedResponse(err.to_string())
        } else if let Some(status) = err.status() {
            UpstreamError::Status(status.as_u16())
        } else {
            UpstreamError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::Internal("x".into()).status_code().as_u16(), 500);
        assert_eq!(AppError::ServiceUnavailable("x".into()).status_code().as_u16(), 503);
    }

    #[actix_web::test]
    async fn test_error_response_body() {
        let response = AppError::ServiceUnavailable("Maximum concurrent sessions (1) reached".into())
            .error_response();
        assert_eq!(response.status().as_u16(), 503);

        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "service_unavailable");
        assert_eq!(value["error"]["message"], "Maximum concurrent sessions (1) reached");
    }

    #[test]
    fn test_upstream_messages_are_never_empty() {
        let errors = [
            UpstreamError::MissingCredentials,
            UpstreamError::Status(503),
            UpstreamError::Timeout,
            UpstreamError::Network("connection refused".into()),
            UpstreamError::EmptyResponse,
            UpstreamError::MalformedResponse("expected value".into()),
            UpstreamError::Internal("panicked".into()),
        ];
        for err in errors {
            assert!(!err.to_string().is_empty());
        }
        assert_eq!(UpstreamError::Status(429).to_string(), "Gemini API error: 429");
        assert_eq!(UpstreamError::EmptyResponse.to_string(), "No response from Gemini API");
    }
}
