//! Error taxonomy and JSON error responses for the gateway

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

use crate::transport::ResponseBody;

/// Error codes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Origin and Referer failed the allow-list
    AccessDenied,
    /// Upstream is not accepting connections
    UpstreamUnavailable,
    /// Upstream did not answer within the method timeout
    UpstreamTimeout,
    /// Any other upstream transport failure
    UpstreamError,
    /// Deployment CLI reported a failure
    DeploymentFailure,
    /// Bad request body or configuration value
    ConfigurationError,
    /// Client exceeded its request window
    RateLimited,
    /// Method not served on this route
    MethodNotAllowed,
    /// Unknown route
    NotFound,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::AccessDenied => StatusCode::FORBIDDEN,
            ProxyErrorCode::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::UpstreamError => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::DeploymentFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::ConfigurationError => StatusCode::BAD_REQUEST,
            ProxyErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ProxyErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::AccessDenied => "ACCESS_DENIED",
            ProxyErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyErrorCode::UpstreamError => "UPSTREAM_ERROR",
            ProxyErrorCode::DeploymentFailure => "DEPLOYMENT_FAILURE",
            ProxyErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ProxyErrorCode::RateLimited => "RATE_LIMITED",
            ProxyErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ProxyErrorCode::NotFound => "NOT_FOUND",
        }
    }
}

/// Failures of the forwarding pipeline
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Access denied: origin not allowed")]
    AccessDenied,

    #[error("Upstream service is not available")]
    UpstreamUnavailable,

    #[error("Upstream timed out after {0} seconds")]
    UpstreamTimeout(u64),

    #[error("Upstream error: {0}")]
    UpstreamError(String),

    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(usize),
}

impl ProxyError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ProxyError::AccessDenied => ProxyErrorCode::AccessDenied,
            ProxyError::UpstreamUnavailable => ProxyErrorCode::UpstreamUnavailable,
            ProxyError::UpstreamTimeout(_) => ProxyErrorCode::UpstreamTimeout,
            ProxyError::UpstreamError(_) | ProxyError::TooManyRedirects(_) => {
                ProxyErrorCode::UpstreamError
            }
        }
    }

    /// Render this error as a JSON response
    pub fn into_response(self) -> Response<ResponseBody> {
        json_error_response(self.code(), self.to_string())
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Always "error"
    pub status: &'static str,
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: "error",
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"status":"error","code":"{}","message":"{}"}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<ResponseBody> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
