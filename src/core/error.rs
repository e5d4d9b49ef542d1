//! Unified error handling for the gateway
//!
//! Every rejection the gateway produces is a [`GatewayError`]. Each kind maps to
//! exactly one HTTP status and one machine readable code, and is rendered to
//! the caller as `{"error", "message", "request_id"}`.

use std::fmt;

use http::StatusCode;
use pingora_error::ErrorType;
use serde::Serialize;

/// Error kinds surfaced by the admission and routing core
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Missing or invalid credentials
    Authentication(String),

    /// Valid credentials lacking a required scope or role
    Authorization(String),

    /// Request exceeded its rate budget
    RateLimited {
        message: String,
        limit: u32,
        remaining: u32,
        /// Whole seconds until the next request may be admitted
        retry_after: u64,
    },

    /// No registry entry or local endpoint for the request
    Routing(String),

    /// Upstream transport failure
    Upstream(String),

    /// Upstream connect/read/write deadline exceeded
    Timeout(String),

    /// Circuit breaker for the target service is open
    CircuitOpen(String),

    /// Missing secret, unknown policy, unsupported algorithm
    Configuration(String),

    /// Malformed administrative input
    Validation(String),

    /// Known local path, unsupported method
    MethodNotAllowed(String),

    /// State store failures
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Authentication(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Authorization(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Routing(_) => StatusCode::NOT_FOUND,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Authentication(_) => "authentication_error",
            GatewayError::Authorization(_) => "authorization_error",
            GatewayError::RateLimited { .. } => "rate_limit_exceeded",
            GatewayError::Routing(_) => "routing_error",
            GatewayError::Upstream(_) => "upstream_error",
            GatewayError::Timeout(_) => "timeout_error",
            GatewayError::CircuitOpen(_) => "circuit_breaker_open",
            GatewayError::Configuration(_) => "configuration_error",
            GatewayError::Validation(_) => "validation_error",
            GatewayError::MethodNotAllowed(_) => "method_not_allowed",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            GatewayError::Authentication(msg)
            | GatewayError::Authorization(msg)
            | GatewayError::Routing(msg)
            | GatewayError::Upstream(msg)
            | GatewayError::Timeout(msg)
            | GatewayError::CircuitOpen(msg)
            | GatewayError::Configuration(msg)
            | GatewayError::Validation(msg)
            | GatewayError::MethodNotAllowed(msg)
            | GatewayError::Internal(msg) => msg,
            GatewayError::RateLimited { message, .. } => message,
        }
    }

    /// Structured body echoed to the caller.
    pub fn body<'a>(&'a self, request_id: &'a str) -> ErrorBody<'a> {
        ErrorBody {
            error: self.code(),
            message: self.message(),
            request_id,
        }
    }

    /// Upstream outcome accounting: only these count against a breaker.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(self, GatewayError::Upstream(_) | GatewayError::Timeout(_))
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub error: &'a str,
    pub message: &'a str,
    pub request_id: &'a str,
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Authentication(msg) => write!(f, "Authentication failed: {msg}"),
            GatewayError::Authorization(msg) => write!(f, "Authorization failed: {msg}"),
            GatewayError::RateLimited {
                message,
                retry_after,
                ..
            } => write!(f, "Rate limited: {message} (retry after {retry_after}s)"),
            GatewayError::Routing(msg) => write!(f, "Routing failed: {msg}"),
            GatewayError::Upstream(msg) => write!(f, "Upstream error: {msg}"),
            GatewayError::Timeout(msg) => write!(f, "Upstream timeout: {msg}"),
            GatewayError::CircuitOpen(msg) => write!(f, "Circuit open: {msg}"),
            GatewayError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            GatewayError::Validation(msg) => write!(f, "Validation error: {msg}"),
            GatewayError::MethodNotAllowed(msg) => write!(f, "Method not allowed: {msg}"),
            GatewayError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<GatewayError> for Box<pingora_error::Error> {
    fn from(err: GatewayError) -> Self {
        pingora_error::Error::explain(
            ErrorType::HTTPStatus(err.status().as_u16()),
            err.to_string(),
        )
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Validation(err.to_string())
    }
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_table() {
        let cases = [
            (GatewayError::Authentication("x".into()), 401),
            (GatewayError::Authorization("x".into()), 403),
            (
                GatewayError::RateLimited {
                    message: "x".into(),
                    limit: 1,
                    remaining: 0,
                    retry_after: 1,
                },
                429,
            ),
            (GatewayError::Routing("x".into()), 404),
            (GatewayError::Upstream("x".into()), 502),
            (GatewayError::Timeout("x".into()), 504),
            (GatewayError::CircuitOpen("x".into()), 503),
            (GatewayError::Configuration("x".into()), 500),
            (GatewayError::Validation("x".into()), 400),
        ];

        for (err, status) in cases {
            assert_eq!(status, err.status().as_u16(), "{err}");
        }
    }

    #[test]
    fn test_error_body() {
        let err = GatewayError::Authentication("Token has expired".into());
        let body = serde_json::to_value(err.body("req-1")).unwrap();
        assert_eq!(
            serde_json::json!({
                "error": "authentication_error",
                "message": "Token has expired",
                "request_id": "req-1",
            }),
            body
        );
    }

    #[test]
    fn test_into_pingora_error() {
        let err: Box<pingora_error::Error> = GatewayError::CircuitOpen("users".into()).into();
        assert_eq!(ErrorType::HTTPStatus(503), err.etype);
    }
}
