//! Response building shared by gateway-local endpoints and rejections.
//!
//! Local handlers produce an `http::Response<Vec<u8>>`; the proxy service
//! converts it into a Pingora [`ResponseHeader`] plus body before writing.

use bytes::Bytes;
use http::{header, HeaderValue, Response, StatusCode};
use pingora_error::Result;
use pingora_http::ResponseHeader;
use pingora_proxy::Session;
use serde::Serialize;

use crate::core::GatewayError;

/// Standard content types
pub mod content_type {
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const APPLICATION_JSON: &str = "application/json";
}

pub const HEADER_RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

pub struct ResponseBuilder;

impl ResponseBuilder {
    fn plain(status: StatusCode, message: &str) -> Response<Vec<u8>> {
        let mut response = Response::new(message.as_bytes().to_vec());
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(content_type::TEXT_PLAIN),
        );
        response
    }

    /// JSON response with the given status.
    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Response<Vec<u8>> {
        match serde_json::to_vec(data) {
            Ok(body) => {
                let mut response = Response::new(body);
                *response.status_mut() = status;
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(content_type::APPLICATION_JSON),
                );
                response
            }
            Err(e) => {
                log::error!("Failed to serialize JSON response: {}", e);
                Self::plain(StatusCode::INTERNAL_SERVER_ERROR, "JSON serialization failed")
            }
        }
    }

    pub fn success_json<T: Serialize>(data: &T) -> Response<Vec<u8>> {
        Self::json(StatusCode::OK, data)
    }

    /// `{error, message, request_id}` body for a rejection.
    ///
    /// Throttled responses also carry the rate-limit headers and `Retry-After`.
    pub fn error_json(err: &GatewayError, request_id: &str) -> Response<Vec<u8>> {
        let mut response = Self::json(err.status(), &err.body(request_id));
        if let GatewayError::RateLimited {
            limit,
            remaining,
            retry_after,
            ..
        } = err
        {
            let headers = response.headers_mut();
            headers.insert(HEADER_RATE_LIMIT_LIMIT, HeaderValue::from(*limit));
            headers.insert(HEADER_RATE_LIMIT_REMAINING, HeaderValue::from(*remaining));
            headers.insert(header::RETRY_AFTER, HeaderValue::from(*retry_after));
        }
        response
    }

    /// Converts a local response into a Pingora header and body.
    pub fn into_proxy_response(response: Response<Vec<u8>>) -> Result<(ResponseHeader, Bytes)> {
        let (parts, body) = response.into_parts();
        let mut resp = ResponseHeader::build(parts.status, Some(parts.headers.len() + 1))?;
        for (name, value) in parts.headers.iter() {
            resp.insert_header(name.clone(), value.clone())?;
        }
        resp.insert_header(header::CONTENT_LENGTH, body.len().to_string())?;
        Ok((resp, Bytes::from(body)))
    }

    /// Writes a complete response to the downstream session.
    pub async fn send_proxy_response(
        session: &mut Session,
        resp: ResponseHeader,
        body: Bytes,
    ) -> Result<()> {
        let empty = body.is_empty();
        session
            .write_response_header(Box::new(resp), empty)
            .await?;
        if !empty {
            session.write_response_body(Some(body), true).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_response() {
        let data = json!({"message": "success", "code": 200});
        let response = ResponseBuilder::json(StatusCode::CREATED, &data);
        assert_eq!(response.status(), StatusCode::CREATED);
        let expected = r#"{"code":200,"message":"success"}"#;
        assert_eq!(response.body(), expected.as_bytes());
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            content_type::APPLICATION_JSON
        );
    }

    #[test]
    fn test_error_json() {
        let err = GatewayError::Routing("Unknown service 'billing'".to_string());
        let response = ResponseBuilder::error_json(&err, "req-1");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(
            json!({"error": "routing_error", "message": "Unknown service 'billing'", "request_id": "req-1"}),
            body
        );
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn test_rate_limited_headers() {
        let err = GatewayError::RateLimited {
            message: "Rate limit exceeded".to_string(),
            limit: 5,
            remaining: 0,
            retry_after: 3,
        };
        let response = ResponseBuilder::error_json(&err, "req-2");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(HEADER_RATE_LIMIT_LIMIT).unwrap(), "5");
        assert_eq!(response.headers().get(HEADER_RATE_LIMIT_REMAINING).unwrap(), "0");
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "3");
    }

    #[test]
    fn test_into_proxy_response() {
        let response = ResponseBuilder::success_json(&json!({"ok": true}));
        let (resp, body) = ResponseBuilder::into_proxy_response(response).unwrap();
        assert_eq!(200, resp.status.as_u16());
        assert_eq!(
            body.len().to_string(),
            resp.headers.get(header::CONTENT_LENGTH).unwrap().to_str().unwrap()
        );
        assert_eq!(
            content_type::APPLICATION_JSON,
            resp.headers.get(header::CONTENT_TYPE).unwrap()
        );
    }
}
