//! Upstream side of the proxy: request context, forwarding, streaming, and
//! the client half of the dual-hop topology.

pub mod issuer_client;
pub mod session;
pub mod stream;
pub mod upstream;

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::BoxStream;
use serde_json::json;
use thiserror::Error;

pub use issuer_client::IssuerClient;
pub use session::UpstreamSession;
pub use upstream::{Forwarder, UpstreamStatus};

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Methods the proxy forwards; anything else is refused before upstream is
/// contacted.
pub const FORWARDED_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
];

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Upstream could not be reached at all (refused, DNS, timeout).
    #[error("Failed to reach upstream: {0}")]
    UpstreamUnreachable(String),
    /// Upstream answered with a non-success status.
    #[error("Upstream API error ({status}): {body}")]
    UpstreamError { status: u16, body: String },
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(Method),
    #[error("Failed to read request body: {0}")]
    ReadBody(String),
    /// Upstream failed after the response had started streaming.
    #[error("Upstream stream interrupted: {0}")]
    StreamInterrupted(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            // Passed through verbatim: same status, same body.
            Self::UpstreamError { status, body } => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                let content_type = if serde_json::from_str::<serde_json::Value>(&body).is_ok() {
                    DEFAULT_CONTENT_TYPE
                } else {
                    "text/plain; charset=utf-8"
                };
                (status, [(header::CONTENT_TYPE, content_type)], body).into_response()
            }
            other => {
                let status = match &other {
                    Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
                    Self::ReadBody(_) => StatusCode::BAD_REQUEST,
                    Self::StreamInterrupted(_) => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, axum::Json(json!({ "error": other.to_string() }))).into_response()
            }
        }
    }
}

pub fn ensure_method_allowed(method: &Method) -> Result<(), ProxyError> {
    if FORWARDED_METHODS.contains(method) {
        Ok(())
    } else {
        Err(ProxyError::MethodNotAllowed(method.clone()))
    }
}

/// One inbound call, captured for forwarding.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Subpath below the proxy prefix, still percent-encoded as received.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardRequest {
    /// Capture `request`, stripping `prefix` (e.g. `/protected/`) from its path.
    pub async fn from_request(
        prefix: &str,
        request: Request,
        max_body_bytes: usize,
    ) -> Result<Self, ProxyError> {
        let (parts, body) = request.into_parts();
        ensure_method_allowed(&parts.method)?;

        let raw_path = parts.uri.path();
        let path = raw_path
            .strip_prefix(prefix)
            .unwrap_or(raw_path.trim_start_matches('/'))
            .to_string();
        let query = parts.uri.query().map(str::to_string);

        let body = axum::body::to_bytes(body, max_body_bytes)
            .await
            .map_err(|e| ProxyError::ReadBody(e.to_string()))?;

        Ok(Self {
            method: parts.method,
            path,
            query,
            headers: parts.headers,
            body,
        })
    }
}

/// Successful upstream response whose body is still in flight.
pub struct StreamedResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub body: BoxStream<'static, Result<Bytes, ProxyError>>,
}

impl std::fmt::Debug for StreamedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamedResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

impl IntoResponse for StreamedResponse {
    fn into_response(self) -> Response {
        let content_type = HeaderValue::from_str(&self.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));

        // An error item aborts the connection instead of ending the body cleanly.
        let mut response = Response::new(Body::from_stream(self.body));
        *response.status_mut() = self.status;
        response.headers_mut().insert(header::CONTENT_TYPE, content_type);
        response
    }
}
