use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use tracing::{debug, warn};

use crate::security::audit_log::AuditLogger;
use crate::transport::stream::rechunk;
use crate::transport::{
    ensure_method_allowed, ForwardRequest, ProxyError, StreamedResponse, DEFAULT_CONTENT_TYPE,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on how much of a non-success upstream body is kept.
pub const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Read at most `limit` bytes of `response`'s body. Anything past the limit
/// is dropped along with the connection; a failed read is an error, never an
/// empty body.
pub(crate) async fn read_body_capped(response: Response, limit: usize) -> Result<String, ProxyError> {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            ProxyError::StreamInterrupted(format!("upstream body ended early: {e}"))
        })?;
        let room = limit - body.len();
        if chunk.len() > room {
            body.extend_from_slice(&chunk[..room]);
            warn!(limit, "upstream error body truncated");
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// Result of a best-effort connectivity check against the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpstreamStatus {
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "not running")]
    NotRunning,
    #[serde(rename = "not reachable")]
    NotReachable,
}

/// Forwards captured requests to one upstream base URL and streams the
/// answer back.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: Client,
    base_url: String,
    chunk_size: usize,
    response_deadline: Option<Duration>,
    audit: AuditLogger,
}

impl Forwarder {
    /// `response_deadline` bounds the wait for upstream response headers;
    /// the body stream itself is never timed out.
    pub fn new(base_url: &str, chunk_size: usize, response_deadline: Option<Duration>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("building upstream HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.strip_suffix('/').unwrap_or(base_url).to_string(),
            chunk_size,
            response_deadline,
            audit: AuditLogger::new(),
        })
    }

    /// `<base>/<path>[?query]`. The subpath is not normalised; upstream is
    /// responsible for rejecting traversal.
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> String {
        let mut url = format!("{}/{}", self.base_url, path);
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(q);
        }
        url
    }

    /// Send `request` upstream, optionally as a bearer-token client, and hand
    /// back the response body as a stream.
    pub async fn forward(
        &self,
        request: ForwardRequest,
        bearer: Option<&str>,
    ) -> Result<StreamedResponse, ProxyError> {
        ensure_method_allowed(&request.method)?;
        let url = self.upstream_url(&request.path, request.query.as_deref());

        let content_type = request
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header(CONTENT_TYPE, content_type)
            .body(request.body);
        if let Some(accept) = request.headers.get(ACCEPT) {
            builder = builder.header(ACCEPT, accept.clone());
        }
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }

        debug!(method = %request.method, url = %url, "forwarding request upstream");
        let response = self.dispatch(builder, &url).await?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, status = status.as_u16(), "upstream returned error status");
            let body = read_body_capped(response, MAX_ERROR_BODY_BYTES).await?;
            return Err(ProxyError::UpstreamError {
                status: status.as_u16(),
                body,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        debug!(url = %url, status = status.as_u16(), content_type = %content_type, "streaming upstream response");

        Ok(StreamedResponse {
            status,
            content_type,
            body: rechunk(response.bytes_stream(), self.chunk_size).boxed(),
        })
    }

    async fn dispatch(&self, builder: RequestBuilder, url: &str) -> Result<Response, ProxyError> {
        let sent = match self.response_deadline {
            Some(deadline) => match tokio::time::timeout(deadline, builder.send()).await {
                Ok(result) => result,
                Err(_) => {
                    let msg = format!("no response within {}s", deadline.as_secs());
                    self.audit.upstream_failure(url, &msg);
                    return Err(ProxyError::UpstreamUnreachable(msg));
                }
            },
            None => builder.send().await,
        };

        sent.map_err(|e| {
            self.audit.upstream_failure(url, &e.to_string());
            ProxyError::UpstreamUnreachable(e.to_string())
        })
    }

    /// GET the upstream root and classify the outcome.
    pub async fn probe(&self) -> UpstreamStatus {
        let url = format!("{}/", self.base_url);
        match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => UpstreamStatus::Running,
            Ok(resp) => {
                debug!(status = resp.status().as_u16(), "upstream probe returned non-success");
                UpstreamStatus::NotRunning
            }
            Err(e) => {
                debug!(error = %e, "upstream probe failed");
                UpstreamStatus::NotReachable
            }
        }
    }
}
