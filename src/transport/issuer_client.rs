use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::transport::upstream::{read_body_capped, MAX_ERROR_BODY_BYTES};
use crate::transport::ProxyError;

const ISSUER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// A token obtained from a remote issuer.
#[derive(Debug, Clone)]
pub struct RemoteToken {
    pub token: String,
    /// Expiry reported by the issuer, when it sends one.
    pub expires_at: Option<DateTime<Utc>>,
}

/// HTTP client of a remote gateway's issuance endpoints.
///
/// This is the consumer side of token issuance; it never validates tokens
/// itself.
#[derive(Clone)]
pub struct IssuerClient {
    http: Client,
    base_url: String,
    password: Arc<str>,
}

impl std::fmt::Debug for IssuerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuerClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl IssuerClient {
    pub fn new(base_url: &str, password: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(ISSUER_TIMEOUT)
            .build()
            .context("building issuer HTTP client")?;
        let password: String = password.into();

        Ok(Self {
            http,
            base_url: base_url.strip_suffix('/').unwrap_or(base_url).to_string(),
            password: Arc::from(password),
        })
    }

    /// `POST <base>/generate-token` with the configured password.
    pub async fn generate_token(&self) -> Result<RemoteToken, ProxyError> {
        let url = format!("{}/generate-token", self.base_url);
        debug!(url = %url, "requesting token from remote issuer");

        let response = self
            .http
            .post(&url)
            .json(&json!({ "password": &*self.password }))
            .send()
            .await
            .map_err(|e| ProxyError::UpstreamUnreachable(format!("Failed to get new token: {e}")))?;

        let status = response.status();
        let body = read_body_capped(response, MAX_ERROR_BODY_BYTES).await?;
        if !status.is_success() {
            return Err(ProxyError::UpstreamError {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| ProxyError::UpstreamError {
            status: 502,
            body: format!("invalid token response from issuer: {e}"),
        })?;

        Ok(RemoteToken {
            token: parsed.token,
            expires_at: parsed.expires_at,
        })
    }

    /// `POST <base>/revoke-token` presenting `token` as the bearer.
    pub async fn revoke_token(&self, token: &str) -> Result<(), ProxyError> {
        let url = format!("{}/revoke-token", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProxyError::UpstreamError {
                status: status.as_u16(),
                body: read_body_capped(response, MAX_ERROR_BODY_BYTES).await?,
            })
        }
    }
}
