//! Startup configuration for the gateway and the relay.
//!
//! Settings come from the environment or a JSON file and are validated once,
//! up front; the resulting config structs are immutable for the life of the
//! process.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::Url;
use serde::Deserialize;

use crate::security::AuthMode;
use crate::transport::stream::DEFAULT_CHUNK_SIZE;

pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 4;
pub const DEFAULT_UPSTREAM_URL: &str = "http://127.0.0.1:11434/";
pub const DEFAULT_GATEWAY_PORT: u16 = 8000;
pub const DEFAULT_RELAY_PORT: u16 = 11434;
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Raw, unvalidated settings. Field names double as JSON keys; environment
/// variables use the upper-case form.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub secret_key: Option<String>,
    pub token_password: Option<String>,
    pub token_expire_hours: Option<i64>,
    pub upstream_url: Option<String>,
    pub gateway_url: Option<String>,
    pub listen_port: Option<u16>,
    pub auth_mode: Option<String>,
    pub api_key: Option<String>,
    pub upstream_timeout_secs: Option<u64>,
    pub stream_chunk_size: Option<usize>,
    pub max_body_bytes: Option<usize>,
    pub token_sweep_interval_secs: Option<u64>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup` (an environment stand-in). Blank values
    /// count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            secret_key: get("SECRET_KEY"),
            token_password: get("TOKEN_PASSWORD"),
            token_expire_hours: parse_var(&get, "TOKEN_EXPIRE_HOURS")?,
            upstream_url: get("UPSTREAM_URL").or_else(|| get("OLLAMA_API_URL")),
            gateway_url: get("GATEWAY_URL").or_else(|| get("BASE_URL")),
            listen_port: parse_var(&get, "LISTEN_PORT")?,
            auth_mode: get("AUTH_MODE"),
            api_key: get("API_KEY"),
            upstream_timeout_secs: parse_var(&get, "UPSTREAM_TIMEOUT_SECS")?,
            stream_chunk_size: parse_var(&get, "STREAM_CHUNK_SIZE")?,
            max_body_bytes: parse_var(&get, "MAX_BODY_BYTES")?,
            token_sweep_interval_secs: parse_var(&get, "TOKEN_SWEEP_INTERVAL_SECS")?,
        })
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).context("reading config file")?;
        serde_json::from_str(&raw).context("parsing JSON config")
    }
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    get(key)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| anyhow!("invalid {key}={v:?}: {e}"))
        })
        .transpose()
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("{name} must be set"))
}

fn http_url(raw: String, name: &str) -> Result<String> {
    let url = Url::parse(&raw).with_context(|| format!("{name} is not a valid URL: {raw:?}"))?;
    match url.scheme() {
        "http" | "https" => Ok(raw),
        other => bail!("{name} must use http or https, got {other:?}"),
    }
}

fn token_ttl(hours: Option<i64>) -> Result<chrono::Duration> {
    let hours = hours.unwrap_or(DEFAULT_TOKEN_TTL_HOURS);
    if hours <= 0 {
        bail!("TOKEN_EXPIRE_HOURS must be positive, got {hours}");
    }
    Ok(chrono::Duration::hours(hours))
}

fn auth_mode(raw: Option<&str>, default: &str, api_key: Option<String>) -> Result<AuthMode> {
    match raw.unwrap_or(default).trim().to_ascii_lowercase().as_str() {
        "bearer" => Ok(AuthMode::Bearer),
        "api_key" | "api-key" | "apikey" => {
            let key = required(api_key, "API_KEY (required when AUTH_MODE=api_key)")?;
            Ok(AuthMode::ApiKey(key))
        }
        "disabled" | "none" => Ok(AuthMode::Disabled),
        other => bail!("unknown AUTH_MODE {other:?} (expected bearer, api_key or disabled)"),
    }
}

fn chunk_size(raw: Option<usize>) -> Result<usize> {
    match raw.unwrap_or(DEFAULT_CHUNK_SIZE) {
        0 => bail!("STREAM_CHUNK_SIZE must be positive"),
        n => Ok(n),
    }
}

/// Gateway: local issuer plus authenticated proxy.
#[derive(Clone)]
pub struct GatewayConfig {
    pub signing_secret: String,
    pub token_password: String,
    pub token_ttl: chrono::Duration,
    pub upstream_url: String,
    pub listen_port: u16,
    pub auth_mode: AuthMode,
    pub upstream_timeout: Option<Duration>,
    pub stream_chunk_size: usize,
    pub max_body_bytes: usize,
    pub sweep_interval: Option<Duration>,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("token_ttl", &self.token_ttl)
            .field("upstream_url", &self.upstream_url)
            .field("listen_port", &self.listen_port)
            .field("auth_mode", &self.auth_mode)
            .field("upstream_timeout", &self.upstream_timeout)
            .field("stream_chunk_size", &self.stream_chunk_size)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("sweep_interval", &self.sweep_interval)
            .finish_non_exhaustive()
    }
}

impl GatewayConfig {
    /// Config with every optional setting at its default.
    pub fn new(
        signing_secret: impl Into<String>,
        token_password: impl Into<String>,
        upstream_url: impl Into<String>,
    ) -> Self {
        Self {
            signing_secret: signing_secret.into(),
            token_password: token_password.into(),
            token_ttl: chrono::Duration::hours(DEFAULT_TOKEN_TTL_HOURS),
            upstream_url: upstream_url.into(),
            listen_port: DEFAULT_GATEWAY_PORT,
            auth_mode: AuthMode::Bearer,
            upstream_timeout: None,
            stream_chunk_size: DEFAULT_CHUNK_SIZE,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            sweep_interval: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_settings(Settings::from_env()?)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        Self::from_settings(Settings::from_file(path)?)
    }

    pub fn from_settings(s: Settings) -> Result<Self> {
        Ok(Self {
            signing_secret: required(s.secret_key, "SECRET_KEY")?,
            token_password: required(s.token_password, "TOKEN_PASSWORD")?,
            token_ttl: token_ttl(s.token_expire_hours)?,
            upstream_url: http_url(
                s.upstream_url.unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string()),
                "UPSTREAM_URL",
            )?,
            listen_port: s.listen_port.unwrap_or(DEFAULT_GATEWAY_PORT),
            auth_mode: auth_mode(s.auth_mode.as_deref(), "bearer", s.api_key)?,
            upstream_timeout: s.upstream_timeout_secs.map(Duration::from_secs),
            stream_chunk_size: chunk_size(s.stream_chunk_size)?,
            max_body_bytes: s.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
            sweep_interval: s
                .token_sweep_interval_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        })
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_auth_mode(mut self, mode: AuthMode) -> Self {
        self.auth_mode = mode;
        self
    }
}

/// Relay: a proxy that holds a token for a remote gateway.
#[derive(Clone)]
pub struct RelayConfig {
    /// Base URL of the gateway (its `/generate-token` and `/protected/` live
    /// below it).
    pub gateway_url: String,
    pub token_password: String,
    pub token_ttl: chrono::Duration,
    pub listen_port: u16,
    pub auth_mode: AuthMode,
    pub upstream_timeout: Option<Duration>,
    pub stream_chunk_size: usize,
    pub max_body_bytes: usize,
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("gateway_url", &self.gateway_url)
            .field("token_ttl", &self.token_ttl)
            .field("listen_port", &self.listen_port)
            .field("auth_mode", &self.auth_mode)
            .field("upstream_timeout", &self.upstream_timeout)
            .field("stream_chunk_size", &self.stream_chunk_size)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish_non_exhaustive()
    }
}

impl RelayConfig {
    pub fn new(
        gateway_url: impl Into<String>,
        token_password: impl Into<String>,
        auth_mode: AuthMode,
    ) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            token_password: token_password.into(),
            token_ttl: chrono::Duration::hours(DEFAULT_TOKEN_TTL_HOURS),
            listen_port: DEFAULT_RELAY_PORT,
            auth_mode,
            upstream_timeout: None,
            stream_chunk_size: DEFAULT_CHUNK_SIZE,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_settings(Settings::from_env()?)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        Self::from_settings(Settings::from_file(path)?)
    }

    pub fn from_settings(s: Settings) -> Result<Self> {
        let auth_mode = auth_mode(s.auth_mode.as_deref(), "api_key", s.api_key)?;
        if auth_mode == AuthMode::Bearer {
            bail!("the relay has no local issuer; use AUTH_MODE=api_key or disabled");
        }

        Ok(Self {
            gateway_url: http_url(required(s.gateway_url, "GATEWAY_URL")?, "GATEWAY_URL")?,
            token_password: required(s.token_password, "TOKEN_PASSWORD")?,
            token_ttl: token_ttl(s.token_expire_hours)?,
            listen_port: s.listen_port.unwrap_or(DEFAULT_RELAY_PORT),
            auth_mode,
            upstream_timeout: s.upstream_timeout_secs.map(Duration::from_secs),
            stream_chunk_size: chunk_size(s.stream_chunk_size)?,
            max_body_bytes: s.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
        })
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }
}
