//! Second-hop proxy: authenticates its callers by API key and forwards to a
//! gateway's `/protected/` tree with a bearer token it mints for itself.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::middleware::from_fn_with_state;
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::comms::guard::{require_auth, AuthGate};
use crate::security::AuthMode;
use crate::server::config::RelayConfig;
use crate::server::daemon::shutdown_signal;
use crate::transport::{
    ForwardRequest, Forwarder, IssuerClient, ProxyError, StreamedResponse, UpstreamSession,
};

pub type SharedRelayState = Arc<RelayState>;

pub const RELAY_PREFIX: &str = "/pxy/";

pub const PUBLIC_ROUTES: &[&str] = &["/mw/"];

#[derive(Debug, Clone)]
pub struct RelayState {
    pub forwarder: Forwarder,
    pub session: UpstreamSession,
    pub auth_mode: AuthMode,
    pub max_body_bytes: usize,
}

impl RelayState {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let issuer = IssuerClient::new(&config.gateway_url, config.token_password.clone())?;
        Self::with_session(config, UpstreamSession::new(issuer, config.token_ttl))
    }

    pub fn with_session(config: &RelayConfig, session: UpstreamSession) -> Result<Self> {
        let gateway = config.gateway_url.strip_suffix('/').unwrap_or(&config.gateway_url);
        let forwarder = Forwarder::new(
            &format!("{gateway}/protected"),
            config.stream_chunk_size,
            config.upstream_timeout,
        )?;

        Ok(Self {
            forwarder,
            session,
            auth_mode: config.auth_mode.clone(),
            max_body_bytes: config.max_body_bytes,
        })
    }
}

async fn relay_status() -> impl IntoResponse {
    Json(json!({"message": "Proxy is running and ready to handle requests"}))
}

async fn relay(
    State(state): State<SharedRelayState>,
    request: Request,
) -> Result<StreamedResponse, ProxyError> {
    // Capture first: an unsupported method must not cost a token mint.
    let request = ForwardRequest::from_request(RELAY_PREFIX, request, state.max_body_bytes).await?;
    let bearer = state.session.bearer().await?;
    state.forwarder.forward(request, Some(&bearer)).await
}

pub fn create_router(state: SharedRelayState) -> Result<Router> {
    let gate = AuthGate::for_mode(&state.auth_mode, None, PUBLIC_ROUTES)?;

    let router = Router::new()
        .route("/mw/", get(relay_status))
        .route("/pxy/{*path}", any(relay))
        .layer(from_fn_with_state(gate, require_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    Ok(router)
}

pub async fn serve(state: SharedRelayState, port: u16) -> Result<()> {
    let app = create_router(state)?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding relay listener on {addr}"))?;
    info!(%addr, "relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server error")?;
    Ok(())
}
