use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::comms::error_response;
use crate::comms::guard::{require_auth, AuthGate, BearerToken};
use crate::security::{AuthError, AuthMode, TokenIssuer};
use crate::server::config::GatewayConfig;
use crate::server::daemon::shutdown_signal;
use crate::transport::{ForwardRequest, Forwarder, ProxyError, StreamedResponse, UpstreamStatus};

pub type SharedState = Arc<AppState>;

pub const PROTECTED_PREFIX: &str = "/protected/";

/// Reachable without credentials.
pub const PUBLIC_ROUTES: &[&str] = &["/", "/generate-token"];

#[derive(Debug, Clone)]
pub struct AppState {
    pub issuer: TokenIssuer,
    pub forwarder: Forwarder,
    pub auth_mode: AuthMode,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let issuer = TokenIssuer::new(
            config.signing_secret.as_bytes(),
            config.token_password.clone(),
            config.token_ttl,
        );
        Self::with_issuer(config, issuer)
    }

    /// Build state around an existing issuer (custom store or clock).
    pub fn with_issuer(config: &GatewayConfig, issuer: TokenIssuer) -> Result<Self> {
        let forwarder = Forwarder::new(
            &config.upstream_url,
            config.stream_chunk_size,
            config.upstream_timeout,
        )?;

        Ok(Self {
            issuer,
            forwarder,
            auth_mode: config.auth_mode.clone(),
            max_body_bytes: config.max_body_bytes,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub middleware_status: &'static str,
    pub upstream_status: UpstreamStatus,
}

async fn root() -> impl IntoResponse {
    Json(json!({"message": "Welcome to the Authenticated API"}))
}

// Body parsed by hand so a bad payload gets our error shape, not axum's.
async fn generate_token(State(state): State<SharedState>, body: Bytes) -> Response {
    let request: TokenRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            debug!(error = %e, "unparseable token request");
            return error_response(StatusCode::BAD_REQUEST, "Invalid request body");
        }
    };
    let Some(password) = request.password.filter(|p| !p.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Password is required");
    };

    match state.issuer.issue(&password).await {
        Ok(issued) => Json(TokenResponse {
            token: issued.token,
            expires_at: issued.expires_at,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn revoke_token(State(state): State<SharedState>, BearerToken(token): BearerToken) -> Response {
    match state.issuer.revoke(&token).await {
        Ok(()) => Json(json!({"message": "Token revoked successfully"})).into_response(),
        Err(AuthError::NotFound) => error_response(StatusCode::NOT_FOUND, "Token not found"),
        Err(e) => e.into_response(),
    }
}

async fn status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(StatusResponse {
        middleware_status: "running",
        upstream_status: state.forwarder.probe().await,
    })
}

async fn protected(
    State(state): State<SharedState>,
    request: Request,
) -> Result<StreamedResponse, ProxyError> {
    let request = ForwardRequest::from_request(PROTECTED_PREFIX, request, state.max_body_bytes).await?;
    state.forwarder.forward(request, None).await
}

pub fn create_router(state: SharedState) -> Result<Router> {
    let gate = AuthGate::for_mode(&state.auth_mode, Some(state.issuer.clone()), PUBLIC_ROUTES)?;

    let router = Router::new()
        .route("/", get(root))
        .route("/generate-token", post(generate_token))
        .route("/revoke-token", post(revoke_token))
        .route("/status", get(status))
        .route("/protected/{*path}", any(protected))
        .layer(from_fn_with_state(gate, require_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    Ok(router)
}

pub async fn serve(state: SharedState, port: u16) -> Result<()> {
    let app = create_router(state)?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding gateway listener on {addr}"))?;
    info!(%addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server error")?;
    Ok(())
}
