use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::comms::error_response;
use crate::security::api_key::api_key_matches;
use crate::security::audit_log::AuditLogger;
use crate::security::{AuthMode, TokenIssuer};

/// Pull the token out of `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Bearer token presented with the request (not yet validated).
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        bearer_token(&parts.headers)
            .map(|t| BearerToken(t.to_string()))
            .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "Missing or invalid token"))
    }
}

#[derive(Debug, Clone)]
enum Check {
    Bearer(TokenIssuer),
    ApiKey(String),
    Disabled,
}

/// Credential check applied to every route outside the public allow-list.
#[derive(Debug, Clone)]
pub struct AuthGate {
    check: Check,
    public_routes: &'static [&'static str],
    audit: AuditLogger,
}

impl AuthGate {
    /// Build the gate for a deployment mode. Bearer mode needs the local issuer.
    pub fn for_mode(
        mode: &AuthMode,
        issuer: Option<TokenIssuer>,
        public_routes: &'static [&'static str],
    ) -> anyhow::Result<Self> {
        let check = match (mode, issuer) {
            (AuthMode::Bearer, Some(issuer)) => Check::Bearer(issuer),
            (AuthMode::Bearer, None) => anyhow::bail!("bearer auth requires a local token issuer"),
            (AuthMode::ApiKey(key), _) => Check::ApiKey(key.clone()),
            (AuthMode::Disabled, _) => Check::Disabled,
        };
        Ok(Self {
            check,
            public_routes,
            audit: AuditLogger::new(),
        })
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.public_routes.iter().any(|route| *route == path)
    }
}

/// Middleware: authenticate before the handler (and therefore before any
/// byte goes upstream).
pub async fn require_auth(State(gate): State<AuthGate>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    if gate.is_public(&path) {
        return next.run(request).await;
    }

    match &gate.check {
        Check::Disabled => {}
        Check::ApiKey(key) => {
            if !api_key_matches(key, request.headers()) {
                gate.audit.auth_failure(&path, "invalid or missing api key");
                return error_response(StatusCode::UNAUTHORIZED, "Invalid or missing API key");
            }
            gate.audit.auth_success(&path, None);
        }
        Check::Bearer(issuer) => {
            // No borrow of the request may be held across the await below.
            let Some(token) = bearer_token(request.headers()).map(str::to_string) else {
                gate.audit.auth_failure(&path, "missing bearer token");
                return error_response(StatusCode::UNAUTHORIZED, "Missing or invalid token");
            };
            match issuer.validate(&token).await {
                Ok(claims) => gate.audit.auth_success(&path, Some(&claims.jti)),
                Err(e) => {
                    gate.audit.auth_failure(&path, &e.to_string());
                    return e.into_response();
                }
            }
        }
    }

    next.run(request).await
}
