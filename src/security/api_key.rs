use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

pub const API_KEY_HEADER: &str = "x-api-key";

/// How inbound requests to non-public routes are authenticated.
///
/// One mode per deployment; requests never mix a bearer token with an API
/// key. `Disabled` is an explicit opt-out and is the only way to run without
/// credentials: an empty API key does not disable the check.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    Bearer,
    ApiKey(String),
    Disabled,
}

impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer => write!(f, "Bearer"),
            Self::ApiKey(_) => write!(f, "ApiKey(<redacted>)"),
            Self::Disabled => write!(f, "Disabled"),
        }
    }
}

impl AuthMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Bearer => "bearer",
            Self::ApiKey(_) => "api_key",
            Self::Disabled => "disabled",
        }
    }
}

/// Compare the presented `x-api-key` header with the configured key.
/// A missing or empty header never matches.
pub fn api_key_matches(expected: &str, headers: &HeaderMap) -> bool {
    let presented = match headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        Some(v) if !v.is_empty() => v,
        _ => return false,
    };
    if expected.is_empty() {
        return false;
    }
    presented.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() == 1
}
