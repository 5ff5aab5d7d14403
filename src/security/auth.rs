use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

use crate::security::audit_log::AuditLogger;
use crate::security::claims::{Claims, TokenSigner};
use crate::security::clock::{Clock, SystemClock};
use crate::security::token_store::{InMemoryTokenStore, TokenStore};

/// Why an issue/validate/revoke call was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid password")]
    InvalidCredential,
    #[error("Token invalid or not found")]
    NotFound,
    #[error("Token expired")]
    Expired,
    #[error("Invalid token: {0}")]
    Malformed(String),
    #[error("Failed to sign token: {0}")]
    Signing(String),
}

/// A freshly minted bearer token.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Mints, validates and revokes bearer tokens against one shared password.
///
/// The issuer owns the active token set; the proxy only reaches it through
/// [`TokenIssuer::validate`].
#[derive(Clone)]
pub struct TokenIssuer {
    password: Arc<str>,
    ttl: Duration,
    signer: TokenSigner,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    audit: AuditLogger,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("ttl", &self.ttl)
            .field("store", &self.store)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    /// Issuer backed by an in-memory store and the wall clock.
    pub fn new(signing_secret: &[u8], password: impl Into<String>, ttl: Duration) -> Self {
        let password: String = password.into();
        Self {
            password: Arc::from(password),
            ttl,
            signer: TokenSigner::new(signing_secret),
            store: Arc::new(InMemoryTokenStore::new()),
            clock: Arc::new(SystemClock),
            audit: AuditLogger::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Mint a token if `password` matches the configured one.
    ///
    /// Issue time is truncated to the whole second and the expiry is that
    /// instant plus the TTL, so a token lives at most the TTL and up to one
    /// second less.
    pub async fn issue(&self, password: &str) -> Result<IssuedToken, AuthError> {
        let matches: bool = password
            .as_bytes()
            .ct_eq(self.password.as_bytes())
            .into();
        if password.is_empty() || !matches {
            self.audit.issue_denied("invalid credential");
            return Err(AuthError::InvalidCredential);
        }

        // Whole seconds so the stored expiry and the `exp` claim agree.
        let issued_at = truncate_to_second(self.clock.now());
        let expires_at = issued_at + self.ttl;
        let claims = Claims::new(issued_at, expires_at);
        let token = self
            .signer
            .sign(&claims)
            .map_err(|e| AuthError::Signing(e.to_string()))?;

        self.store.put(token.clone(), expires_at).await;
        self.audit.token_issued(&claims.jti, claims.exp);
        debug!(expires_at = %expires_at.to_rfc3339(), "token issued");

        Ok(IssuedToken {
            token,
            issued_at,
            expires_at,
        })
    }

    /// Check that `token` is well-formed, active and unexpired.
    ///
    /// Expired tokens are removed from the active set as a side effect, whether
    /// the signed claim or the recorded expiry noticed it first.
    pub async fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = self
            .signer
            .verify(token)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        let now = self.clock.now();

        if claims.is_expired_at(now) {
            self.store.delete(token).await;
            self.audit.token_expired(Some(&claims.jti));
            return Err(AuthError::Expired);
        }

        let expires_at = self.store.get(token).await.ok_or(AuthError::NotFound)?;
        if now >= expires_at {
            self.store.delete(token).await;
            self.audit.token_expired(Some(&claims.jti));
            return Err(AuthError::Expired);
        }

        Ok(claims)
    }

    /// Remove `token` from the active set regardless of its expiry.
    pub async fn revoke(&self, token: &str) -> Result<(), AuthError> {
        match self.store.delete(token).await {
            Some(_) => {
                let jti = self.signer.verify(token).ok().map(|c| c.jti);
                self.audit.token_revoked(jti.as_deref());
                Ok(())
            }
            None => Err(AuthError::NotFound),
        }
    }

    /// Drop every expired entry from the active set.
    pub async fn sweep_expired(&self) -> usize {
        self.store.purge_expired(self.clock.now()).await
    }

    pub async fn active_tokens(&self) -> usize {
        self.store.len().await
    }
}

fn truncate_to_second(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(at.timestamp(), 0).unwrap_or(at)
}
