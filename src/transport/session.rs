use std::sync::Arc;

use chrono::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::security::clock::{Clock, SystemClock};
use crate::security::token_cache::TokenCache;
use crate::transport::issuer_client::IssuerClient;
use crate::transport::ProxyError;

/// Bearer credential for the second hop of a dual-hop deployment.
///
/// Mints lazily through an [`IssuerClient`] and re-mints once the locally
/// tracked expiry has passed. A token rejected by the far side is not
/// refreshed here; the failed call is returned and the caller may retry.
#[derive(Debug, Clone)]
pub struct UpstreamSession {
    issuer: IssuerClient,
    cache: TokenCache,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    mint_lock: Arc<Mutex<()>>,
}

impl UpstreamSession {
    pub fn new(issuer: IssuerClient, ttl: Duration) -> Self {
        Self {
            issuer,
            cache: TokenCache::new(),
            ttl,
            clock: Arc::new(SystemClock),
            mint_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// A token believed valid right now, minting one if needed.
    pub async fn bearer(&self) -> Result<String, ProxyError> {
        if let Some(token) = self.cache.get_valid(self.clock.now()).await {
            return Ok(token);
        }

        // One mint at a time; late arrivals reuse the winner's token.
        let _guard = self.mint_lock.lock().await;
        let now = self.clock.now();
        if let Some(token) = self.cache.get_valid(now).await {
            return Ok(token);
        }

        if let Some(previous) = self.cache.last_rotated().await {
            debug!(minted_at = %previous.to_rfc3339(), "upstream token expired, minting a new one");
        }
        let minted = self.issuer.generate_token().await?;
        let local_expiry = now + self.ttl;
        let expires_at = match minted.expires_at {
            Some(remote) if remote < local_expiry => remote,
            _ => local_expiry,
        };
        self.cache.swap(minted.token.clone(), expires_at, now).await;
        info!(expires_at = %expires_at.to_rfc3339(), "minted upstream token");

        Ok(minted.token)
    }

    /// Revoke the held token on the remote issuer, best effort.
    pub async fn release(&self) -> bool {
        let Some(token) = self.cache.clear().await else {
            return false;
        };
        match self.issuer.revoke_token(&token).await {
            Ok(()) => {
                debug!("released upstream token");
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to revoke upstream token");
                false
            }
        }
    }
}
