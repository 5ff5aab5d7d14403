use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Token held by a client of a remote issuer, with a locally tracked expiry.
///
/// Cloning shares the underlying slot.
#[derive(Debug, Clone, Default)]
pub struct TokenCache {
    slot: Arc<RwLock<Option<CachedToken>>>,
    last_rotated: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached token if it is still usable at `now`.
    pub async fn get_valid(&self, now: DateTime<Utc>) -> Option<String> {
        let slot = self.slot.read().await;
        slot.as_ref()
            .filter(|cached| now < cached.expires_at)
            .map(|cached| cached.token.clone())
    }

    /// Replace the cached token and record the rotation time.
    pub async fn swap(&self, token: String, expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        let mut slot = self.slot.write().await;
        *slot = Some(CachedToken { token, expires_at });
        drop(slot);

        let mut last_rotated = self.last_rotated.write().await;
        *last_rotated = Some(now);
        debug!(expires_at = %expires_at.to_rfc3339(), "upstream token rotated");
    }

    /// Empty the slot, returning what it held.
    pub async fn clear(&self) -> Option<String> {
        self.slot.write().await.take().map(|cached| cached.token)
    }

    pub async fn last_rotated(&self) -> Option<DateTime<Utc>> {
        *self.last_rotated.read().await
    }
}
