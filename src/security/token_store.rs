use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Backing store for the active token set: token value -> expiry.
///
/// Every method completes without network I/O for the in-memory store;
/// other backends must not hold their own locks across awaits either.
#[async_trait]
pub trait TokenStore: Send + Sync + std::fmt::Debug {
    /// Record a token. Tokens are never updated in place, so an existing
    /// entry with the same value is simply overwritten.
    async fn put(&self, token: String, expires_at: DateTime<Utc>);

    async fn get(&self, token: &str) -> Option<DateTime<Utc>>;

    /// Remove a token, returning its recorded expiry if it was present.
    async fn delete(&self, token: &str) -> Option<DateTime<Utc>>;

    /// Drop every entry whose expiry is at or before `now`. Returns how many
    /// entries were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> usize;

    async fn len(&self) -> usize;
}

/// In-memory token store (tokens do not survive restarts).
#[derive(Debug, Clone, Default)]
pub struct InMemoryTokenStore {
    tokens: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn put(&self, token: String, expires_at: DateTime<Utc>) {
        let mut tokens = self.tokens.write().await;
        tokens.insert(token, expires_at);
    }

    async fn get(&self, token: &str) -> Option<DateTime<Utc>> {
        let tokens = self.tokens.read().await;
        tokens.get(token).copied()
    }

    async fn delete(&self, token: &str) -> Option<DateTime<Utc>> {
        let mut tokens = self.tokens.write().await;
        tokens.remove(token)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, expires_at| *expires_at > now);
        before - tokens.len()
    }

    async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }
}
