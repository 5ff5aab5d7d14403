use tracing::{error, info, warn};

/// Security event log. Events go to the `audit` target so they can be
/// filtered separately (`RUST_LOG=audit=info`).
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn token_issued(&self, jti: &str, expires_at: i64) {
        info!(target: "audit", event = "token_issued", jti, expires_at);
    }

    pub fn issue_denied(&self, reason: &str) {
        warn!(target: "audit", event = "issue_denied", reason);
    }

    pub fn auth_success(&self, path: &str, jti: Option<&str>) {
        info!(target: "audit", event = "auth_success", path, jti = jti.unwrap_or(""));
    }

    pub fn auth_failure(&self, path: &str, reason: &str) {
        warn!(target: "audit", event = "auth_failure", path, reason);
    }

    pub fn token_expired(&self, jti: Option<&str>) {
        warn!(target: "audit", event = "token_expired", jti = jti.unwrap_or(""));
    }

    pub fn token_revoked(&self, jti: Option<&str>) {
        info!(target: "audit", event = "token_revoked", jti = jti.unwrap_or(""));
    }

    pub fn tokens_swept(&self, removed: usize) {
        info!(target: "audit", event = "tokens_swept", removed);
    }

    pub fn upstream_failure(&self, url: &str, error_msg: &str) {
        error!(target: "audit", event = "upstream_failure", url, error = error_msg);
    }
}
