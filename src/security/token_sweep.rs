use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

use crate::security::audit_log::AuditLogger;
use crate::security::auth::TokenIssuer;

/// Background task that purges expired entries from the active token set.
///
/// Validation already removes expired tokens it sees; this bounds memory for
/// tokens that are issued and never presented again. The first sweep happens
/// one full `period` after spawning.
pub fn spawn_token_sweeper(issuer: TokenIssuer, period: Duration) -> JoinHandle<()> {
    let audit = AuditLogger::new();
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = issuer.sweep_expired().await;
            if removed > 0 {
                audit.tokens_swept(removed);
            } else {
                debug!("token sweep found nothing to remove");
            }
        }
    })
}
