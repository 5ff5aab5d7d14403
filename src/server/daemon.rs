use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{info, warn};

use crate::comms::local_api::{self, AppState};
use crate::comms::relay_api::{self, RelayState};
use crate::security::token_sweep::spawn_token_sweeper;
use crate::security::AuthMode;
use crate::server::config::{GatewayConfig, RelayConfig};

/// Resolves on Ctrl+C.
pub async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn announce_auth_mode(mode: &AuthMode) {
    if *mode == AuthMode::Disabled {
        warn!("AUTH_MODE=disabled: every route is reachable without credentials");
    } else {
        info!(auth_mode = mode.label(), "authentication enabled");
    }
}

pub async fn run_gateway(config: GatewayConfig) -> Result<()> {
    info!(
        upstream = %config.upstream_url,
        port = config.listen_port,
        token_ttl_hours = config.token_ttl.num_hours(),
        "gateway starting"
    );
    announce_auth_mode(&config.auth_mode);

    let state = Arc::new(AppState::new(&config)?);

    let sweeper = config.sweep_interval.map(|period| {
        info!(interval_secs = period.as_secs(), "token sweeper started");
        spawn_token_sweeper(state.issuer.clone(), period)
    });

    let result = local_api::serve(state, config.listen_port).await;

    if let Some(handle) = sweeper {
        handle.abort();
        let _ = handle.await;
    }
    result
}

pub async fn run_relay(config: RelayConfig) -> Result<()> {
    info!(
        gateway = %config.gateway_url,
        port = config.listen_port,
        "relay starting"
    );
    announce_auth_mode(&config.auth_mode);

    let state = Arc::new(RelayState::new(&config)?);
    let session = state.session.clone();

    let result = relay_api::serve(state, config.listen_port).await;

    if session.release().await {
        info!("revoked relay token on shutdown");
    }
    result
}
