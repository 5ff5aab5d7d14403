use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use token_gate::server::{daemon, GatewayConfig, RelayConfig};
use token_gate::utils;

#[derive(Parser)]
#[command(name = "token-gate", version, about = "Token-authenticated streaming proxy")]
struct AppCli {
    /// JSON config file (environment variables are read when omitted)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway: token issuer plus authenticated proxy
    Serve {
        /// Overrides LISTEN_PORT
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the relay in front of a remote gateway
    Relay {
        /// Overrides LISTEN_PORT
        #[arg(long)]
        port: Option<u16>,
    },
}

fn gateway_config(path: Option<&str>, port: Option<u16>) -> Result<GatewayConfig> {
    let config = match path {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::from_env()?,
    };
    Ok(match port {
        Some(port) => config.with_listen_port(port),
        None => config,
    })
}

fn relay_config(path: Option<&str>, port: Option<u16>) -> Result<RelayConfig> {
    let config = match path {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::from_env()?,
    };
    Ok(match port {
        Some(port) => config.with_listen_port(port),
        None => config,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let args = AppCli::parse();
    info!(version = token_gate::VERSION, "token-gate starting");

    match args.command {
        Some(Commands::Relay { port }) => {
            let config = relay_config(args.config.as_deref(), port)?;
            daemon::run_relay(config).await?;
        }
        Some(Commands::Serve { port }) => {
            let config = gateway_config(args.config.as_deref(), port)?;
            daemon::run_gateway(config).await?;
        }
        None => {
            // Default: run the gateway
            let config = gateway_config(args.config.as_deref(), None)?;
            daemon::run_gateway(config).await?;
        }
    }

    Ok(())
}
