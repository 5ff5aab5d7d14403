pub mod config;
pub mod daemon;

pub use config::{GatewayConfig, RelayConfig, Settings};
