//! Gateway binary: load config, boot, run until SIGINT.

use sluice::{Gateway, GatewayConfig};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("sluice.toml"), PathBuf::from);

    let config = match GatewayConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "failed to load configuration");
            std::process::exit(1);
        },
    };

    let gateway = match Gateway::start(config).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(error = %e, "gateway failed to start");
            std::process::exit(1);
        },
    };

    info!("gateway running; Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    gateway.shutdown().await;
}
