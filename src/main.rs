//! canvas-bridge binary: load config, start the listener, run until Ctrl-C.

use std::process;

use tracing_subscriber::EnvFilter;

use canvas_bridge::adapters::websocket::{BridgeServer, Broker};
use canvas_bridge::config::AppConfig;

#[tokio::main]
async fn main() {
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            process::exit(1);
        }
    };
    if let Err(err) = config.validate() {
        eprintln!("invalid configuration: {err}");
        process::exit(1);
    }

    // RUST_LOG wins over the configured filter when set.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.server.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !config.server.is_loopback() {
        tracing::warn!(
            host = %config.server.host,
            "binding a non-loopback address; the socket carries no authentication"
        );
    }

    let broker = Broker::new(config.broker.clone());
    let server = BridgeServer::new(broker, config.server.clone());

    let addr = match server.start().await {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(%err, "failed to start listener");
            process::exit(1);
        }
    };
    tracing::info!(%addr, "canvas-bridge ready, press Ctrl-C to stop");

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for shutdown signal");
    }

    tracing::info!("shutting down");
    server.stop().await;
}
