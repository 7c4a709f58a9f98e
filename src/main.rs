//! `transportd`: runs the listeners of a transport configuration file.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ConnectInfo;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use std::net::SocketAddr;

use http_ws_transport::config::loader::load_config;
use http_ws_transport::observability::{logging, metrics};
use http_ws_transport::{HttpWsConnectorFactory, ServerConnector, Shutdown};

#[derive(Parser)]
#[command(name = "transportd")]
#[command(about = "HTTP/WebSocket transport daemon", long_about = None)]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(short, long, default_value = "transport.toml")]
    config: PathBuf,
}

fn status_router() -> Router {
    Router::new().route("/health", get(health))
}

async fn health(ConnectInfo(peer): ConnectInfo<SocketAddr>) -> &'static str {
    tracing::trace!(peer = %peer, "Health probe");
    "ok"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    logging::init_logging(&config.observability.log_level);
    tracing::info!("transportd v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let factory = HttpWsConnectorFactory::new(status_router());
    let mut connectors: Vec<ServerConnector> = Vec::with_capacity(config.listeners.len());

    for listener in &config.listeners {
        let connector = factory.create_server_connector(&config.server_socket, listener)?;
        let outcome = connector.start()?.wait().await;
        match outcome {
            Ok(addr) => {
                tracing::info!(connector_id = %connector.id(), address = %addr, "Listener ready");
                connectors.push(connector);
            }
            Err(e) => {
                tracing::error!(connector_id = %connector.id(), error = %e, "Listener failed to start");
            }
        }
    }

    if connectors.is_empty() {
        tracing::warn!("No listener is running");
    }

    let shutdown = Arc::new(Shutdown::new());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutdown signal received"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
            }
            shutdown.trigger();
        });
    }
    shutdown.wait().await;

    // stop() blocks until each listening socket is closed.
    let stopped = tokio::task::spawn_blocking(move || {
        connectors.iter().filter(|connector| connector.stop()).count()
    })
    .await?;
    factory.shutdown();

    tracing::info!(stopped, "Shutdown complete");
    Ok(())
}
