//! HTTP server for the operator API.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use super::routes::{AppState, routes};
use crate::config::DEFAULT_HTTP_PORT;
use crate::orchestrator::FarmControl;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_HTTP_PORT,
        }
    }
}

impl From<SocketAddr> for ServerConfig {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

/// Serve the operator API until SIGINT, SIGTERM or `POST /shutdown`.
pub async fn serve(config: ServerConfig, farm: Arc<dyn FarmControl>) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = routes(AppState::new(farm, shutdown_tx));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Operator API listening on {}", actual_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_rx))
        .await?;

    info!("Operator API stopped");
    Ok(())
}

/// Wait for SIGINT, SIGTERM or the /shutdown endpoint.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when the
/// tokio runtime is misconfigured. That is unrecoverable at startup.
async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let explicit_shutdown = async {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = explicit_shutdown => {
            info!("Shutdown requested via /shutdown endpoint...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3105);
    }

    #[test]
    fn server_config_from_addr() {
        let config = ServerConfig::from("0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
    }
}
