//! HTTP server implementation.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::service::BridgeService;

use super::routes::routes;

/// Request bodies larger than this are cut (or refused, see [`OversizePolicy`]).
pub const DEFAULT_MAX_BODY_BYTES: usize = 1 << 20;

/// What to do with a request body larger than the cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OversizePolicy {
    /// Forward the first `max_bytes` bytes and drop the rest.
    #[default]
    Truncate,
    /// Answer 413 without touching the worker channel.
    Reject,
}

impl FromStr for OversizePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "truncate" => Ok(Self::Truncate),
            "reject" => Ok(Self::Reject),
            other => Err(format!(
                "unknown oversize policy '{other}' (expected 'truncate' or 'reject')"
            )),
        }
    }
}

impl fmt::Display for OversizePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncate => f.write_str("truncate"),
            Self::Reject => f.write_str("reject"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyLimit {
    pub max_bytes: usize,
    pub policy: OversizePolicy,
}

impl Default for BodyLimit {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BODY_BYTES,
            policy: OversizePolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub body_limit: BodyLimit,
    /// Connections that do not finish sending headers in time are closed.
    pub header_read_timeout: Duration,
    /// How long in-flight connections get to finish after a shutdown signal.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            body_limit: BodyLimit::default(),
            header_read_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Start the HTTP server with provided service.
pub async fn serve(config: ServerConfig, service: Arc<BridgeService>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;

    run(listener, config, service, shutdown_signal()).await
}

/// Serve connections from `listener` until `shutdown` resolves.
///
/// Each connection runs on its own task. After shutdown, in-flight
/// connections get `shutdown_grace` to finish, then the worker channel is
/// closed.
pub async fn run<F>(
    listener: TcpListener,
    config: ServerConfig,
    service: Arc<BridgeService>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let app = routes(Arc::clone(&service), config.body_limit);

    let mut http = http1::Builder::new();
    http.timer(TokioTimer::new())
        .header_read_timeout(config.header_read_timeout);

    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);

    info!("Starting pipebridge server on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };

                let conn = http.serve_connection(
                    TokioIo::new(stream),
                    TowerToHyperService::new(app.clone()),
                );
                let conn = graceful.watch(conn);

                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(%peer, error = %e, "Connection ended with error");
                    }
                });
            }
            _ = &mut shutdown => break,
        }
    }

    drop(listener);

    tokio::select! {
        _ = graceful.shutdown() => {
            info!("All connections drained");
        }
        _ = tokio::time::sleep(config.shutdown_grace) => {
            warn!(grace = ?config.shutdown_grace, "Timed out draining connections");
        }
    }

    service.close(config.shutdown_grace).await;

    info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This can only happen if
/// the tokio runtime is not properly initialized, an unrecoverable
/// configuration error that should fail fast at startup.
async fn shutdown_signal() {
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

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
