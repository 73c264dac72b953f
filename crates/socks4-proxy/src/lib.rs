//! SOCKS4/4a Proxy Server Implementation
//!
//! This crate provides a SOCKS4 CONNECT proxy with optional SOCKS4a host
//! name resolution. Each accepted connection is handled on its own task and
//! each granted CONNECT is relayed on a further independent task.

pub mod config;
pub mod error;
pub mod metrics;
pub mod relay;
pub mod socks4;

pub use config::{ProxyConfig, TimeoutConfig};
pub use error::{MalformedRequest, ProxyError, Result};
pub use metrics::ProxyMetrics;

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info, warn};

/// Pause before accepting again once the process is out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Listener loop dispatching SOCKS4 connections
#[derive(Clone)]
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    metrics: ProxyMetrics,
}

impl ProxyServer {
    /// Create a new proxy server instance
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate()?;
        let metrics = ProxyMetrics::new()?;

        Ok(Self {
            config: Arc::new(config),
            metrics,
        })
    }

    /// Bind the listening socket with SO_REUSEADDR and the configured backlog
    pub fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.bind_address();
        let bind = || -> std::io::Result<TcpListener> {
            let socket = TcpSocket::new_v4()?;
            socket.set_reuseaddr(true)?;
            socket.bind(addr)?;
            socket.listen(self.config.backlog)
        };
        bind().map_err(|source| ProxyError::Bind { addr, source })
    }

    /// Bind and serve until the listening socket fails
    pub async fn start(&self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accept connections and hand each one to its own task
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("Starting SOCKS4 proxy server on {}", listener.local_addr()?);

        let socks_proxy = socks4::Socks4Server::new(self.config.clone(), self.metrics.clone());

        loop {
            let (socket, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_transient_accept_error(e.kind()) => {
                    warn!("Dropped incoming connection: {}", e);
                    continue;
                }
                Err(e) if is_fd_exhaustion(&e) => {
                    warn!("Pausing accept for {:?}: {}", ACCEPT_BACKOFF, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
                Err(e) => {
                    error!("Listener failed: {}", e);
                    return Err(e.into());
                }
            };
            let proxy = socks_proxy.clone();

            tokio::spawn(async move {
                handle_client(proxy, socket, peer_addr).await;
            });
        }
    }

    /// Get server configuration
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Get server metrics
    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }
}

async fn handle_client(proxy: socks4::Socks4Server, socket: TcpStream, peer_addr: SocketAddr) {
    match proxy.handle_connection(socket, peer_addr).await {
        Ok(()) => {}
        Err(e) if e.is_rejection() => {
            warn!("Rejected SOCKS4 request from {}: {}", peer_addr, e);
        }
        Err(e) => {
            debug!("SOCKS4 session from {} failed: {}", peer_addr, e);
        }
    }
}

/// Errors that concern a single pending connection, not the listener itself
fn is_transient_accept_error(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    )
}

/// EMFILE and ENFILE have no `ErrorKind` of their own
fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}
