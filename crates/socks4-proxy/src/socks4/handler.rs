//! SOCKS4 server handler

use super::protocol::{read_request, request_frame_len, send_reply};
use super::{ClientRequest, Command, Reply, ReplyCode};
use crate::{
    config::ProxyConfig,
    error::{ProxyError, Result},
    metrics::ProxyMetrics,
    relay::RelayPair,
};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// SOCKS4 server implementation
#[derive(Clone)]
pub struct Socks4Server {
    config: Arc<ProxyConfig>,
    metrics: ProxyMetrics,
}

impl Socks4Server {
    /// Create a new SOCKS4 server
    pub fn new(config: Arc<ProxyConfig>, metrics: ProxyMetrics) -> Self {
        Self { config, metrics }
    }

    /// Handle an incoming SOCKS4 connection.
    ///
    /// Returns once the client has its reply. A granted CONNECT keeps running
    /// on its own relay task.
    pub async fn handle_connection(
        &self,
        mut client: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        debug!("New SOCKS4 connection from {}", peer_addr);

        let mut buf = read_request(
            &mut client,
            self.config.buffer_size,
            self.config.socks4a,
            self.config.timeouts.handshake,
        )
        .await?;

        // An empty buffer decodes as too short and is rejected like any other
        let request = match ClientRequest::decode(&buf) {
            Ok(request) => request,
            Err(e) => {
                self.metrics.record_request("malformed");
                self.reject(client).await?;
                return Err(e.into());
            }
        };

        self.metrics.record_request(request.command.as_str());

        // Bytes sent behind the request belong to the destination
        let frame_len = request_frame_len(&buf, self.config.socks4a || request.hostname.is_some())
            .unwrap_or(buf.len());
        let pending = buf.split_off(frame_len);
        debug!(
            "SOCKS4 {} from {} (userid {:?})",
            request,
            peer_addr,
            request.user_id_lossy()
        );

        match request.command {
            Command::Connect => {
                self.handle_connect(client, peer_addr, request, &pending)
                    .await
            }
            Command::Bind => {
                self.reject(client).await?;
                Err(ProxyError::CommandNotSupported("BIND"))
            }
        }
    }

    /// Dial the destination, reply, and start the relay on success
    async fn handle_connect(
        &self,
        mut client: TcpStream,
        peer_addr: SocketAddr,
        request: ClientRequest,
        pending: &[u8],
    ) -> Result<()> {
        let started = Instant::now();
        let dialed = self.dial(&request).await;
        self.metrics.record_dial(started.elapsed().as_secs_f64());

        let mut destination = match dialed {
            Ok(destination) => destination,
            Err(e) => {
                self.reject(client).await?;
                return Err(e);
            }
        };

        send_reply(&mut client, Reply::granted(&request)).await?;
        self.metrics.record_reply(ReplyCode::Granted.as_str());

        info!("SOCKS4 CONNECT from {} to {} granted", peer_addr, request);

        if !pending.is_empty() {
            debug!(
                "Forwarding {} bytes {} sent with its request",
                pending.len(),
                peer_addr
            );
            destination.write_all(pending).await?;
        }

        RelayPair::new(client, destination, peer_addr, self.config.buffer_size)
            .spawn(self.metrics.clone());

        Ok(())
    }

    /// One outbound connect attempt bounded by the connect timeout
    async fn dial(&self, request: &ClientRequest) -> Result<TcpStream> {
        let timeout = self.config.timeouts.connect;

        let connect = async {
            let target = match request.socks4a_hostname(self.config.socks4a) {
                Some(host) => resolve_ipv4(host, request.port).await?,
                None => SocketAddrV4::new(request.address, request.port),
            };
            debug!("Connecting to {}", target);
            TcpStream::connect(target).await
        };

        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProxyError::dial_failed(request.to_string(), e)),
            Err(_) => Err(ProxyError::DialTimeout {
                addr: request.to_string(),
                timeout,
            }),
        }
    }

    /// Send the single rejection reply and close the client
    async fn reject(&self, mut client: TcpStream) -> Result<()> {
        send_reply(&mut client, Reply::rejected()).await?;
        self.metrics.record_reply(ReplyCode::Rejected.as_str());
        if let Err(e) = client.shutdown().await {
            warn!("Failed to shut down rejected client: {}", e);
        }
        Ok(())
    }
}

/// Resolve a SOCKS4a host name to its first IPv4 address
async fn resolve_ipv4(host: &str, port: u16) -> std::io::Result<SocketAddrV4> {
    tokio::net::lookup_host((host, port))
        .await?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no IPv4 address for {}", host),
            )
        })
}
