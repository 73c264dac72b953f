//! Bidirectional relay between a client and the destination it asked for

use crate::metrics::ProxyMetrics;
use std::fmt;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Which end of a relay an event happened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Destination,
}

impl Side {
    fn opposite(self) -> Self {
        match self {
            Self::Client => Self::Destination,
            Self::Destination => Self::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Destination => write!(f, "destination"),
        }
    }
}

/// Why a relay stopped. None of these are reported as failures.
#[derive(Debug)]
pub enum RelayEnd {
    /// Zero-length read
    Closed(Side),
    /// Connection reset by peer
    Reset(Side),
    /// Any other socket error, including error readiness
    Error(Side, io::Error),
}

impl RelayEnd {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Closed(_) => "closed",
            Self::Reset(_) => "reset",
            Self::Error(..) => "error",
        }
    }
}

impl fmt::Display for RelayEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(side) => write!(f, "{} closed", side),
            Self::Reset(side) => write!(f, "{} reset", side),
            Self::Error(side, e) => write!(f, "{} error: {}", side, e),
        }
    }
}

/// Summary of a finished relay
#[derive(Debug)]
pub struct RelayStats {
    pub client_to_destination: u64,
    pub destination_to_client: u64,
    pub end: RelayEnd,
}

/// A client socket and its dialed destination, owned by one relay task.
///
/// Both sockets are closed together, either by [`RelayPair::close`] or on drop.
pub struct RelayPair {
    client: Option<TcpStream>,
    destination: Option<TcpStream>,
    peer_addr: SocketAddr,
    buffer_size: usize,
}

impl RelayPair {
    pub fn new(
        client: TcpStream,
        destination: TcpStream,
        peer_addr: SocketAddr,
        buffer_size: usize,
    ) -> Self {
        Self {
            client: Some(client),
            destination: Some(destination),
            peer_addr,
            buffer_size,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_none() && self.destination.is_none()
    }

    /// Close both sockets. Calling this again does nothing.
    pub fn close(&mut self) {
        drop(self.client.take());
        drop(self.destination.take());
    }

    /// Start the relay on its own task
    pub fn spawn(self, metrics: ProxyMetrics) -> tokio::task::JoinHandle<RelayStats> {
        tokio::spawn(async move {
            metrics.relay_started();
            let stats = self.run().await;
            metrics.relay_finished(&stats);
            stats
        })
    }

    /// Forward bytes in both directions until either side closes or fails.
    pub async fn run(mut self) -> RelayStats {
        let peer_addr = self.peer_addr;
        let mut buffer = vec![0u8; self.buffer_size];
        let mut client_to_destination = 0u64;
        let mut destination_to_client = 0u64;

        let end = loop {
            let (client, destination) = match (&self.client, &self.destination) {
                (Some(client), Some(destination)) => (client, destination),
                _ => break RelayEnd::Error(Side::Client, io::Error::from(ErrorKind::NotConnected)),
            };

            let (side, ready) = match wait_readable(client, destination).await {
                Ok(event) => event,
                Err((side, e)) => break RelayEnd::Error(side, e),
            };

            if ready.is_error() {
                let (source, _) = pick(side, client, destination);
                let err = source
                    .take_error()
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| io::Error::from(ErrorKind::Other));
                debug!("Error readiness on {} socket of {}: {}", side, peer_addr, err);
                break match err.kind() {
                    ErrorKind::ConnectionReset => RelayEnd::Reset(side),
                    _ => RelayEnd::Error(side, err),
                };
            }

            let (source, sink) = pick(side, client, destination);
            let n = match source.try_read(&mut buffer) {
                Ok(0) => break RelayEnd::Closed(side),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => break RelayEnd::Reset(side),
                Err(e) => break RelayEnd::Error(side, e),
            };

            if let Err(e) = write_all(sink, &buffer[..n]).await {
                let other = side.opposite();
                break match e.kind() {
                    ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => RelayEnd::Reset(other),
                    _ => RelayEnd::Error(other, e),
                };
            }

            match side {
                Side::Client => client_to_destination += n as u64,
                Side::Destination => destination_to_client += n as u64,
            }
        };

        self.close();

        info!(
            "Relay for {} finished ({}): {} bytes up, {} bytes down",
            peer_addr, end, client_to_destination, destination_to_client
        );

        RelayStats {
            client_to_destination,
            destination_to_client,
            end,
        }
    }
}

impl Drop for RelayPair {
    fn drop(&mut self) {
        self.close();
    }
}

/// Block until either socket is readable or reports an error.
async fn wait_readable(
    client: &TcpStream,
    destination: &TcpStream,
) -> Result<(Side, Ready), (Side, io::Error)> {
    let interest = Interest::READABLE | Interest::ERROR;
    tokio::select! {
        ready = client.ready(interest) => ready
            .map(|r| (Side::Client, r))
            .map_err(|e| (Side::Client, e)),
        ready = destination.ready(interest) => ready
            .map(|r| (Side::Destination, r))
            .map_err(|e| (Side::Destination, e)),
    }
}

fn pick<'a>(
    side: Side,
    client: &'a TcpStream,
    destination: &'a TcpStream,
) -> (&'a TcpStream, &'a TcpStream) {
    match side {
        Side::Client => (client, destination),
        Side::Destination => (destination, client),
    }
}

/// Write the whole buffer, looping over partial writes.
async fn write_all(stream: &TcpStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        stream.writable().await?;
        match stream.try_write(data) {
            Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
            Ok(n) => {
                data = &data[n..];
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
