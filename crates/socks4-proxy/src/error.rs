//! Error types for the proxy server

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Reasons a SOCKS4 request fails wire-format validation
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedRequest {
    #[error("request too short: {0} bytes")]
    TooShort(usize),

    #[error("unsupported version: {0}")]
    BadVersion(u8),

    #[error("unknown command: {0}")]
    UnknownCommand(u8),
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(#[from] MalformedRequest),

    #[error("Connect to {addr} timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("Connect to {addr} failed: {source}")]
    DialFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command not supported: {0}")]
    CommandNotSupported(&'static str),

    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn dial_failed(addr: impl Into<String>, source: std::io::Error) -> Self {
        Self::DialFailed {
            addr: addr.into(),
            source,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error came from the outbound dial rather than the client
    pub fn is_dial_failure(&self) -> bool {
        matches!(self, Self::DialTimeout { .. } | Self::DialFailed { .. })
    }

    /// Whether the client was answered with a rejection because of this error
    pub fn is_rejection(&self) -> bool {
        self.is_dial_failure()
            || matches!(self, Self::MalformedRequest(_) | Self::CommandNotSupported(_))
    }
}

impl From<prometheus::Error> for ProxyError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}
