//! Proxy server configuration

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

/// Smallest request the decoder accepts; the read buffer can never be smaller.
const MIN_BUFFER_SIZE: usize = 9;

/// Proxy server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listen address
    pub bind_host: Ipv4Addr,

    /// Listen port
    pub port: u16,

    /// Accept backlog of the listening socket
    pub backlog: u32,

    /// Size of each relay read, also the cap on request size
    pub buffer_size: usize,

    /// Resolve SOCKS4a host names instead of dialing the placeholder address
    pub socks4a: bool,

    /// Default log filter when RUST_LOG is unset
    pub log_level: String,

    /// Timeout settings
    pub timeouts: TimeoutConfig,
}

/// Timeout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Outbound connect timeout
    pub connect: Duration,

    /// Time allowed for a client to deliver its request
    pub handshake: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_host: Ipv4Addr::UNSPECIFIED,
            port: 12345,
            backlog: 10,
            buffer_size: 4096,
            socks4a: false,
            log_level: "info".to_string(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(20),
            handshake: Duration::from_secs(10),
        }
    }
}

impl ProxyConfig {
    /// Get listen address
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.bind_host, self.port))
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(crate::ProxyError::config(format!(
                "buffer_size must be at least {} bytes, got {}",
                MIN_BUFFER_SIZE, self.buffer_size
            )));
        }
        if self.backlog == 0 {
            return Err(crate::ProxyError::config("backlog must be greater than 0"));
        }
        if self.timeouts.connect.is_zero() {
            return Err(crate::ProxyError::config("connect timeout must be non-zero"));
        }
        if self.timeouts.handshake.is_zero() {
            return Err(crate::ProxyError::config("handshake timeout must be non-zero"));
        }
        Ok(())
    }

    /// Load configuration from file
    pub async fn load_from_file(path: &Path) -> crate::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::ProxyError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> crate::Result<()> {
        tokio::fs::write(path, self.to_toml()?).await?;
        Ok(())
    }

    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::ProxyError::config(format!("Failed to serialize config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:12345".parse::<SocketAddr>().unwrap());
        assert_eq!(config.backlog, 10);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.timeouts.connect, Duration::from_secs(20));
        assert!(!config.socks4a);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_tiny_buffer() {
        let config = ProxyConfig {
            buffer_size: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = ProxyConfig::default();
        config.timeouts.connect = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::default();
        config.timeouts.handshake = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ProxyConfig = toml::from_str("port = 1080\nsocks4a = true\n").unwrap();
        assert_eq!(config.port, 1080);
        assert!(config.socks4a);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.timeouts, TimeoutConfig::default());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socks4d.toml");

        let mut config = ProxyConfig {
            bind_host: Ipv4Addr::LOCALHOST,
            port: 9050,
            ..Default::default()
        };
        config.timeouts.connect = Duration::from_millis(1500);

        config.save_to_file(&path).await.unwrap();
        let loaded = ProxyConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_load_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        tokio::fs::write(&path, "port = \"not a number\"").await.unwrap();

        assert!(ProxyConfig::load_from_file(&path).await.is_err());
    }
}
