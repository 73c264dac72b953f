//! SOCKS4 proxy daemon

use anyhow::{Context, Result};
use clap::Parser;
use socks4_proxy::{ProxyConfig, ProxyServer};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "socks4d",
    about = "Minimal SOCKS4/4a proxy server",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    host: Option<Ipv4Addr>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Accept backlog
    #[arg(long)]
    backlog: Option<u32>,

    /// Relay read buffer size in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Outbound connect timeout in seconds
    #[arg(long, value_name = "SECS")]
    connect_timeout: Option<u64>,

    /// Resolve SOCKS4a host names
    #[arg(long)]
    socks4a: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    dump_config: bool,
}

impl Cli {
    async fn load_config(&self) -> Result<ProxyConfig> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::load_from_file(path)
                .await
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ProxyConfig::default(),
        };

        if let Some(host) = self.host {
            config.bind_host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(backlog) = self.backlog {
            config.backlog = backlog;
        }
        if let Some(buffer_size) = self.buffer_size {
            config.buffer_size = buffer_size;
        }
        if let Some(secs) = self.connect_timeout {
            config.timeouts.connect = Duration::from_secs(secs);
        }
        if self.socks4a {
            config.socks4a = true;
        }
        if self.verbose {
            config.log_level = "debug".to_string();
        } else if self.quiet {
            config.log_level = "warn".to_string();
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config().await?;

    if cli.dump_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let server = ProxyServer::new(config)?;
    let listener = server.bind()?;

    tokio::select! {
        result = server.serve(listener) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Caught interrupt, exiting");
        }
    }

    debug!("Final metrics:\n{}", server.metrics().render()?);

    Ok(())
}
