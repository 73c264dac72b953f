//! Prometheus metrics for proxy server

use crate::error::Result;
use crate::relay::RelayStats;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Proxy server metrics
#[derive(Clone)]
pub struct ProxyMetrics {
    /// Decoded requests by command, plus malformed ones
    pub requests_total: IntCounterVec,

    /// Replies sent by result code
    pub replies_total: IntCounterVec,

    /// Outbound connect latency, successful or not
    pub dial_duration_seconds: Histogram,

    /// Relays currently forwarding
    pub relays_active: IntGauge,

    /// Bytes relayed
    pub bytes_relayed_total: IntCounterVec,

    /// How relays ended
    pub relays_ended_total: IntCounterVec,

    /// Registry
    registry: Registry,
}

impl ProxyMetrics {
    /// Create new metrics instance with its own registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("socks4_requests_total", "SOCKS4 requests received"),
            &["command"],
        )?;

        let replies_total = IntCounterVec::new(
            Opts::new("socks4_replies_total", "SOCKS4 replies sent"),
            &["result"],
        )?;

        let dial_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "socks4_dial_duration_seconds",
                "Outbound connect duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 20.0]),
        )?;

        let relays_active = IntGauge::new("socks4_relays_active", "Relays currently running")?;

        let bytes_relayed_total = IntCounterVec::new(
            Opts::new("socks4_bytes_relayed_total", "Bytes forwarded by relays"),
            &["direction"],
        )?;

        let relays_ended_total = IntCounterVec::new(
            Opts::new("socks4_relays_ended_total", "Finished relays by reason"),
            &["reason"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(replies_total.clone()))?;
        registry.register(Box::new(dial_duration_seconds.clone()))?;
        registry.register(Box::new(relays_active.clone()))?;
        registry.register(Box::new(bytes_relayed_total.clone()))?;
        registry.register(Box::new(relays_ended_total.clone()))?;

        Ok(Self {
            requests_total,
            replies_total,
            dial_duration_seconds,
            relays_active,
            bytes_relayed_total,
            relays_ended_total,
            registry,
        })
    }

    pub fn record_request(&self, command: &str) {
        self.requests_total.with_label_values(&[command]).inc();
    }

    pub fn record_reply(&self, result: &str) {
        self.replies_total.with_label_values(&[result]).inc();
    }

    pub fn record_dial(&self, seconds: f64) {
        self.dial_duration_seconds.observe(seconds);
    }

    pub fn relay_started(&self) {
        self.relays_active.inc();
    }

    pub fn relay_finished(&self, stats: &RelayStats) {
        self.relays_active.dec();
        self.bytes_relayed_total
            .with_label_values(&["upload"])
            .inc_by(stats.client_to_destination);
        self.bytes_relayed_total
            .with_label_values(&["download"])
            .inc_by(stats.destination_to_client);
        self.relays_ended_total
            .with_label_values(&[stats.end.reason()])
            .inc();
    }

    /// Render metrics in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::ProxyError::Metrics(e.to_string()))
    }
}
