//! Environment-driven configuration.

use std::time::Duration;

/// Read at startup; every field has a default so the daemon runs with no
/// environment at all.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for the peer protocol.
    pub bind: String,
    /// When set, also dial out to this receiver (reverse mode).
    pub reverse_host: Option<String>,
    pub reverse_port: u16,
    /// Delay between reverse-mode reconnect attempts.
    pub reconnect_interval: Duration,
    /// How often the statistics summary is logged.
    pub stats_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3240".to_owned(),
            reverse_host: None,
            reverse_port: 3240,
            reconnect_interval: Duration::from_secs(5),
            stats_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(bind) = std::env::var("USBLINK_BIND") {
            cfg.bind = bind;
        }
        if let Ok(host) = std::env::var("USBLINK_REVERSE_HOST") {
            if !host.is_empty() {
                cfg.reverse_host = Some(host);
            }
        }
        if let Ok(port) = std::env::var("USBLINK_REVERSE_PORT") {
            if let Ok(port) = port.parse() {
                cfg.reverse_port = port;
            }
        }
        if let Ok(secs) = std::env::var("USBLINK_RECONNECT_SECS") {
            if let Ok(secs) = secs.parse() {
                cfg.reconnect_interval = Duration::from_secs(secs);
            }
        }
        cfg
    }
}
