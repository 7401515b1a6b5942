use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub shared_secret: String,
    /// Capacity of each subscriber's outbound channel; slow consumers that
    /// fall this far behind are evicted.
    pub channel_depth: usize,
    /// Close sessions that stay silent for this long; clients ping every
    /// 15s by default, so a healthy session never trips it.
    pub read_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("ROWBOAT_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            shared_secret: env::var("ROWBOAT_SHARED_SECRET")
                .unwrap_or_else(|_| "rowboat-dev-secret".to_string()),
            channel_depth: env::var("ROWBOAT_CHANNEL_DEPTH")
                .ok()
                .and_then(|d| d.parse().ok())
                .unwrap_or(64),
            read_timeout: env::var("ROWBOAT_READ_TIMEOUT_SECS")
                .ok()
                .and_then(|t| t.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(75)),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            shared_secret: "rowboat-dev-secret".to_string(),
            channel_depth: 64,
            read_timeout: Duration::from_secs(75),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}
