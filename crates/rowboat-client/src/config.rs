use std::time::Duration;

/// Tunables for the client connection runtime.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// First reconnect delay; doubles per attempt.
    pub reconnect_min_delay: Duration,
    /// Cap on the reconnect delay.
    pub reconnect_max_delay: Duration,
    /// How often a ping is sent while connected.
    pub heartbeat_interval: Duration,
    /// No pong within this window means the socket is dead.
    pub heartbeat_timeout: Duration,
    /// How long subscribe/fetch waits for a snapshot.
    pub fetch_timeout: Duration,
    /// How long submit waits for an acknowledgment.
    pub submit_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_min_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(5),
            submit_timeout: Duration::from_secs(5),
        }
    }
}
