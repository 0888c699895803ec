//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
pub const DEFAULT_OFFLINE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub listen: SocketAddr,
    /// Default wait for an agent to go offline after an `offline` request.
    pub offline_timeout: Duration,
    /// Wall-clock ceiling for the shutdown sequence.
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    #[must_use]
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            offline_timeout: Duration::from_millis(DEFAULT_OFFLINE_TIMEOUT_MS),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        }
    }
}
