use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tagbridge_core::constants::DEFAULT_SERVER_PORT;

/// Distribution server settings.
///
/// ```
/// use tagbridge_network::ServerConfig;
///
/// let config = ServerConfig::default();
/// assert_eq!(config.bind_addr.to_string(), "0.0.0.0:3001");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP and WebSocket listener to
    pub bind_addr: SocketAddr,

    /// Largest accepted WebSocket message in bytes
    pub max_message_size: usize,

    /// Messages buffered per subscriber before it is considered lagging
    pub subscriber_queue: usize,

    /// Interval between WebSocket keep-alive pings in seconds
    pub ping_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_SERVER_PORT)),
            max_message_size: 64 * 1024,
            subscriber_queue: 64,
            ping_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}
