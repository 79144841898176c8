//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

/// Default incoming message size limit (1 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default outbound queue size; the hard cap is four times this
pub const DEFAULT_QUEUE_SIZE: usize = 512;

/// Default text frames accepted per rolling second
pub const DEFAULT_MAX_RATE_PER_SECOND: usize = 20;

/// Per-connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest inbound message accepted
    pub max_message_size: usize,

    /// Nominal outbound queue size
    pub queue_size: usize,

    /// Text frames allowed per rolling second (0 = unlimited)
    pub max_rate_per_second: usize,

    /// Read deadline, refreshed by every inbound frame
    pub pong_wait: Duration,

    /// Interval between keepalive pings (must be below `pong_wait`)
    pub ping_period: Duration,

    /// Deadline for a single write
    pub write_wait: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            queue_size: DEFAULT_QUEUE_SIZE,
            max_rate_per_second: DEFAULT_MAX_RATE_PER_SECOND,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    /// Messages held before new ones are dropped
    pub fn max_queue_size(&self) -> usize {
        self.queue_size * 4
    }

    /// Set the incoming size limit
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the nominal queue size
    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = size.max(1);
        self
    }

    /// Set the inbound rate limit
    pub fn max_rate_per_second(mut self, rate: usize) -> Self {
        self.max_rate_per_second = rate;
        self
    }

    /// Set the read deadline; the ping period follows at 90%
    pub fn pong_wait(mut self, wait: Duration) -> Self {
        self.pong_wait = wait;
        self.ping_period = wait * 9 / 10;
        self
    }

    /// Set the write deadline
    pub fn write_wait(mut self, wait: Duration) -> Self {
        self.write_wait = wait;
        self
    }
}

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Path of the WebSocket upgrade endpoint
    pub ws_path: String,

    /// Version reported to clients in `Self` replies
    pub version: String,

    /// Per-connection settings
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 0, // Unlimited
            ws_path: "/ws".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Load from `SIGNAL_RELAY_*` environment variables
    ///
    /// Unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let connection = ConnectionConfig::default();

        let bind_addr = env_parse("SIGNAL_RELAY_BIND").unwrap_or(defaults.bind_addr);
        let max_connections =
            env_parse("SIGNAL_RELAY_MAX_CONNECTIONS").unwrap_or(defaults.max_connections);
        let ws_path = std::env::var("SIGNAL_RELAY_WS_PATH")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| v.starts_with('/'))
            .unwrap_or(defaults.ws_path);
        let max_message_size = env_parse("SIGNAL_RELAY_MAX_MESSAGE_SIZE")
            .unwrap_or(connection.max_message_size);
        let queue_size = env_parse("SIGNAL_RELAY_QUEUE_SIZE").unwrap_or(connection.queue_size);
        let rate = env_parse("SIGNAL_RELAY_MAX_RATE_PER_SECOND")
            .unwrap_or(connection.max_rate_per_second);
        let pong_wait = env_parse("SIGNAL_RELAY_PONG_WAIT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(connection.pong_wait);

        Self {
            bind_addr,
            max_connections,
            ws_path,
            version: defaults.version,
            connection: connection
                .max_message_size(max_message_size)
                .queue_size(queue_size)
                .max_rate_per_second(rate)
                .pong_wait(pong_wait),
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the WebSocket endpoint path
    pub fn ws_path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = path.into();
        self
    }

    /// Set per-connection settings
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.max_connections, 0);
        assert_eq!(config.ws_path, "/ws");
        assert_eq!(config.connection.max_message_size, 1024 * 1024);
        assert_eq!(config.connection.max_queue_size(), 2048);
        assert_eq!(config.connection.max_rate_per_second, 20);
        assert_eq!(config.connection.ping_period, Duration::from_secs(54));
        assert_eq!(config.connection.write_wait, Duration::from_secs(10));
    }

    #[test]
    fn test_with_addr() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let config = ServerConfig::with_addr(addr);

        assert_eq!(config.bind_addr.port(), 9000);
    }

    #[test]
    fn test_builder_pong_wait_moves_ping_period() {
        let config = ConnectionConfig::default().pong_wait(Duration::from_secs(10));

        assert_eq!(config.pong_wait, Duration::from_secs(10));
        assert_eq!(config.ping_period, Duration::from_secs(9));
    }

    #[test]
    fn test_builder_queue_size_not_zero() {
        let config = ConnectionConfig::default().queue_size(0);

        assert_eq!(config.queue_size, 1);
        assert_eq!(config.max_queue_size(), 4);
    }

    #[test]
    fn test_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:8443".parse().unwrap();
        let config = ServerConfig::default()
            .bind(addr)
            .max_connections(50)
            .ws_path("/signaling")
            .connection(ConnectionConfig::default().max_rate_per_second(5));

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.ws_path, "/signaling");
        assert_eq!(config.connection.max_rate_per_second, 5);
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("SIGNAL_RELAY_MAX_CONNECTIONS", "12");
        std::env::set_var("SIGNAL_RELAY_WS_PATH", "not-a-path");
        let config = ServerConfig::from_env();
        std::env::remove_var("SIGNAL_RELAY_MAX_CONNECTIONS");
        std::env::remove_var("SIGNAL_RELAY_WS_PATH");

        assert_eq!(config.max_connections, 12);
        assert_eq!(config.ws_path, "/ws");
    }
}
