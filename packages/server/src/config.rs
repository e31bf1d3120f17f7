//! Server configuration.

use std::time::Duration;

/// Default listening port
pub const DEFAULT_PORT: u16 = 12345;

/// Default maximum number of concurrently admitted clients
pub const DEFAULT_MAX_CLIENTS: usize = 50;

/// How long shutdown waits for session tasks before aborting them
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Process-wide server settings, fixed once the server is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// The host address to bind to (e.g., "127.0.0.1")
    pub host: String,
    /// The port number to bind to; `0` picks an ephemeral port
    pub port: u16,
    /// Connections beyond this many are closed on accept
    pub max_clients: usize,
    /// Bounded wait for in-flight sessions during shutdown
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// The `host:port` string passed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}
