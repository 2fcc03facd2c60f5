//! Server configuration.
//!
//! Every knob has a default suitable for local development; `from_env`
//! overrides them from `EMBERDB_*` environment variables. Unparsable values
//! are logged and fall back to the default rather than aborting startup.

use std::str::FromStr;

use tracing::warn;

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 15432;

/// Default cap on concurrent client connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Default capacity of each worker's hand-off queue.
pub const DEFAULT_QUEUE_SIZE: usize = 128;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: usize = 128;

/// Configuration for the network front-end.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, as an IP literal.
    pub host: String,
    /// TCP port; 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Size of the I/O worker pool.
    pub num_workers: usize,
    /// Upper bound on concurrent sockets; excess accepts are closed
    /// immediately.
    pub max_connections: usize,
    /// Capacity of each worker's hand-off queue.
    pub queue_size: usize,
    /// Listen backlog for the server socket.
    pub backlog: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            num_workers: default_workers(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            queue_size: DEFAULT_QUEUE_SIZE,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from `EMBERDB_*` environment variables, falling
    /// back to defaults for anything absent or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("EMBERDB_HOST").unwrap_or(defaults.host),
            port: env_or("EMBERDB_PORT", defaults.port),
            num_workers: env_or("EMBERDB_WORKERS", defaults.num_workers).max(1),
            max_connections: env_or("EMBERDB_MAX_CONNECTIONS", defaults.max_connections).max(1),
            queue_size: env_or("EMBERDB_QUEUE_SIZE", defaults.queue_size).max(1),
            backlog: env_or("EMBERDB_BACKLOG", defaults.backlog).max(1),
        }
    }
}

/// One worker per hardware thread.
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparsable configuration value, using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.num_workers >= 1);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.queue_size, DEFAULT_QUEUE_SIZE);
        assert_eq!(config.backlog, DEFAULT_BACKLOG);
    }

    #[test]
    fn test_from_env_overrides_and_falls_back() {
        std::env::set_var("EMBERDB_PORT", "6000");
        std::env::set_var("EMBERDB_WORKERS", "3");
        std::env::set_var("EMBERDB_QUEUE_SIZE", "not-a-number");

        let config = ServerConfig::from_env();
        assert_eq!(config.port, 6000);
        assert_eq!(config.num_workers, 3);
        assert_eq!(config.queue_size, DEFAULT_QUEUE_SIZE);

        std::env::remove_var("EMBERDB_PORT");
        std::env::remove_var("EMBERDB_WORKERS");
        std::env::remove_var("EMBERDB_QUEUE_SIZE");
    }
}
