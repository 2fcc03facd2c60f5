/// Errors that prevent the server from starting or keep it from running.
///
/// These are the only errors that escape the network layer; anything
/// scoped to a single connection is handled in place.
#[derive(Debug)]
pub enum ServerError {
    /// The configured host/port did not parse as a socket address.
    InvalidAddress(String),
    /// Creating, binding or listening on the server socket failed.
    Bind(std::io::Error),
    /// The event demultiplexer could not be created or polled.
    Reactor(std::io::Error),
    /// An I/O worker thread could not be started.
    WorkerSpawn(std::io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::InvalidAddress(addr) => write!(f, "invalid listen address: {}", addr),
            ServerError::Bind(e) => write!(f, "failed to bind server socket: {}", e),
            ServerError::Reactor(e) => write!(f, "reactor error: {}", e),
            ServerError::WorkerSpawn(e) => write!(f, "failed to spawn worker: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}
