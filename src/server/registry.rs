use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Interest;
use parking_lot::Mutex;

use crate::server::connection::Connection;

/// Shard count; a power of two so the modulo is a mask. Shards spread
/// unrelated fds across locks, while the per-connection mutex is what
/// serializes work on any one fd.
const SHARDS: usize = 16;

/// Process-wide table of connections, keyed by file descriptor.
///
/// A slot is created the first time an fd number is accepted and is then
/// recycled for the life of the process: when the OS hands the same number
/// out again, the existing connection object is reset in place rather than
/// reallocated. Slots are only ever mutated by the worker that currently
/// owns the fd.
pub struct Registry {
    shards: Vec<Mutex<HashMap<RawFd, Arc<Mutex<Connection>>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, fd: RawFd) -> &Mutex<HashMap<RawFd, Arc<Mutex<Connection>>>> {
        &self.shards[fd as usize % SHARDS]
    }

    /// Looks up the connection at slot `fd`.
    pub fn get(&self, fd: RawFd) -> Option<Arc<Mutex<Connection>>> {
        self.shard(fd).lock().get(&fd).cloned()
    }

    /// Adopts a freshly accepted socket: inserts a new connection if the fd
    /// has never been seen, otherwise resets the existing slot for the
    /// recycled fd. Registration with the adopting worker's reactor happens
    /// inside.
    pub(crate) fn create_or_reset(
        &self,
        fd: RawFd,
        stream: TcpStream,
        interest: Interest,
        reactor: Arc<mio::Registry>,
        worker: usize,
    ) -> io::Result<Arc<Mutex<Connection>>> {
        let existing = self.shard(fd).lock().get(&fd).cloned();
        match existing {
            Some(slot) => {
                slot.lock().reset(stream, interest, reactor, worker)?;
                Ok(slot)
            }
            None => {
                let conn = Connection::new(stream, interest, reactor, worker)?;
                let slot = Arc::new(Mutex::new(conn));
                self.shard(fd).lock().insert(fd, slot.clone());
                Ok(slot)
            }
        }
    }

    /// Every slot in the table, open or not. Used at worker shutdown to
    /// close what that worker still owns.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Mutex<Connection>>> {
        let mut all = Vec::new();
        for shard in &self.shards {
            all.extend(shard.lock().values().cloned());
        }
        all
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn tcp_pair() -> (std::net::TcpStream, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, TcpStream::from_std(server))
    }

    #[test]
    fn test_lookup_miss() {
        let registry = Registry::new();
        assert!(registry.get(42).is_none());
    }

    #[test]
    fn test_create_then_get() {
        let poll = mio::Poll::new().unwrap();
        let reactor = Arc::new(poll.registry().try_clone().unwrap());
        let registry = Registry::new();

        let (_client, server) = tcp_pair();
        let fd = server.as_raw_fd();
        let slot = registry
            .create_or_reset(fd, server, Interest::READABLE, reactor, 0)
            .unwrap();

        let found = registry.get(fd).expect("slot should exist");
        assert!(Arc::ptr_eq(&slot, &found));
        assert_eq!(found.lock().fd(), fd);
    }

    #[test]
    fn test_recycled_fd_reuses_slot() {
        let poll = mio::Poll::new().unwrap();
        let reactor = Arc::new(poll.registry().try_clone().unwrap());
        let registry = Registry::new();

        let (_client, server) = tcp_pair();
        let fd = server.as_raw_fd();
        let first = registry
            .create_or_reset(fd, server, Interest::READABLE, reactor.clone(), 0)
            .unwrap();
        first.lock().close();

        // Adopt a new socket under the same slot key, as happens when the
        // OS recycles the fd number after a close.
        let (_client2, server2) = tcp_pair();
        let second = registry
            .create_or_reset(fd, server2, Interest::READABLE, reactor, 1)
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        let conn = second.lock();
        assert!(!conn.is_disconnected());
        assert!(!conn.is_closed());
        assert_eq!(conn.worker(), 1);
    }

    #[test]
    fn test_snapshot_sees_all_slots() {
        let poll = mio::Poll::new().unwrap();
        let reactor = Arc::new(poll.registry().try_clone().unwrap());
        let registry = Registry::new();

        let mut keep = Vec::new();
        for _ in 0..3 {
            let (client, server) = tcp_pair();
            let fd = server.as_raw_fd();
            registry
                .create_or_reset(fd, server, Interest::READABLE, reactor.clone(), 0)
                .unwrap();
            keep.push(client);
        }
        assert_eq!(registry.snapshot().len(), 3);
    }
}
