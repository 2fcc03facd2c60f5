use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_queue::ArrayQueue;
use mio::net::{TcpStream, UnixStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, trace, warn};

use crate::protocol::ProtocolFactory;
use crate::server::registry::Registry;
use crate::server::state;

/// Token reserved for the wake pipe in every reactor.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// One record of the acceptor-to-worker hand-off: a freshly accepted socket
/// and the readiness mask to register it under.
pub(crate) struct HandOff {
    pub stream: TcpStream,
    pub interest: Interest,
}

/// Cross-thread face of a worker: the hand-off queue, the write end of the
/// wake pipe, and the controls for stopping the thread.
pub(crate) struct WorkerHandle {
    pub id: usize,
    pub queue: Arc<ArrayQueue<HandOff>>,
    wake: UnixStream,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Unblocks the worker's reactor. One byte is enough: the worker drains
    /// the pipe and the queue in batches, so a single pending byte covers
    /// any number of enqueues.
    pub fn wake(&self) {
        loop {
            match (&self.wake).write(&[1u8]) {
                Ok(_) => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // A full pipe already guarantees a pending wake-up.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "wake write failed");
                    return;
                }
            }
        }
    }

    /// Whether the worker thread is still running. A worker only dies on a
    /// reactor failure; the acceptor stops dispatching to it then.
    pub fn is_alive(&self) -> bool {
        self.thread.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Signals the worker to break its reactor loop and waits for it.
    pub fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.wake();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(worker = self.id, "worker thread panicked");
            }
        }
    }
}

/// An I/O worker: one reactor, one wake pipe, one hand-off queue. Runs the
/// state machine for every connection it has adopted; after hand-off all
/// I/O for a connection stays on this thread.
pub(crate) struct Worker {
    id: usize,
    poll: Poll,
    wake_rx: UnixStream,
    queue: Arc<ArrayQueue<HandOff>>,
    stop: Arc<AtomicBool>,
    registry: Arc<Registry>,
    factory: ProtocolFactory,
    /// Process-wide count of live connections, shared with the acceptor.
    live: Arc<AtomicUsize>,
}

impl Worker {
    pub fn spawn(
        id: usize,
        queue_size: usize,
        registry: Arc<Registry>,
        factory: ProtocolFactory,
        live: Arc<AtomicUsize>,
    ) -> io::Result<WorkerHandle> {
        let poll = Poll::new()?;
        let (mut wake_rx, wake_tx) = UnixStream::pair()?;
        poll.registry()
            .register(&mut wake_rx, WAKE_TOKEN, Interest::READABLE)?;
        let queue = Arc::new(ArrayQueue::new(queue_size));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            id,
            poll,
            wake_rx,
            queue: queue.clone(),
            stop: stop.clone(),
            registry,
            factory,
            live,
        };
        let thread = std::thread::Builder::new()
            .name(format!("emberdb-worker-{id}"))
            .spawn(move || worker.run())?;

        Ok(WorkerHandle {
            id,
            queue,
            wake: wake_tx,
            stop,
            thread: Some(thread),
        })
    }

    fn run(mut self) {
        let reactor = match self.poll.registry().try_clone() {
            Ok(r) => Arc::new(r),
            Err(e) => {
                error!(worker = self.id, error = %e, "reactor handle unavailable");
                return;
            }
        };
        info!(worker = self.id, "worker started");

        let mut events = Events::with_capacity(1024);
        'outer: loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = self.id, error = %e, "reactor failed");
                break;
            }
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    if self.on_wake(&reactor) {
                        break 'outer;
                    }
                } else {
                    self.drive(event.token().0 as RawFd);
                }
            }
            if self.stop.load(Ordering::Acquire) {
                break;
            }
        }
        self.shutdown();
    }

    /// Drains the wake pipe until it would block, then drains the hand-off
    /// queue, adopting each record. Returns true when the pipe is closed,
    /// meaning the acceptor is gone and this worker should wind down.
    fn on_wake(&mut self, reactor: &Arc<mio::Registry>) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match self.wake_rx.read(&mut buf) {
                Ok(0) => {
                    debug!(worker = self.id, "wake pipe closed");
                    return true;
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "wake pipe read failed");
                    break;
                }
            }
        }
        if self.stop.load(Ordering::Acquire) {
            // Winding down; shutdown() will dispose of the queue.
            return false;
        }
        while let Some(item) = self.queue.pop() {
            self.adopt(item, reactor);
        }
        false
    }

    fn adopt(&mut self, item: HandOff, reactor: &Arc<mio::Registry>) {
        let fd = item.stream.as_raw_fd();
        match self
            .registry
            .create_or_reset(fd, item.stream, item.interest, reactor.clone(), self.id)
        {
            Ok(_) => trace!(fd, worker = self.id, "connection adopted"),
            Err(e) => {
                warn!(fd, worker = self.id, error = %e, "could not adopt connection");
                self.live.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Runs the state machine for the connection behind a readiness event.
    fn drive(&mut self, fd: RawFd) {
        let Some(slot) = self.registry.get(fd) else {
            trace!(fd, worker = self.id, "event for unknown fd");
            return;
        };
        let mut conn = slot.lock();
        if conn.is_closed() {
            // Stale readiness from before the slot was closed.
            return;
        }
        state::advance(&mut conn, &self.factory);
        if conn.is_closed() {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Closes everything this worker still owns: queued hand-offs that were
    /// never adopted, then every open connection adopted by this thread.
    fn shutdown(&mut self) {
        while let Some(item) = self.queue.pop() {
            drop(item);
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
        for slot in self.registry.snapshot() {
            let mut conn = slot.lock();
            if conn.worker() == self.id && !conn.is_closed() {
                conn.close();
                self.live.fetch_sub(1, Ordering::Relaxed);
            }
        }
        info!(worker = self.id, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EchoProtocol, Protocol, ECHO_PACKET_TYPE};
    use std::time::Duration;

    fn spawn_echo_worker() -> (WorkerHandle, Arc<Registry>, Arc<AtomicUsize>) {
        let registry = Arc::new(Registry::new());
        let live = Arc::new(AtomicUsize::new(0));
        let factory: ProtocolFactory =
            Arc::new(|| Box::new(EchoProtocol::new()) as Box<dyn Protocol>);
        let handle = Worker::spawn(0, 16, registry.clone(), factory, live.clone()).unwrap();
        (handle, registry, live)
    }

    fn hand_off_client(handle: &WorkerHandle, live: &AtomicUsize) -> std::net::TcpStream {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        live.fetch_add(1, Ordering::Relaxed);
        assert!(handle
            .queue
            .push(HandOff {
                stream: TcpStream::from_std(server),
                interest: Interest::READABLE,
            })
            .is_ok());
        handle.wake();
        client
    }

    #[test]
    fn test_worker_serves_handed_off_connection() {
        let (mut handle, _registry, live) = spawn_echo_worker();
        let mut client = hand_off_client(&handle, &live);

        client.write_all(b"ping").unwrap();
        let mut wire = [0u8; 9];
        client.read_exact(&mut wire).unwrap();
        assert_eq!(wire[0], ECHO_PACKET_TYPE);
        assert_eq!(&wire[5..], b"ping");

        handle.stop_and_join();
        assert_eq!(live.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_worker_handles_many_connections_in_order() {
        let (mut handle, _registry, live) = spawn_echo_worker();

        let mut clients = Vec::new();
        for i in 0..4u8 {
            let mut client = hand_off_client(&handle, &live);
            client.write_all(&[i; 3]).unwrap();
            clients.push(client);
        }
        for (i, client) in clients.iter_mut().enumerate() {
            let mut wire = [0u8; 8];
            client.read_exact(&mut wire).unwrap();
            assert_eq!(wire[0], ECHO_PACKET_TYPE);
            assert_eq!(&wire[5..], &[i as u8; 3]);
        }

        handle.stop_and_join();
        assert_eq!(live.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_stop_closes_adopted_connections() {
        let (mut handle, _registry, live) = spawn_echo_worker();
        let mut client = hand_off_client(&handle, &live);

        // Round-trip once so the hand-off has certainly been adopted.
        client.write_all(b"x").unwrap();
        let mut wire = [0u8; 6];
        client.read_exact(&mut wire).unwrap();

        handle.stop_and_join();
        assert_eq!(live.load(Ordering::Relaxed), 0);

        // The worker closed the socket on its way out.
        let mut probe = [0u8; 1];
        assert_eq!(client.read(&mut probe).unwrap_or(0), 0);
    }
}
