use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::UnixStream;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol as IpProtocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::protocol::ProtocolFactory;
use crate::server::error::ServerError;
use crate::server::registry::Registry;
use crate::server::worker::{HandOff, Worker, WorkerHandle, WAKE_TOKEN};

const LISTENER_TOKEN: Token = Token(usize::MAX - 1);

/// How many times a dispatch retries against a full hand-off queue before
/// giving up on the connection.
const DISPATCH_RETRIES: usize = 1000;

/// The acceptor: hosts the listening socket and round-robins accepted
/// connections across the worker pool.
///
/// Each accepted socket is pushed onto one worker's hand-off queue followed
/// by a byte on that worker's wake pipe; from then on every event for the
/// connection happens on that worker's thread. The acceptor itself never
/// touches the connection registry.
pub struct Server {
    listener: mio::net::TcpListener,
    local_addr: SocketAddr,
    poll: Poll,
    wake_rx: UnixStream,
    workers: Vec<WorkerHandle>,
    /// Round-robin dispatch counter.
    next_worker: usize,
    /// Live connections across all workers, for the max_connections cutoff.
    live: Arc<AtomicUsize>,
    max_connections: usize,
    handle: ServerHandle,
}

/// Shareable control handle for a running server.
#[derive(Clone)]
pub struct ServerHandle {
    stop: Arc<AtomicBool>,
    wake: Arc<UnixStream>,
}

impl ServerHandle {
    /// Asks the acceptor to stop. It finishes the current poll round, stops
    /// accepting, and winds the workers down; `serve` then returns.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = (&*self.wake).write(&[1u8]);
    }
}

impl Server {
    /// Binds the listening socket and starts the worker pool. The returned
    /// server does not accept anything until [`Server::serve`] runs.
    pub fn bind(config: ServerConfig, factory: ProtocolFactory) -> Result<Self, ServerError> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|_| ServerError::InvalidAddress(format!("{}:{}", config.host, config.port)))?;

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket =
            Socket::new(domain, Type::STREAM, Some(IpProtocol::TCP)).map_err(ServerError::Bind)?;
        socket.set_reuse_address(true).map_err(ServerError::Bind)?;
        socket.bind(&addr.into()).map_err(ServerError::Bind)?;
        socket
            .listen(config.backlog as i32)
            .map_err(ServerError::Bind)?;
        socket.set_nonblocking(true).map_err(ServerError::Bind)?;
        let std_listener: std::net::TcpListener = socket.into();
        let local_addr = std_listener.local_addr().map_err(ServerError::Bind)?;
        let mut listener = mio::net::TcpListener::from_std(std_listener);

        let poll = Poll::new().map_err(ServerError::Reactor)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ServerError::Reactor)?;
        let (mut wake_rx, wake_tx) = UnixStream::pair().map_err(ServerError::Reactor)?;
        poll.registry()
            .register(&mut wake_rx, WAKE_TOKEN, Interest::READABLE)
            .map_err(ServerError::Reactor)?;

        let registry = Arc::new(Registry::new());
        let live = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(config.num_workers);
        for id in 0..config.num_workers {
            let handle = Worker::spawn(
                id,
                config.queue_size,
                registry.clone(),
                factory.clone(),
                live.clone(),
            )
            .map_err(ServerError::WorkerSpawn)?;
            workers.push(handle);
        }

        info!(addr = %local_addr, workers = config.num_workers, "listening");
        Ok(Self {
            listener,
            local_addr,
            poll,
            wake_rx,
            workers,
            next_worker: 0,
            live,
            max_connections: config.max_connections,
            handle: ServerHandle {
                stop: Arc::new(AtomicBool::new(false)),
                wake: Arc::new(wake_tx),
            },
        })
    }

    /// The address the listener actually bound, useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A control handle for shutting the server down from another thread.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Runs the accept loop until [`ServerHandle::shutdown`] is called or
    /// the acceptor's reactor fails. Workers are wound down and joined
    /// before this returns; every in-flight connection gets closed.
    pub fn serve(mut self) -> Result<(), ServerError> {
        let result = self.accept_loop();
        self.stop_workers();
        info!("server stopped");
        result
    }

    fn accept_loop(&mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(64);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "acceptor reactor failed");
                return Err(ServerError::Reactor(e));
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_ready(),
                    WAKE_TOKEN => self.drain_wake(),
                    _ => {}
                }
            }
            if self.handle.stop.load(Ordering::Acquire) {
                info!("acceptor stopping");
                return Ok(());
            }
        }
    }

    /// Accepts as many connections as the listener has pending.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.live.load(Ordering::Relaxed) >= self.max_connections {
                        warn!(%peer, limit = self.max_connections, "connection limit reached");
                        drop(stream);
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "could not set TCP_NODELAY");
                    }
                    debug!(%peer, "accepted connection");
                    self.dispatch(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    debug!(error = %e, "transient accept error");
                    continue;
                }
                Err(e) => {
                    // Usually fd exhaustion; pause briefly rather than spin.
                    warn!(error = %e, "accept failed, pausing");
                    std::thread::sleep(Duration::from_millis(10));
                    break;
                }
            }
        }
    }

    /// Hands a connection to the next worker in round-robin order: push
    /// onto its queue, then one byte on its wake pipe. A full queue gets a
    /// bounded retry; the worker drains in batches, so this resolves fast
    /// or not at all.
    fn dispatch(&mut self, stream: mio::net::TcpStream) {
        // Skip workers whose thread has died; they cannot drain a queue.
        let mut idx = self.next_worker % self.workers.len();
        self.next_worker = self.next_worker.wrapping_add(1);
        for _ in 0..self.workers.len() {
            if self.workers[idx].is_alive() {
                break;
            }
            idx = self.next_worker % self.workers.len();
            self.next_worker = self.next_worker.wrapping_add(1);
        }
        let worker = &self.workers[idx];
        if !worker.is_alive() {
            error!("no live workers, dropping connection");
            return;
        }

        self.live.fetch_add(1, Ordering::Relaxed);
        let mut item = HandOff {
            stream,
            interest: Interest::READABLE,
        };
        for attempt in 0.. {
            match worker.queue.push(item) {
                Ok(()) => {
                    worker.wake();
                    return;
                }
                Err(back) => {
                    if attempt >= DISPATCH_RETRIES {
                        warn!(worker = worker.id, "hand-off queue full, dropping connection");
                        self.live.fetch_sub(1, Ordering::Relaxed);
                        return;
                    }
                    item = back;
                    worker.wake();
                    std::thread::sleep(Duration::from_micros(50));
                }
            }
        }
    }

    fn drain_wake(&mut self) {
        let mut buf = [0u8; 16];
        loop {
            match self.wake_rx.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    fn stop_workers(&mut self) {
        for worker in &mut self.workers {
            worker.stop_and_join();
        }
    }
}
