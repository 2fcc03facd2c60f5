use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Token};
use tracing::{debug, trace, warn};

use crate::protocol::{Protocol, ProtocolFactory};
use crate::server::buffer::{Buffer, SOCKET_BUFFER_SIZE};

/// Outcome of a read-buffer refill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillResult {
    /// At least one new byte is readable.
    Filled,
    /// The socket has nothing more right now; wait for readability.
    WouldBlock,
    /// EOF or a hard error; the disconnect flag is set.
    Disconnected,
}

/// Outcome of [`Connection::read_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The requested bytes were copied out and consumed.
    Done,
    /// Not enough bytes buffered yet. Nothing was consumed; the call can be
    /// retried verbatim once the socket is readable again.
    Blocked,
    /// The peer is gone; the disconnect flag is set.
    Disconnected,
}

/// Outcome of [`Connection::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushResult {
    /// Every buffered byte reached the socket.
    Flushed,
    /// The socket stopped accepting bytes; wait for writability and resume.
    Blocked,
    /// The peer is gone; the disconnect flag is set.
    Disconnected,
}

/// A single client connection.
///
/// Owns the socket, both fixed I/O buffers, and the protocol handler for
/// the session. All I/O is non-blocking; the worker that owns this
/// connection is the only thread that touches it between resets.
pub struct Connection {
    fd: RawFd,
    /// `None` once the socket has been closed. The object itself survives in
    /// the registry so the slot can be reused when the OS recycles the fd.
    stream: Option<TcpStream>,
    /// Latches true on EOF or a connection-fatal error; cleared only by
    /// `reset`.
    disconnected: bool,
    /// The readiness mask currently registered with the reactor.
    interest: Interest,
    /// Handle to the owning worker's reactor, for re-arming and deregistration.
    reactor: Arc<mio::Registry>,
    worker: usize,
    rbuf: Buffer,
    wbuf: Buffer,
    /// Outbound bytes that did not fit `wbuf` while the socket was
    /// write-blocked. Drained by `flush` after `wbuf`, so append order is
    /// preserved on the wire.
    overflow: BytesMut,
    /// Created lazily on the first state-machine pass, dropped on reset.
    handler: Option<Box<dyn Protocol>>,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        interest: Interest,
        reactor: Arc<mio::Registry>,
        worker: usize,
    ) -> io::Result<Self> {
        let fd = stream.as_raw_fd();
        let mut conn = Self {
            fd,
            stream: Some(stream),
            disconnected: false,
            interest,
            reactor,
            worker,
            rbuf: Buffer::new(),
            wbuf: Buffer::new(),
            overflow: BytesMut::new(),
            handler: None,
        };
        conn.register()?;
        Ok(conn)
    }

    fn register(&mut self) -> io::Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            self.reactor
                .register(stream, Token(self.fd as usize), self.interest)?;
        }
        Ok(())
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// True once the socket has been closed. The slot stays in the registry.
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub(crate) fn worker(&self) -> usize {
        self.worker
    }

    /// Number of buffered input bytes not yet consumed.
    pub fn available(&self) -> usize {
        self.rbuf.remaining()
    }

    /// The buffered input bytes not yet consumed.
    pub fn readable(&self) -> &[u8] {
        self.rbuf.readable()
    }

    /// Consumes `n` buffered input bytes. `n` must not exceed `available()`.
    pub fn consume(&mut self, n: usize) {
        self.rbuf.consume(n);
    }

    pub(crate) fn has_pending_write(&self) -> bool {
        self.wbuf.remaining() > 0 || !self.overflow.is_empty()
    }

    /// Repopulates the read buffer with a fresh batch of bytes from the
    /// socket, reading until it would block or the buffer is full.
    ///
    /// Returns `Filled` when at least one new byte arrived, `WouldBlock`
    /// when nothing is available right now, and `Disconnected` on EOF or a
    /// hard error (the disconnect flag is set in that case).
    pub fn refill_read_buffer(&mut self) -> FillResult {
        if self.rbuf.remaining() == 0 {
            self.rbuf.reset();
        } else if self.rbuf.space() == 0 {
            self.rbuf.compact();
        }
        if self.rbuf.space() == 0 {
            // A whole buffer of unconsumed bytes; the handler must drain
            // some before a refill can make progress.
            return FillResult::Filled;
        }
        let Some(stream) = self.stream.as_mut() else {
            self.disconnected = true;
            return FillResult::Disconnected;
        };

        let mut total = 0;
        while self.rbuf.space() > 0 {
            match stream.read(self.rbuf.unfilled_mut()) {
                Ok(0) => {
                    self.disconnected = true;
                    return FillResult::Disconnected;
                }
                Ok(n) => {
                    self.rbuf.advance_filled(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "read failed");
                    self.disconnected = true;
                    return FillResult::Disconnected;
                }
            }
        }

        if total > 0 {
            trace!(fd = self.fd, bytes = total, "read buffer refilled");
            FillResult::Filled
        } else {
            FillResult::WouldBlock
        }
    }

    /// Copies exactly `out.len()` bytes from the read buffer into `out`,
    /// refilling from the socket as needed.
    ///
    /// All-or-nothing: on `Blocked` no bytes have been consumed, so callers
    /// can re-arm for readability and retry the same call later. Reads
    /// larger than one socket buffer must be taken in chunks; asking for
    /// more is treated as a framing violation and disconnects.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> ReadOutcome {
        if out.len() > SOCKET_BUFFER_SIZE {
            warn!(fd = self.fd, len = out.len(), "read exceeds socket buffer");
            self.disconnected = true;
            return ReadOutcome::Disconnected;
        }
        while self.rbuf.remaining() < out.len() {
            match self.refill_read_buffer() {
                FillResult::Filled => {}
                FillResult::WouldBlock => return ReadOutcome::Blocked,
                FillResult::Disconnected => return ReadOutcome::Disconnected,
            }
        }
        out.copy_from_slice(&self.rbuf.readable()[..out.len()]);
        self.rbuf.consume(out.len());
        ReadOutcome::Done
    }

    /// Appends one wire packet to the write buffer: a one-byte type tag,
    /// then a big-endian u32 length covering itself plus the payload, then
    /// the payload.
    ///
    /// A packet larger than the write buffer is emitted with intermediate
    /// flushes; its bytes stay contiguous on the wire. The call never
    /// blocks: bytes the socket will not take yet are kept until the next
    /// flush. On a connection-fatal write error the disconnect flag is set
    /// and the remainder is dropped.
    pub fn write_packet(&mut self, ty: u8, payload: &[u8]) {
        let mut header = [0u8; 5];
        header[0] = ty;
        header[1..].copy_from_slice(&(payload.len() as u32 + 4).to_be_bytes());
        self.write_bytes(&header);
        self.write_bytes(payload);
    }

    /// Appends raw bytes to the outbound stream, outside any packet frame.
    /// Needed by handshake exchanges whose replies predate packet framing.
    pub fn write_bytes(&mut self, mut src: &[u8]) {
        while !src.is_empty() && !self.disconnected {
            if !self.overflow.is_empty() {
                // Order matters: once bytes queue behind a blocked flush,
                // everything later queues too.
                self.overflow.extend_from_slice(src);
                return;
            }
            let space = self.wbuf.space();
            if space == 0 {
                match self.flush() {
                    FlushResult::Flushed => {}
                    FlushResult::Blocked => {
                        self.overflow.extend_from_slice(src);
                        return;
                    }
                    FlushResult::Disconnected => return,
                }
            } else {
                let n = space.min(src.len());
                self.wbuf.append(&src[..n]);
                src = &src[n..];
            }
        }
    }

    /// Writes all buffered outbound bytes to the socket, looping over
    /// partial writes.
    ///
    /// On `Blocked` the unwritten remainder stays buffered and the caller
    /// re-arms for writability. On a hard error the disconnect flag is set.
    pub fn flush(&mut self) -> FlushResult {
        let Some(stream) = self.stream.as_mut() else {
            self.disconnected = true;
            return FlushResult::Disconnected;
        };

        while self.wbuf.remaining() > 0 {
            match stream.write(self.wbuf.readable()) {
                Ok(0) => {
                    self.disconnected = true;
                    return FlushResult::Disconnected;
                }
                Ok(n) => self.wbuf.consume(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return FlushResult::Blocked,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "write failed");
                    self.disconnected = true;
                    return FlushResult::Disconnected;
                }
            }
        }
        self.wbuf.reset();

        while !self.overflow.is_empty() {
            match stream.write(&self.overflow) {
                Ok(0) => {
                    self.disconnected = true;
                    return FlushResult::Disconnected;
                }
                Ok(n) => self.overflow.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return FlushResult::Blocked,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "write failed");
                    self.disconnected = true;
                    return FlushResult::Disconnected;
                }
            }
        }
        FlushResult::Flushed
    }

    /// Closes the socket and removes its reactor registration. Idempotent.
    /// The connection object itself stays in the registry for reuse.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = self.reactor.deregister(&mut stream) {
                debug!(fd = self.fd, error = %e, "deregister failed");
            }
            debug!(fd = self.fd, worker = self.worker, "connection closed");
        }
        self.disconnected = true;
    }

    /// Reinitializes this slot for a fresh session on a recycled fd. The
    /// connection may now belong to a different worker; the new reactor
    /// handle comes with it.
    pub(crate) fn reset(
        &mut self,
        stream: TcpStream,
        interest: Interest,
        reactor: Arc<mio::Registry>,
        worker: usize,
    ) -> io::Result<()> {
        self.close();
        self.rbuf.reset();
        self.wbuf.reset();
        self.overflow.clear();
        self.handler = None;
        self.fd = stream.as_raw_fd();
        self.stream = Some(stream);
        self.disconnected = false;
        self.interest = interest;
        self.reactor = reactor;
        self.worker = worker;
        if let Err(e) = self.register() {
            self.close();
            return Err(e);
        }
        Ok(())
    }

    /// Changes the registered readiness mask. A no-op when the mask is
    /// unchanged; new edges re-arm an unchanged registration by themselves.
    pub(crate) fn rearm(&mut self, interest: Interest) {
        if self.interest == interest {
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        match self
            .reactor
            .reregister(stream, Token(self.fd as usize), interest)
        {
            Ok(()) => self.interest = interest,
            Err(e) => {
                warn!(fd = self.fd, error = %e, "reactor re-arm failed");
                self.disconnected = true;
            }
        }
    }

    pub(crate) fn take_handler(&mut self, factory: &ProtocolFactory) -> Box<dyn Protocol> {
        self.handler.take().unwrap_or_else(|| (**factory)())
    }

    pub(crate) fn put_handler(&mut self, handler: Box<dyn Protocol>) {
        self.handler = Some(handler);
    }
}
