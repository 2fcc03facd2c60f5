use mio::Interest;
use tracing::{debug, trace};

use crate::protocol::{ProtocolFactory, Step};
use crate::server::connection::{Connection, FillResult, FlushResult};

/// Runs the per-connection state machine until progress is blocked.
///
/// Invoked whenever the reactor reports readiness on the connection's
/// socket. The loop alternates between draining buffered output and letting
/// the protocol handler consume input, and only yields at one of four
/// points:
///
/// 1. the connection is disconnected - close, do not re-arm;
/// 2. more input is needed but the socket has none - re-arm for read;
/// 3. output is pending but the socket is full - re-arm for write (and
///    read, since the peer may speak meanwhile);
/// 4. the handler declared the session finished - close.
///
/// Because the loop always drives the blocking direction to `WouldBlock`
/// before yielding, edge-triggered readiness behaves like level-triggered
/// here.
pub(crate) fn advance(conn: &mut Connection, factory: &ProtocolFactory) {
    loop {
        if conn.is_disconnected() {
            conn.close();
            return;
        }

        // A previous pass may have left output behind a full socket; try to
        // drain it before giving the handler another turn.
        if conn.has_pending_write() {
            match conn.flush() {
                FlushResult::Flushed => {}
                FlushResult::Blocked => {
                    conn.rearm(Interest::READABLE | Interest::WRITABLE);
                    return;
                }
                FlushResult::Disconnected => {
                    conn.close();
                    return;
                }
            }
        }

        let mut handler = conn.take_handler(factory);
        let step = handler.process(conn);
        conn.put_handler(handler);

        match step {
            Ok(Step::Continue) => continue,
            Ok(Step::NeedRead) => match conn.refill_read_buffer() {
                FillResult::Filled => continue,
                FillResult::WouldBlock => {
                    trace!(fd = conn.fd(), "waiting for input");
                    conn.rearm(Interest::READABLE);
                    return;
                }
                FillResult::Disconnected => {
                    conn.close();
                    return;
                }
            },
            Ok(Step::NeedWrite) => match conn.flush() {
                FlushResult::Flushed => continue,
                FlushResult::Blocked => {
                    trace!(fd = conn.fd(), "waiting for socket to drain");
                    conn.rearm(Interest::READABLE | Interest::WRITABLE);
                    return;
                }
                FlushResult::Disconnected => {
                    conn.close();
                    return;
                }
            },
            Ok(Step::Done) => {
                debug!(fd = conn.fd(), "session finished");
                let _ = conn.flush();
                conn.close();
                return;
            }
            Err(e) => {
                debug!(fd = conn.fd(), error = %e, "protocol error, dropping connection");
                conn.close();
                return;
            }
        }
    }
}
