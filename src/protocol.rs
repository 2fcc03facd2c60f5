//! Wire-protocol handlers driven by the network front-end.
//!
//! The front-end owns sockets, buffering and readiness; a handler owns the
//! session-level protocol state. Each connection lazily creates one handler
//! instance and keeps it until the slot is reset.
//!
//! ## Architecture
//!
//! ```text
//! +--------+   readiness    +---------+   process()    +----------+
//! | Worker | -------------> | advance | -------------> | Protocol |
//! +--------+                +---------+                +----------+
//!                                ^                          |
//!                                |   Step / ProtocolError   |
//!                                +--------------------------+
//! ```
//!
//! ## Terminology
//!
//! - **Protocol**: per-connection handler consuming whole packets from the
//!   read buffer and appending responses to the write buffer
//! - **Step**: what the handler needs next (more input, a flush, another
//!   turn, or end of session)

pub mod codec;
pub mod echo;
pub mod error;
pub mod startup;

pub use echo::{EchoProtocol, ECHO_PACKET_TYPE};
pub use error::ProtocolError;
pub use startup::StartupProtocol;

use std::sync::Arc;

use crate::server::Connection;

/// Outcome of one handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More input is required than is currently buffered.
    NeedRead,
    /// Buffered output should reach the socket before the handler continues.
    NeedWrite,
    /// Progress was made; invoke the handler again immediately.
    Continue,
    /// The session is complete; the connection should be closed.
    Done,
}

/// A session-level protocol handler.
///
/// `process` is called whenever the connection may be able to make progress.
/// The handler consumes input through [`Connection::read_bytes`] /
/// [`Connection::readable`] and produces output through
/// [`Connection::write_packet`]. It must be resumable: when input runs short
/// it returns [`Step::NeedRead`] without consuming a partial packet, and is
/// called again once more bytes arrive.
///
/// If the peer vanishes mid-read the connection flags itself disconnected
/// and the driver closes it; returning [`Step::Continue`] in that case is
/// the convention. An `Err` is a protocol violation and terminates the
/// connection.
pub trait Protocol: Send {
    fn process(&mut self, conn: &mut Connection) -> Result<Step, ProtocolError>;
}

/// Creates one handler per connection, on first use after accept or reset.
pub type ProtocolFactory = Arc<dyn Fn() -> Box<dyn Protocol> + Send + Sync>;
