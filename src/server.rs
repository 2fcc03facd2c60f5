//! Event-driven TCP front-end for the database server.
//!
//! This module accepts client connections and drives their wire-protocol
//! sessions without ever blocking an I/O thread.
//!
//! ## Architecture
//!
//! ```text
//! +--------+  round-robin   +--------+     +--------+
//! | Server | -------------> | Worker | ... | Worker |   <- reactor threads
//! +--------+  queue + wake  +--------+     +--------+
//!      |                         |
//!      v                         v
//! +----------+            +------------+
//! | Registry |  <-------- | Connection |  <- buffered non-blocking I/O
//! +----------+   fd slot  +------------+
//! ```
//!
//! ## Terminology
//!
//! - **Server**: acceptor thread owning the listening socket
//! - **Worker**: I/O thread owning one reactor, a wake pipe and a hand-off
//!   queue
//! - **Connection**: per-client socket with fixed read/write buffers
//! - **Registry**: process-wide fd-keyed table of reusable connection slots
//!
//! After hand-off, everything about a connection happens on the worker that
//! adopted it; the hand-off queue is the only cross-thread structure in the
//! steady state.

pub mod buffer;
pub mod connection;
pub mod error;
pub mod listener;
pub mod registry;
mod state;
mod worker;

pub use buffer::{Buffer, SOCKET_BUFFER_SIZE};
pub use connection::{Connection, FillResult, FlushResult, ReadOutcome};
pub use error::ServerError;
pub use listener::{Server, ServerHandle};
pub use registry::Registry;
