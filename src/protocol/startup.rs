use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

use crate::protocol::codec::{put_cstring, take_cstring};
use crate::protocol::{Protocol, ProtocolError, Step};
use crate::server::{Connection, ReadOutcome};

/// SSLRequest magic number
pub const SSL_REQUEST_CODE: i32 = (1234 << 16) | 5679; // 80877103

/// GSSENCRequest magic number
pub const GSSENC_REQUEST_CODE: i32 = (1234 << 16) | 5680; // 80877104

/// CancelRequest magic number
pub const CANCEL_REQUEST_CODE: i32 = (1234 << 16) | 5678; // 80877102

/// A startup message must fit a single socket buffer.
const MAX_STARTUP_LEN: usize = 8192;

/// Where the session currently stands.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    /// Waiting for the length prefix of a startup-phase message.
    AwaitingStartup,
    /// Length received, waiting for the message body.
    StartupBody { remaining: usize },
    /// Handshake complete; waiting for a typed message header.
    Ready,
    /// Draining the body of a typed message.
    Message { msg_type: u8, remaining: usize },
}

/// Minimal PostgreSQL-compatible session handler.
///
/// Speaks enough of the v3.0 startup exchange for standard clients to
/// connect: rejects SSL/GSSAPI encryption probes with `N`, accepts the
/// startup parameter list, answers with `AuthenticationOk`, a few
/// `ParameterStatus` fields and `ReadyForQuery`. Queries are answered with
/// an `ErrorResponse` (nothing executes behind this front-end) and
/// `Terminate` ends the session.
pub struct StartupProtocol {
    phase: Phase,
    user: Option<String>,
    database: Option<String>,
}

impl StartupProtocol {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingStartup,
            user: None,
            database: None,
        }
    }

    fn read_parameters(&mut self, mut body: &[u8]) -> Result<(), ProtocolError> {
        while !body.is_empty() {
            let (name, used) = take_cstring(body)?;
            body = &body[used..];
            // Empty name signals end of parameters
            if name.is_empty() {
                break;
            }
            let (value, used) = take_cstring(body)?;
            body = &body[used..];
            match name.as_str() {
                "user" => self.user = Some(value),
                "database" => self.database = Some(value),
                _ => trace!(name = %name, value = %value, "ignoring startup parameter"),
            }
        }
        debug!(
            user = self.user.as_deref().unwrap_or(""),
            database = self.database.as_deref().unwrap_or(""),
            "session startup"
        );
        Ok(())
    }

    /// AuthenticationOk, the parameters clients expect, then ReadyForQuery.
    fn send_session_start(&self, conn: &mut Connection) {
        conn.write_packet(b'R', &0i32.to_be_bytes());

        let params = [
            ("server_version", "16.0"),
            ("server_encoding", "UTF8"),
            ("client_encoding", "UTF8"),
        ];
        for (name, value) in params {
            let mut body = BytesMut::new();
            put_cstring(&mut body, name);
            put_cstring(&mut body, value);
            conn.write_packet(b'S', &body);
        }

        conn.write_packet(b'Z', b"I");
    }

    fn send_query_error(&self, conn: &mut Connection) {
        let mut body = BytesMut::new();
        body.put_u8(b'S');
        put_cstring(&mut body, "ERROR");
        body.put_u8(b'V');
        put_cstring(&mut body, "ERROR");
        body.put_u8(b'C');
        put_cstring(&mut body, "0A000");
        body.put_u8(b'M');
        put_cstring(&mut body, "queries are not yet implemented");
        body.put_u8(0);
        conn.write_packet(b'E', &body);

        conn.write_packet(b'Z', b"I");
    }
}

impl Default for StartupProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for StartupProtocol {
    fn process(&mut self, conn: &mut Connection) -> Result<Step, ProtocolError> {
        loop {
            match self.phase {
                Phase::AwaitingStartup => {
                    let mut len = [0u8; 4];
                    match conn.read_bytes(&mut len) {
                        ReadOutcome::Done => {}
                        ReadOutcome::Blocked => return Ok(Step::NeedRead),
                        ReadOutcome::Disconnected => return Ok(Step::Continue),
                    }
                    let len = i32::from_be_bytes(len);
                    // Minimum length is 8 (length + code)
                    if len < 8 {
                        return Err(ProtocolError::InvalidMessage);
                    }
                    let len = len as usize;
                    if len > MAX_STARTUP_LEN {
                        return Err(ProtocolError::OversizedMessage(len));
                    }
                    self.phase = Phase::StartupBody { remaining: len - 4 };
                }

                Phase::StartupBody { remaining } => {
                    let mut body = vec![0u8; remaining];
                    match conn.read_bytes(&mut body) {
                        ReadOutcome::Done => {}
                        ReadOutcome::Blocked => return Ok(Step::NeedRead),
                        ReadOutcome::Disconnected => return Ok(Step::Continue),
                    }
                    let code = i32::from_be_bytes(body[..4].try_into().expect("length checked"));
                    match code {
                        SSL_REQUEST_CODE | GSSENC_REQUEST_CODE if remaining == 4 => {
                            // Reject encryption with a bare 'N'; the client
                            // retries in the clear with a real startup.
                            conn.write_bytes(b"N");
                            self.phase = Phase::AwaitingStartup;
                            return Ok(Step::NeedWrite);
                        }
                        CANCEL_REQUEST_CODE if remaining == 12 => {
                            // No cancel routing here; the session just ends.
                            return Ok(Step::Done);
                        }
                        SSL_REQUEST_CODE | GSSENC_REQUEST_CODE | CANCEL_REQUEST_CODE => {
                            return Err(ProtocolError::InvalidMessage);
                        }
                        version if version >> 16 == 3 => {
                            self.read_parameters(&body[4..])?;
                            self.send_session_start(conn);
                            self.phase = Phase::Ready;
                            return Ok(Step::NeedWrite);
                        }
                        other => return Err(ProtocolError::UnsupportedProtocolVersion(other)),
                    }
                }

                Phase::Ready => {
                    let mut head = [0u8; 5];
                    match conn.read_bytes(&mut head) {
                        ReadOutcome::Done => {}
                        ReadOutcome::Blocked => return Ok(Step::NeedRead),
                        ReadOutcome::Disconnected => return Ok(Step::Continue),
                    }
                    let len = i32::from_be_bytes(head[1..5].try_into().expect("length checked"));
                    if len < 4 {
                        return Err(ProtocolError::InvalidMessage);
                    }
                    self.phase = Phase::Message {
                        msg_type: head[0],
                        remaining: len as usize - 4,
                    };
                }

                Phase::Message { msg_type, remaining } => {
                    if remaining > 0 {
                        // Message bodies are discarded in chunks; they can
                        // be arbitrarily large.
                        if conn.available() == 0 {
                            return Ok(Step::NeedRead);
                        }
                        let take = remaining.min(conn.available());
                        conn.consume(take);
                        self.phase = Phase::Message {
                            msg_type,
                            remaining: remaining - take,
                        };
                        continue;
                    }
                    match msg_type {
                        b'X' => return Ok(Step::Done),
                        _ => {
                            self.send_query_error(conn);
                            self.phase = Phase::Ready;
                            return Ok(Step::NeedWrite);
                        }
                    }
                }
            }
        }
    }
}
