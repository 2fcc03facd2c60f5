/// Protocol-level errors.
///
/// Any of these terminates the offending connection; they never propagate
/// past it.
#[derive(Debug)]
pub enum ProtocolError {
    /// A framing field that cannot be satisfied (bad length, bad magic).
    InvalidMessage,
    /// The client requested a protocol version the handler does not speak.
    UnsupportedProtocolVersion(i32),
    /// A declared message length above what the handler accepts.
    OversizedMessage(usize),
    /// A string field that is not valid UTF-8.
    InvalidUtf8,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::InvalidMessage => write!(f, "invalid message"),
            ProtocolError::UnsupportedProtocolVersion(v) => {
                write!(f, "unsupported protocol version: {}", v)
            }
            ProtocolError::OversizedMessage(len) => {
                write!(f, "message too large: {} bytes", len)
            }
            ProtocolError::InvalidUtf8 => write!(f, "invalid UTF-8"),
        }
    }
}

impl std::error::Error for ProtocolError {}
