use crate::protocol::{Protocol, ProtocolError, Step};
use crate::server::Connection;

/// Type tag of echoed packets.
pub const ECHO_PACKET_TYPE: u8 = 0x41;

/// A handler that frames everything it receives straight back to the peer.
///
/// Inbound bytes carry no framing of their own; whatever has arrived is
/// wrapped in a single packet and returned. Useful for exercising the
/// front-end without a real protocol on the other side.
#[derive(Default)]
pub struct EchoProtocol;

impl EchoProtocol {
    pub fn new() -> Self {
        Self
    }
}

impl Protocol for EchoProtocol {
    fn process(&mut self, conn: &mut Connection) -> Result<Step, ProtocolError> {
        if conn.available() == 0 {
            return Ok(Step::NeedRead);
        }
        let payload = conn.readable().to_vec();
        conn.consume(payload.len());
        conn.write_packet(ECHO_PACKET_TYPE, &payload);
        Ok(Step::NeedWrite)
    }
}
