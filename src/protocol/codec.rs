use bytes::{BufMut, BytesMut};

use crate::protocol::ProtocolError;

/// Write a null-terminated string to a BytesMut buffer.
pub fn put_cstring(dst: &mut BytesMut, s: &str) {
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
}

/// Read a null-terminated string from the front of `src`.
///
/// Returns the string (without its terminator) and the number of bytes it
/// occupied including the terminator, or an error if no terminator exists.
pub fn take_cstring(src: &[u8]) -> Result<(String, usize), ProtocolError> {
    let Some(null_pos) = src.iter().position(|&b| b == 0) else {
        return Err(ProtocolError::InvalidMessage);
    };
    let s = std::str::from_utf8(&src[..null_pos]).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok((s.to_string(), null_pos + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_cstring() {
        let mut buf = BytesMut::new();
        put_cstring(&mut buf, "test");
        assert_eq!(buf, b"test\0"[..]);
    }

    #[test]
    fn test_take_cstring() {
        let (s, used) = take_cstring(b"hello\0world").unwrap();
        assert_eq!(s, "hello");
        assert_eq!(used, 6);
    }

    #[test]
    fn test_take_cstring_unterminated() {
        assert!(take_cstring(b"hello").is_err());
    }

    #[test]
    fn test_take_cstring_bad_utf8() {
        assert!(take_cstring(&[0xFF, 0xFE, 0x00]).is_err());
    }
}
