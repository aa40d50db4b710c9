use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: payload length (4, little-endian).
pub const HEADER_SIZE: usize = 4;

/// Hard ceiling for a whole frame, header included.
pub const MESSAGE_MAX_LEN: usize = 4_194_308;

/// Ceiling for a request payload; leaves room for the envelope below
/// [`MESSAGE_MAX_LEN`].
pub const PAYLOAD_MAX_LEN: usize = 4_194_304;

/// Capacity of the receive reassembly buffer.
pub const RECV_BUFFER_MAX_LEN: usize = MESSAGE_MAX_LEN * 2;

/// Encode one payload into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬─────────────────────┐
/// │ Length (4B)  │ Payload             │
/// │ u32 LE       │ (Length bytes)      │
/// └──────────────┴─────────────────────┘
/// ```
pub fn encode_frame(payload: &[u8], max_message: usize, dst: &mut BytesMut) -> Result<()> {
    let total = HEADER_SIZE + payload.len();
    if total > max_message || payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: total,
            max: max_message,
        });
    }
    dst.reserve(total);
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` while fewer than `HEADER_SIZE + 1` bytes are buffered or
/// the announced payload has not fully arrived. On success the frame bytes are
/// consumed from `src`. A length prefix announcing more than `max_message`
/// bytes means the frame boundary cannot be trusted.
pub fn decode_frame(src: &mut BytesMut, max_message: usize) -> Result<Option<Bytes>> {
    if src.len() <= HEADER_SIZE {
        return Ok(None);
    }

    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&src[..HEADER_SIZE]);
    let payload_len = u32::from_le_bytes(header) as usize;

    if HEADER_SIZE + payload_len > max_message {
        return Err(FrameError::PayloadTooLarge {
            size: HEADER_SIZE + payload_len,
            max: max_message,
        });
    }

    if src.len() < HEADER_SIZE + payload_len {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    Ok(Some(src.split_to(payload_len).freeze()))
}

/// Size limits and timeouts for framed I/O.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum frame size including the header. Default: [`MESSAGE_MAX_LEN`].
    pub max_message_len: usize,
    /// Receive buffer capacity. Default: [`RECV_BUFFER_MAX_LEN`].
    pub recv_buffer_capacity: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_message_len: MESSAGE_MAX_LEN,
            recv_buffer_capacity: RECV_BUFFER_MAX_LEN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_writes_le_prefix() {
        let mut buf = BytesMut::new();
        encode_frame(b"{}", MESSAGE_MAX_LEN, &mut buf).unwrap();
        assert_eq!(buf.as_ref(), &[2, 0, 0, 0, b'{', b'}']);
    }

    #[test]
    fn decode_consumes_exactly_one_frame() {
        let mut buf = BytesMut::new();
        encode_frame(b"first", MESSAGE_MAX_LEN, &mut buf).unwrap();
        encode_frame(b"second", MESSAGE_MAX_LEN, &mut buf).unwrap();

        let first = decode_frame(&mut buf, MESSAGE_MAX_LEN).unwrap().unwrap();
        assert_eq!(first.as_ref(), b"first");
        assert_eq!(buf.len(), HEADER_SIZE + 6);

        let second = decode_frame(&mut buf, MESSAGE_MAX_LEN).unwrap().unwrap();
        assert_eq!(second.as_ref(), b"second");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_header_and_one_byte() {
        let mut buf = BytesMut::from(&[5u8, 0, 0, 0][..]);
        assert!(decode_frame(&mut buf, MESSAGE_MAX_LEN).unwrap().is_none());
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_frame(b"hello", MESSAGE_MAX_LEN, &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 2);

        assert!(decode_frame(&mut buf, MESSAGE_MAX_LEN).unwrap().is_none());
        assert_eq!(buf.len(), HEADER_SIZE + 2);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let mut buf = BytesMut::new();
        let payload = vec![b'x'; 16];
        let err = encode_frame(&payload, 19, &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 20, max: 19 }));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_rejects_oversized_announcement() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1024);
        buf.put_u8(b'{');

        let err = decode_frame(&mut buf, 64).unwrap_err();
        assert!(err.is_corruption());
    }
}
