//! Wire format of the multiplexer stream.
//!
//! Everything the reliable stream carries is a length-prefixed frame:
//!
//! ```text
//! +--------+------------+--------------------------+
//! | len(2) | connIdx(2) | payload (len - 4 bytes)  |
//! +--------+------------+--------------------------+
//! ```
//!
//! Both header fields are little-endian and `len` counts the whole frame,
//! header included.  A nonzero `connIdx` addresses one multiplexed TCP
//! connection and the payload is opaque application bytes.  `connIdx == 0`
//! marks a control frame whose payload starts with a type byte:
//!
//! ```text
//! CLOSE_CONN  | len(2) | 0x0000 | 0x01 | connIdx(2) |
//! KEEPALIVE   | len(2) | 0x0000 | 0x02 |
//! ```
//!
//! No I/O happens here — this is pure data transformation.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Frame header size: length prefix plus connection index.
pub const HEADER_LEN: usize = 4;

/// Largest payload a single data frame can carry; `len` is 16 bits and
/// covers the header too.
pub const MAX_PAYLOAD: usize = u16::MAX as usize - HEADER_LEN;

/// Connection index reserved for control frames.
pub const CONTROL_IDX: u16 = 0;

const TYPE_CLOSE_CONN: u8 = 0x01;
const TYPE_KEEPALIVE: u8 = 0x02;

/// Errors that desynchronize the multiplexer stream.  Framing cannot be
/// recovered past any of these, so they end the whole conversation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The length prefix is smaller than the frame header itself.
    #[error("frame length {0} is smaller than the 4-byte header")]
    BadLength(u16),
    /// A control frame too short to hold its type byte or its payload.
    #[error("truncated control frame ({0} bytes)")]
    TruncatedControl(usize),
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Opaque bytes for the TCP connection at `idx`.
    Data { idx: u16, payload: Bytes },
    /// The peer dropped connection `idx`.
    Close { idx: u16 },
    /// Liveness probe; carries nothing.
    Keepalive,
    /// A control frame with an unrecognized type byte.  The frame boundary
    /// is still known from `len`, so the caller can log and skip it.
    Unknown { ty: u8 },
}

/// Decode one frame from the front of `buf`, consuming it.
///
/// Returns `Ok(None)` without consuming anything until at least 4 bytes are
/// buffered and the buffer holds the full `len` bytes; only the first 4
/// bytes are examined before that point.
pub fn try_decode(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = usize::from(u16::from_le_bytes([buf[0], buf[1]]));
    if len < HEADER_LEN {
        return Err(FrameError::BadLength(len as u16));
    }
    if buf.len() < len {
        return Ok(None);
    }

    let frame = buf.split_to(len).freeze();
    let idx = u16::from_le_bytes([frame[2], frame[3]]);
    if idx != CONTROL_IDX {
        return Ok(Some(Frame::Data {
            idx,
            payload: frame.slice(HEADER_LEN..),
        }));
    }

    let body = &frame[HEADER_LEN..];
    let decoded = match body.split_first() {
        Some((&TYPE_CLOSE_CONN, rest)) if rest.len() >= 2 => Frame::Close {
            idx: u16::from_le_bytes([rest[0], rest[1]]),
        },
        Some((&TYPE_CLOSE_CONN, _)) => return Err(FrameError::TruncatedControl(len)),
        Some((&TYPE_KEEPALIVE, _)) => Frame::Keepalive,
        Some((&ty, _)) => Frame::Unknown { ty },
        None => return Err(FrameError::TruncatedControl(len)),
    };
    Ok(Some(decoded))
}

/// Encode one data frame.  `payload` must fit in a single frame; arbitrary
/// input is chunked by [`data_frames`].
pub fn encode_data(idx: u16, payload: &[u8]) -> Vec<u8> {
    debug_assert_ne!(idx, CONTROL_IDX);
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    let len = HEADER_LEN + payload.len();
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(&(len as u16).to_le_bytes());
    out.extend_from_slice(&idx.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Encode arbitrary-size input as a sequence of data frames, at most
/// [`MAX_PAYLOAD`] bytes each, preserving byte order.  Empty input yields
/// no frames.
pub fn data_frames(idx: u16, payload: &[u8]) -> Vec<Vec<u8>> {
    payload.chunks(MAX_PAYLOAD).map(|c| encode_data(idx, c)).collect()
}

/// Encode a CLOSE_CONN control frame for `idx`.
pub fn encode_close(idx: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(7);
    out.extend_from_slice(&7u16.to_le_bytes());
    out.extend_from_slice(&CONTROL_IDX.to_le_bytes());
    out.push(TYPE_CLOSE_CONN);
    out.extend_from_slice(&idx.to_le_bytes());
    out
}

/// Encode a KEEPALIVE control frame.
pub fn encode_keepalive() -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    out.extend_from_slice(&5u16.to_le_bytes());
    out.extend_from_slice(&CONTROL_IDX.to_le_bytes());
    out.push(TYPE_KEEPALIVE);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(mut buf: BytesMut) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(f) = try_decode(&mut buf).unwrap() {
            frames.push(f);
        }
        assert!(buf.is_empty(), "trailing bytes after decode");
        frames
    }

    #[test]
    fn data_frame_roundtrip() {
        let encoded = encode_data(2, b"hello");
        assert_eq!(encoded, [0x09, 0x00, 0x02, 0x00, b'h', b'e', b'l', b'l', b'o']);

        let frames = decode_all(BytesMut::from(&encoded[..]));
        assert_eq!(
            frames,
            [Frame::Data { idx: 2, payload: Bytes::from_static(b"hello") }]
        );
    }

    #[test]
    fn close_conn_exact_bytes() {
        assert_eq!(encode_close(2), [0x07, 0x00, 0x00, 0x00, 0x01, 0x02, 0x00]);
        assert_eq!(encode_close(0x1234), [0x07, 0x00, 0x00, 0x00, 0x01, 0x34, 0x12]);

        let frames = decode_all(BytesMut::from(&encode_close(0x1234)[..]));
        assert_eq!(frames, [Frame::Close { idx: 0x1234 }]);
    }

    #[test]
    fn keepalive_exact_bytes() {
        assert_eq!(encode_keepalive(), [0x05, 0x00, 0x00, 0x00, 0x02]);

        let frames = decode_all(BytesMut::from(&encode_keepalive()[..]));
        assert_eq!(frames, [Frame::Keepalive]);
    }

    #[test]
    fn incomplete_frame_consumes_nothing() {
        let mut buf = BytesMut::from(&[0x09, 0x00, 0x02][..]);
        assert_eq!(try_decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 3);

        // Header complete, payload still short by one byte.
        buf.extend_from_slice(&[0x00, b'h', b'e', b'l', b'l']);
        assert_eq!(try_decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 8);

        buf.extend_from_slice(b"o");
        assert!(matches!(
            try_decode(&mut buf).unwrap(),
            Some(Frame::Data { idx: 2, .. })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn streaming_decode_at_arbitrary_boundaries() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_data(2, b"hello"));
        stream.extend_from_slice(&encode_close(3));
        stream.extend_from_slice(&encode_keepalive());
        stream.extend_from_slice(&encode_data(0x0104, &[0xff; 300]));

        let expected = [
            Frame::Data { idx: 2, payload: Bytes::from_static(b"hello") },
            Frame::Close { idx: 3 },
            Frame::Keepalive,
            Frame::Data { idx: 0x0104, payload: Bytes::from(vec![0xff; 300]) },
        ];

        // Feed the concatenation in slices of several sizes; step 1 hits
        // every split point and the decoder must never consume bytes early.
        for step in [1usize, 2, 3, 7] {
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            for chunk in stream.chunks(step) {
                buf.extend_from_slice(chunk);
                while let Some(f) = try_decode(&mut buf).unwrap() {
                    decoded.push(f);
                }
            }
            assert_eq!(decoded, expected, "chunk size {step}");
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn length_below_header_is_rejected() {
        for len in 0u16..4 {
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(&[0x00, 0x00]);
            assert_eq!(try_decode(&mut buf), Err(FrameError::BadLength(len)));
        }
    }

    #[test]
    fn truncated_control_is_rejected() {
        // Control frame with no type byte at all.
        let mut buf = BytesMut::from(&[0x04, 0x00, 0x00, 0x00][..]);
        assert_eq!(try_decode(&mut buf), Err(FrameError::TruncatedControl(4)));

        // CLOSE_CONN missing its connection index.
        let mut buf = BytesMut::from(&[0x05, 0x00, 0x00, 0x00, 0x01][..]);
        assert_eq!(try_decode(&mut buf), Err(FrameError::TruncatedControl(5)));
    }

    #[test]
    fn unknown_control_type_keeps_stream_in_sync() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x06, 0x00, 0x00, 0x00, 0x7f, 0xaa]);
        buf.extend_from_slice(&encode_data(2, b"ok"));

        assert_eq!(try_decode(&mut buf).unwrap(), Some(Frame::Unknown { ty: 0x7f }));
        assert_eq!(
            try_decode(&mut buf).unwrap(),
            Some(Frame::Data { idx: 2, payload: Bytes::from_static(b"ok") })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn chunking_preserves_bytes_and_bounds() {
        let input: Vec<u8> = (0..2 * MAX_PAYLOAD + 5).map(|i| i as u8).collect();
        let frames = data_frames(7, &input);
        assert_eq!(frames.len(), 3);

        let mut reassembled = Vec::new();
        for frame in &frames {
            let mut buf = BytesMut::from(&frame[..]);
            match try_decode(&mut buf).unwrap() {
                Some(Frame::Data { idx, payload }) => {
                    assert_eq!(idx, 7);
                    assert!(payload.len() <= MAX_PAYLOAD);
                    assert!(!payload.is_empty());
                    reassembled.extend_from_slice(&payload);
                }
                other => panic!("expected data frame, got {other:?}"),
            }
        }
        assert_eq!(reassembled, input);
    }

    #[test]
    fn chunking_empty_input_yields_no_frames() {
        assert!(data_frames(2, b"").is_empty());
    }

    #[test]
    fn max_payload_fills_length_field() {
        let frame = encode_data(2, &vec![0xab; MAX_PAYLOAD]);
        assert_eq!(frame.len(), u16::MAX as usize);
        assert_eq!(&frame[..2], &u16::MAX.to_le_bytes());
    }
}
