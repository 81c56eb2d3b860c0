//! Encoding and decoding of Chorus frames.
//!
//! Frames are MessagePack-encoded and carried with a 4-byte big-endian
//! length prefix so they can be streamed over any byte transport.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum encoded frame size (1 MiB).
///
/// Chat content and signaling payloads are bounded well below this; anything
/// larger is a protocol violation.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode a complete frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Structurally invalid frame.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a frame to a standalone buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = rmp_serde::to_vec_named(frame)?;

    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);

    Ok(())
}

/// Decode a single frame from a complete buffer.
///
/// # Errors
///
/// Returns [`ProtocolError::Incomplete`] if the buffer holds less than one
/// full frame.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total = LENGTH_PREFIX_SIZE + length;
    if data.len() < total {
        return Err(ProtocolError::Incomplete(total - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total])?)
}

/// Try to decode one frame from a streaming buffer, consuming it on success.
///
/// Returns `Ok(None)` when more data is needed.
///
/// # Errors
///
/// Returns an error if the pending frame is oversized or malformed.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let body = buf.split_to(length);
    Ok(Some(rmp_serde::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::CallKind;

    #[test]
    fn roundtrip_representative_frames() {
        let frames = vec![
            Frame::connect("token-abc"),
            Frame::connected("conn-1", "user-1", 30_000),
            Frame::ack(9),
            Frame::error(9, 1004, "call already active"),
            Frame::JoinChat {
                id: 1,
                chat_id: "chat-7".into(),
            },
            Frame::StartCall {
                id: 2,
                chat_id: "chat-7".into(),
                kind: CallKind::AudioRoom,
            },
            Frame::IceCandidate {
                call_id: "call-3".into(),
                target_user_id: "user-2".into(),
                payload: b"candidate:1 1 udp".to_vec(),
            },
            Frame::event("message_received", b"\x81".to_vec()),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn incomplete_buffer_reports_missing_bytes() {
        let encoded = encode(&Frame::ack(1)).unwrap();
        match decode(&encoded[..2]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("expected Incomplete, got {other:?}"),
        }
    }

    #[test]
    fn oversized_frame_rejected_on_encode() {
        let frame = Frame::event("blob", vec![0u8; MAX_FRAME_SIZE + 1]);
        assert!(matches!(
            encode(&frame),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn streaming_decode_consumes_frames_in_order() {
        let mut buf = BytesMut::new();
        encode_into(&Frame::ack(1), &mut buf).unwrap();
        encode_into(
            &Frame::StartTyping {
                chat_id: "chat-1".into(),
            },
            &mut buf,
        )
        .unwrap();

        assert_eq!(decode_from(&mut buf).unwrap(), Some(Frame::ack(1)));
        assert!(matches!(
            decode_from(&mut buf).unwrap(),
            Some(Frame::StartTyping { .. })
        ));
        assert_eq!(decode_from(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_stream_waits_for_more_data() {
        let encoded = encode(&Frame::ack(5)).unwrap();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(decode_from(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[encoded.len() - 1..]);
        assert_eq!(decode_from(&mut buf).unwrap(), Some(Frame::ack(5)));
    }
}
