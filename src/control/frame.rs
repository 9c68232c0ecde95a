//! Length-prefixed control frames.
//!
//! Wire layout: `MAGT | version(1) | type(1) | seq(4 BE) | length(4 BE) |
//! payload`. Payloads are capped at 1 MiB; the cap is enforced on the
//! declared length before any allocation happens. Requests carry a
//! caller-chosen sequence number echoed in the reply; server-originated
//! events use sequence 0.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::types::MessageType;
use crate::error::AgentError;

/// Frame magic.
pub const MAGIC: [u8; 4] = *b"MAGT";
/// Protocol version.
pub const VERSION: u8 = 1;
/// Header size in bytes.
pub const HEADER_LEN: usize = 14;
/// Maximum payload size.
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// One control frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Raw message type byte (unknown types answer `NotSupported`).
    pub msg_type: u8,
    /// Request/response correlation; 0 for pushed events.
    pub seq: u32,
    /// Opaque payload (UTF-8 text or JSON by type).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame from a known type.
    pub fn new(kind: MessageType, seq: u32, payload: Vec<u8>) -> Self {
        Self {
            msg_type: kind.as_byte(),
            seq,
            payload,
        }
    }

    /// Build a frame with a UTF-8 text payload.
    pub fn text(kind: MessageType, seq: u32, text: &str) -> Self {
        Self::new(kind, seq, text.as_bytes().to_vec())
    }

    /// The known type, when the byte is recognised.
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_byte(self.msg_type)
    }

    /// The payload as UTF-8 text.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Codec for control frames over a byte stream.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a codec.
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = AgentError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if src[0..4] != MAGIC {
            return Err(AgentError::ProtocolViolation("bad frame magic".to_string()));
        }
        if src[4] != VERSION {
            return Err(AgentError::ProtocolViolation(format!(
                "unsupported protocol version {}",
                src[4]
            )));
        }

        let length = u32::from_be_bytes([src[10], src[11], src[12], src[13]]) as usize;
        if length > MAX_PAYLOAD {
            // Rejected before any payload allocation.
            return Err(AgentError::ProtocolViolation(format!(
                "frame payload {} exceeds {} byte cap",
                length, MAX_PAYLOAD
            )));
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        let msg_type = src[5];
        let seq = u32::from_be_bytes([src[6], src[7], src[8], src[9]]);
        src.advance(HEADER_LEN);
        let payload = src.split_to(length).to_vec();

        Ok(Some(Frame {
            msg_type,
            seq,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = AgentError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.len() > MAX_PAYLOAD {
            return Err(AgentError::ProtocolViolation(format!(
                "outbound payload {} exceeds cap",
                frame.payload.len()
            )));
        }

        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_slice(&MAGIC);
        dst.put_u8(VERSION);
        dst.put_u8(frame.msg_type);
        dst.put_u32(frame.seq);
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn round_trip() {
        let frame = Frame::new(MessageType::Ping, 42, b"payload".to_vec());
        let mut buf = encode(frame.clone());
        let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn wire_layout_is_stable() {
        let buf = encode(Frame::new(MessageType::AuthChallenge, 7, vec![0xAA, 0xBB]));
        assert_eq!(&buf[0..4], b"MAGT");
        assert_eq!(buf[4], 1); // version
        assert_eq!(buf[5], 0x01); // type
        assert_eq!(&buf[6..10], &[0, 0, 0, 7]); // seq, big-endian
        assert_eq!(&buf[10..14], &[0, 0, 0, 2]); // length, big-endian
        assert_eq!(&buf[14..], &[0xAA, 0xBB]);
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let full = encode(Frame::new(MessageType::Ping, 1, vec![1, 2, 3, 4]));
        let mut codec = FrameCodec::new();

        // Any truncation point yields None, never a frame and never an error.
        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(codec.decode(&mut partial).unwrap().is_none(), "cut at {}", cut);
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let mut buf = encode(Frame::new(MessageType::Ping, 1, vec![]));
        buf[0] = b'X';
        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(AgentError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn unknown_version_rejected() {
        let mut buf = encode(Frame::new(MessageType::Ping, 1, vec![]));
        buf[4] = 2;
        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(AgentError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn inflated_length_rejected_without_allocation() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(MessageType::Ping.as_byte());
        buf.put_u32(1);
        buf.put_u32((MAX_PAYLOAD + 1) as u32);
        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(AgentError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn payload_at_cap_is_accepted() {
        let frame = Frame::new(MessageType::SendRaw, 9, vec![0; MAX_PAYLOAD]);
        let mut buf = encode(frame.clone());
        let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload.len(), MAX_PAYLOAD);
    }

    #[test]
    fn oversize_outbound_rejected() {
        let frame = Frame::new(MessageType::SendRaw, 9, vec![0; MAX_PAYLOAD + 1]);
        let mut buf = BytesMut::new();
        assert!(FrameCodec::new().encode(frame, &mut buf).is_err());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut buf = encode(Frame::text(MessageType::Ping, 1, "a"));
        buf.extend_from_slice(&encode(Frame::text(MessageType::Pong, 2, "b")));
        let mut codec = FrameCodec::new();
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.kind(), Some(MessageType::Ping));
        assert_eq!(second.kind(), Some(MessageType::Pong));
        assert_eq!(second.seq, 2);
    }
}
