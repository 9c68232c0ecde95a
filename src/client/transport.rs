//! Line-oriented framing between raw bytes and [`Message`].
//!
//! Inbound lines are scanned for `\n`, decoded as UTF-8 (invalid bytes are
//! replaced at this boundary), parsed, and handed up. A malformed line is
//! a `CodecError`: logged and dropped, never fatal. Outbound messages are
//! serialized through the length-aware encoder and terminated with CRLF.

use bytes::{BufMut, BytesMut};
use munin_proto::Message;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::AgentError;

/// Upper bound for one inbound line (command + tags headroom). Anything
/// longer without a newline is a protocol violation and closes the link.
const MAX_INBOUND_LINE: usize = 16 * 1024;

/// Codec turning a byte stream into parsed IRC messages and back.
#[derive(Debug, Default)]
pub struct LineCodec {
    /// Set when we are discarding an over-long line up to its newline.
    discarding: bool,
}

impl LineCodec {
    /// Create a codec.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = Message;
    type Error = AgentError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(newline) = src.iter().position(|&b| b == b'\n') else {
                if self.discarding {
                    src.clear();
                    return Ok(None);
                }
                if src.len() > MAX_INBOUND_LINE {
                    return Err(AgentError::ProtocolViolation(format!(
                        "line exceeds {} bytes without terminator",
                        MAX_INBOUND_LINE
                    )));
                }
                return Ok(None);
            };

            let line = src.split_to(newline + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if line.len() > MAX_INBOUND_LINE {
                warn!(len = line.len(), "Dropping over-long inbound line");
                continue;
            }

            // Invalid UTF-8 is replaced here; the parser itself sees &str.
            let text = String::from_utf8_lossy(&line);
            match Message::parse(&text) {
                Ok(msg) => return Ok(Some(msg)),
                Err(munin_proto::MessageParseError::EmptyMessage) => continue,
                Err(e) => {
                    warn!(error = %e, len = line.len(), "Dropping malformed line");
                    continue;
                }
            }
        }
    }
}

impl Encoder<Message> for LineCodec {
    type Error = AgentError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = item.to_line();
        if encoded.truncated {
            warn!(command = %item.command, "Outbound line truncated at 510 bytes");
        }
        dst.reserve(encoded.text.len() + 2);
        dst.put_slice(encoded.text.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(codec: &mut LineCodec, bytes: &[u8]) -> (BytesMut, Vec<Message>) {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Ok(Some(msg)) = codec.decode(&mut buf) {
            out.push(msg);
        }
        (buf, out)
    }

    #[test]
    fn decodes_complete_lines() {
        let mut codec = LineCodec::new();
        let (_, msgs) = feed(&mut codec, b"PING :x\r\nPRIVMSG #a :hi\r\n");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].command, "PING");
        assert_eq!(msgs[1].params[1], "hi");
    }

    #[test]
    fn waits_for_newline() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"PRIVMSG #a :partial"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(b" done\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.params[1], "partial done");
    }

    #[test]
    fn malformed_lines_are_dropped() {
        let mut codec = LineCodec::new();
        let (_, msgs) = feed(&mut codec, b"12 bogus numeric\r\nPING :ok\r\n");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].command, "PING");
    }

    #[test]
    fn bare_lf_is_accepted() {
        let mut codec = LineCodec::new();
        let (_, msgs) = feed(&mut codec, b"PING :x\n");
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn invalid_utf8_does_not_poison_stream() {
        let mut codec = LineCodec::new();
        let mut raw = Vec::new();
        raw.extend_from_slice(b"PRIVMSG #a :caf\xff\r\n");
        raw.extend_from_slice(b"PING :next\r\n");
        let (_, msgs) = feed(&mut codec, &raw);
        assert_eq!(msgs.len(), 2);
    }

    #[test]
    fn encoder_appends_crlf() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Message::privmsg("#a", "hello there"), &mut buf).unwrap();
        assert_eq!(&buf[..], b"PRIVMSG #a :hello there\r\n");
    }
}
