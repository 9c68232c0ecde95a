//! SASL authentication over IRC.
//!
//! The AUTHENTICATE exchange carries base64 payloads in 400-byte chunks.
//! This module provides the PLAIN and EXTERNAL payloads plus the chunking
//! rules; SCRAM-SHA-256 lives in [`scram`].

pub mod scram;

pub use scram::{ScramClient, ScramError, ScramState};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Maximum bytes per AUTHENTICATE argument.
pub const AUTHENTICATE_CHUNK: usize = 400;

/// A SASL mechanism the agent can drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaslMechanism {
    /// RFC 4616 PLAIN.
    Plain,
    /// EXTERNAL (TLS client certificate).
    External,
    /// RFC 5802/7677 SCRAM-SHA-256.
    ScramSha256,
}

impl SaslMechanism {
    /// The mechanism name as sent in `AUTHENTICATE <name>`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::External => "EXTERNAL",
            Self::ScramSha256 => "SCRAM-SHA-256",
        }
    }
}

/// Build the PLAIN payload: base64 of `authzid \0 authcid \0 password`.
pub fn plain_payload(authzid: &str, authcid: &str, password: &str) -> String {
    let raw = format!("{}\0{}\0{}", authzid, authcid, password);
    BASE64.encode(raw.as_bytes())
}

/// Split a base64 payload into AUTHENTICATE arguments.
///
/// An empty payload, or one whose length is an exact multiple of the chunk
/// size, is terminated with a lone `+`.
pub fn chunk_payload(payload: &str) -> Vec<String> {
    if payload.is_empty() {
        return vec!["+".to_string()];
    }

    let bytes = payload.as_bytes();
    let mut chunks: Vec<String> = bytes
        .chunks(AUTHENTICATE_CHUNK)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect();
    if bytes.len() % AUTHENTICATE_CHUNK == 0 {
        chunks.push("+".to_string());
    }
    chunks
}

/// Decode a base64 string, rejecting malformed input.
pub fn decode_base64(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_payload_layout() {
        // base64("alice\0alice\0pw")
        assert_eq!(plain_payload("alice", "alice", "pw"), "YWxpY2UAYWxpY2UAcHc=");
    }

    #[test]
    fn short_payload_is_one_chunk() {
        assert_eq!(chunk_payload("abcd"), vec!["abcd"]);
    }

    #[test]
    fn empty_payload_is_plus() {
        assert_eq!(chunk_payload(""), vec!["+"]);
    }

    #[test]
    fn exact_multiple_gets_terminator() {
        let payload = "a".repeat(AUTHENTICATE_CHUNK);
        let chunks = chunk_payload(&payload);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], "+");
    }

    #[test]
    fn long_payload_is_split() {
        let payload = "a".repeat(AUTHENTICATE_CHUNK + 10);
        let chunks = chunk_payload(&payload);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), AUTHENTICATE_CHUNK);
        assert_eq!(chunks[1].len(), 10);
    }
}
