//! Wire client for the relay companion.
//!
//! The relay is a separate tool that terminates near the IRC network and
//! forwards a byte pipe on the agent's behalf. Its protocol: magic
//! `MUNIN`, version 1, a one-byte type, then TLV fields (one-byte length
//! for short strings, two-byte length for messages). Authentication is an
//! HMAC-SHA256 challenge against the shared secret; a `Connect` request
//! carries `hostname || port(u16) || useSsl(bool)`. After a successful
//! connect the socket is a transparent tunnel.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::crypto::hmac_sha256;
use crate::error::{AgentError, AgentResult};

/// Relay frame magic.
pub const MAGIC: &[u8; 5] = b"MUNIN";
/// Relay protocol version.
pub const VERSION: u8 = 1;
/// Hostnames are length-prefixed with one byte.
pub const MAX_HOSTNAME: usize = 255;

/// Handshake steps must finish within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Relay message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayType {
    /// Relay -> agent: random challenge.
    AuthChallenge = 0x01,
    /// Agent -> relay: HMAC over the challenge.
    AuthResponse = 0x02,
    /// Authentication accepted.
    AuthSuccess = 0x03,
    /// Authentication rejected; message follows.
    AuthFailure = 0x04,
    /// Agent -> relay: open an onward connection.
    Connect = 0x10,
    /// Onward connection established; the tunnel is live.
    ConnectSuccess = 0x11,
    /// Onward connection failed; message follows.
    ConnectFailure = 0x12,
}

impl RelayType {
    fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => Self::AuthChallenge,
            0x02 => Self::AuthResponse,
            0x03 => Self::AuthSuccess,
            0x04 => Self::AuthFailure,
            0x10 => Self::Connect,
            0x11 => Self::ConnectSuccess,
            0x12 => Self::ConnectFailure,
            _ => return None,
        })
    }
}

/// Open an authenticated tunnel to `target_host:target_port` through the
/// relay. Returns the socket, now a transparent byte pipe.
pub async fn open_tunnel(
    relay_host: &str,
    relay_port: u16,
    secret: &str,
    target_host: &str,
    target_port: u16,
    use_ssl: bool,
) -> AgentResult<TcpStream> {
    let mut stream = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        TcpStream::connect((relay_host, relay_port)),
    )
    .await
    .map_err(|_| {
        AgentError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "relay connect timeout",
        ))
    })??;
    stream.set_nodelay(true)?;

    tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        // Challenge-response auth.
        let (msg_type, challenge) = read_short_frame(&mut stream).await?;
        if msg_type != RelayType::AuthChallenge {
            return Err(AgentError::ProtocolViolation(
                "relay did not open with a challenge".to_string(),
            ));
        }
        debug!(challenge_len = challenge.len(), "Relay challenge received");

        let mac = hmac_sha256(secret.as_bytes(), &challenge);
        write_short_frame(&mut stream, RelayType::AuthResponse, &mac).await?;

        let (msg_type, body) = read_message_frame(&mut stream).await?;
        match msg_type {
            RelayType::AuthSuccess => {}
            RelayType::AuthFailure => {
                return Err(AgentError::Auth(format!(
                    "relay rejected credentials: {}",
                    String::from_utf8_lossy(&body)
                )));
            }
            other => {
                return Err(AgentError::ProtocolViolation(format!(
                    "unexpected relay reply {:?} to auth",
                    other
                )));
            }
        }

        // Onward connect request.
        let request = encode_connect(target_host, target_port, use_ssl)?;
        write_frame_raw(&mut stream, RelayType::Connect, &request).await?;

        let (msg_type, body) = read_message_frame(&mut stream).await?;
        match msg_type {
            RelayType::ConnectSuccess => {
                info!(target = %target_host, port = target_port, ssl = use_ssl, "Relay tunnel established");
                Ok(())
            }
            RelayType::ConnectFailure => Err(AgentError::Io(std::io::Error::other(format!(
                "relay connect failed: {}",
                String::from_utf8_lossy(&body)
            )))),
            other => Err(AgentError::ProtocolViolation(format!(
                "unexpected relay reply {:?} to connect",
                other
            ))),
        }
    })
    .await
    .map_err(|_| {
        AgentError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "relay handshake timeout",
        ))
    })??;

    Ok(stream)
}

/// Encode the `Connect` body: `len(1) hostname || port(u16 BE) || ssl(1)`.
pub fn encode_connect(hostname: &str, port: u16, use_ssl: bool) -> AgentResult<Vec<u8>> {
    if hostname.len() > MAX_HOSTNAME {
        return Err(AgentError::Config(format!(
            "hostname longer than {} bytes",
            MAX_HOSTNAME
        )));
    }
    let mut body = Vec::with_capacity(hostname.len() + 4);
    body.push(hostname.len() as u8);
    body.extend_from_slice(hostname.as_bytes());
    body.extend_from_slice(&port.to_be_bytes());
    body.push(use_ssl as u8);
    Ok(body)
}

/// Decode a `Connect` body, kept in step with the relay's parser.
#[cfg_attr(not(test), allow(dead_code))]
pub fn decode_connect(body: &[u8]) -> AgentResult<(String, u16, bool)> {
    let Some((&len, rest)) = body.split_first() else {
        return Err(AgentError::ProtocolViolation("empty connect body".into()));
    };
    let len = len as usize;
    if rest.len() != len + 3 {
        return Err(AgentError::ProtocolViolation(
            "connect body length mismatch".into(),
        ));
    }
    let hostname = String::from_utf8(rest[..len].to_vec())
        .map_err(|_| AgentError::ProtocolViolation("hostname is not UTF-8".into()))?;
    let port = u16::from_be_bytes([rest[len], rest[len + 1]]);
    let use_ssl = rest[len + 2] != 0;
    Ok((hostname, port, use_ssl))
}

/// Header: `MUNIN || version || type`.
fn encode_header(msg_type: RelayType) -> [u8; 7] {
    let mut header = [0u8; 7];
    header[..5].copy_from_slice(MAGIC);
    header[5] = VERSION;
    header[6] = msg_type as u8;
    header
}

async fn read_header(stream: &mut TcpStream) -> AgentResult<RelayType> {
    let mut header = [0u8; 7];
    stream.read_exact(&mut header).await?;
    if &header[..5] != MAGIC {
        return Err(AgentError::ProtocolViolation("bad relay magic".into()));
    }
    if header[5] != VERSION {
        return Err(AgentError::ProtocolViolation(format!(
            "unsupported relay version {}",
            header[5]
        )));
    }
    RelayType::from_byte(header[6])
        .ok_or_else(|| AgentError::ProtocolViolation(format!("unknown relay type {:#04x}", header[6])))
}

/// Read a frame whose body is a one-byte-length short string.
async fn read_short_frame(stream: &mut TcpStream) -> AgentResult<(RelayType, Vec<u8>)> {
    let msg_type = read_header(stream).await?;
    let len = stream.read_u8().await? as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok((msg_type, body))
}

/// Read a frame whose body is a two-byte-length message.
async fn read_message_frame(stream: &mut TcpStream) -> AgentResult<(RelayType, Vec<u8>)> {
    let msg_type = read_header(stream).await?;
    let len = stream.read_u16().await? as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok((msg_type, body))
}

/// Write a frame with a one-byte-length body.
async fn write_short_frame(
    stream: &mut TcpStream,
    msg_type: RelayType,
    body: &[u8],
) -> AgentResult<()> {
    debug_assert!(body.len() <= u8::MAX as usize);
    stream.write_all(&encode_header(msg_type)).await?;
    stream.write_u8(body.len() as u8).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

/// Write a frame whose body carries its own internal layout.
async fn write_frame_raw(
    stream: &mut TcpStream,
    msg_type: RelayType,
    body: &[u8],
) -> AgentResult<()> {
    stream.write_all(&encode_header(msg_type)).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_body_round_trip() {
        let body = encode_connect("irc.example.org", 6697, true).unwrap();
        let (host, port, ssl) = decode_connect(&body).unwrap();
        assert_eq!(host, "irc.example.org");
        assert_eq!(port, 6697);
        assert!(ssl);
    }

    #[test]
    fn connect_body_layout() {
        let body = encode_connect("ab", 0x1234, false).unwrap();
        assert_eq!(body, vec![2, b'a', b'b', 0x12, 0x34, 0]);
    }

    #[test]
    fn hostname_length_is_bounded() {
        let long = "a".repeat(256);
        assert!(encode_connect(&long, 1, false).is_err());
        let max = "a".repeat(255);
        assert!(encode_connect(&max, 1, false).is_ok());
    }

    #[test]
    fn truncated_connect_body_rejected() {
        let mut body = encode_connect("host", 1, true).unwrap();
        body.pop();
        assert!(decode_connect(&body).is_err());
    }

    #[test]
    fn header_layout() {
        let header = encode_header(RelayType::Connect);
        assert_eq!(&header[..5], b"MUNIN");
        assert_eq!(header[5], 1);
        assert_eq!(header[6], 0x10);
    }
}
