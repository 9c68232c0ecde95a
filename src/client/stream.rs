//! Unified stream type and connectors for IRC connections.
//!
//! Wraps plaintext TCP and TLS so the transport layer stays agnostic to
//! connection security. A connection can also be tunneled through the
//! relay companion, in which case the relay performs the onward connect
//! (and TLS, when requested) and this side stays a plain byte pipe.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{self, pki_types::ServerName};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::{ServerConfig, TlsClientConfig};
use crate::error::{AgentError, AgentResult};
use crate::relay;

/// TCP connect timeout.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// TLS handshake timeout.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// A unified stream for IRC connections.
pub enum IrcStream {
    /// Plaintext TCP (including relay tunnels).
    Plain(TcpStream),
    /// TLS-encrypted connection.
    Tls(Box<TlsStream<TcpStream>>),
}

impl IrcStream {
    /// Returns true if this is a TLS-encrypted connection.
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for IrcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IrcStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IrcStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IrcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            IrcStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IrcStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IrcStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IrcStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IrcStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IrcStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Result of the TCP phase: either a direct socket that may still want a
/// TLS upgrade, or a relay tunnel that is already end-to-end.
pub enum TcpPhase {
    /// Direct socket; TLS upgrade may follow.
    Direct(TcpStream),
    /// Relay tunnel; the relay performs onward TLS when requested.
    Tunnel(TcpStream),
}

/// Establish the TCP leg to the configured server (or its relay).
pub async fn connect_tcp(
    server: &ServerConfig,
    relay_secret: Option<&str>,
) -> AgentResult<TcpPhase> {
    if let Some(proxy) = &server.proxy {
        // The relay performs the onward connect and optional TLS; this leg
        // stays a plain byte pipe.
        let secret = relay_secret.ok_or_else(|| {
            AgentError::Config("relay proxy configured without a secret".to_string())
        })?;
        let stream = relay::open_tunnel(
            &proxy.host,
            proxy.port,
            secret,
            &server.host,
            server.port,
            server.tls.enabled,
        )
        .await?;
        debug!(server = %server.id, relay = %proxy.host, "Connected through relay tunnel");
        return Ok(TcpPhase::Tunnel(stream));
    }

    let tcp = tokio::time::timeout(
        TCP_CONNECT_TIMEOUT,
        TcpStream::connect((server.host.as_str(), server.port)),
    )
    .await
    .map_err(|_| AgentError::Io(io::Error::new(io::ErrorKind::TimedOut, "tcp connect timeout")))??;
    tcp.set_nodelay(true)?;
    Ok(TcpPhase::Direct(tcp))
}

/// Upgrade the TCP phase to the final stream, running the TLS handshake
/// when the configuration asks for one.
pub async fn upgrade_tls(phase: TcpPhase, server: &ServerConfig) -> AgentResult<IrcStream> {
    let tcp = match phase {
        TcpPhase::Tunnel(stream) => return Ok(IrcStream::Plain(stream)),
        TcpPhase::Direct(tcp) if !server.tls.enabled => return Ok(IrcStream::Plain(tcp)),
        TcpPhase::Direct(tcp) => tcp,
    };

    let connector = build_connector(&server.tls)?;
    let name = ServerName::try_from(server.host.clone())
        .map_err(|e| AgentError::Tls(format!("invalid server name {}: {}", server.host, e)))?;

    let tls = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(name, tcp))
        .await
        .map_err(|_| AgentError::Tls("tls handshake timeout".to_string()))?
        .map_err(|e| AgentError::Tls(e.to_string()))?;

    Ok(IrcStream::Tls(Box::new(tls)))
}

/// Build a TLS connector for one server's settings.
fn build_connector(tls: &TlsClientConfig) -> AgentResult<TlsConnector> {
    let builder = rustls::ClientConfig::builder();

    let builder = if tls.accept_invalid_certificates {
        warn!("TLS certificate verification is DISABLED for this connection");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
    } else {
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            // Unusable platform certs are skipped, not fatal.
            let _ = roots.add(cert);
        }
        builder.with_root_certificates(roots)
    };

    let config = match &tls.client_cert_path {
        Some(path) => {
            let (certs, key) = load_client_identity(path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| AgentError::Tls(format!("client certificate rejected: {}", e)))?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Load a PEM file holding the client certificate chain and private key.
fn load_client_identity(
    path: &str,
) -> AgentResult<(
    Vec<rustls::pki_types::CertificateDer<'static>>,
    rustls::pki_types::PrivateKeyDer<'static>,
)> {
    let pem = std::fs::read(path)
        .map_err(|e| AgentError::Tls(format!("cannot read client certificate {}: {}", path, e)))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| AgentError::Tls(format!("bad certificate in {}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(AgentError::Tls(format!("no certificate found in {}", path)));
    }

    let key = rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| AgentError::Tls(format!("bad private key in {}: {}", path, e)))?
        .ok_or_else(|| AgentError::Tls(format!("no private key found in {}", path)))?;

    Ok((certs, key))
}

/// Certificate verifier that accepts anything. Selected only by explicit
/// configuration, and logged loudly at connect time.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
