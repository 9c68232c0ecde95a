//! The control listener and per-session protocol driver.
//!
//! Sessions pass four gates: the IP allow-list, the (optional but default)
//! TLS handshake, the HMAC challenge-response, and only then command
//! dispatch. Authenticated sessions receive heartbeats every 30 seconds,
//! are dropped after 90 seconds of silence, and are closed when their
//! outbound buffer exceeds 4 MiB so a slow reader cannot grow our memory.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use ipnet::IpNet;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::frame::{Frame, FrameCodec, HEADER_LEN};
use super::handlers::{self, agent_info_json};
use super::types::MessageType;
use crate::agent::AgentCommand;
use crate::binds::BindRegistry;
use crate::client::{ConnectionHandle, Event};
use crate::config::Config;
use crate::crypto::{self, Vault};
use crate::error::{AgentError, AgentResult};
use crate::protect::ProtectionEngine;
use crate::userdb::UserDb;

/// Authentication must complete within this window.
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
/// TLS accept deadline, inside the auth window.
const TLS_ACCEPT_TIMEOUT: Duration = Duration::from_secs(15);
/// Heartbeat cadence after authentication.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// A peer silent for this long is dropped.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// Outbound buffer cap per session.
const MAX_SESSION_BUFFER: usize = 4 * 1024 * 1024;
/// Outbound frame queue depth.
const OUTBOUND_QUEUE: usize = 1024;

/// Shared state the control plane reads and acts on.
pub struct ControlDeps {
    /// Live connections keyed by server id.
    pub connections: Arc<DashMap<String, ConnectionHandle>>,
    /// User database.
    pub userdb: Arc<UserDb>,
    /// Bind registry.
    pub binds: Arc<BindRegistry>,
    /// Secrets vault (lock state reporting).
    pub vault: Arc<Vault>,
    /// Protection engine (status reporting).
    pub protection: Arc<ProtectionEngine>,
    /// Aggregated event stream across all connections.
    pub events: broadcast::Sender<Event>,
    /// Commands that need the agent host (connect/reload/restart).
    pub agent_tx: mpsc::Sender<AgentCommand>,
    /// Process shutdown broadcast.
    pub shutdown: broadcast::Sender<()>,
    /// Agent start time, for uptime reporting.
    pub started_at: DateTime<Utc>,
    /// Log directory, for `GetLogs`.
    pub log_directory: String,
    /// Shared control auth token (HMAC key).
    pub auth_token: String,
}

/// One allow-list rule.
enum AllowRule {
    Any,
    Exact(IpAddr),
    Net(IpNet),
}

impl AllowRule {
    fn parse(entry: &str) -> AgentResult<Self> {
        if entry == "*" {
            return Ok(Self::Any);
        }
        if let Ok(ip) = entry.parse::<IpAddr>() {
            return Ok(Self::Exact(ip));
        }
        entry
            .parse::<IpNet>()
            .map(Self::Net)
            .map_err(|_| AgentError::Config(format!("bad allow-list entry: {}", entry)))
    }

    fn matches(&self, ip: IpAddr) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(allowed) => *allowed == ip,
            Self::Net(net) => net.contains(&ip),
        }
    }
}

/// The control plane listener.
pub struct ControlServer {
    port: u16,
    acceptor: Option<TlsAcceptor>,
    allow_list: Vec<AllowRule>,
    deps: Arc<ControlDeps>,
}

impl ControlServer {
    /// Build the listener from configuration. TLS is required unless the
    /// operator explicitly turned it off.
    pub fn new(config: &Config, deps: Arc<ControlDeps>) -> AgentResult<Self> {
        let acceptor = if config.require_tls {
            let tls = config.control_tls.as_ref().ok_or_else(|| {
                AgentError::Config("requireTls set without controlTls material".to_string())
            })?;
            Some(build_acceptor(&tls.cert_path, &tls.key_path)?)
        } else {
            warn!("Control plane TLS is DISABLED by configuration");
            None
        };

        let allow_list = config
            .allowed_ips
            .iter()
            .map(|e| AllowRule::parse(e))
            .collect::<AgentResult<Vec<_>>>()?;

        Ok(Self {
            port: config.control_port,
            acceptor,
            allow_list,
            deps,
        })
    }

    /// Accept sessions until shutdown.
    pub async fn run(self) -> AgentResult<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        info!(port = self.port, tls = self.acceptor.is_some(), "Control server listening");

        let mut shutdown_rx = self.deps.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Control accept failed");
                            continue;
                        }
                    };

                    if !self.peer_allowed(peer.ip()) {
                        warn!(peer = %peer, audit = true, "Control connection refused by allow-list");
                        continue;
                    }

                    let acceptor = self.acceptor.clone();
                    let deps = self.deps.clone();
                    tokio::spawn(async move {
                        if let Err(e) = accept_session(socket, peer, acceptor, deps).await {
                            debug!(peer = %peer, error = %e, "Control session ended with error");
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    info!("Control server stopping; no new sessions accepted");
                    return Ok(());
                }
            }
        }
    }

    fn peer_allowed(&self, ip: IpAddr) -> bool {
        self.allow_list.is_empty() || self.allow_list.iter().any(|r| r.matches(ip))
    }
}

fn build_acceptor(cert_path: &str, key_path: &str) -> AgentResult<TlsAcceptor> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| AgentError::Tls(format!("cannot read {}: {}", cert_path, e)))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| AgentError::Tls(format!("cannot read {}: {}", key_path, e)))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| AgentError::Tls(format!("bad certificate: {}", e)))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| AgentError::Tls(format!("bad key: {}", e)))?
        .ok_or_else(|| AgentError::Tls(format!("no private key in {}", key_path)))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| AgentError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn accept_session(
    socket: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    deps: Arc<ControlDeps>,
) -> AgentResult<()> {
    match acceptor {
        Some(acceptor) => {
            let tls = tokio::time::timeout(TLS_ACCEPT_TIMEOUT, acceptor.accept(socket))
                .await
                .map_err(|_| AgentError::Tls("control TLS accept timeout".to_string()))?
                .map_err(|e| AgentError::Tls(e.to_string()))?;
            run_session(tls, peer, deps).await
        }
        None => run_session(socket, peer, deps).await,
    }
}

async fn run_session<S>(stream: S, peer: SocketAddr, deps: Arc<ControlDeps>) -> AgentResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(stream, FrameCodec::new());

    // Challenge-response: 32 random bytes, HMAC-SHA256 under the shared
    // token, constant-time comparison, hard 30-second deadline.
    let challenge: [u8; 32] = crypto::random_bytes();
    framed
        .send(Frame::new(MessageType::AuthChallenge, 0, challenge.to_vec()))
        .await?;

    let response = tokio::time::timeout(AUTH_TIMEOUT, framed.next())
        .await
        .map_err(|_| {
            warn!(peer = %peer, audit = true, "Control auth timed out");
            AgentError::Auth("auth timeout".to_string())
        })?
        .ok_or_else(|| AgentError::Auth("peer closed during auth".to_string()))??;

    if response.kind() != Some(MessageType::AuthResponse) {
        framed
            .send(Frame::text(MessageType::AuthFailure, response.seq, "expected AuthResponse"))
            .await?;
        warn!(peer = %peer, audit = true, "Control auth protocol error");
        return Err(AgentError::Auth("expected AuthResponse".to_string()));
    }

    let expected = crypto::hmac_sha256(deps.auth_token.as_bytes(), &challenge);
    if !crypto::constant_time_eq(&response.payload, &expected) {
        framed
            .send(Frame::text(MessageType::AuthFailure, response.seq, "bad credentials"))
            .await?;
        warn!(peer = %peer, audit = true, "Control auth failed");
        return Err(AgentError::Auth("bad control credentials".to_string()));
    }

    framed
        .send(Frame::new(
            MessageType::AuthSuccess,
            response.seq,
            agent_info_json(&deps).into_bytes(),
        ))
        .await?;
    info!(peer = %peer, "Control session authenticated");

    // Writer sub-task with byte-accounted outbound queue.
    let (writer, mut reader) = framed.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
    let buffered = Arc::new(AtomicUsize::new(0));

    let writer_buffered = buffered.clone();
    let mut writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(frame) = frame_rx.recv().await {
            let size = frame.payload.len() + HEADER_LEN;
            let result = writer.send(frame).await;
            writer_buffered.fetch_sub(size, Ordering::Relaxed);
            if result.is_err() {
                break;
            }
        }
    });

    let enqueue = |frame: Frame| -> AgentResult<()> {
        let size = frame.payload.len() + HEADER_LEN;
        let total = buffered.fetch_add(size, Ordering::Relaxed) + size;
        if total > MAX_SESSION_BUFFER {
            return Err(AgentError::RateLimited);
        }
        frame_tx.try_send(frame).map_err(|_| AgentError::RateLimited)
    };

    let mut events = deps.events.subscribe();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut shutdown_rx = deps.shutdown.subscribe();
    let mut last_inbound = Instant::now();

    let result = loop {
        tokio::select! {
            inbound = reader.next() => match inbound {
                Some(Ok(frame)) => {
                    last_inbound = Instant::now();
                    match frame.kind() {
                        Some(MessageType::Ping) => {
                            let reply = Frame::new(MessageType::Pong, frame.seq, frame.payload);
                            if enqueue(reply).is_err() { break close_slow(&peer); }
                        }
                        Some(MessageType::Pong) => {}
                        _ => {
                            let reply = handlers::handle_request(&deps, frame).await;
                            if enqueue(reply).is_err() { break close_slow(&peer); }
                        }
                    }
                }
                Some(Err(AgentError::ProtocolViolation(violation))) => {
                    warn!(peer = %peer, violation = %violation, audit = true, "Control framing violation");
                    let _ = enqueue(Frame::text(MessageType::ProtocolError, 0, &violation));
                    // Give the writer a moment to flush the error frame.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    break Err(AgentError::ProtocolViolation(violation));
                }
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            },

            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(frame) = handlers::event_frame(&event) {
                        if enqueue(frame).is_err() { break close_slow(&peer); }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(peer = %peer, missed, "Control session lagged behind event stream");
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },

            _ = heartbeat.tick() => {
                if last_inbound.elapsed() >= IDLE_TIMEOUT {
                    info!(peer = %peer, "Control session idle; dropping");
                    break Ok(());
                }
                if enqueue(Frame::new(MessageType::Ping, 0, Vec::new())).is_err() {
                    break close_slow(&peer);
                }
            },

            _ = shutdown_rx.recv() => break Ok(()),
        }
    };

    drop(enqueue);
    drop(frame_tx);
    let _ = tokio::time::timeout(Duration::from_secs(2), &mut writer_task).await;
    writer_task.abort();
    result
}

fn close_slow(peer: &SocketAddr) -> AgentResult<()> {
    warn!(peer = %peer, audit = true, "Control session over buffer cap; closing slow reader");
    Err(AgentError::RateLimited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtectionConfig;

    fn test_deps(token: &str) -> Arc<ControlDeps> {
        let dir = tempfile::tempdir().unwrap();
        let userdb = Arc::new(UserDb::load(dir.path().join("users.json")).unwrap());
        let protection =
            Arc::new(ProtectionEngine::new(ProtectionConfig::default(), userdb.clone()).unwrap());
        let (events, _) = broadcast::channel(16);
        let (shutdown, _) = broadcast::channel(4);
        let (agent_tx, _agent_rx) = mpsc::channel(4);
        // _agent_rx is dropped: agent commands would error, which none of
        // these tests issue.
        Arc::new(ControlDeps {
            connections: Arc::new(DashMap::new()),
            userdb,
            binds: Arc::new(BindRegistry::new()),
            vault: Arc::new(Vault::new()),
            protection,
            events,
            agent_tx,
            shutdown,
            started_at: Utc::now(),
            log_directory: dir.path().to_string_lossy().into_owned(),
            auth_token: token.to_string(),
        })
    }

    /// Read frames until something other than a heartbeat Ping arrives.
    async fn next_non_ping(
        client: &mut Framed<tokio::io::DuplexStream, FrameCodec>,
    ) -> Frame {
        loop {
            let frame = client
                .next()
                .await
                .expect("stream open")
                .expect("frame decodes");
            if frame.kind() != Some(MessageType::Ping) {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn control_auth_rejects_wrong_hmac() {
        let deps = test_deps("secret-token");
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let session = tokio::spawn(run_session(server_end, peer, deps));

        let mut client = Framed::new(client_end, FrameCodec::new());
        let challenge = next_non_ping(&mut client).await;
        assert_eq!(challenge.kind(), Some(MessageType::AuthChallenge));
        assert_eq!(challenge.payload.len(), 32);

        let mac = crypto::hmac_sha256(b"wrong-token", &challenge.payload);
        client
            .send(Frame::new(MessageType::AuthResponse, 1, mac.to_vec()))
            .await
            .unwrap();

        let reply = next_non_ping(&mut client).await;
        assert_eq!(reply.kind(), Some(MessageType::AuthFailure));
        assert!(matches!(
            session.await.unwrap(),
            Err(AgentError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn control_auth_success_enables_commands() {
        let deps = test_deps("secret-token");
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        tokio::spawn(run_session(server_end, peer, deps));

        let mut client = Framed::new(client_end, FrameCodec::new());
        let challenge = next_non_ping(&mut client).await;
        assert_eq!(challenge.kind(), Some(MessageType::AuthChallenge));

        let mac = crypto::hmac_sha256(b"secret-token", &challenge.payload);
        client
            .send(Frame::new(MessageType::AuthResponse, 3, mac.to_vec()))
            .await
            .unwrap();

        // AuthSuccess echoes the request sequence and carries agent info.
        let success = next_non_ping(&mut client).await;
        assert_eq!(success.kind(), Some(MessageType::AuthSuccess));
        assert_eq!(success.seq, 3);
        let info: serde_json::Value = serde_json::from_slice(&success.payload).unwrap();
        assert_eq!(info["name"], "munin");

        // Liveness and a status query both work post-auth.
        client
            .send(Frame::new(MessageType::Ping, 9, b"hb".to_vec()))
            .await
            .unwrap();
        let pong = next_non_ping(&mut client).await;
        assert_eq!(pong.kind(), Some(MessageType::Pong));
        assert_eq!(pong.seq, 9);
        assert_eq!(pong.payload, b"hb");

        client
            .send(Frame::new(MessageType::ServerList, 10, Vec::new()))
            .await
            .unwrap();
        let reply = next_non_ping(&mut client).await;
        assert_eq!(reply.kind(), Some(MessageType::Success));
        assert_eq!(reply.seq, 10);

        // Unknown server id answers Error/not_found.
        client
            .send(Frame::text(
                MessageType::Reconnect,
                11,
                r#"{"server":"nowhere"}"#,
            ))
            .await
            .unwrap();
        let reply = next_non_ping(&mut client).await;
        assert_eq!(reply.kind(), Some(MessageType::Error));
        let body: serde_json::Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn framing_violation_answers_protocol_error() {
        let deps = test_deps("secret-token");
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        tokio::spawn(run_session(server_end, peer, deps));

        let mut client = Framed::new(client_end, FrameCodec::new());
        let challenge = next_non_ping(&mut client).await;
        let mac = crypto::hmac_sha256(b"secret-token", &challenge.payload);
        client
            .send(Frame::new(MessageType::AuthResponse, 1, mac.to_vec()))
            .await
            .unwrap();
        let _ = next_non_ping(&mut client).await; // AuthSuccess

        // Garbage bytes instead of a frame.
        use tokio::io::AsyncWriteExt;
        client.get_mut().write_all(b"NOTMAGT_GARBAGE___").await.unwrap();

        let reply = next_non_ping(&mut client).await;
        assert_eq!(reply.kind(), Some(MessageType::ProtocolError));
    }

    #[test]
    fn allow_rules_parse_and_match() {
        let any = AllowRule::parse("*").unwrap();
        assert!(any.matches("203.0.113.9".parse().unwrap()));

        let exact = AllowRule::parse("127.0.0.1").unwrap();
        assert!(exact.matches("127.0.0.1".parse().unwrap()));
        assert!(!exact.matches("127.0.0.2".parse().unwrap()));

        let net = AllowRule::parse("10.0.0.0/8").unwrap();
        assert!(net.matches("10.20.30.40".parse().unwrap()));
        assert!(!net.matches("11.0.0.1".parse().unwrap()));

        assert!(AllowRule::parse("not-an-ip").is_err());
    }

    #[test]
    fn v6_rules_work() {
        let net = AllowRule::parse("fd00::/8").unwrap();
        assert!(net.matches("fd12::1".parse().unwrap()));
        assert!(!net.matches("fe80::1".parse().unwrap()));
    }
}
