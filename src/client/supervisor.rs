//! Connection lifecycle supervision.
//!
//! One supervisor task per configured server walks the connection through
//! `Idle -> Resolving -> TcpConnecting -> [TlsHandshake] -> Registering ->
//! Ready -> Closing`, reconnecting with exponential backoff and jitter on
//! failure. A clean operator-requested disconnect never reconnects.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use munin_proto::{Isupport, Message};
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use super::event::{ConnState, Event, EventKind};
use super::registration::Registrar;
use super::sendq::{self, SendQueue, SendQueueWorker};
use super::session::Session;
use super::stream::{self, TcpPhase};
use super::transport::LineCodec;
use super::{ConnCommand, ConnectionHandle, ServerId};
use crate::binds::BindRegistry;
use crate::config::ServerConfig;
use crate::error::{AgentError, AgentResult};
use crate::protect::ProtectionEngine;
use crate::userdb::UserDb;

/// NICK/USER/CAP/SASL must finish within this window.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);
/// An open SCRAM/SASL exchange must finish within this window.
const SASL_TIMEOUT: Duration = Duration::from_secs(20);
/// Silence before we probe the server with a PING.
const IDLE_BEFORE_PING: Duration = Duration::from_secs(240);
/// Grace per outstanding PING before the next escalation.
const PING_GRACE: Duration = Duration::from_secs(60);
/// Drain window for the writer on teardown.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Everything a supervised connection needs.
pub struct ConnectionParams {
    /// Server definition.
    pub config: ServerConfig,
    /// Revealed password, when the auth mode uses one.
    pub password: Option<String>,
    /// Revealed relay secret, when a proxy is configured.
    pub relay_secret: Option<String>,
    /// Protection engine shared across connections.
    pub protection: Arc<ProtectionEngine>,
    /// Bind registry shared across connections.
    pub binds: Arc<BindRegistry>,
    /// User database shared across connections.
    pub userdb: Arc<UserDb>,
    /// QUIT message for graceful shutdown.
    pub quit_message: String,
    /// Process shutdown broadcast.
    pub shutdown: broadcast::Sender<()>,
}

/// How a connection ended.
enum Teardown {
    /// Operator-requested disconnect: no reconnect.
    Clean,
    /// Process shutdown: no reconnect.
    Shutdown,
    /// Link lost or reconnect requested: supervisor retries.
    Broken(String),
}

/// Spawn a supervised connection and return its shared handle.
pub fn spawn(params: ConnectionParams) -> ConnectionHandle {
    let id = ServerId(params.config.id.clone());
    let primary_nick = params
        .config
        .nicknames
        .first()
        .cloned()
        .unwrap_or_else(|| "munin".to_string());

    let (events_tx, _) = broadcast::channel(256);
    let state = Arc::new(RwLock::new(ConnState::Idle));
    let session = Arc::new(RwLock::new(Session::new(&primary_nick)));
    let isupport = Arc::new(RwLock::new(Isupport::default()));
    let (sendq, worker) = sendq::channel(isupport.clone());
    let (inbox_tx, inbox_rx) = mpsc::channel(64);

    let handle = ConnectionHandle {
        id: id.clone(),
        inbox: inbox_tx,
        events: events_tx.clone(),
        state: state.clone(),
        session: session.clone(),
        sendq: sendq.clone(),
    };

    let supervisor = Supervisor {
        id,
        config: params.config,
        password: params.password,
        relay_secret: params.relay_secret,
        protection: params.protection,
        binds: params.binds,
        userdb: params.userdb,
        quit_message: params.quit_message,
        shutdown: params.shutdown,
        events: events_tx,
        state,
        session,
        isupport,
        sendq,
        worker: Some(worker),
        inbox: inbox_rx,
    };

    tokio::spawn(supervisor.run());
    handle
}

/// Exponential backoff with +/-20% jitter: `base * 2^(attempt-1)`, capped.
pub fn reconnect_delay(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let raw = base_secs
        .saturating_mul(1u64 << exponent)
        .min(max_secs.max(base_secs));
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_secs_f64(raw as f64 * jitter)
}

struct Supervisor {
    id: ServerId,
    config: ServerConfig,
    password: Option<String>,
    relay_secret: Option<String>,
    protection: Arc<ProtectionEngine>,
    binds: Arc<BindRegistry>,
    userdb: Arc<UserDb>,
    quit_message: String,
    shutdown: broadcast::Sender<()>,
    events: broadcast::Sender<Event>,
    state: Arc<RwLock<ConnState>>,
    session: Arc<RwLock<Session>>,
    isupport: Arc<RwLock<Isupport>>,
    sendq: SendQueue,
    worker: Option<SendQueueWorker>,
    inbox: mpsc::Receiver<ConnCommand>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        let max_attempts = self.config.reconnect.max_attempts;

        loop {
            let outcome = self.run_connection().await;
            self.set_state(ConnState::Closing);

            match outcome {
                Ok(Teardown::Clean) => {
                    info!(server = %self.id, "Disconnected at operator request");
                    self.emit(EventKind::Disconnected {
                        reason: "disconnected".to_string(),
                    });
                    break;
                }
                Ok(Teardown::Shutdown) => {
                    debug!(server = %self.id, "Connection stopped for shutdown");
                    break;
                }
                Ok(Teardown::Broken(reason)) => {
                    warn!(server = %self.id, reason = %reason, "Connection lost");
                    self.emit(EventKind::Disconnected { reason });
                }
                Err(e) => {
                    warn!(
                        server = %self.id,
                        error = %e,
                        code = e.error_code(),
                        transient = e.is_transient(),
                        "Connection attempt failed"
                    );
                    self.emit(EventKind::Disconnected {
                        reason: e.to_string(),
                    });
                }
            }

            if self.worker.is_none() {
                error!(server = %self.id, "Writer worker unrecoverable; supervisor stopping");
                break;
            }

            attempt += 1;
            if max_attempts > 0 && attempt > max_attempts {
                error!(
                    server = %self.id,
                    attempts = attempt - 1,
                    "Reconnect attempts exhausted; giving up"
                );
                break;
            }

            let delay = reconnect_delay(
                attempt,
                self.config.reconnect.base_delay_secs,
                self.config.reconnect.max_delay_secs,
            );
            info!(server = %self.id, attempt, delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
            self.set_state(ConnState::Reconnecting);

            let mut shutdown_rx = self.shutdown.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        self.set_state(ConnState::Idle);
    }

    async fn run_connection(&mut self) -> AgentResult<Teardown> {
        self.set_state(ConnState::Resolving);
        self.set_state(ConnState::TcpConnecting);
        let phase = stream::connect_tcp(&self.config, self.relay_secret.as_deref()).await?;

        if matches!(phase, TcpPhase::Direct(_)) && self.config.tls.enabled {
            self.set_state(ConnState::TlsHandshake);
        }
        let link = stream::upgrade_tls(phase, &self.config).await?;
        info!(server = %self.id, tls = link.is_tls(), "Connected");

        let (read_half, write_half) = tokio::io::split(link);
        let mut reader = FramedRead::new(read_half, LineCodec::new());
        let sink = FramedWrite::new(write_half, LineCodec::new());

        self.set_state(ConnState::Registering);
        let mut registrar = Registrar::new(&self.config, self.password.clone())?;
        *self.session.write() = Session::new(registrar.current_nick());

        let (stop_tx, stop_rx) = watch::channel(false);
        let Some(worker) = self.worker.take() else {
            return Err(AgentError::ProtocolViolation(
                "send queue worker lost".to_string(),
            ));
        };
        let mut writer_task = tokio::spawn(async move {
            let mut worker = worker;
            let result = worker.run(sink, stop_rx).await;
            (worker, result)
        });
        let mut writer_done = false;

        for msg in registrar.start() {
            // A failure here means the writer died instantly; the writer
            // select arm below reports it.
            if let Err(e) = self.sendq.send(msg) {
                warn!(server = %self.id, error = %e, "Registration enqueue failed");
            }
        }

        let reg_deadline = Instant::now() + REGISTRATION_TIMEOUT;
        let mut sasl_deadline: Option<Instant> = None;
        let mut last_activity = Instant::now();
        let mut pings_sent: u8 = 0;
        let mut ping_sent_at: Option<Instant> = None;
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let teardown = loop {
            tokio::select! {
                inbound = reader.next() => match inbound {
                    Some(Ok(msg)) => {
                        last_activity = Instant::now();
                        pings_sent = 0;
                        ping_sent_at = None;

                        if msg.command == "PING" {
                            // Mirrored immediately through the priority lane.
                            let token = msg.params.first().map(String::as_str).unwrap_or("");
                            let _ = self.sendq.send(Message::pong(token));
                        }
                        if msg.command == "ERROR" {
                            let reason = msg.params.first().cloned().unwrap_or_default();
                            break Teardown::Broken(format!("server error: {}", reason));
                        }

                        if !registrar.is_done() {
                            for reply in registrar.handle(&msg) {
                                if let Err(e) = self.sendq.send(reply) {
                                    warn!(server = %self.id, error = %e, "Registration enqueue failed");
                                }
                            }
                            if registrar.sasl_in_flight() && sasl_deadline.is_none() {
                                sasl_deadline = Some(Instant::now() + SASL_TIMEOUT);
                            }
                            if !registrar.sasl_in_flight() {
                                sasl_deadline = None;
                            }
                            if registrar.is_done() {
                                self.set_state(ConnState::Ready);
                                self.autojoin();
                            }
                        }

                        self.process_message(msg);
                    }
                    Some(Err(AgentError::ProtocolViolation(v))) => {
                        break Teardown::Broken(format!("protocol violation: {}", v));
                    }
                    Some(Err(e)) => break Teardown::Broken(e.to_string()),
                    None => break Teardown::Broken("connection closed by server".to_string()),
                },

                cmd = self.inbox.recv() => match cmd {
                    Some(ConnCommand::Send(msg)) => {
                        if let Err(e) = self.sendq.send(msg) {
                            warn!(server = %self.id, error = %e, audit = true, "Dropped control-requested send");
                        }
                    }
                    Some(ConnCommand::Join { channel, key }) => {
                        let _ = self.sendq.send(Message::join(&channel, key.as_deref()));
                    }
                    Some(ConnCommand::Part { channel, reason }) => {
                        let _ = self.sendq.send(Message::part(&channel, reason.as_deref()));
                    }
                    Some(ConnCommand::Nick(nick)) => {
                        let _ = self.sendq.send(Message::nick(&nick));
                    }
                    Some(ConnCommand::Disconnect { reason }) => {
                        let _ = self.sendq.send(Message::quit(&reason));
                        break Teardown::Clean;
                    }
                    Some(ConnCommand::Reconnect) => {
                        break Teardown::Broken("reconnect requested".to_string());
                    }
                    None => break Teardown::Shutdown,
                },

                joined = &mut writer_task => {
                    writer_done = true;
                    match joined {
                        Ok((worker, result)) => {
                            self.worker = Some(worker);
                            let reason = match result {
                                Ok(()) => "writer stopped".to_string(),
                                Err(e) => format!("write failed: {}", e),
                            };
                            break Teardown::Broken(reason);
                        }
                        Err(e) => {
                            error!(server = %self.id, error = %e, "Writer task aborted");
                            return Err(AgentError::ProtocolViolation(
                                "writer task aborted".to_string(),
                            ));
                        }
                    }
                },

                _ = shutdown_rx.recv() => {
                    let _ = self.sendq.send(Message::quit(&self.quit_message));
                    break Teardown::Shutdown;
                },

                _ = tick.tick() => {
                    let now = Instant::now();
                    if !registrar.is_done() {
                        if now >= reg_deadline {
                            break Teardown::Broken("registration timeout".to_string());
                        }
                        if sasl_deadline.is_some_and(|d| now >= d) {
                            break Teardown::Broken("sasl exchange timeout".to_string());
                        }
                    } else if let Some(sent_at) = ping_sent_at {
                        if now.duration_since(sent_at) >= PING_GRACE {
                            if pings_sent >= 2 {
                                break Teardown::Broken("ping timeout".to_string());
                            }
                            let _ = self.sendq.send(Message::ping(self.id.as_str()));
                            pings_sent += 1;
                            ping_sent_at = Some(now);
                        }
                    } else if now.duration_since(last_activity) >= IDLE_BEFORE_PING {
                        let _ = self.sendq.send(Message::ping(self.id.as_str()));
                        pings_sent = 1;
                        ping_sent_at = Some(now);
                    }
                },
            }
        };

        // Stop the writer and recover the worker for the next connection,
        // draining outstanding priority traffic (QUIT) within the grace.
        if !writer_done {
            let _ = stop_tx.send(true);
            match tokio::time::timeout(DRAIN_GRACE, writer_task).await {
                Ok(Ok((worker, _))) => self.worker = Some(worker),
                Ok(Err(e)) => {
                    error!(server = %self.id, error = %e, "Writer task aborted");
                    return Err(AgentError::ProtocolViolation(
                        "writer task aborted".to_string(),
                    ));
                }
                Err(_) => {
                    warn!(server = %self.id, audit = true, "Writer drain grace expired; abandoning in-flight writes");
                    return Err(AgentError::ProtocolViolation(
                        "writer failed to stop".to_string(),
                    ));
                }
            }
        }

        Ok(teardown)
    }

    /// Session mutation plus event dispatch for one inbound message.
    fn process_message(&self, msg: Message) {
        let events = {
            let mut session = self.session.write();
            session.apply(&msg)
        };

        let isupport_changed = events
            .iter()
            .any(|e| matches!(e, EventKind::IsupportUpdated));
        if isupport_changed {
            // Refresh the writer-visible snapshot.
            *self.isupport.write() = self.session.read().isupport().clone();
        }

        self.dispatch(EventKind::Raw { message: msg });
        for kind in events {
            self.dispatch(kind);
        }
    }

    /// Offer an event to protection, then binds, then the broadcast.
    fn dispatch(&self, kind: EventKind) {
        let event = Event::now(self.id.clone(), kind);

        let verdict = self.protection.inspect(&event);
        if let Some((channel, changes)) = &verdict.modes {
            if let Err(e) = self.sendq.send_modes(channel, changes) {
                warn!(server = %self.id, error = %e, audit = true, "Protection mode change dropped");
            }
        }
        for action in verdict.actions {
            if let Err(e) = self.sendq.send(action) {
                warn!(server = %self.id, error = %e, audit = true, "Protection action dropped");
            }
        }

        if !verdict.suppress {
            self.binds.dispatch(&event, &self.userdb);
        }

        // Control fan-out and logging observe everything.
        let _ = self.events.send(event);
    }

    fn autojoin(&self) {
        for entry in &self.config.auto_join {
            if let Err(e) = self.sendq.send(Message::join(&entry.channel, entry.key.as_deref())) {
                warn!(server = %self.id, channel = %entry.channel, error = %e, "Auto-join enqueue failed");
            }
        }
    }

    fn set_state(&self, new: ConnState) {
        *self.state.write() = new;
        self.emit(EventKind::StateChanged { state: new });
    }

    fn emit(&self, kind: EventKind) {
        let _ = self.events.send(Event::now(self.id.clone(), kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_with_jitter() {
        // base 5s, cap 60s: attempts map to 5, 10, 20, 40, 60, 60 (+/-20%).
        for (attempt, expected) in [(1u32, 5.0f64), (2, 10.0), (3, 20.0), (4, 40.0), (5, 60.0), (9, 60.0)] {
            let delay = reconnect_delay(attempt, 5, 60).as_secs_f64();
            assert!(
                delay >= expected * 0.8 - 1e-9 && delay <= expected * 1.2 + 1e-9,
                "attempt {}: {}s outside +/-20% of {}s",
                attempt,
                delay,
                expected
            );
        }
    }

    #[test]
    fn backoff_never_overflows_on_large_attempts() {
        let delay = reconnect_delay(u32::MAX, 5, 60);
        assert!(delay.as_secs() <= 72);
    }

    #[test]
    fn backoff_respects_minimum_base() {
        // A max below base falls back to the base rather than zero.
        let delay = reconnect_delay(3, 10, 1);
        assert!(delay.as_secs_f64() >= 8.0);
    }
}
