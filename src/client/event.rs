//! Typed events published by the session state machine.
//!
//! Every session mutation publishes exactly one event. Events flow to the
//! protection engine first (which may suppress further delivery), then the
//! bind registry; the control fan-out and logging observe everything via
//! the broadcast channel.

use chrono::{DateTime, Utc};
use munin_proto::{Message, ModeChange};

use super::ServerId;

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Not connected, no activity scheduled.
    Idle,
    /// Resolving the server address.
    Resolving,
    /// TCP connect in flight.
    TcpConnecting,
    /// TLS handshake in flight.
    TlsHandshake,
    /// NICK/USER/CAP/SASL exchange in flight.
    Registering,
    /// Registered and processing traffic.
    Ready,
    /// Draining queues before teardown.
    Closing,
    /// Waiting out the reconnect backoff.
    Reconnecting,
}

impl ConnState {
    /// Stable lowercase name for logs and control payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Resolving => "resolving",
            Self::TcpConnecting => "tcp-connecting",
            Self::TlsHandshake => "tls-handshake",
            Self::Registering => "registering",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Reconnecting => "reconnecting",
        }
    }
}

/// One observed event with its origin and arrival time.
#[derive(Clone, Debug)]
pub struct Event {
    /// Originating server.
    pub server: ServerId,
    /// Arrival timestamp.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

impl Event {
    /// Stamp an event kind with its origin and the current time.
    pub fn now(server: ServerId, kind: EventKind) -> Self {
        Self {
            server,
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Typed session events.
#[derive(Clone, Debug)]
pub enum EventKind {
    /// Registration confirmed (001); carries our canonical nickname.
    Registered {
        /// Our nickname as latched by the server.
        nick: String,
    },
    /// The ISUPPORT snapshot changed.
    IsupportUpdated,
    /// Connection state transition.
    StateChanged {
        /// The new state.
        state: ConnState,
    },
    /// The connection ended.
    Disconnected {
        /// Human-readable reason.
        reason: String,
    },
    /// We joined a channel.
    ChannelJoined {
        /// Channel name.
        channel: String,
    },
    /// We left a channel (self PART, KICK, or teardown).
    ChannelLeft {
        /// Channel name.
        channel: String,
        /// Why we left.
        reason: String,
    },
    /// Another user joined a channel.
    UserJoined {
        /// Channel name.
        channel: String,
        /// Their nickname.
        nick: String,
        /// Their full hostmask.
        hostmask: String,
        /// Account name when `extended-join` is active.
        account: Option<String>,
    },
    /// Another user parted a channel.
    UserParted {
        /// Channel name.
        channel: String,
        /// Their nickname.
        nick: String,
        /// Part reason.
        reason: Option<String>,
    },
    /// A user was kicked.
    UserKicked {
        /// Channel name.
        channel: String,
        /// Victim nickname.
        nick: String,
        /// Kicker nickname.
        by: String,
        /// Kicker hostmask.
        by_hostmask: String,
        /// Kick reason.
        reason: Option<String>,
    },
    /// A user quit; one event covering every shared channel.
    UserQuit {
        /// Their nickname.
        nick: String,
        /// Their hostmask.
        hostmask: String,
        /// Quit reason.
        reason: Option<String>,
        /// Channels they were removed from.
        channels: Vec<String>,
    },
    /// A nickname changed; one event per affected channel.
    NickChanged {
        /// Affected channel, `None` when we share no channel.
        channel: Option<String>,
        /// Previous nickname.
        old: String,
        /// New nickname.
        new: String,
    },
    /// A channel MODE was applied.
    ModeChanged {
        /// Channel name.
        channel: String,
        /// Who set it.
        by: String,
        /// Setter hostmask.
        by_hostmask: String,
        /// The parsed changes.
        changes: Vec<ModeChange>,
    },
    /// Topic changed or learned.
    TopicChanged {
        /// Channel name.
        channel: String,
        /// New topic text.
        topic: String,
        /// Who set it, when known.
        set_by: Option<String>,
    },
    /// NAMES listing for a channel completed.
    NamesComplete {
        /// Channel name.
        channel: String,
        /// Roster size after finalisation.
        users: usize,
    },
    /// A user's away state changed (`away-notify`).
    AwayChanged {
        /// Their nickname.
        nick: String,
        /// Whether they are now away.
        away: bool,
    },
    /// A user's ident/host changed (`chghost`).
    HostChanged {
        /// Their nickname.
        nick: String,
        /// New ident.
        user: String,
        /// New host.
        host: String,
    },
    /// A user's realname changed (`setname`).
    RealnameChanged {
        /// Their nickname.
        nick: String,
        /// New realname.
        realname: String,
    },
    /// A user logged in or out of an account (`account-notify`).
    AccountChanged {
        /// Their nickname.
        nick: String,
        /// New account; `None` means logged out.
        account: Option<String>,
    },
    /// A PRIVMSG arrived.
    Privmsg {
        /// Sender nickname.
        nick: String,
        /// Sender hostmask.
        hostmask: String,
        /// Target channel or our nick.
        target: String,
        /// Message text.
        text: String,
    },
    /// A NOTICE arrived.
    Notice {
        /// Sender nickname.
        nick: String,
        /// Sender hostmask.
        hostmask: String,
        /// Target channel or our nick.
        target: String,
        /// Message text.
        text: String,
    },
    /// We were invited to a channel.
    Invited {
        /// Channel name.
        channel: String,
        /// Inviter nickname.
        by: String,
    },
    /// Any protocol message, for raw binds and diagnostics.
    Raw {
        /// The parsed message.
        message: Message,
    },
}

impl EventKind {
    /// The channel this event concerns, when there is exactly one.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::ChannelJoined { channel }
            | Self::ChannelLeft { channel, .. }
            | Self::UserJoined { channel, .. }
            | Self::UserParted { channel, .. }
            | Self::UserKicked { channel, .. }
            | Self::ModeChanged { channel, .. }
            | Self::TopicChanged { channel, .. }
            | Self::NamesComplete { channel, .. }
            | Self::Invited { channel, .. } => Some(channel),
            Self::NickChanged { channel, .. } => channel.as_deref(),
            Self::Privmsg { target, .. } | Self::Notice { target, .. } => Some(target),
            _ => None,
        }
    }
}
