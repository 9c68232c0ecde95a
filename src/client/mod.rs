//! IRC connection engine.
//!
//! One supervised connection per configured server. Each connection owns a
//! reader task (bytes -> codec -> session mutation -> event dispatch) and a
//! writer task (send queue -> bytes). Session state follows a single-writer
//! discipline: all mutation happens in the reader; everyone else reads
//! snapshots through the shared lock.

pub mod event;
pub mod registration;
pub mod sendq;
pub mod session;
pub mod stream;
pub mod supervisor;
pub mod transport;

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};

pub use event::{ConnState, Event, EventKind};
pub use sendq::SendQueue;
pub use session::Session;

/// Stable identity of one configured server.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub String);

impl ServerId {
    /// The configured id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Commands a control session can enqueue into a connection's inbox.
///
/// Control sessions never touch session state directly.
#[derive(Debug)]
pub enum ConnCommand {
    /// Send a message through the flood-controlled queue.
    Send(munin_proto::Message),
    /// Join a channel, optionally with a key.
    Join {
        /// Channel name.
        channel: String,
        /// Channel key (+k).
        key: Option<String>,
    },
    /// Part a channel.
    Part {
        /// Channel name.
        channel: String,
        /// Part reason.
        reason: Option<String>,
    },
    /// Change nickname.
    Nick(String),
    /// Clean disconnect; no reconnect is scheduled.
    Disconnect {
        /// QUIT message.
        reason: String,
    },
    /// Drop the link and let the supervisor reconnect.
    Reconnect,
}

/// Shared handle to one supervised connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    /// Server identity.
    pub id: ServerId,
    /// Command inbox consumed by the reader task.
    pub inbox: mpsc::Sender<ConnCommand>,
    /// Event broadcast; control fan-out subscribes here.
    pub events: broadcast::Sender<Event>,
    /// Connection lifecycle state.
    pub state: Arc<RwLock<ConnState>>,
    /// Session state (single writer: the reader task).
    pub session: Arc<RwLock<Session>>,
    /// Flood-controlled outbound queue.
    pub sendq: SendQueue,
}
