//! Control protocol message types.
//!
//! Values are fixed for wire compatibility with the operator UI; never
//! renumber. The framing layer carries the raw byte; this enum is the
//! dispatch table's view of it.

/// Known control message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    // Auth
    /// Server -> client: 32 random bytes to sign.
    AuthChallenge = 0x01,
    /// Client -> server: HMAC-SHA256(token, challenge).
    AuthResponse = 0x02,
    /// Auth accepted; payload is agent-info JSON.
    AuthSuccess = 0x03,
    /// Auth rejected; connection closes after this frame.
    AuthFailure = 0x04,

    // Liveness
    /// Heartbeat request.
    Ping = 0x10,
    /// Heartbeat reply.
    Pong = 0x11,

    // Status queries
    /// Agent name, version, uptime.
    AgentInfo = 0x20,
    /// Configured servers and their connection states.
    ServerList = 0x21,
    /// Detailed state of one server.
    ServerState = 0x22,
    /// Channels joined on one server.
    ChannelList = 0x23,
    /// Roster of one channel.
    ChannelRoster = 0x24,
    /// Registered binds.
    BindList = 0x25,
    /// Protection engine status.
    ProtectionStatus = 0x26,
    /// Vault lock state.
    VaultStatus = 0x27,

    // IRC control
    /// Join a channel.
    Join = 0x30,
    /// Part a channel.
    Part = 0x31,
    /// Send a PRIVMSG.
    SendMessage = 0x32,
    /// Send a CTCP ACTION.
    SendAction = 0x33,
    /// Send a NOTICE.
    SendNotice = 0x34,
    /// Change nickname.
    ChangeNick = 0x35,
    /// Send a raw line.
    SendRaw = 0x36,
    /// Connect a configured server.
    Connect = 0x37,
    /// Cleanly disconnect a server.
    Disconnect = 0x38,
    /// Drop and re-establish a server link.
    Reconnect = 0x39,

    // Script management (the engine itself is an external plug-in)
    /// List known scripts and their binds.
    ScriptList = 0x50,
    /// Load a script.
    ScriptLoad = 0x51,
    /// Unload a script, removing its binds.
    ScriptUnload = 0x52,
    /// Reload a script.
    ScriptReload = 0x53,

    // User database management
    /// List database users.
    UserList = 0x60,
    /// Add a user with an initial hostmask.
    UserAdd = 0x61,
    /// Delete a user.
    UserDel = 0x62,
    /// Grant flags.
    UserAddFlags = 0x63,
    /// Revoke flags.
    UserRemoveFlags = 0x64,

    // Agent control
    /// Reload the configuration file.
    ReloadConfig = 0x70,
    /// Fetch recent log lines.
    GetLogs = 0x71,
    /// Graceful shutdown.
    Shutdown = 0x72,
    /// Shutdown with a restart marker for the process supervisor.
    Restart = 0x73,

    // Pushed events (server -> client, seq = 0)
    /// Connection state change.
    EventConnState = 0x80,
    /// PRIVMSG/NOTICE observed.
    EventMessage = 0x81,
    /// Join observed.
    EventJoin = 0x82,
    /// Part observed.
    EventPart = 0x83,
    /// Kick observed.
    EventKick = 0x84,
    /// Nick change observed.
    EventNick = 0x85,
    /// Mode change observed.
    EventMode = 0x86,
    /// Topic change observed.
    EventTopic = 0x87,
    /// Quit observed.
    EventQuit = 0x88,
    /// Protection enforcement fired.
    EventProtection = 0x89,

    // Responses
    /// Request succeeded; payload depends on the request.
    Success = 0xF0,
    /// Request failed; payload is an error string.
    Error = 0xF1,
    /// Request type not supported by this agent.
    NotSupported = 0xF2,
    /// Framing violation; the connection closes after this frame.
    ProtocolError = 0xF3,
}

impl MessageType {
    /// Map a wire byte to a known type.
    pub fn from_byte(byte: u8) -> Option<Self> {
        use MessageType::*;
        Some(match byte {
            0x01 => AuthChallenge,
            0x02 => AuthResponse,
            0x03 => AuthSuccess,
            0x04 => AuthFailure,
            0x10 => Ping,
            0x11 => Pong,
            0x20 => AgentInfo,
            0x21 => ServerList,
            0x22 => ServerState,
            0x23 => ChannelList,
            0x24 => ChannelRoster,
            0x25 => BindList,
            0x26 => ProtectionStatus,
            0x27 => VaultStatus,
            0x30 => Join,
            0x31 => Part,
            0x32 => SendMessage,
            0x33 => SendAction,
            0x34 => SendNotice,
            0x35 => ChangeNick,
            0x36 => SendRaw,
            0x37 => Connect,
            0x38 => Disconnect,
            0x39 => Reconnect,
            0x50 => ScriptList,
            0x51 => ScriptLoad,
            0x52 => ScriptUnload,
            0x53 => ScriptReload,
            0x60 => UserList,
            0x61 => UserAdd,
            0x62 => UserDel,
            0x63 => UserAddFlags,
            0x64 => UserRemoveFlags,
            0x70 => ReloadConfig,
            0x71 => GetLogs,
            0x72 => Shutdown,
            0x73 => Restart,
            0x80 => EventConnState,
            0x81 => EventMessage,
            0x82 => EventJoin,
            0x83 => EventPart,
            0x84 => EventKick,
            0x85 => EventNick,
            0x86 => EventMode,
            0x87 => EventTopic,
            0x88 => EventQuit,
            0x89 => EventProtection,
            0xF0 => Success,
            0xF1 => Error,
            0xF2 => NotSupported,
            0xF3 => ProtocolError,
            _ => return None,
        })
    }

    /// The wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}
