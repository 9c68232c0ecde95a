//! Control request dispatch.
//!
//! Each request type maps to one handler; unknown types answer
//! `NotSupported`. Payloads are JSON both ways. Handlers never touch
//! session state directly: IRC actions go through the owning connection's
//! inbox or send queue.

use munin_proto::Message;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::frame::Frame;
use super::server::ControlDeps;
use super::types::MessageType;
use crate::agent::AgentCommand;
use crate::client::{ConnCommand, ConnectionHandle, Event, EventKind};
use crate::error::AgentError;

/// Default and maximum line counts for `GetLogs`.
const DEFAULT_LOG_LINES: usize = 100;
const MAX_LOG_LINES: usize = 1000;

#[derive(Deserialize)]
struct ServerTarget {
    server: String,
}

#[derive(Deserialize)]
struct ChannelTarget {
    server: String,
    channel: String,
    key: Option<String>,
    reason: Option<String>,
}

#[derive(Deserialize)]
struct MessageTarget {
    server: String,
    target: String,
    text: String,
}

#[derive(Deserialize)]
struct NickTarget {
    server: String,
    nick: String,
}

#[derive(Deserialize)]
struct RawTarget {
    server: String,
    line: String,
}

#[derive(Deserialize)]
struct UserTarget {
    handle: String,
    #[serde(default)]
    hostmask: Option<String>,
    #[serde(default)]
    flags: Option<String>,
}

#[derive(Deserialize)]
struct LogQuery {
    #[serde(default)]
    lines: Option<usize>,
}

/// Dispatch one authenticated request to its handler.
pub async fn handle_request(deps: &ControlDeps, request: Frame) -> Frame {
    let seq = request.seq;
    let Some(kind) = request.kind() else {
        return Frame::text(MessageType::NotSupported, seq, "unknown message type");
    };

    let result = match kind {
        MessageType::AgentInfo => Ok(agent_info_json(deps)),
        MessageType::ServerList => server_list(deps),
        MessageType::ServerState => server_state(deps, &request),
        MessageType::ChannelList => channel_list(deps, &request),
        MessageType::ChannelRoster => channel_roster(deps, &request),
        MessageType::BindList => Ok(bind_list(deps)),
        MessageType::ProtectionStatus => Ok(protection_status(deps)),
        MessageType::VaultStatus => Ok(json!({ "unlocked": deps.vault.is_unlocked() }).to_string()),

        MessageType::Join => irc_join(deps, &request).await,
        MessageType::Part => irc_part(deps, &request).await,
        MessageType::SendMessage => irc_send(deps, &request, SendAs::Privmsg).await,
        MessageType::SendAction => irc_send(deps, &request, SendAs::Action).await,
        MessageType::SendNotice => irc_send(deps, &request, SendAs::Notice).await,
        MessageType::ChangeNick => irc_nick(deps, &request).await,
        MessageType::SendRaw => irc_raw(deps, &request).await,
        MessageType::Connect => agent_command(deps, &request, AgentCommand::ConnectServer).await,
        MessageType::Disconnect => irc_disconnect(deps, &request).await,
        MessageType::Reconnect => irc_reconnect(deps, &request).await,

        MessageType::ScriptList => Ok(script_list(deps)),
        MessageType::ScriptLoad | MessageType::ScriptUnload | MessageType::ScriptReload => {
            // The script engine is an external plug-in behind the bind
            // contract; without one attached these are honest errors.
            Err(AgentError::NotFound("script engine not attached".to_string()))
        }

        MessageType::UserList => Ok(user_list(deps)),
        MessageType::UserAdd => user_add(deps, &request),
        MessageType::UserDel => user_del(deps, &request),
        MessageType::UserAddFlags => user_flags(deps, &request, true),
        MessageType::UserRemoveFlags => user_flags(deps, &request, false),

        MessageType::ReloadConfig => {
            send_agent_command(deps, AgentCommand::ReloadConfig).await
        }
        MessageType::GetLogs => get_logs(deps, &request),
        MessageType::Shutdown => {
            info!(audit = true, "Shutdown requested over control plane");
            let _ = deps.shutdown.send(());
            Ok(json!({ "ok": true }).to_string())
        }
        MessageType::Restart => {
            info!(audit = true, "Restart requested over control plane");
            send_agent_command(deps, AgentCommand::Restart).await
        }

        _ => return Frame::text(MessageType::NotSupported, seq, kind_name(kind)),
    };

    match result {
        Ok(payload) => Frame::new(MessageType::Success, seq, payload.into_bytes()),
        Err(e) => error_frame(seq, &e),
    }
}

fn kind_name(kind: MessageType) -> &'static str {
    // Only reached for response/event types echoed back at us.
    match kind {
        MessageType::AuthChallenge | MessageType::AuthResponse => "auth already complete",
        _ => "not a request type",
    }
}

fn error_frame(seq: u32, error: &AgentError) -> Frame {
    let payload = json!({
        "error": error.error_code(),
        "message": error.to_string(),
    });
    Frame::new(MessageType::Error, seq, payload.to_string().into_bytes())
}

/// Agent summary used for `AgentInfo` and the `AuthSuccess` payload.
pub fn agent_info_json(deps: &ControlDeps) -> String {
    let uptime = (chrono::Utc::now() - deps.started_at).num_seconds().max(0);
    json!({
        "name": "munin",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime,
        "servers": deps.connections.len(),
        "vaultUnlocked": deps.vault.is_unlocked(),
    })
    .to_string()
}

fn parse<'a, T: Deserialize<'a>>(request: &'a Frame) -> Result<T, AgentError> {
    serde_json::from_slice(&request.payload)
        .map_err(|e| AgentError::ProtocolViolation(format!("bad request payload: {}", e)))
}

fn connection(deps: &ControlDeps, server: &str) -> Result<ConnectionHandle, AgentError> {
    deps.connections
        .get(server)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AgentError::NotFound(format!("server {}", server)))
}

// === Status queries ===

fn server_list(deps: &ControlDeps) -> Result<String, AgentError> {
    let servers: Vec<_> = deps
        .connections
        .iter()
        .map(|entry| {
            let handle = entry.value();
            let session = handle.session.read();
            json!({
                "id": handle.id.as_str(),
                "state": handle.state.read().as_str(),
                "nick": session.nick(),
                "channels": session.channel_count(),
            })
        })
        .collect();
    Ok(json!({ "servers": servers }).to_string())
}

fn server_state(deps: &ControlDeps, request: &Frame) -> Result<String, AgentError> {
    let target: ServerTarget = parse(request)?;
    let handle = connection(deps, &target.server)?;
    let session = handle.session.read();
    Ok(json!({
        "id": handle.id.as_str(),
        "state": handle.state.read().as_str(),
        "nick": session.nick(),
        "registered": session.is_registered(),
        "network": session.isupport().network(),
        "channels": session.channel_names(),
    })
    .to_string())
}

fn channel_list(deps: &ControlDeps, request: &Frame) -> Result<String, AgentError> {
    let target: ServerTarget = parse(request)?;
    let handle = connection(deps, &target.server)?;
    let session = handle.session.read();
    Ok(json!({ "channels": session.channel_names() }).to_string())
}

fn channel_roster(deps: &ControlDeps, request: &Frame) -> Result<String, AgentError> {
    let target: ChannelTarget = parse(request)?;
    let handle = connection(deps, &target.server)?;
    let session = handle.session.read();
    let channel = session
        .channel(&target.channel)
        .ok_or_else(|| AgentError::NotFound(format!("channel {}", target.channel)))?;

    let users: Vec<_> = channel
        .users
        .values()
        .map(|u| {
            json!({
                "nick": u.nick,
                "prefixes": u.prefixes.iter().collect::<String>(),
                "away": u.away,
                "account": u.account,
                "hostmask": u.hostmask(),
            })
        })
        .collect();

    let bans: Vec<_> = channel
        .lists
        .get(&'b')
        .map(|entries| {
            entries
                .iter()
                .map(|e| json!({ "mask": e.mask, "setBy": e.set_by, "setAt": e.set_at }))
                .collect()
        })
        .unwrap_or_default();

    Ok(json!({
        "channel": channel.name,
        "topic": channel.topic.as_ref().map(|t| {
            json!({ "text": t.text, "setBy": t.set_by, "setAt": t.set_at })
        }),
        "users": users,
        "bans": bans,
    })
    .to_string())
}

fn bind_list(deps: &ControlDeps) -> String {
    let binds: Vec<_> = deps
        .binds
        .list()
        .into_iter()
        .map(|(kind, flags, mask, script)| {
            json!({ "type": kind, "flags": flags, "mask": mask, "script": script })
        })
        .collect();
    json!({ "binds": binds }).to_string()
}

fn protection_status(deps: &ControlDeps) -> String {
    // The sweep count doubles as a liveness probe of the bucket maps.
    json!({ "enabled": true, "idleBucketsEvicted": deps.protection.sweep() }).to_string()
}

fn script_list(deps: &ControlDeps) -> String {
    let scripts: Vec<String> = {
        let mut names: Vec<String> = deps
            .binds
            .list()
            .into_iter()
            .map(|(_, _, _, script)| script)
            .collect();
        names.sort();
        names.dedup();
        names
    };
    json!({ "scripts": scripts }).to_string()
}

// === IRC control ===

enum SendAs {
    Privmsg,
    Action,
    Notice,
}

async fn irc_join(deps: &ControlDeps, request: &Frame) -> Result<String, AgentError> {
    let target: ChannelTarget = parse(request)?;
    let handle = connection(deps, &target.server)?;
    handle
        .inbox
        .send(ConnCommand::Join {
            channel: target.channel,
            key: target.key,
        })
        .await
        .map_err(|_| AgentError::NotFound("connection task gone".to_string()))?;
    Ok(json!({ "ok": true }).to_string())
}

async fn irc_part(deps: &ControlDeps, request: &Frame) -> Result<String, AgentError> {
    let target: ChannelTarget = parse(request)?;
    let handle = connection(deps, &target.server)?;
    handle
        .inbox
        .send(ConnCommand::Part {
            channel: target.channel,
            reason: target.reason,
        })
        .await
        .map_err(|_| AgentError::NotFound("connection task gone".to_string()))?;
    Ok(json!({ "ok": true }).to_string())
}

async fn irc_send(
    deps: &ControlDeps,
    request: &Frame,
    mode: SendAs,
) -> Result<String, AgentError> {
    let target: MessageTarget = parse(request)?;
    let handle = connection(deps, &target.server)?;
    let message = match mode {
        SendAs::Privmsg => Message::privmsg(&target.target, &target.text),
        SendAs::Action => Message::privmsg(
            &target.target,
            &format!("\u{1}ACTION {}\u{1}", target.text),
        ),
        SendAs::Notice => Message::notice(&target.target, &target.text),
    };
    handle.sendq.send(message)?;
    Ok(json!({ "ok": true }).to_string())
}

async fn irc_nick(deps: &ControlDeps, request: &Frame) -> Result<String, AgentError> {
    let target: NickTarget = parse(request)?;
    let handle = connection(deps, &target.server)?;
    handle
        .inbox
        .send(ConnCommand::Nick(target.nick))
        .await
        .map_err(|_| AgentError::NotFound("connection task gone".to_string()))?;
    Ok(json!({ "ok": true }).to_string())
}

async fn irc_raw(deps: &ControlDeps, request: &Frame) -> Result<String, AgentError> {
    let target: RawTarget = parse(request)?;
    let handle = connection(deps, &target.server)?;
    let message = Message::parse(&target.line)?;
    handle.sendq.send(message)?;
    Ok(json!({ "ok": true }).to_string())
}

#[derive(Deserialize)]
struct DisconnectTarget {
    server: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn irc_disconnect(deps: &ControlDeps, request: &Frame) -> Result<String, AgentError> {
    let target: DisconnectTarget = parse(request)?;
    let handle = connection(deps, &target.server)?;
    handle
        .inbox
        .send(ConnCommand::Disconnect {
            reason: target
                .reason
                .unwrap_or_else(|| "disconnected by operator".to_string()),
        })
        .await
        .map_err(|_| AgentError::NotFound("connection task gone".to_string()))?;
    Ok(json!({ "ok": true }).to_string())
}

async fn irc_reconnect(deps: &ControlDeps, request: &Frame) -> Result<String, AgentError> {
    let target: ServerTarget = parse(request)?;
    let handle = connection(deps, &target.server)?;
    handle
        .inbox
        .send(ConnCommand::Reconnect)
        .await
        .map_err(|_| AgentError::NotFound("connection task gone".to_string()))?;
    Ok(json!({ "ok": true }).to_string())
}

async fn agent_command<F>(
    deps: &ControlDeps,
    request: &Frame,
    build: F,
) -> Result<String, AgentError>
where
    F: FnOnce(String) -> AgentCommand,
{
    let target: ServerTarget = parse(request)?;
    send_agent_command(deps, build(target.server)).await
}

async fn send_agent_command(
    deps: &ControlDeps,
    command: AgentCommand,
) -> Result<String, AgentError> {
    deps.agent_tx
        .send(command)
        .await
        .map_err(|_| AgentError::NotFound("agent host stopped".to_string()))?;
    Ok(json!({ "ok": true }).to_string())
}

// === User database ===

fn user_list(deps: &ControlDeps) -> String {
    let users: Vec<_> = deps
        .userdb
        .list()
        .into_iter()
        .map(|u| {
            json!({
                "handle": u.handle,
                "flags": u.flags,
                "channelFlags": u.channel_flags,
                "hostmasks": u.hostmasks,
                "info": u.info,
                "lastSeen": u.last_seen,
            })
        })
        .collect();
    json!({ "users": users }).to_string()
}

fn user_add(deps: &ControlDeps, request: &Frame) -> Result<String, AgentError> {
    let target: UserTarget = parse(request)?;
    let hostmask = target
        .hostmask
        .ok_or_else(|| AgentError::Config("hostmask is required".to_string()))?;
    deps.userdb.add_user(&target.handle, &hostmask)?;
    if let Some(flags) = target.flags {
        deps.userdb.add_flags(&target.handle, &flags)?;
    }
    deps.userdb.save()?;
    info!(handle = %target.handle, audit = true, "User added over control plane");
    Ok(json!({ "ok": true }).to_string())
}

fn user_del(deps: &ControlDeps, request: &Frame) -> Result<String, AgentError> {
    let target: UserTarget = parse(request)?;
    guard_last_owner(deps, &target.handle)?;
    if !deps.userdb.del_user(&target.handle) {
        return Err(AgentError::NotFound(format!("user {}", target.handle)));
    }
    deps.userdb.save()?;
    info!(handle = %target.handle, audit = true, "User deleted over control plane");
    Ok(json!({ "ok": true }).to_string())
}

fn user_flags(deps: &ControlDeps, request: &Frame, add: bool) -> Result<String, AgentError> {
    let target: UserTarget = parse(request)?;
    let flags = target
        .flags
        .ok_or_else(|| AgentError::Config("flags are required".to_string()))?;
    if add {
        deps.userdb.add_flags(&target.handle, &flags)?;
    } else {
        if flags.contains('n') {
            guard_last_owner(deps, &target.handle)?;
        }
        deps.userdb.remove_flags(&target.handle, &flags)?;
    }
    deps.userdb.save()?;
    Ok(json!({ "ok": true }).to_string())
}

/// Refuse to drop the last owner; locking every operator out of the agent
/// is never a valid control command.
fn guard_last_owner(deps: &ControlDeps, handle: &str) -> Result<(), AgentError> {
    let Some(user) = deps.userdb.get(handle) else {
        return Ok(());
    };
    if !user.has_flag('n', None) {
        return Ok(());
    }
    let owners = deps
        .userdb
        .list()
        .iter()
        .filter(|u| u.has_flag('n', None))
        .count();
    if owners <= 1 {
        return Err(AgentError::Forbidden(
            "cannot remove the last owner".to_string(),
        ));
    }
    Ok(())
}

// === Logs ===

fn get_logs(deps: &ControlDeps, request: &Frame) -> Result<String, AgentError> {
    let query: LogQuery = if request.payload.is_empty() {
        LogQuery { lines: None }
    } else {
        parse(request)?
    };
    let wanted = query.lines.unwrap_or(DEFAULT_LOG_LINES).min(MAX_LOG_LINES);

    let mut files: Vec<_> = std::fs::read_dir(&deps.log_directory)
        .map_err(|e| AgentError::NotFound(format!("log directory: {}", e)))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect();
    files.sort();

    let Some(newest) = files.last() else {
        return Ok(json!({ "lines": [] }).to_string());
    };

    let content = std::fs::read_to_string(newest)?;
    let lines: Vec<&str> = content.lines().rev().take(wanted).collect();
    let lines: Vec<&str> = lines.into_iter().rev().collect();
    Ok(json!({ "file": newest.file_name().and_then(|n| n.to_str()), "lines": lines }).to_string())
}

// === Event push ===

/// Convert an observed event into a pushed frame (sequence 0).
pub fn event_frame(event: &Event) -> Option<Frame> {
    let server = event.server.as_str();
    let ts = event.timestamp.to_rfc3339();

    let (kind, body) = match &event.kind {
        EventKind::StateChanged { state } => (
            MessageType::EventConnState,
            json!({ "server": server, "time": ts, "state": state.as_str() }),
        ),
        EventKind::Disconnected { reason } => (
            MessageType::EventConnState,
            json!({ "server": server, "time": ts, "state": "disconnected", "reason": reason }),
        ),
        EventKind::Privmsg {
            nick,
            target,
            text,
            ..
        } => (
            MessageType::EventMessage,
            json!({ "server": server, "time": ts, "kind": "privmsg", "nick": nick, "target": target, "text": text }),
        ),
        EventKind::Notice {
            nick,
            target,
            text,
            ..
        } => (
            MessageType::EventMessage,
            json!({ "server": server, "time": ts, "kind": "notice", "nick": nick, "target": target, "text": text }),
        ),
        EventKind::UserJoined { channel, nick, .. } => (
            MessageType::EventJoin,
            json!({ "server": server, "time": ts, "channel": channel, "nick": nick }),
        ),
        EventKind::UserParted { channel, nick, .. } => (
            MessageType::EventPart,
            json!({ "server": server, "time": ts, "channel": channel, "nick": nick }),
        ),
        EventKind::UserKicked {
            channel, nick, by, ..
        } => (
            MessageType::EventKick,
            json!({ "server": server, "time": ts, "channel": channel, "nick": nick, "by": by }),
        ),
        EventKind::NickChanged { channel, old, new } => (
            MessageType::EventNick,
            json!({ "server": server, "time": ts, "channel": channel, "old": old, "new": new }),
        ),
        EventKind::ModeChanged { channel, by, .. } => (
            MessageType::EventMode,
            json!({ "server": server, "time": ts, "channel": channel, "by": by }),
        ),
        EventKind::TopicChanged {
            channel,
            topic,
            set_by,
        } => (
            MessageType::EventTopic,
            json!({ "server": server, "time": ts, "channel": channel, "topic": topic, "setBy": set_by }),
        ),
        EventKind::UserQuit { nick, channels, .. } => (
            MessageType::EventQuit,
            json!({ "server": server, "time": ts, "nick": nick, "channels": channels }),
        ),
        _ => return None,
    };

    // Pushed events always use sequence 0.
    Some(Frame::new(kind, 0, body.to_string().into_bytes()))
}
