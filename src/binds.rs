//! Bind registry: typed event subscriptions with masks and flag gates.
//!
//! A bind associates an event type, a required-flag gate, and a wildcard
//! mask with a callback. Masks match a type-specific projection of the
//! event: the command word for `pub`/`msg`, the whole text for
//! `pubm`/`msgm`, the IRC verb for `raw`, and `"{channel} {hostmask}"`
//! for channel events. The first callback that reports handled stops
//! further bind delivery for that event. The script engine behind the
//! callbacks is an external plug-in; this registry is its contract.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::client::{Event, EventKind};
use crate::mask::wildcard_match;
use crate::userdb::UserDb;

/// Event types a bind can attach to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindKind {
    /// Channel message, matched on its first word.
    Pub,
    /// Channel message, matched on the whole text.
    Pubm,
    /// Private message, matched on its first word.
    Msg,
    /// Private message, matched on the whole text.
    Msgm,
    /// Channel join.
    Join,
    /// Channel part.
    Part,
    /// Kick.
    Kick,
    /// Nick change.
    Nick,
    /// Channel mode change.
    Mode,
    /// CTCP query.
    Ctcp,
    /// Any protocol message, matched on the verb.
    Raw,
    /// Invitation.
    Invite,
}

impl BindKind {
    /// Stable name used by scripts and the control plane.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pub => "pub",
            Self::Pubm => "pubm",
            Self::Msg => "msg",
            Self::Msgm => "msgm",
            Self::Join => "join",
            Self::Part => "part",
            Self::Kick => "kick",
            Self::Nick => "nick",
            Self::Mode => "mode",
            Self::Ctcp => "ctcp",
            Self::Raw => "raw",
            Self::Invite => "invite",
        }
    }

    /// Parse a bind type name.
    #[allow(dead_code)] // Script-engine boundary: plug-ins register by name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pub" => Some(Self::Pub),
            "pubm" => Some(Self::Pubm),
            "msg" => Some(Self::Msg),
            "msgm" => Some(Self::Msgm),
            "join" => Some(Self::Join),
            "part" => Some(Self::Part),
            "kick" => Some(Self::Kick),
            "nick" => Some(Self::Nick),
            "mode" => Some(Self::Mode),
            "ctcp" => Some(Self::Ctcp),
            "raw" => Some(Self::Raw),
            "invite" => Some(Self::Invite),
            _ => None,
        }
    }
}

/// Callback invoked on a matching event; returns whether it handled it.
pub type BindCallback = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// One registration.
#[derive(Clone)]
pub struct Bind {
    /// Event type.
    pub kind: BindKind,
    /// Flag gate: `-` passes everyone, otherwise the matched database
    /// user needs at least one of the listed flags.
    pub required_flags: String,
    /// Wildcard mask against the type-specific projection.
    pub mask: String,
    /// Owning script, for bulk unregistration.
    pub script: String,
    callback: BindCallback,
}

/// Registry of binds, dispatched in registration order.
#[derive(Default)]
pub struct BindRegistry {
    binds: RwLock<Vec<Bind>>,
}

impl BindRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bind.
    pub fn register(
        &self,
        kind: BindKind,
        required_flags: &str,
        mask: &str,
        script: &str,
        callback: BindCallback,
    ) {
        debug!(kind = kind.as_str(), mask, script, "Bind registered");
        self.binds.write().push(Bind {
            kind,
            required_flags: required_flags.to_string(),
            mask: mask.to_string(),
            script: script.to_string(),
            callback,
        });
    }

    /// Remove binds matching (script, kind, mask); returns how many.
    pub fn unregister(&self, script: &str, kind: BindKind, mask: &str) -> usize {
        let mut binds = self.binds.write();
        let before = binds.len();
        binds.retain(|b| !(b.script == script && b.kind == kind && b.mask == mask));
        before - binds.len()
    }

    /// Remove every bind a script owns; returns how many.
    pub fn remove_script(&self, script: &str) -> usize {
        let mut binds = self.binds.write();
        let before = binds.len();
        binds.retain(|b| b.script != script);
        before - binds.len()
    }

    /// Bind descriptions for the control plane.
    pub fn list(&self) -> Vec<(String, String, String, String)> {
        self.binds
            .read()
            .iter()
            .map(|b| {
                (
                    b.kind.as_str().to_string(),
                    b.required_flags.clone(),
                    b.mask.clone(),
                    b.script.clone(),
                )
            })
            .collect()
    }

    /// Offer an event; the first handled callback wins. Returns whether
    /// any callback handled it.
    pub fn dispatch(&self, event: &Event, userdb: &UserDb) -> bool {
        let candidates = project(&event.kind);
        if candidates.is_empty() {
            return false;
        }

        // Callbacks run outside the lock: they may re-enter the registry.
        let binds: Vec<Bind> = self.binds.read().clone();

        for (kind, projection, hostmask) in &candidates {
            for bind in binds.iter().filter(|b| b.kind == *kind) {
                if !wildcard_match(&bind.mask, projection) {
                    continue;
                }
                if !passes_flag_gate(bind, hostmask.as_deref(), event.kind.channel(), userdb) {
                    continue;
                }
                if (bind.callback)(event) {
                    debug!(
                        kind = kind.as_str(),
                        mask = %bind.mask,
                        script = %bind.script,
                        "Bind handled event"
                    );
                    return true;
                }
            }
        }
        false
    }
}

fn passes_flag_gate(
    bind: &Bind,
    hostmask: Option<&str>,
    channel: Option<&str>,
    userdb: &UserDb,
) -> bool {
    if bind.required_flags == "-" || bind.required_flags.is_empty() {
        return true;
    }
    let Some(hostmask) = hostmask else {
        return false;
    };
    let Some(user) = userdb.match_user(hostmask) else {
        return false;
    };
    userdb.touch_seen(&user.handle, chrono::Utc::now().timestamp());
    user.has_any_flag(&bind.required_flags, channel)
}

/// Type-specific projections for one event:
/// `(kind, matched text, actor hostmask)`.
fn project(kind: &EventKind) -> Vec<(BindKind, String, Option<String>)> {
    match kind {
        EventKind::Privmsg {
            hostmask,
            target,
            text,
            ..
        } => {
            let channel_message = target.starts_with(['#', '&', '+', '!']);
            if let Some(ctcp) = ctcp_verb(text) {
                return vec![(BindKind::Ctcp, ctcp, Some(hostmask.clone()))];
            }
            let command_word = text.split_whitespace().next().unwrap_or("").to_string();
            if channel_message {
                vec![
                    (BindKind::Pub, command_word, Some(hostmask.clone())),
                    (BindKind::Pubm, text.clone(), Some(hostmask.clone())),
                ]
            } else {
                vec![
                    (BindKind::Msg, command_word, Some(hostmask.clone())),
                    (BindKind::Msgm, text.clone(), Some(hostmask.clone())),
                ]
            }
        }
        EventKind::UserJoined {
            channel, hostmask, ..
        } => vec![(
            BindKind::Join,
            format!("{} {}", channel, hostmask),
            Some(hostmask.clone()),
        )],
        EventKind::UserParted { channel, nick, .. } => vec![(
            BindKind::Part,
            format!("{} {}", channel, nick),
            None,
        )],
        EventKind::UserKicked {
            channel,
            nick,
            by_hostmask,
            ..
        } => vec![(
            BindKind::Kick,
            format!("{} {}", channel, nick),
            Some(by_hostmask.clone()),
        )],
        EventKind::NickChanged { channel, old, new } => vec![(
            BindKind::Nick,
            match channel {
                Some(chan) => format!("{} {}", chan, new),
                None => new.clone(),
            },
            // Nick changes carry no hostmask; gate on the old nick's mask.
            Some(format!("{}!*@*", old)),
        )],
        EventKind::ModeChanged {
            channel,
            by_hostmask,
            changes,
            ..
        } => {
            let modestring: String = changes
                .iter()
                .map(|c| {
                    format!("{}{}", if c.add { '+' } else { '-' }, c.mode)
                })
                .collect();
            vec![(
                BindKind::Mode,
                format!("{} {}", channel, modestring),
                Some(by_hostmask.clone()),
            )]
        }
        EventKind::Invited { channel, by } => vec![(
            BindKind::Invite,
            channel.clone(),
            Some(format!("{}!*@*", by)),
        )],
        EventKind::Raw { message } => vec![(BindKind::Raw, message.command.clone(), None)],
        _ => Vec::new(),
    }
}

/// Extract the CTCP verb from `\x01VERB args\x01`.
fn ctcp_verb(text: &str) -> Option<String> {
    let inner = text.strip_prefix('\u{1}')?;
    let inner = inner.strip_suffix('\u{1}').unwrap_or(inner);
    let verb = inner.split_whitespace().next()?;
    Some(verb.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::client::ServerId;

    fn userdb() -> Arc<UserDb> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(UserDb::load(dir.path().join("users.json")).unwrap())
    }

    fn privmsg(target: &str, text: &str) -> Event {
        Event::now(
            ServerId("net".into()),
            EventKind::Privmsg {
                nick: "alice".into(),
                hostmask: "alice!a@host.example".into(),
                target: target.into(),
                text: text.into(),
            },
        )
    }

    fn counting_callback(counter: Arc<AtomicUsize>, handled: bool) -> BindCallback {
        Arc::new(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
            handled
        })
    }

    #[test]
    fn pub_matches_command_word() {
        let registry = BindRegistry::new();
        let db = userdb();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(BindKind::Pub, "-", "!seen", "demo", counting_callback(hits.clone(), true));

        assert!(registry.dispatch(&privmsg("#chan", "!seen bob"), &db));
        assert!(!registry.dispatch(&privmsg("#chan", "hello !seen"), &db));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pubm_matches_whole_text() {
        let registry = BindRegistry::new();
        let db = userdb();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(
            BindKind::Pubm,
            "-",
            "*deploy*",
            "demo",
            counting_callback(hits.clone(), true),
        );

        assert!(registry.dispatch(&privmsg("#chan", "time to deploy now"), &db));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn msg_and_pub_are_distinct() {
        let registry = BindRegistry::new();
        let db = userdb();
        let pub_hits = Arc::new(AtomicUsize::new(0));
        let msg_hits = Arc::new(AtomicUsize::new(0));
        registry.register(BindKind::Pub, "-", "!x", "demo", counting_callback(pub_hits.clone(), true));
        registry.register(BindKind::Msg, "-", "!x", "demo", counting_callback(msg_hits.clone(), true));

        registry.dispatch(&privmsg("#chan", "!x"), &db);
        registry.dispatch(&privmsg("munin", "!x"), &db);
        assert_eq!(pub_hits.load(Ordering::SeqCst), 1);
        assert_eq!(msg_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_handled_stops_delivery() {
        let registry = BindRegistry::new();
        let db = userdb();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        registry.register(BindKind::Pub, "-", "!cmd", "one", counting_callback(first.clone(), true));
        registry.register(BindKind::Pub, "-", "!cmd", "two", counting_callback(second.clone(), true));

        registry.dispatch(&privmsg("#chan", "!cmd"), &db);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unhandled_falls_through() {
        let registry = BindRegistry::new();
        let db = userdb();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        registry.register(BindKind::Pub, "-", "!cmd", "one", counting_callback(first.clone(), false));
        registry.register(BindKind::Pub, "-", "!cmd", "two", counting_callback(second.clone(), true));

        assert!(registry.dispatch(&privmsg("#chan", "!cmd"), &db));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn flag_gate_requires_database_user() {
        let registry = BindRegistry::new();
        let db = userdb();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(BindKind::Pub, "o", "!op", "demo", counting_callback(hits.clone(), true));

        // Unknown hostmask: gate closed.
        assert!(!registry.dispatch(&privmsg("#chan", "!op"), &db));

        db.add_user("alice", "alice!*@host.example").unwrap();
        db.add_flags("alice", "o").unwrap();
        assert!(registry.dispatch(&privmsg("#chan", "!op"), &db));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn flag_gate_accepts_any_listed_flag() {
        let registry = BindRegistry::new();
        let db = userdb();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(BindKind::Pub, "nm", "!adm", "demo", counting_callback(hits.clone(), true));

        db.add_user("alice", "alice!*@host.example").unwrap();
        db.add_flags("alice", "m").unwrap();
        assert!(registry.dispatch(&privmsg("#chan", "!adm"), &db));
    }

    #[test]
    fn join_projection_is_channel_and_hostmask() {
        let registry = BindRegistry::new();
        let db = userdb();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(
            BindKind::Join,
            "-",
            "#ops *!*@trusted.*",
            "demo",
            counting_callback(hits.clone(), true),
        );

        let event = Event::now(
            ServerId("net".into()),
            EventKind::UserJoined {
                channel: "#ops".into(),
                nick: "bob".into(),
                hostmask: "bob!b@trusted.example".into(),
                account: None,
            },
        );
        assert!(registry.dispatch(&event, &db));
    }

    #[test]
    fn raw_matches_verb() {
        let registry = BindRegistry::new();
        let db = userdb();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(BindKind::Raw, "-", "PONG", "demo", counting_callback(hits.clone(), true));

        let event = Event::now(
            ServerId("net".into()),
            EventKind::Raw {
                message: munin_proto::Message::parse(":server PONG :token").unwrap(),
            },
        );
        assert!(registry.dispatch(&event, &db));
    }

    #[test]
    fn ctcp_routes_to_ctcp_binds_only() {
        let registry = BindRegistry::new();
        let db = userdb();
        let ctcp_hits = Arc::new(AtomicUsize::new(0));
        let pub_hits = Arc::new(AtomicUsize::new(0));
        registry.register(BindKind::Ctcp, "-", "VERSION", "demo", counting_callback(ctcp_hits.clone(), true));
        registry.register(BindKind::Pub, "-", "*", "demo", counting_callback(pub_hits.clone(), true));

        registry.dispatch(&privmsg("#chan", "\u{1}VERSION\u{1}"), &db);
        assert_eq!(ctcp_hits.load(Ordering::SeqCst), 1);
        assert_eq!(pub_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn masks_are_case_insensitive() {
        let registry = BindRegistry::new();
        let db = userdb();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(BindKind::Pub, "-", "!Seen", "demo", counting_callback(hits.clone(), true));
        assert!(registry.dispatch(&privmsg("#chan", "!SEEN bob"), &db));
    }

    #[test]
    fn unregister_by_script_kind_mask() {
        let registry = BindRegistry::new();
        let db = userdb();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(BindKind::Pub, "-", "!a", "demo", counting_callback(hits.clone(), true));
        registry.register(BindKind::Pub, "-", "!b", "demo", counting_callback(hits.clone(), true));

        assert_eq!(registry.unregister("demo", BindKind::Pub, "!a"), 1);
        assert!(!registry.dispatch(&privmsg("#chan", "!a"), &db));
        assert!(registry.dispatch(&privmsg("#chan", "!b"), &db));

        assert_eq!(registry.remove_script("demo"), 1);
        assert!(registry.list().is_empty());
    }
}
