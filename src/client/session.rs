//! Per-connection session state.
//!
//! Tracks our own nickname, the server's ISUPPORT snapshot, and the roster
//! of every joined channel. All mutation happens in the connection's reader
//! task; every mutation publishes exactly one typed event.
//!
//! Channel and nickname identity go through the server-declared casemap.
//! When a 005 changes the mapping, every keyed collection is re-keyed.

use std::collections::HashMap;

use munin_proto::{parse_mode_changes, Isupport, Message, ModeClass, Prefix};
use tracing::{debug, trace};

use super::event::EventKind;

/// A list-mode entry (ban/except/invite).
#[derive(Clone, Debug)]
pub struct ListEntry {
    /// The mask.
    pub mask: String,
    /// Who set it.
    pub set_by: String,
    /// Unix timestamp when it was set.
    pub set_at: i64,
}

/// Channel topic with metadata.
#[derive(Clone, Debug, Default)]
pub struct Topic {
    /// Topic text.
    pub text: String,
    /// Who set it.
    pub set_by: Option<String>,
    /// Unix timestamp when it was set.
    pub set_at: Option<i64>,
}

/// One member of a channel roster.
#[derive(Clone, Debug, Default)]
pub struct ChannelUser {
    /// Nickname (display form).
    pub nick: String,
    /// Ident, when known.
    pub user: Option<String>,
    /// Host, when known.
    pub host: Option<String>,
    /// Away flag (`away-notify`).
    pub away: bool,
    /// Prefix symbols, sorted by rank (highest privilege first).
    pub prefixes: Vec<char>,
    /// Account name (`extended-join` / `account-notify`).
    pub account: Option<String>,
}

impl ChannelUser {
    /// The user's hostmask with `*` placeholders for unknown parts.
    pub fn hostmask(&self) -> String {
        format!(
            "{}!{}@{}",
            self.nick,
            self.user.as_deref().unwrap_or("*"),
            self.host.as_deref().unwrap_or("*")
        )
    }
}

/// One joined channel.
#[derive(Clone, Debug, Default)]
pub struct Channel {
    /// Display name (original case).
    pub name: String,
    /// Topic, when known.
    pub topic: Option<Topic>,
    /// Members keyed by normalized nickname.
    pub users: HashMap<String, ChannelUser>,
    /// Class-A list modes keyed by mode letter.
    pub lists: HashMap<char, Vec<ListEntry>>,
    /// Class B/C/D modes; flags carry `None`, parameterised modes their value.
    pub modes: HashMap<char, Option<String>>,
}

/// Session state for one server connection.
pub struct Session {
    /// Our current nickname.
    nick: String,
    /// Registration latch (001 seen).
    registered: bool,
    /// Server feature snapshot.
    isupport: Isupport,
    /// Channels keyed by normalized name.
    channels: HashMap<String, Channel>,
    /// NAMES replies buffered until 366.
    pending_names: HashMap<String, Vec<ChannelUser>>,
}

impl Session {
    /// Fresh session with the configured primary nickname.
    pub fn new(nick: &str) -> Self {
        Self {
            nick: nick.to_string(),
            registered: false,
            isupport: Isupport::default(),
            channels: HashMap::new(),
            pending_names: HashMap::new(),
        }
    }

    /// Our current nickname.
    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Whether 001 has been seen.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// The current ISUPPORT snapshot.
    pub fn isupport(&self) -> &Isupport {
        &self.isupport
    }

    /// Joined channel names (display form).
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.values().map(|c| c.name.clone()).collect()
    }

    /// Look up a channel by name under the active casemap.
    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(&self.isupport.normalize(name))
    }

    /// Number of joined channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Whether `a` and `b` name the same entity under the active casemap.
    pub fn same_entity(&self, a: &str, b: &str) -> bool {
        self.isupport.casemapping().eq(a, b)
    }

    /// Apply one inbound message; returns the published events.
    pub fn apply(&mut self, msg: &Message) -> Vec<EventKind> {
        match msg.command.as_str() {
            "001" => self.on_welcome(msg),
            "005" => self.on_isupport(msg),
            "332" => self.on_topic_reply(msg),
            "333" => self.on_topic_meta(msg),
            "353" => self.on_names(msg),
            "366" => self.on_names_end(msg),
            "JOIN" => self.on_join(msg),
            "PART" => self.on_part(msg),
            "KICK" => self.on_kick(msg),
            "QUIT" => self.on_quit(msg),
            "NICK" => self.on_nick(msg),
            "MODE" => self.on_mode(msg),
            "TOPIC" => self.on_topic(msg),
            "AWAY" => self.on_away(msg),
            "CHGHOST" => self.on_chghost(msg),
            "SETNAME" => self.on_setname(msg),
            "ACCOUNT" => self.on_account(msg),
            "PRIVMSG" => self.on_privmsg(msg, false),
            "NOTICE" => self.on_privmsg(msg, true),
            "INVITE" => self.on_invite(msg),
            _ => Vec::new(),
        }
    }

    // === Numerics ===

    fn on_welcome(&mut self, msg: &Message) -> Vec<EventKind> {
        self.registered = true;
        if let Some(nick) = msg.params.first() {
            // 001 latches our canonical nickname.
            self.nick = nick.clone();
        }
        vec![EventKind::Registered {
            nick: self.nick.clone(),
        }]
    }

    fn on_isupport(&mut self, msg: &Message) -> Vec<EventKind> {
        let casemap_changed = self.isupport.apply_params(&msg.params);
        if casemap_changed {
            debug!("Casemap changed; re-keying session collections");
            self.rekey();
        }
        vec![EventKind::IsupportUpdated]
    }

    fn on_topic_reply(&mut self, msg: &Message) -> Vec<EventKind> {
        let (Some(channel), Some(text)) = (msg.params.get(1), msg.params.get(2)) else {
            return Vec::new();
        };
        let key = self.isupport.normalize(channel);
        let Some(chan) = self.channels.get_mut(&key) else {
            return Vec::new();
        };
        let topic = chan.topic.get_or_insert_with(Topic::default);
        topic.text = text.clone();
        vec![EventKind::TopicChanged {
            channel: chan.name.clone(),
            topic: text.clone(),
            set_by: topic.set_by.clone(),
        }]
    }

    fn on_topic_meta(&mut self, msg: &Message) -> Vec<EventKind> {
        let (Some(channel), Some(set_by)) = (msg.params.get(1), msg.params.get(2)) else {
            return Vec::new();
        };
        let key = self.isupport.normalize(channel);
        if let Some(chan) = self.channels.get_mut(&key) {
            let topic = chan.topic.get_or_insert_with(Topic::default);
            topic.set_by = Some(set_by.clone());
            topic.set_at = msg.params.get(3).and_then(|t| t.parse().ok());
        }
        // Metadata completes the 332 event; no separate event here.
        Vec::new()
    }

    fn on_names(&mut self, msg: &Message) -> Vec<EventKind> {
        // :server 353 me <symbol> <channel> :@nick +nick nick
        let (Some(channel), Some(names)) = (msg.params.get(2), msg.params.get(3)) else {
            return Vec::new();
        };
        let key = self.isupport.normalize(channel);
        let buffer = self.pending_names.entry(key).or_default();
        for token in names.split_whitespace() {
            if let Some(user) = parse_names_token(token, &self.isupport) {
                buffer.push(user);
            }
        }
        Vec::new()
    }

    fn on_names_end(&mut self, msg: &Message) -> Vec<EventKind> {
        let Some(channel) = msg.params.get(1) else {
            return Vec::new();
        };
        let key = self.isupport.normalize(channel);
        let Some(users) = self.pending_names.remove(&key) else {
            return Vec::new();
        };

        let chan = self.channels.entry(key).or_insert_with(|| Channel {
            name: channel.clone(),
            ..Channel::default()
        });

        // NAMES is the full membership: replace the roster.
        chan.users.clear();
        let casemap = self.isupport.casemapping();
        for user in users {
            chan.users.insert(casemap.normalize(&user.nick), user);
        }

        vec![EventKind::NamesComplete {
            channel: chan.name.clone(),
            users: chan.users.len(),
        }]
    }

    // === Membership ===

    fn on_join(&mut self, msg: &Message) -> Vec<EventKind> {
        let Some(prefix) = &msg.prefix else {
            return Vec::new();
        };
        let Some(nick) = prefix.nick() else {
            return Vec::new();
        };
        let Some(channel) = msg.params.first() else {
            return Vec::new();
        };

        // extended-join: JOIN <channel> <account|*> <realname>;
        // otherwise fall back to an account-tag when present.
        let account = msg
            .params
            .get(1)
            .map(String::as_str)
            .or_else(|| msg.tag_value("account"))
            .filter(|a| !a.is_empty() && *a != "*")
            .map(str::to_string);

        let key = self.isupport.normalize(channel);

        if self.same_entity(nick, &self.nick) {
            // Confirmation of our own join: fresh empty roster.
            self.channels.insert(
                key,
                Channel {
                    name: channel.clone(),
                    ..Channel::default()
                },
            );
            return vec![EventKind::ChannelJoined {
                channel: channel.clone(),
            }];
        }

        let Some(chan) = self.channels.get_mut(&key) else {
            trace!(channel = %channel, "JOIN for unknown channel");
            return Vec::new();
        };

        let (user, host) = match prefix {
            Prefix::User { user, host, .. } => (user.clone(), host.clone()),
            Prefix::Server(_) => (None, None),
        };

        // Idempotent: a duplicate join refreshes identity, never doubles.
        let nick_key = self.isupport.normalize(nick);
        let entry = chan.users.entry(nick_key).or_insert_with(|| ChannelUser {
            nick: nick.to_string(),
            ..ChannelUser::default()
        });
        entry.nick = nick.to_string();
        entry.user = user.or(entry.user.take());
        entry.host = host.or(entry.host.take());
        if account.is_some() {
            entry.account = account.clone();
        }

        vec![EventKind::UserJoined {
            channel: chan.name.clone(),
            nick: nick.to_string(),
            hostmask: prefix.hostmask(),
            account,
        }]
    }

    fn on_part(&mut self, msg: &Message) -> Vec<EventKind> {
        let Some(nick) = msg.prefix.as_ref().and_then(Prefix::nick) else {
            return Vec::new();
        };
        let Some(channel) = msg.params.first() else {
            return Vec::new();
        };
        let reason = msg.params.get(1).cloned();
        let key = self.isupport.normalize(channel);

        if self.same_entity(nick, &self.nick) {
            if let Some(chan) = self.channels.remove(&key) {
                return vec![EventKind::ChannelLeft {
                    channel: chan.name,
                    reason: reason.unwrap_or_else(|| "parted".to_string()),
                }];
            }
            return Vec::new();
        }

        let Some(chan) = self.channels.get_mut(&key) else {
            return Vec::new();
        };
        let nick_key = self.isupport.normalize(nick);
        if chan.users.remove(&nick_key).is_some() {
            return vec![EventKind::UserParted {
                channel: chan.name.clone(),
                nick: nick.to_string(),
                reason,
            }];
        }
        Vec::new()
    }

    fn on_kick(&mut self, msg: &Message) -> Vec<EventKind> {
        let Some(prefix) = &msg.prefix else {
            return Vec::new();
        };
        let (Some(channel), Some(victim)) = (msg.params.first(), msg.params.get(1)) else {
            return Vec::new();
        };
        let reason = msg.params.get(2).cloned();
        let by = prefix.nick().unwrap_or("server").to_string();
        let key = self.isupport.normalize(channel);

        if self.same_entity(victim, &self.nick) {
            if let Some(chan) = self.channels.remove(&key) {
                return vec![EventKind::ChannelLeft {
                    channel: chan.name,
                    reason: format!("kicked by {}", by),
                }];
            }
            return Vec::new();
        }

        let Some(chan) = self.channels.get_mut(&key) else {
            return Vec::new();
        };
        let victim_key = self.isupport.normalize(victim);
        if chan.users.remove(&victim_key).is_some() {
            return vec![EventKind::UserKicked {
                channel: chan.name.clone(),
                nick: victim.clone(),
                by,
                by_hostmask: prefix.hostmask(),
                reason,
            }];
        }
        Vec::new()
    }

    fn on_quit(&mut self, msg: &Message) -> Vec<EventKind> {
        let Some(prefix) = &msg.prefix else {
            return Vec::new();
        };
        let Some(nick) = prefix.nick() else {
            return Vec::new();
        };
        let reason = msg.params.first().cloned();
        let nick_key = self.isupport.normalize(nick);

        let mut affected = Vec::new();
        for chan in self.channels.values_mut() {
            if chan.users.remove(&nick_key).is_some() {
                affected.push(chan.name.clone());
            }
        }

        if affected.is_empty() {
            return Vec::new();
        }
        vec![EventKind::UserQuit {
            nick: nick.to_string(),
            hostmask: prefix.hostmask(),
            reason,
            channels: affected,
        }]
    }

    fn on_nick(&mut self, msg: &Message) -> Vec<EventKind> {
        let Some(old) = msg.prefix.as_ref().and_then(Prefix::nick) else {
            return Vec::new();
        };
        let Some(new) = msg.params.first() else {
            return Vec::new();
        };

        let is_self = self.same_entity(old, &self.nick);
        if is_self {
            self.nick = new.clone();
        }

        let old_key = self.isupport.normalize(old);
        let new_key = self.isupport.normalize(new);

        let mut events = Vec::new();
        for chan in self.channels.values_mut() {
            // Rename preserves prefix sets and identity fields.
            if let Some(mut user) = chan.users.remove(&old_key) {
                user.nick = new.clone();
                chan.users.insert(new_key.clone(), user);
                events.push(EventKind::NickChanged {
                    channel: Some(chan.name.clone()),
                    old: old.to_string(),
                    new: new.clone(),
                });
            }
        }

        if events.is_empty() && is_self {
            events.push(EventKind::NickChanged {
                channel: None,
                old: old.to_string(),
                new: new.clone(),
            });
        }
        events
    }

    // === Modes and metadata ===

    fn on_mode(&mut self, msg: &Message) -> Vec<EventKind> {
        let (Some(target), Some(modestring)) = (msg.params.first(), msg.params.get(1)) else {
            return Vec::new();
        };
        if !self.isupport.is_channel(target) {
            // Own user modes are not tracked.
            return Vec::new();
        }

        let key = self.isupport.normalize(target);
        let set_by = msg
            .prefix
            .as_ref()
            .and_then(Prefix::nick)
            .unwrap_or("server")
            .to_string();
        let set_at = chrono::Utc::now().timestamp();
        let changes = parse_mode_changes(modestring, &msg.params[2..], &self.isupport);

        let casemap = self.isupport.casemapping();
        let Some(chan) = self.channels.get_mut(&key) else {
            return Vec::new();
        };

        for change in &changes {
            match self.isupport.mode_class(change.mode) {
                Some(ModeClass::Prefix) => {
                    let Some(symbol) = self.isupport.prefix_for_mode(change.mode) else {
                        continue;
                    };
                    let Some(arg) = &change.arg else { continue };
                    let Some(user) = chan.users.get_mut(&casemap.normalize(arg)) else {
                        continue;
                    };
                    if change.add {
                        if !user.prefixes.contains(&symbol) {
                            user.prefixes.push(symbol);
                            let isupport = &self.isupport;
                            user.prefixes
                                .sort_by_key(|&s| isupport.prefix_rank(s).unwrap_or(usize::MAX));
                        }
                    } else {
                        user.prefixes.retain(|&s| s != symbol);
                    }
                }
                Some(ModeClass::TypeA) => {
                    let Some(arg) = &change.arg else { continue };
                    let list = chan.lists.entry(change.mode).or_default();
                    if change.add {
                        if !list.iter().any(|e| e.mask == *arg) {
                            list.push(ListEntry {
                                mask: arg.clone(),
                                set_by: set_by.clone(),
                                set_at,
                            });
                        }
                    } else {
                        list.retain(|e| e.mask != *arg);
                    }
                }
                Some(ModeClass::TypeB) | Some(ModeClass::TypeC) => {
                    if change.add {
                        chan.modes.insert(change.mode, change.arg.clone());
                    } else {
                        chan.modes.remove(&change.mode);
                    }
                }
                Some(ModeClass::TypeD) => {
                    if change.add {
                        chan.modes.insert(change.mode, None);
                    } else {
                        chan.modes.remove(&change.mode);
                    }
                }
                None => {}
            }
        }

        vec![EventKind::ModeChanged {
            channel: chan.name.clone(),
            by: set_by,
            by_hostmask: msg
                .prefix
                .as_ref()
                .map(Prefix::hostmask)
                .unwrap_or_default(),
            changes,
        }]
    }

    fn on_topic(&mut self, msg: &Message) -> Vec<EventKind> {
        let (Some(channel), Some(text)) = (msg.params.first(), msg.params.get(1)) else {
            return Vec::new();
        };
        let set_by = msg.prefix.as_ref().and_then(Prefix::nick).map(str::to_string);
        let key = self.isupport.normalize(channel);
        let Some(chan) = self.channels.get_mut(&key) else {
            return Vec::new();
        };
        chan.topic = Some(Topic {
            text: text.clone(),
            set_by: set_by.clone(),
            set_at: Some(chrono::Utc::now().timestamp()),
        });
        vec![EventKind::TopicChanged {
            channel: chan.name.clone(),
            topic: text.clone(),
            set_by,
        }]
    }

    fn on_away(&mut self, msg: &Message) -> Vec<EventKind> {
        let Some(nick) = msg.prefix.as_ref().and_then(Prefix::nick) else {
            return Vec::new();
        };
        let away = msg.params.first().is_some_and(|r| !r.is_empty());
        let nick_key = self.isupport.normalize(nick);

        let mut seen = false;
        for chan in self.channels.values_mut() {
            if let Some(user) = chan.users.get_mut(&nick_key) {
                user.away = away;
                seen = true;
            }
        }
        if !seen {
            return Vec::new();
        }
        vec![EventKind::AwayChanged {
            nick: nick.to_string(),
            away,
        }]
    }

    fn on_chghost(&mut self, msg: &Message) -> Vec<EventKind> {
        let Some(nick) = msg.prefix.as_ref().and_then(Prefix::nick) else {
            return Vec::new();
        };
        let (Some(user), Some(host)) = (msg.params.first(), msg.params.get(1)) else {
            return Vec::new();
        };
        let nick_key = self.isupport.normalize(nick);
        for chan in self.channels.values_mut() {
            if let Some(entry) = chan.users.get_mut(&nick_key) {
                entry.user = Some(user.clone());
                entry.host = Some(host.clone());
            }
        }
        vec![EventKind::HostChanged {
            nick: nick.to_string(),
            user: user.clone(),
            host: host.clone(),
        }]
    }

    fn on_setname(&mut self, msg: &Message) -> Vec<EventKind> {
        let Some(nick) = msg.prefix.as_ref().and_then(Prefix::nick) else {
            return Vec::new();
        };
        let Some(realname) = msg.params.first() else {
            return Vec::new();
        };
        vec![EventKind::RealnameChanged {
            nick: nick.to_string(),
            realname: realname.clone(),
        }]
    }

    fn on_account(&mut self, msg: &Message) -> Vec<EventKind> {
        let Some(nick) = msg.prefix.as_ref().and_then(Prefix::nick) else {
            return Vec::new();
        };
        let account = msg
            .params
            .first()
            .filter(|a| a.as_str() != "*")
            .cloned();
        let nick_key = self.isupport.normalize(nick);
        for chan in self.channels.values_mut() {
            if let Some(user) = chan.users.get_mut(&nick_key) {
                user.account = account.clone();
            }
        }
        vec![EventKind::AccountChanged {
            nick: nick.to_string(),
            account,
        }]
    }

    fn on_privmsg(&mut self, msg: &Message, notice: bool) -> Vec<EventKind> {
        let Some(prefix) = &msg.prefix else {
            return Vec::new();
        };
        let (Some(target), Some(text)) = (msg.params.first(), msg.params.get(1)) else {
            return Vec::new();
        };
        let nick = prefix.nick().unwrap_or("").to_string();
        let kind = if notice {
            EventKind::Notice {
                nick,
                hostmask: prefix.hostmask(),
                target: target.clone(),
                text: text.clone(),
            }
        } else {
            EventKind::Privmsg {
                nick,
                hostmask: prefix.hostmask(),
                target: target.clone(),
                text: text.clone(),
            }
        };
        vec![kind]
    }

    fn on_invite(&mut self, msg: &Message) -> Vec<EventKind> {
        let Some(by) = msg.prefix.as_ref().and_then(Prefix::nick) else {
            return Vec::new();
        };
        let Some(channel) = msg.params.get(1) else {
            return Vec::new();
        };
        vec![EventKind::Invited {
            channel: channel.clone(),
            by: by.to_string(),
        }]
    }

    /// Re-key every identity-keyed collection under the new casemap.
    fn rekey(&mut self) {
        let casemap = self.isupport.casemapping();

        let channels = std::mem::take(&mut self.channels);
        self.channels = channels
            .into_values()
            .map(|mut chan| {
                let users = std::mem::take(&mut chan.users);
                chan.users = users
                    .into_values()
                    .map(|u| (casemap.normalize(&u.nick), u))
                    .collect();
                (casemap.normalize(&chan.name), chan)
            })
            .collect();

        let pending = std::mem::take(&mut self.pending_names);
        self.pending_names = pending
            .into_iter()
            .map(|(k, v)| (casemap.normalize(&k), v))
            .collect();
    }
}

/// Parse one NAMES token: `[prefixes]nick[!user@host]`.
fn parse_names_token(token: &str, isupport: &Isupport) -> Option<ChannelUser> {
    let mut rest = token;
    let mut prefixes = Vec::new();

    // multi-prefix: every leading prefix symbol belongs to the user.
    while let Some(c) = rest.chars().next() {
        if isupport.mode_for_prefix(c).is_some() {
            prefixes.push(c);
            rest = &rest[c.len_utf8()..];
        } else {
            break;
        }
    }
    if rest.is_empty() {
        return None;
    }

    // userhost-in-names: the token is a full hostmask.
    let (nick, user, host) = match Prefix::parse(rest) {
        Prefix::User { nick, user, host } => (nick, user, host),
        Prefix::Server(name) => (name, None, None),
    };

    prefixes.sort_by_key(|&s| isupport.prefix_rank(s).unwrap_or(usize::MAX));

    Some(ChannelUser {
        nick,
        user,
        host,
        prefixes,
        ..ChannelUser::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(line: &str) -> Message {
        Message::parse(line).unwrap()
    }

    fn joined_session() -> Session {
        let mut session = Session::new("munin");
        session.apply(&msg(":server 001 munin :welcome"));
        session.apply(&msg(":munin!m@agent JOIN #chan"));
        session
    }

    #[test]
    fn welcome_latches_nick() {
        let mut session = Session::new("wanted");
        let events = session.apply(&msg(":server 001 actual :welcome"));
        assert!(session.is_registered());
        assert_eq!(session.nick(), "actual");
        assert!(matches!(&events[0], EventKind::Registered { nick } if nick == "actual"));
    }

    #[test]
    fn self_join_creates_empty_channel() {
        let session = joined_session();
        let chan = session.channel("#chan").unwrap();
        assert!(chan.users.is_empty());
        assert_eq!(chan.name, "#chan");
    }

    #[test]
    fn join_is_idempotent_and_refreshes_identity() {
        let mut session = joined_session();
        session.apply(&msg(":alice!a@one JOIN #chan"));
        session.apply(&msg(":alice!a@two JOIN #chan"));

        let chan = session.channel("#chan").unwrap();
        assert_eq!(chan.users.len(), 1);
        let alice = chan.users.values().next().unwrap();
        assert_eq!(alice.host.as_deref(), Some("two"));
    }

    #[test]
    fn extended_join_captures_account() {
        let mut session = joined_session();
        session.apply(&msg(":alice!a@h JOIN #chan accountname :Real Name"));
        let chan = session.channel("#chan").unwrap();
        let alice = chan.users.values().next().unwrap();
        assert_eq!(alice.account.as_deref(), Some("accountname"));
    }

    #[test]
    fn names_parse_with_multi_prefix_and_userhost() {
        let mut session = joined_session();
        session.apply(&msg(":server 005 munin PREFIX=(qov)~@+ :are supported"));
        session.apply(&msg(
            ":server 353 munin = #chan :~@alice!a@h +bob carol",
        ));
        let events = session.apply(&msg(":server 366 munin #chan :End of /NAMES list"));
        assert!(matches!(events[0], EventKind::NamesComplete { users: 3, .. }));

        let chan = session.channel("#chan").unwrap();
        let alice = &chan.users[&"alice".to_string()];
        assert_eq!(alice.prefixes, vec!['~', '@']);
        assert_eq!(alice.host.as_deref(), Some("h"));
        let bob = &chan.users[&"bob".to_string()];
        assert_eq!(bob.prefixes, vec!['+']);
        assert!(chan.users[&"carol".to_string()].prefixes.is_empty());
    }

    #[test]
    fn mode_applies_prefixes_and_lists() {
        let mut session = joined_session();
        session.apply(&msg(":server 005 munin PREFIX=(ov)@+ CHANMODES=beI,k,l,imnpst :ok"));
        session.apply(&msg(":alice!a@h JOIN #chan"));
        session.apply(&msg(":bob!b@h JOIN #chan"));

        let events = session.apply(&msg(":op!o@h MODE #chan +ovb alice bob *!*@bad.host"));
        assert!(matches!(&events[0], EventKind::ModeChanged { changes, .. } if changes.len() == 3));

        let chan = session.channel("#chan").unwrap();
        assert_eq!(chan.users[&"alice".to_string()].prefixes, vec!['@']);
        assert_eq!(chan.users[&"bob".to_string()].prefixes, vec!['+']);
        assert_eq!(chan.lists[&'b'][0].mask, "*!*@bad.host");
    }

    #[test]
    fn mode_flags_and_params_tracked() {
        let mut session = joined_session();
        session.apply(&msg(":op!o@h MODE #chan +kl secret 42"));
        session.apply(&msg(":op!o@h MODE #chan +i"));
        let chan = session.channel("#chan").unwrap();
        assert_eq!(chan.modes[&'k'], Some("secret".to_string()));
        assert_eq!(chan.modes[&'l'], Some("42".to_string()));
        assert_eq!(chan.modes[&'i'], None);

        let mut session2 = joined_session();
        session2.apply(&msg(":op!o@h MODE #chan +i"));
        session2.apply(&msg(":op!o@h MODE #chan -i"));
        assert!(!session2.channel("#chan").unwrap().modes.contains_key(&'i'));
    }

    #[test]
    fn quit_removes_from_all_channels() {
        let mut session = joined_session();
        session.apply(&msg(":munin!m@agent JOIN #two"));
        session.apply(&msg(":alice!a@h JOIN #chan"));
        session.apply(&msg(":alice!a@h JOIN #two"));

        let events = session.apply(&msg(":alice!a@h QUIT :bye"));
        match &events[0] {
            EventKind::UserQuit { channels, .. } => assert_eq!(channels.len(), 2),
            other => panic!("expected UserQuit, got {:?}", other),
        }
        assert!(session.channel("#chan").unwrap().users.is_empty());
        assert!(session.channel("#two").unwrap().users.is_empty());
    }

    #[test]
    fn nick_change_preserves_prefixes() {
        let mut session = joined_session();
        session.apply(&msg(":alice!a@h JOIN #chan"));
        session.apply(&msg(":op!o@h MODE #chan +o alice"));

        let events = session.apply(&msg(":alice!a@h NICK alicia"));
        assert_eq!(events.len(), 1);
        let chan = session.channel("#chan").unwrap();
        assert!(chan.users.contains_key("alicia"));
        assert_eq!(chan.users[&"alicia".to_string()].prefixes, vec!['@']);
        assert!(!chan.users.contains_key("alice"));
    }

    #[test]
    fn own_nick_change_updates_self() {
        let mut session = joined_session();
        session.apply(&msg(":munin!m@agent NICK munin2"));
        assert_eq!(session.nick(), "munin2");
    }

    #[test]
    fn kick_of_self_drops_channel() {
        let mut session = joined_session();
        let events = session.apply(&msg(":op!o@h KICK #chan munin :out"));
        assert!(matches!(&events[0], EventKind::ChannelLeft { .. }));
        assert!(session.channel("#chan").is_none());
    }

    #[test]
    fn casemap_identity_for_channels_and_nicks() {
        let mut session = joined_session();
        // rfc1459: #CHAN[]\ == #chan{}|
        session.apply(&msg(":munin!m@agent JOIN #brack[x]"));
        assert!(session.channel("#BRACK{X}").is_some());

        session.apply(&msg(":nick[a]!u@h JOIN #chan"));
        session.apply(&msg(":NICK{A}!u@h PART #chan"));
        assert!(session.channel("#chan").unwrap().users.is_empty());
    }

    #[test]
    fn casemap_change_rekeys_collections() {
        let mut session = joined_session();
        session.apply(&msg(":tilde[x]!u@h JOIN #chan"));

        // Under ascii mapping, [ and { are distinct.
        let events = session.apply(&msg(":server 005 munin CASEMAPPING=ascii :ok"));
        assert!(matches!(events[0], EventKind::IsupportUpdated));
        let chan = session.channel("#chan").unwrap();
        assert!(chan.users.contains_key("tilde[x]"));
        assert!(!chan.users.contains_key("tilde{x}"));
    }

    #[test]
    fn away_and_account_updates() {
        let mut session = joined_session();
        session.apply(&msg(":alice!a@h JOIN #chan"));

        session.apply(&msg(":alice!a@h AWAY :gone fishing"));
        assert!(session.channel("#chan").unwrap().users[&"alice".to_string()].away);
        session.apply(&msg(":alice!a@h AWAY"));
        assert!(!session.channel("#chan").unwrap().users[&"alice".to_string()].away);

        session.apply(&msg(":alice!a@h ACCOUNT alice_acct"));
        assert_eq!(
            session.channel("#chan").unwrap().users[&"alice".to_string()]
                .account
                .as_deref(),
            Some("alice_acct")
        );
        session.apply(&msg(":alice!a@h ACCOUNT *"));
        assert!(session.channel("#chan").unwrap().users[&"alice".to_string()]
            .account
            .is_none());
    }

    #[test]
    fn topic_reply_and_meta() {
        let mut session = joined_session();
        session.apply(&msg(":server 332 munin #chan :the topic"));
        session.apply(&msg(":server 333 munin #chan alice 1700000000"));
        let topic = session.channel("#chan").unwrap().topic.clone().unwrap();
        assert_eq!(topic.text, "the topic");
        assert_eq!(topic.set_by.as_deref(), Some("alice"));
        assert_eq!(topic.set_at, Some(1_700_000_000));
    }

    #[test]
    fn chghost_updates_identity() {
        let mut session = joined_session();
        session.apply(&msg(":alice!old@oldhost JOIN #chan"));
        session.apply(&msg(":alice!old@oldhost CHGHOST new newhost"));
        let alice = &session.channel("#chan").unwrap().users[&"alice".to_string()];
        assert_eq!(alice.user.as_deref(), Some("new"));
        assert_eq!(alice.host.as_deref(), Some("newhost"));
    }
}
