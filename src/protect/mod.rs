//! Channel protection engine.
//!
//! Four detectors share the sliding-window bookkeeping in [`trackers`]:
//! flood (messages per nick), clones (nicks per host), mass-kick (kicks
//! per kicker), and bad words (pattern match). A subject whose hostmask
//! resolves to a database user carrying the friend flag is exempt.
//! Detector hits turn into graduated enforcement lines pushed through the
//! connection's send queue; bans are always host-generalised.

mod badwords;
mod trackers;

pub use badwords::BadWordSet;
pub use trackers::{BucketKey, MembershipTracker, WindowTracker};

use std::sync::Arc;
use std::time::Duration;

use munin_proto::{Message, ModeChange};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::client::{Event, EventKind, ServerId};
use crate::config::{ProtectionAction, ProtectionConfig};
use crate::error::AgentResult;
use crate::mask::{ban_mask, host_of};
use crate::userdb::UserDb;

/// Sweep cadence for idle buckets.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Extra idle slack past the largest window before a bucket is evicted.
const SWEEP_SLACK: Duration = Duration::from_secs(60);

/// What the engine decided about one event.
#[derive(Debug, Default)]
pub struct Verdict {
    /// Suppress bind delivery for this event.
    pub suppress: bool,
    /// MODE changes to apply first (bans, deops, quiets). The send queue
    /// batches these within the server's MODES limit.
    pub modes: Option<(String, Vec<ModeChange>)>,
    /// Enforcement lines sent after the modes (kicks, notices).
    pub actions: Vec<Message>,
}

impl Verdict {
    fn clean() -> Self {
        Self::default()
    }

    fn enforce(channel: &str, modes: Vec<ModeChange>, actions: Vec<Message>) -> Self {
        Self {
            suppress: true,
            modes: if modes.is_empty() {
                None
            } else {
                Some((channel.to_string(), modes))
            },
            actions,
        }
    }
}

/// The protection engine, shared by every connection.
pub struct ProtectionEngine {
    config: ProtectionConfig,
    userdb: Arc<UserDb>,
    flood: WindowTracker,
    clones: MembershipTracker,
    kicks: WindowTracker,
    bad_words: BadWordSet,
}

impl ProtectionEngine {
    /// Build the engine, compiling the bad-word rules.
    pub fn new(config: ProtectionConfig, userdb: Arc<UserDb>) -> AgentResult<Self> {
        let bad_words = BadWordSet::compile(&config.bad_words)?;
        let flood_threshold = config.flood.message_threshold;
        let kick_threshold = config.mass_kick.kick_threshold;
        Ok(Self {
            config,
            userdb,
            flood: WindowTracker::new(flood_threshold),
            clones: MembershipTracker::new(),
            kicks: WindowTracker::new(kick_threshold),
            bad_words,
        })
    }

    /// Inspect one event; called before bind dispatch.
    pub fn inspect(&self, event: &Event) -> Verdict {
        if !self.config.enabled {
            return Verdict::clean();
        }

        match &event.kind {
            EventKind::Privmsg {
                nick,
                hostmask,
                target,
                text,
            } if is_channel_name(target) => {
                self.on_channel_message(&event.server, target, nick, hostmask, text)
            }
            EventKind::UserJoined {
                channel,
                nick,
                hostmask,
                ..
            } => self.on_join(&event.server, channel, nick, hostmask),
            EventKind::UserParted { channel, nick, .. } => {
                self.clones.leave(&event.server, channel, nick);
                Verdict::clean()
            }
            EventKind::UserKicked {
                channel,
                nick,
                by,
                by_hostmask,
                ..
            } => {
                self.clones.leave(&event.server, channel, nick);
                self.on_kick(&event.server, channel, by, by_hostmask)
            }
            EventKind::UserQuit { nick, channels, .. } => {
                for channel in channels {
                    self.clones.leave(&event.server, channel, nick);
                }
                Verdict::clean()
            }
            EventKind::NickChanged { old, new, .. } => {
                self.clones.rename(&event.server, old, new);
                Verdict::clean()
            }
            _ => Verdict::clean(),
        }
    }

    fn on_channel_message(
        &self,
        server: &ServerId,
        channel: &str,
        nick: &str,
        hostmask: &str,
        text: &str,
    ) -> Verdict {
        if self.is_exempt(hostmask, channel) {
            return Verdict::clean();
        }

        // Bad words first: a single slur should not need a full window.
        if let Some(rule) = self.bad_words.first_match(channel, text) {
            info!(
                channel,
                nick,
                pattern_len = rule.pattern.len(),
                audit = true,
                "Bad-word rule matched"
            );
            let (modes, actions) =
                action_effects(rule.action, channel, nick, hostmask, "Watch your language");
            return Verdict::enforce(channel, modes, actions);
        }

        let flood = self.config.flood_for(channel);
        let key = BucketKey::new(server, channel, nick);
        let count = self
            .flood
            .record(key, Duration::from_secs(flood.window_secs));
        if count > flood.message_threshold as usize {
            info!(
                channel,
                nick,
                count,
                threshold = flood.message_threshold,
                audit = true,
                "Flood detected"
            );
            let (modes, actions) = action_effects(
                flood.action,
                channel,
                nick,
                hostmask,
                "Flood protection triggered",
            );
            return Verdict::enforce(channel, modes, actions);
        }

        Verdict::clean()
    }

    fn on_join(
        &self,
        server: &ServerId,
        channel: &str,
        nick: &str,
        hostmask: &str,
    ) -> Verdict {
        let Some(host) = host_of(hostmask).filter(|h| !h.is_empty() && *h != "*") else {
            return Verdict::clean();
        };

        let key = BucketKey::new(server, channel, host);
        let count = self.clones.join(key, nick);

        if self.is_exempt(hostmask, channel) {
            return Verdict::clean();
        }

        let clone_config = self.config.clone_for(channel);
        if count > clone_config.max_clones as usize {
            info!(
                channel,
                host,
                count,
                limit = clone_config.max_clones,
                audit = true,
                "Clone limit exceeded"
            );
            let (modes, actions) = action_effects(
                clone_config.action,
                channel,
                nick,
                hostmask,
                "Too many connections from your host",
            );
            return Verdict::enforce(channel, modes, actions);
        }

        Verdict::clean()
    }

    fn on_kick(
        &self,
        server: &ServerId,
        channel: &str,
        kicker: &str,
        kicker_hostmask: &str,
    ) -> Verdict {
        if self.is_exempt(kicker_hostmask, channel) {
            return Verdict::clean();
        }

        let mass_kick = &self.config.mass_kick;
        let key = BucketKey::new(server, channel, kicker);
        let count = self
            .kicks
            .record(key, Duration::from_secs(mass_kick.window_secs));
        if count > mass_kick.kick_threshold as usize {
            warn!(
                channel,
                kicker,
                count,
                audit = true,
                "Mass-kick detected; removing operator"
            );
            // Fixed response: deop plus kickban, in one batched MODE.
            let (mut modes, actions) = action_effects(
                ProtectionAction::Kickban,
                channel,
                kicker,
                kicker_hostmask,
                "Mass-kick protection triggered",
            );
            modes.insert(
                0,
                ModeChange {
                    add: false,
                    mode: 'o',
                    arg: Some(kicker.to_string()),
                },
            );
            return Verdict::enforce(channel, modes, actions);
        }

        Verdict::clean()
    }

    /// Friend flag (global or on this channel) exempts the subject.
    fn is_exempt(&self, hostmask: &str, channel: &str) -> bool {
        self.userdb
            .match_user(hostmask)
            .map(|user| user.has_flag('f', Some(channel)))
            .unwrap_or(false)
    }

    /// Evict buckets idle past the largest configured window plus slack.
    pub fn sweep(&self) -> usize {
        let max_window = self
            .config
            .flood
            .window_secs
            .max(self.config.mass_kick.window_secs);
        let max_idle = Duration::from_secs(max_window) + SWEEP_SLACK;

        let removed = self.flood.sweep_idle(max_idle)
            + self.kicks.sweep_idle(max_idle)
            + self.clones.sweep_idle(max_idle);
        if removed > 0 {
            debug!(removed, "Idle protection buckets evicted");
        }
        removed
    }
}

/// Background sweep of idle buckets, at most once a minute.
pub fn spawn_sweeper(engine: Arc<ProtectionEngine>, shutdown: broadcast::Sender<()>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    engine.sweep();
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}

/// Whether a message target is a channel.
fn is_channel_name(target: &str) -> bool {
    target.starts_with(['#', '&', '+', '!'])
}

/// Mode changes and follow-up lines for one action.
///
/// Bans are host-generalised to `*!*@host`; modes land before kicks so the
/// offender cannot rejoin during the gap.
fn action_effects(
    action: ProtectionAction,
    channel: &str,
    nick: &str,
    hostmask: &str,
    reason: &str,
) -> (Vec<ModeChange>, Vec<Message>) {
    let mask = ban_mask(hostmask);
    let ban = |mode: char| ModeChange {
        add: true,
        mode,
        arg: Some(mask.clone()),
    };
    match action {
        ProtectionAction::Warn => (Vec::new(), vec![Message::notice(nick, reason)]),
        ProtectionAction::Kick => (Vec::new(), vec![Message::kick(channel, nick, reason)]),
        ProtectionAction::Ban => (vec![ban('b')], Vec::new()),
        ProtectionAction::Kickban => {
            (vec![ban('b')], vec![Message::kick(channel, nick, reason)])
        }
        ProtectionAction::Quiet => (vec![ban('q')], Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BadWordRule, FloodConfig};

    fn server() -> ServerId {
        ServerId("net".to_string())
    }

    fn engine_with(config: ProtectionConfig) -> ProtectionEngine {
        // The database never touches disk unless save() is called, so the
        // temporary directory can go away immediately.
        let dir = tempfile::tempdir().unwrap();
        let userdb = Arc::new(UserDb::load(dir.path().join("users.json")).unwrap());
        ProtectionEngine::new(config, userdb).unwrap()
    }

    fn engine_with_db(config: ProtectionConfig, userdb: Arc<UserDb>) -> ProtectionEngine {
        ProtectionEngine::new(config, userdb).unwrap()
    }

    fn privmsg_event(nick: &str, text: &str) -> Event {
        Event::now(
            server(),
            EventKind::Privmsg {
                nick: nick.to_string(),
                hostmask: format!("{}!user@spammer-host", nick),
                target: "#room".to_string(),
                text: text.to_string(),
            },
        )
    }

    fn join_event(nick: &str, host: &str) -> Event {
        Event::now(
            server(),
            EventKind::UserJoined {
                channel: "#room".to_string(),
                nick: nick.to_string(),
                hostmask: format!("{}!u@{}", nick, host),
                account: None,
            },
        )
    }

    /// Render a verdict to wire lines the way the supervisor does: batched
    /// MODEs first, then the follow-up actions.
    fn wire_lines(verdict: &Verdict) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some((channel, changes)) = &verdict.modes {
            let isupport = munin_proto::Isupport::default();
            for msg in
                crate::client::sendq::batch_mode_changes(channel, changes, isupport.max_modes())
            {
                lines.push(msg.to_string());
            }
        }
        lines.extend(verdict.actions.iter().map(|m| m.to_string()));
        lines
    }

    #[test]
    fn flood_kickban_after_threshold() {
        let mut config = ProtectionConfig::default();
        config.flood = FloodConfig {
            message_threshold: 5,
            window_secs: 10,
            action: ProtectionAction::Kickban,
        };
        let engine = engine_with(config);

        for i in 0..5 {
            let verdict = engine.inspect(&privmsg_event("spammer", &format!("msg {}", i)));
            assert!(!verdict.suppress, "message {} must pass", i);
        }

        let verdict = engine.inspect(&privmsg_event("spammer", "msg 6"));
        assert!(verdict.suppress);
        let lines = wire_lines(&verdict);
        assert_eq!(lines[0], "MODE #room +b *!*@spammer-host");
        assert_eq!(lines[1], "KICK #room spammer :Flood protection triggered");
    }

    #[test]
    fn clone_count_is_idempotent_per_nick() {
        let mut config = ProtectionConfig::default();
        config.clone.max_clones = 2;
        config.clone.action = ProtectionAction::Warn;
        let engine = engine_with(config);

        assert!(!engine.inspect(&join_event("a", "evil.host")).suppress);
        // Replayed join never doubles the count.
        assert!(!engine.inspect(&join_event("a", "evil.host")).suppress);
        assert!(!engine.inspect(&join_event("b", "evil.host")).suppress);

        let verdict = engine.inspect(&join_event("c", "evil.host"));
        assert_eq!(verdict.actions.len(), 1);
        assert!(verdict.actions[0].to_string().starts_with("NOTICE c"));
    }

    #[test]
    fn departures_shrink_clone_count() {
        let mut config = ProtectionConfig::default();
        config.clone.max_clones = 2;
        let engine = engine_with(config);

        engine.inspect(&join_event("a", "h"));
        engine.inspect(&join_event("b", "h"));
        engine.inspect(&Event::now(
            server(),
            EventKind::UserParted {
                channel: "#room".to_string(),
                nick: "a".to_string(),
                reason: None,
            },
        ));
        // Two live nicks again after the part: no breach.
        assert!(!engine.inspect(&join_event("c", "h")).suppress);
    }

    #[test]
    fn mass_kick_triggers_deop_and_kickban() {
        let mut config = ProtectionConfig::default();
        config.mass_kick.kick_threshold = 2;
        config.mass_kick.window_secs = 30;
        let engine = engine_with(config);

        let kick = |victim: &str| {
            Event::now(
                server(),
                EventKind::UserKicked {
                    channel: "#room".to_string(),
                    nick: victim.to_string(),
                    by: "rogue".to_string(),
                    by_hostmask: "rogue!r@rogue.host".to_string(),
                    reason: None,
                },
            )
        };

        assert!(!engine.inspect(&kick("v1")).suppress);
        assert!(!engine.inspect(&kick("v2")).suppress);

        let verdict = engine.inspect(&kick("v3"));
        let lines = wire_lines(&verdict);
        // Deop and ban ride one batched MODE, then the kick.
        assert_eq!(lines[0], "MODE #room -o+b rogue *!*@rogue.host");
        assert!(lines[1].starts_with("KICK #room rogue"));
    }

    #[test]
    fn bad_word_first_match_wins_over_flood() {
        let mut config = ProtectionConfig::default();
        config.bad_words.push(BadWordRule {
            pattern: "forbidden".to_string(),
            regex: false,
            action: ProtectionAction::Quiet,
            channels: Vec::new(),
        });
        let engine = engine_with(config);

        let verdict = engine.inspect(&privmsg_event("mouth", "this is forbidden talk"));
        let lines = wire_lines(&verdict);
        assert_eq!(lines, vec!["MODE #room +q *!*@spammer-host"]);
    }

    #[test]
    fn friends_are_exempt() {
        let dir = tempfile::tempdir().unwrap();
        let userdb = Arc::new(UserDb::load(dir.path().join("users.json")).unwrap());
        userdb.add_user("pal", "*!*@spammer-host").unwrap();
        userdb.add_flags("pal", "f").unwrap();

        let mut config = ProtectionConfig::default();
        config.flood.message_threshold = 1;
        let engine = engine_with_db(config, userdb);

        for _ in 0..10 {
            assert!(!engine.inspect(&privmsg_event("pal", "spam")).suppress);
        }
    }

    #[test]
    fn channel_scoped_friend_flag_exempts_only_there() {
        let dir = tempfile::tempdir().unwrap();
        let userdb = Arc::new(UserDb::load(dir.path().join("users.json")).unwrap());
        userdb.add_user("pal", "*!*@spammer-host").unwrap();
        userdb.add_flags("pal", "|#room:f").unwrap();

        let mut config = ProtectionConfig::default();
        config.flood.message_threshold = 1;
        config.flood.action = ProtectionAction::Kick;
        let engine = engine_with_db(config, userdb.clone());

        // Exempt on #room.
        for _ in 0..5 {
            assert!(!engine.inspect(&privmsg_event("pal", "x")).suppress);
        }

        // Not exempt elsewhere.
        let elsewhere = Event::now(
            server(),
            EventKind::Privmsg {
                nick: "pal".to_string(),
                hostmask: "pal!user@spammer-host".to_string(),
                target: "#other".to_string(),
                text: "x".to_string(),
            },
        );
        engine.inspect(&elsewhere);
        let verdict = engine.inspect(&elsewhere);
        assert!(verdict.suppress);
    }

    #[test]
    fn disabled_engine_is_inert() {
        let config = ProtectionConfig {
            enabled: false,
            ..ProtectionConfig::default()
        };
        let engine = engine_with(config);
        for _ in 0..20 {
            assert!(!engine.inspect(&privmsg_event("x", "y")).suppress);
        }
    }

    #[test]
    fn sweep_clears_idle_state() {
        let engine = engine_with(ProtectionConfig::default());
        engine.inspect(&privmsg_event("a", "hello"));
        engine.inspect(&join_event("a", "h"));
        assert!(engine.flood.len() + engine.clones.len() > 0);
        // Zero-idle sweep evicts everything (the production sweeper allows
        // max(window) + 60s of idleness).
        engine.flood.sweep_idle(Duration::ZERO);
        engine.clones.sweep_idle(Duration::ZERO);
        engine.kicks.sweep_idle(Duration::ZERO);
        assert_eq!(engine.flood.len() + engine.clones.len() + engine.kicks.len(), 0);
    }
}
