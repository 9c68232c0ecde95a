//! ISUPPORT (RPL_ISUPPORT, numeric 005) feature registry.
//!
//! Servers advertise their limits and behaviour through 005 tokens. The
//! [`Isupport`] registry consumes those tokens and answers the questions the
//! rest of the engine needs: is this a channel name, what class is this mode,
//! which prefix outranks which, how do we fold identity for comparison.
//!
//! All answers derive solely from the current snapshot; a fresh 005 replaces
//! whatever was hard-coded before it.

use std::collections::HashMap;

use crate::casemap::CaseMapping;

/// Channel mode classes per the `CHANMODES` ISUPPORT token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeClass {
    /// Type A: list modes (ban/except/invite); always carry a mask.
    TypeA,
    /// Type B: always take a parameter (e.g. `+k`).
    TypeB,
    /// Type C: take a parameter only when set (e.g. `+l`).
    TypeC,
    /// Type D: flags, never take a parameter.
    TypeD,
    /// A membership prefix mode from `PREFIX` (e.g. `+o`, `+v`).
    Prefix,
}

/// Parsed server feature snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct Isupport {
    network: Option<String>,
    chantypes: String,
    /// Mode letters from `PREFIX`, highest privilege first.
    prefix_modes: Vec<char>,
    /// Prefix symbols from `PREFIX`, same order as `prefix_modes`.
    prefix_symbols: Vec<char>,
    /// `CHANMODES` classes A, B, C, D.
    chanmodes: [String; 4],
    casemapping: CaseMapping,
    nicklen: usize,
    channellen: usize,
    topiclen: usize,
    kicklen: usize,
    awaylen: usize,
    modes: usize,
    chanlimit: HashMap<char, usize>,
    /// Per-command target limits; `None` means unlimited.
    targmax: HashMap<String, Option<usize>>,
    maxlist: HashMap<char, usize>,
    excepts: Option<char>,
    invex: Option<char>,
    statusmsg: String,
    whox: bool,
    monitor: Option<usize>,
}

impl Default for Isupport {
    /// RFC 2812 defaults, used until the server's first 005 arrives.
    fn default() -> Self {
        Self {
            network: None,
            chantypes: "#&".to_string(),
            prefix_modes: vec!['o', 'v'],
            prefix_symbols: vec!['@', '+'],
            chanmodes: [
                "beI".to_string(),
                "k".to_string(),
                "l".to_string(),
                "imnpst".to_string(),
            ],
            casemapping: CaseMapping::Rfc1459,
            nicklen: 9,
            channellen: 50,
            topiclen: 390,
            kicklen: 255,
            awaylen: 200,
            modes: 3,
            chanlimit: HashMap::new(),
            targmax: HashMap::new(),
            maxlist: HashMap::new(),
            excepts: None,
            invex: None,
            statusmsg: String::new(),
            whox: false,
            monitor: None,
        }
    }
}

impl Isupport {
    /// Feed the parameters of one 005 reply.
    ///
    /// The first parameter (our nickname) and a trailing
    /// "are supported by this server" text are skipped.
    ///
    /// Returns true when the case mapping changed, in which case the caller
    /// must re-key every identity-keyed collection.
    pub fn apply_params(&mut self, params: &[String]) -> bool {
        let before = self.casemapping;

        let mut tokens: &[String] = match params.len() {
            0 | 1 => &[],
            _ => &params[1..],
        };
        if let Some(last) = tokens.last() {
            if last.contains(' ') {
                tokens = &tokens[..tokens.len() - 1];
            }
        }

        for token in tokens {
            self.apply_token(token);
        }

        self.casemapping != before
    }

    /// Apply one `KEY[=value]` or `-KEY` token.
    pub fn apply_token(&mut self, token: &str) {
        if let Some(negated) = token.strip_prefix('-') {
            self.reset_feature(negated);
            return;
        }

        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (token, None),
        };

        match key {
            "NETWORK" => self.network = value.map(str::to_string),
            "CHANTYPES" => {
                if let Some(v) = value {
                    self.chantypes = v.to_string();
                }
            }
            "PREFIX" => {
                if let Some((modes, symbols)) = value.and_then(parse_prefix_token) {
                    self.prefix_modes = modes;
                    self.prefix_symbols = symbols;
                }
            }
            "CHANMODES" => {
                if let Some(v) = value {
                    let mut classes = v.split(',');
                    for slot in self.chanmodes.iter_mut() {
                        *slot = classes.next().unwrap_or("").to_string();
                    }
                }
            }
            "CASEMAPPING" => {
                if let Some(mapping) = value.and_then(CaseMapping::from_token) {
                    self.casemapping = mapping;
                }
            }
            "NICKLEN" => set_usize(&mut self.nicklen, value),
            "CHANNELLEN" => set_usize(&mut self.channellen, value),
            "TOPICLEN" => set_usize(&mut self.topiclen, value),
            "KICKLEN" => set_usize(&mut self.kicklen, value),
            "AWAYLEN" => set_usize(&mut self.awaylen, value),
            "MODES" => set_usize(&mut self.modes, value),
            "CHANLIMIT" => {
                if let Some(v) = value {
                    self.chanlimit = parse_char_limits(v);
                }
            }
            "TARGMAX" => {
                if let Some(v) = value {
                    self.targmax = parse_targmax(v);
                }
            }
            "MAXLIST" => {
                if let Some(v) = value {
                    self.maxlist = parse_char_limits(v);
                }
            }
            "EXCEPTS" => {
                self.excepts = Some(value.and_then(|v| v.chars().next()).unwrap_or('e'));
            }
            "INVEX" => {
                self.invex = Some(value.and_then(|v| v.chars().next()).unwrap_or('I'));
            }
            "STATUSMSG" => {
                if let Some(v) = value {
                    self.statusmsg = v.to_string();
                }
            }
            "WHOX" => self.whox = true,
            "MONITOR" => {
                self.monitor = Some(
                    value
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(usize::MAX),
                );
            }
            _ => {} // unknown tokens are ignored
        }
    }

    fn reset_feature(&mut self, key: &str) {
        let defaults = Self::default();
        match key {
            "NETWORK" => self.network = defaults.network,
            "CHANTYPES" => self.chantypes = defaults.chantypes,
            "PREFIX" => {
                self.prefix_modes = defaults.prefix_modes;
                self.prefix_symbols = defaults.prefix_symbols;
            }
            "CHANMODES" => self.chanmodes = defaults.chanmodes,
            "CASEMAPPING" => self.casemapping = defaults.casemapping,
            "NICKLEN" => self.nicklen = defaults.nicklen,
            "CHANNELLEN" => self.channellen = defaults.channellen,
            "TOPICLEN" => self.topiclen = defaults.topiclen,
            "KICKLEN" => self.kicklen = defaults.kicklen,
            "AWAYLEN" => self.awaylen = defaults.awaylen,
            "MODES" => self.modes = defaults.modes,
            "CHANLIMIT" => self.chanlimit = defaults.chanlimit,
            "TARGMAX" => self.targmax = defaults.targmax,
            "MAXLIST" => self.maxlist = defaults.maxlist,
            "EXCEPTS" => self.excepts = None,
            "INVEX" => self.invex = None,
            "STATUSMSG" => self.statusmsg = defaults.statusmsg,
            "WHOX" => self.whox = false,
            "MONITOR" => self.monitor = None,
            _ => {}
        }
    }

    // === Queries ===

    /// Whether the name starts with a declared channel type character.
    pub fn is_channel(&self, name: &str) -> bool {
        name.chars()
            .next()
            .is_some_and(|c| self.chantypes.contains(c))
    }

    /// Prefix symbol for a membership mode letter (`o` → `@`).
    pub fn prefix_for_mode(&self, mode: char) -> Option<char> {
        self.prefix_modes
            .iter()
            .position(|&m| m == mode)
            .map(|i| self.prefix_symbols[i])
    }

    /// Membership mode letter for a prefix symbol (`@` → `o`).
    pub fn mode_for_prefix(&self, symbol: char) -> Option<char> {
        self.prefix_symbols
            .iter()
            .position(|&s| s == symbol)
            .map(|i| self.prefix_modes[i])
    }

    /// Rank of a prefix symbol; lower is more privileged.
    pub fn prefix_rank(&self, symbol: char) -> Option<usize> {
        self.prefix_symbols.iter().position(|&s| s == symbol)
    }

    /// Fold a name under the active case mapping.
    pub fn normalize(&self, s: &str) -> String {
        self.casemapping.normalize(s)
    }

    /// The active case mapping.
    pub fn casemapping(&self) -> CaseMapping {
        self.casemapping
    }

    /// Classify a channel mode letter.
    pub fn mode_class(&self, mode: char) -> Option<ModeClass> {
        if self.prefix_modes.contains(&mode) {
            return Some(ModeClass::Prefix);
        }
        if self.chanmodes[0].contains(mode) {
            return Some(ModeClass::TypeA);
        }
        if self.chanmodes[1].contains(mode) {
            return Some(ModeClass::TypeB);
        }
        if self.chanmodes[2].contains(mode) {
            return Some(ModeClass::TypeC);
        }
        if self.chanmodes[3].contains(mode) {
            return Some(ModeClass::TypeD);
        }
        None
    }

    /// Per-command target limit. `None` means no declared limit.
    pub fn targmax(&self, command: &str) -> Option<usize> {
        self.targmax
            .get(&command.to_ascii_uppercase())
            .copied()
            .flatten()
    }

    /// Maximum parameterised modes per MODE command.
    pub fn max_modes(&self) -> usize {
        self.modes
    }

    /// Maximum entries for a list mode, when declared.
    pub fn max_list(&self, mode: char) -> Option<usize> {
        self.maxlist.get(&mode).copied()
    }

    /// Declared network name.
    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    /// Maximum nickname length.
    pub fn nicklen(&self) -> usize {
        self.nicklen
    }

    /// Maximum channel name length.
    pub fn channellen(&self) -> usize {
        self.channellen
    }

    /// Maximum topic length.
    pub fn topiclen(&self) -> usize {
        self.topiclen
    }

    /// Maximum kick reason length.
    pub fn kicklen(&self) -> usize {
        self.kicklen
    }

    /// Maximum away message length.
    pub fn awaylen(&self) -> usize {
        self.awaylen
    }

    /// Ban-exception mode letter, when supported.
    pub fn excepts(&self) -> Option<char> {
        self.excepts
    }

    /// Invite-exception mode letter, when supported.
    pub fn invex(&self) -> Option<char> {
        self.invex
    }

    /// Prefix symbols usable as STATUSMSG targets.
    pub fn statusmsg(&self) -> &str {
        &self.statusmsg
    }

    /// Whether WHOX queries are supported.
    pub fn whox(&self) -> bool {
        self.whox
    }

    /// MONITOR target limit, when supported.
    pub fn monitor(&self) -> Option<usize> {
        self.monitor
    }

    /// Membership mode letters, highest privilege first.
    pub fn prefix_modes(&self) -> &[char] {
        &self.prefix_modes
    }

    /// Membership prefix symbols, highest privilege first.
    pub fn prefix_symbols(&self) -> &[char] {
        &self.prefix_symbols
    }
}

/// Parse `(modes)prefixes`; ignored when the two halves differ in length.
fn parse_prefix_token(value: &str) -> Option<(Vec<char>, Vec<char>)> {
    let rest = value.strip_prefix('(')?;
    let (modes, symbols) = rest.split_once(')')?;
    let modes: Vec<char> = modes.chars().collect();
    let symbols: Vec<char> = symbols.chars().collect();
    if modes.len() != symbols.len() {
        return None;
    }
    Some((modes, symbols))
}

/// Parse `chars:limit[,chars:limit...]` (CHANLIMIT, MAXLIST).
fn parse_char_limits(value: &str) -> HashMap<char, usize> {
    let mut out = HashMap::new();
    for group in value.split(',') {
        let Some((chars, limit)) = group.split_once(':') else {
            continue;
        };
        let Ok(limit) = limit.parse::<usize>() else {
            continue;
        };
        for c in chars.chars() {
            out.insert(c, limit);
        }
    }
    out
}

/// Parse `CMD:n[,CMD:...]`; an empty limit means unlimited.
fn parse_targmax(value: &str) -> HashMap<String, Option<usize>> {
    let mut out = HashMap::new();
    for group in value.split(',') {
        let Some((cmd, limit)) = group.split_once(':') else {
            continue;
        };
        let limit = if limit.is_empty() {
            None
        } else {
            match limit.parse::<usize>() {
                Ok(n) => Some(n),
                Err(_) => continue,
            }
        };
        out.insert(cmd.to_ascii_uppercase(), limit);
    }
    out
}

fn set_usize(slot: &mut usize, value: Option<&str>) {
    if let Some(n) = value.and_then(|v| v.parse().ok()) {
        *slot = n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(tokens: &[&str]) -> Isupport {
        let mut isupport = Isupport::default();
        for t in tokens {
            isupport.apply_token(t);
        }
        isupport
    }

    #[test]
    fn defaults_mirror_rfc2812() {
        let i = Isupport::default();
        assert!(i.is_channel("#chan"));
        assert!(i.is_channel("&chan"));
        assert!(!i.is_channel("nick"));
        assert_eq!(i.prefix_for_mode('o'), Some('@'));
        assert_eq!(i.mode_class('b'), Some(ModeClass::TypeA));
        assert_eq!(i.mode_class('k'), Some(ModeClass::TypeB));
        assert_eq!(i.mode_class('l'), Some(ModeClass::TypeC));
        assert_eq!(i.mode_class('i'), Some(ModeClass::TypeD));
        assert_eq!(i.max_modes(), 3);
    }

    #[test]
    fn parses_prefix_token() {
        let i = apply(&["PREFIX=(qaohv)~&@%+"]);
        assert_eq!(i.prefix_for_mode('q'), Some('~'));
        assert_eq!(i.mode_for_prefix('%'), Some('h'));
        assert_eq!(i.prefix_rank('~'), Some(0));
        assert_eq!(i.prefix_rank('+'), Some(4));
        assert!(i.prefix_rank('~') < i.prefix_rank('@'));
    }

    #[test]
    fn mismatched_prefix_token_is_ignored() {
        let i = apply(&["PREFIX=(ov)@+%"]);
        assert_eq!(i.prefix_symbols(), &['@', '+']);
    }

    #[test]
    fn parses_chanmodes_classes() {
        let i = apply(&["CHANMODES=beI,k,l,imnpst"]);
        assert_eq!(i.mode_class('e'), Some(ModeClass::TypeA));
        assert_eq!(i.mode_class('t'), Some(ModeClass::TypeD));
        assert_eq!(i.mode_class('x'), None);
    }

    #[test]
    fn prefix_beats_chanmodes_classification() {
        // 'o' must classify as a prefix mode, never as a flag
        let i = apply(&["PREFIX=(ov)@+", "CHANMODES=beI,k,l,imnpsto"]);
        assert_eq!(i.mode_class('o'), Some(ModeClass::Prefix));
    }

    #[test]
    fn casemap_change_is_reported() {
        let mut i = Isupport::default();
        let params = vec!["nick".to_string(), "CASEMAPPING=ascii".to_string()];
        assert!(i.apply_params(&params));
        assert_eq!(i.casemapping(), CaseMapping::Ascii);
        // Re-applying the same mapping is not a change.
        assert!(!i.apply_params(&params));
    }

    #[test]
    fn negation_restores_default() {
        let mut i = apply(&["NICKLEN=30", "EXCEPTS"]);
        assert_eq!(i.nicklen(), 30);
        assert_eq!(i.excepts(), Some('e'));
        i.apply_token("-NICKLEN");
        i.apply_token("-EXCEPTS");
        assert_eq!(i.nicklen(), 9);
        assert_eq!(i.excepts(), None);
    }

    #[test]
    fn targmax_with_unlimited_entries() {
        let i = apply(&["TARGMAX=PRIVMSG:4,NOTICE:3,JOIN:"]);
        assert_eq!(i.targmax("PRIVMSG"), Some(4));
        assert_eq!(i.targmax("privmsg"), Some(4));
        assert_eq!(i.targmax("JOIN"), None);
        assert_eq!(i.targmax("KICK"), None);
    }

    #[test]
    fn skips_trailing_text_in_params() {
        let mut i = Isupport::default();
        let params: Vec<String> = vec![
            "nick".into(),
            "NETWORK=TestNet".into(),
            "are supported by this server".into(),
        ];
        i.apply_params(&params);
        assert_eq!(i.network(), Some("TestNet"));
    }

    #[test]
    fn maxlist_and_chanlimit() {
        let i = apply(&["MAXLIST=beI:100", "CHANLIMIT=#:25"]);
        assert_eq!(i.max_list('b'), Some(100));
        assert_eq!(i.max_list('I'), Some(100));
        assert_eq!(i.max_list('q'), None);
        assert_eq!(i.chanlimit.get(&'#'), Some(&25));
    }
}
