//! IRCv3 capability negotiation.
//!
//! The [`CapNegotiator`] drives the client side of `CAP LS 302`:
//! list what the server offers, request the intersection with our wanted
//! set, and track ACK/NAK plus live NEW/DEL updates. `CAP END` timing is
//! owned by the registration driver, because it must wait for SASL.

use std::collections::{HashMap, HashSet};

use crate::message::Message;

/// Capabilities the agent asks for when the server offers them.
pub const WANTED_CAPS: &[&str] = &[
    "sasl",
    "server-time",
    "message-tags",
    "account-tag",
    "multi-prefix",
    "extended-join",
    "account-notify",
    "away-notify",
    "chghost",
    "setname",
    "cap-notify",
    "batch",
    "echo-message",
    "msgid",
    "labeled-response",
    "invite-notify",
    "userhost-in-names",
    "standard-replies",
];

/// Negotiation phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapState {
    /// Nothing sent yet.
    Idle,
    /// `CAP LS 302` sent, collecting the (possibly multi-line) offer.
    Listing,
    /// `CAP REQ` sent, waiting for ACK/NAK.
    Requesting,
    /// All requests answered.
    Negotiated,
}

/// Client-side CAP negotiation state machine.
#[derive(Clone, Debug)]
pub struct CapNegotiator {
    state: CapState,
    /// Server-offered capabilities with their advertised values.
    available: HashMap<String, Option<String>>,
    /// Requested but not yet answered.
    pending: HashSet<String>,
    /// Acknowledged and active.
    enabled: HashSet<String>,
    want_sasl: bool,
}

impl CapNegotiator {
    /// Create a negotiator. `want_sasl` controls whether the `sasl`
    /// capability is part of the wanted set.
    pub fn new(want_sasl: bool) -> Self {
        Self {
            state: CapState::Idle,
            available: HashMap::new(),
            pending: HashSet::new(),
            enabled: HashSet::new(),
            want_sasl,
        }
    }

    /// Current phase.
    pub fn state(&self) -> CapState {
        self.state
    }

    /// True once every request has been answered.
    pub fn negotiated(&self) -> bool {
        self.state == CapState::Negotiated
    }

    /// Whether a capability is currently enabled.
    pub fn is_enabled(&self, cap: &str) -> bool {
        self.enabled.contains(cap)
    }

    /// The enabled capability set.
    pub fn enabled(&self) -> &HashSet<String> {
        &self.enabled
    }

    /// SASL mechanisms advertised by the server (`sasl=PLAIN,EXTERNAL`).
    ///
    /// `Some(vec![])` means the cap is offered without a mechanism list.
    pub fn sasl_mechanisms(&self) -> Option<Vec<String>> {
        let value = self.available.get("sasl")?;
        Some(match value {
            Some(list) => list
                .split(',')
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        })
    }

    /// Start negotiation. Returns the `CAP LS 302` message to send.
    pub fn begin(&mut self) -> Message {
        self.state = CapState::Listing;
        Message::from_parts("CAP", &["LS", "302"])
    }

    /// Handle a `CAP` message from the server; returns messages to send.
    ///
    /// `params` are the CAP command parameters, e.g.
    /// `["*", "LS", "*", "sasl=PLAIN server-time"]`.
    pub fn handle_cap(&mut self, params: &[String]) -> Vec<Message> {
        let Some(subcommand) = params.get(1) else {
            return Vec::new();
        };

        match subcommand.as_str() {
            "LS" => self.on_ls(&params[2..]),
            "ACK" => self.on_answer(params.get(2).map(String::as_str).unwrap_or(""), true),
            "NAK" => self.on_answer(params.get(2).map(String::as_str).unwrap_or(""), false),
            "NEW" => self.on_new(params.get(2).map(String::as_str).unwrap_or("")),
            "DEL" => {
                self.on_del(params.get(2).map(String::as_str).unwrap_or(""));
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_ls(&mut self, rest: &[String]) -> Vec<Message> {
        // A `*` before the capability list marks a continuation line.
        let (more, caps) = match rest {
            [marker, caps, ..] if marker == "*" => (true, caps.as_str()),
            [caps, ..] => (false, caps.as_str()),
            [] => (false, ""),
        };

        for item in caps.split_whitespace() {
            let (name, value) = match item.split_once('=') {
                Some((n, v)) => (n, Some(v.to_string())),
                None => (item, None),
            };
            self.available.insert(name.to_string(), value);
        }

        if more {
            return Vec::new();
        }

        let to_request = self.missing_wanted();
        if to_request.is_empty() {
            self.state = CapState::Negotiated;
            return Vec::new();
        }

        self.state = CapState::Requesting;
        self.pending.extend(to_request.iter().cloned());
        vec![Message::from_parts("CAP", &["REQ", &to_request.join(" ")])]
    }

    fn on_answer(&mut self, caps: &str, acked: bool) -> Vec<Message> {
        for cap in caps.split_whitespace() {
            let name = cap.strip_prefix('-').unwrap_or(cap);
            self.pending.remove(name);
            if acked {
                if cap.starts_with('-') {
                    self.enabled.remove(name);
                } else {
                    self.enabled.insert(name.to_string());
                }
            }
        }

        if self.state == CapState::Requesting && self.pending.is_empty() {
            self.state = CapState::Negotiated;
        }
        Vec::new()
    }

    fn on_new(&mut self, caps: &str) -> Vec<Message> {
        for item in caps.split_whitespace() {
            let (name, value) = match item.split_once('=') {
                Some((n, v)) => (n, Some(v.to_string())),
                None => (item, None),
            };
            self.available.insert(name.to_string(), value);
        }

        // Late offers of wanted caps are picked up immediately.
        let to_request: Vec<String> = self
            .missing_wanted()
            .into_iter()
            .filter(|c| !self.pending.contains(c))
            .collect();
        if to_request.is_empty() {
            return Vec::new();
        }
        self.pending.extend(to_request.iter().cloned());
        vec![Message::from_parts("CAP", &["REQ", &to_request.join(" ")])]
    }

    fn on_del(&mut self, caps: &str) {
        for cap in caps.split_whitespace() {
            self.available.remove(cap);
            self.enabled.remove(cap);
        }
    }

    /// Wanted caps the server offers but we have neither enabled nor asked for.
    fn missing_wanted(&self) -> Vec<String> {
        WANTED_CAPS
            .iter()
            .filter(|&&cap| cap != "sasl" || self.want_sasl)
            .filter(|&&cap| self.available.contains_key(cap) && !self.enabled.contains(cap))
            .map(|&cap| cap.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn requests_only_offered_wanted_caps() {
        let mut neg = CapNegotiator::new(true);
        let ls = neg.begin();
        assert_eq!(ls.to_string(), "CAP LS 302");

        let out = neg.handle_cap(&params(&["*", "LS", "sasl=PLAIN server-time draft/unwanted"]));
        assert_eq!(out.len(), 1);
        let req = out[0].to_string();
        assert!(req.starts_with("CAP REQ :"));
        assert!(req.contains("sasl"));
        assert!(req.contains("server-time"));
        assert!(!req.contains("unwanted"));
        assert_eq!(neg.state(), CapState::Requesting);
    }

    #[test]
    fn multiline_ls_defers_request() {
        let mut neg = CapNegotiator::new(true);
        neg.begin();

        let out = neg.handle_cap(&params(&["*", "LS", "*", "sasl=PLAIN server-time"]));
        assert!(out.is_empty());
        assert_eq!(neg.state(), CapState::Listing);

        let out = neg.handle_cap(&params(&["*", "LS", "msgid"]));
        assert_eq!(out.len(), 1);
        assert!(out[0].to_string().contains("msgid"));
    }

    #[test]
    fn ack_enables_and_completes() {
        let mut neg = CapNegotiator::new(false);
        neg.begin();
        neg.handle_cap(&params(&["*", "LS", "server-time msgid"]));
        assert!(!neg.negotiated());

        neg.handle_cap(&params(&["*", "ACK", "server-time msgid"]));
        assert!(neg.negotiated());
        assert!(neg.is_enabled("server-time"));
        assert!(neg.is_enabled("msgid"));
    }

    #[test]
    fn nak_is_ignored_but_completes() {
        let mut neg = CapNegotiator::new(false);
        neg.begin();
        neg.handle_cap(&params(&["*", "LS", "server-time"]));
        neg.handle_cap(&params(&["*", "NAK", "server-time"]));
        assert!(neg.negotiated());
        assert!(!neg.is_enabled("server-time"));
    }

    #[test]
    fn sasl_excluded_when_not_wanted() {
        let mut neg = CapNegotiator::new(false);
        neg.begin();
        let out = neg.handle_cap(&params(&["*", "LS", "sasl=PLAIN server-time"]));
        assert!(!out[0].to_string().contains("sasl"));
    }

    #[test]
    fn empty_offer_negotiates_immediately() {
        let mut neg = CapNegotiator::new(true);
        neg.begin();
        let out = neg.handle_cap(&params(&["*", "LS", "draft/other"]));
        assert!(out.is_empty());
        assert!(neg.negotiated());
    }

    #[test]
    fn new_triggers_late_request() {
        let mut neg = CapNegotiator::new(false);
        neg.begin();
        neg.handle_cap(&params(&["*", "LS", "server-time"]));
        neg.handle_cap(&params(&["*", "ACK", "server-time"]));
        assert!(neg.negotiated());

        let out = neg.handle_cap(&params(&["*", "NEW", "msgid"]));
        assert_eq!(out.len(), 1);
        assert!(out[0].to_string().contains("msgid"));
        neg.handle_cap(&params(&["*", "ACK", "msgid"]));
        assert!(neg.is_enabled("msgid"));
    }

    #[test]
    fn del_revokes_enabled_cap() {
        let mut neg = CapNegotiator::new(false);
        neg.begin();
        neg.handle_cap(&params(&["*", "LS", "server-time"]));
        neg.handle_cap(&params(&["*", "ACK", "server-time"]));
        neg.handle_cap(&params(&["*", "DEL", "server-time"]));
        assert!(!neg.is_enabled("server-time"));
    }

    #[test]
    fn sasl_mechanism_list() {
        let mut neg = CapNegotiator::new(true);
        neg.begin();
        neg.handle_cap(&params(&["*", "LS", "sasl=PLAIN,SCRAM-SHA-256"]));
        assert_eq!(
            neg.sasl_mechanisms(),
            Some(vec!["PLAIN".to_string(), "SCRAM-SHA-256".to_string()])
        );
    }
}
