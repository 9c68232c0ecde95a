//! Registration driver: CAP negotiation, SASL, NICK/USER.
//!
//! Runs between the socket coming up and the 001 welcome. Capability
//! negotiation happens first; `CAP END` (followed by NICK/USER) is held
//! back until SASL has completed, successfully or not, or was never
//! requested at all.

use munin_proto::sasl::{self, SaslMechanism, ScramClient, ScramState};
use munin_proto::{CapNegotiator, Message};
use tracing::{debug, info, warn};

use crate::config::{AuthMode, ServerConfig};
use crate::error::{AgentError, AgentResult};

/// SASL numerics.
const RPL_SASLSUCCESS: &str = "903";
const SASL_FAILURES: &[&str] = &["902", "904", "905", "906", "907"];

enum SaslFlow {
    Plain { authcid: String, password: String },
    External,
    Scram(Box<ScramClient>),
}

impl SaslFlow {
    fn mechanism(&self) -> SaslMechanism {
        match self {
            Self::Plain { .. } => SaslMechanism::Plain,
            Self::External => SaslMechanism::External,
            Self::Scram(_) => SaslMechanism::ScramSha256,
        }
    }
}

/// Drives one registration attempt.
pub struct Registrar {
    caps: CapNegotiator,
    sasl: Option<SaslFlow>,
    sasl_started: bool,
    sasl_outcome: Option<bool>,
    nicknames: Vec<String>,
    nick_index: usize,
    username: String,
    realname: String,
    server_pass: Option<String>,
    cap_end_sent: bool,
    done: bool,
}

impl Registrar {
    /// Build a registrar for one server, with the revealed password (when
    /// the auth mode needs one).
    pub fn new(config: &ServerConfig, password: Option<String>) -> AgentResult<Self> {
        let account = config
            .auth_username
            .clone()
            .or_else(|| config.nicknames.first().cloned())
            .unwrap_or_default();

        let (sasl, server_pass) = match config.auth {
            AuthMode::None => (None, None),
            AuthMode::Pass => (None, password),
            AuthMode::SaslPlain => {
                let password = password
                    .ok_or_else(|| AgentError::Config("sasl-plain needs a password".into()))?;
                (
                    Some(SaslFlow::Plain {
                        authcid: account,
                        password,
                    }),
                    None,
                )
            }
            AuthMode::SaslScramSha256 => {
                let password = password.ok_or_else(|| {
                    AgentError::Config("sasl-scram-sha-256 needs a password".into())
                })?;
                let client = ScramClient::new(&account, &password)
                    .map_err(|e| AgentError::Auth(e.to_string()))?;
                (Some(SaslFlow::Scram(Box::new(client))), None)
            }
            AuthMode::SaslExternal => (Some(SaslFlow::External), None),
        };

        Ok(Self {
            caps: CapNegotiator::new(config.auth.is_sasl()),
            sasl,
            sasl_started: false,
            sasl_outcome: None,
            nicknames: config.nicknames.clone(),
            nick_index: 0,
            username: config.username.clone(),
            realname: config.realname.clone(),
            server_pass,
            cap_end_sent: false,
            done: false,
        })
    }

    /// Registration finished (001 seen).
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The nickname we are currently trying to take.
    pub fn current_nick(&self) -> &str {
        self.nicknames
            .get(self.nick_index)
            .map(String::as_str)
            .unwrap_or("munin")
    }

    /// Whether SASL succeeded; `None` while the exchange is open.
    pub fn sasl_outcome(&self) -> Option<bool> {
        self.sasl_outcome
    }

    /// A SASL exchange has started and is not yet settled.
    pub fn sasl_in_flight(&self) -> bool {
        self.sasl_started && self.sasl_outcome.is_none()
    }

    /// The negotiated capability set (for session bookkeeping).
    pub fn caps(&self) -> &CapNegotiator {
        &self.caps
    }

    /// Opening messages for a fresh connection.
    pub fn start(&mut self) -> Vec<Message> {
        let mut out = vec![self.caps.begin()];
        if let Some(pass) = &self.server_pass {
            out.push(Message::from_parts("PASS", &[pass]));
        }
        out
    }

    /// Feed one inbound message; returns what to send in response.
    pub fn handle(&mut self, msg: &Message) -> Vec<Message> {
        match msg.command.as_str() {
            "CAP" => {
                let mut out = self.caps.handle_cap(&msg.params);
                out.extend(self.after_cap_progress());
                out
            }
            "AUTHENTICATE" => self.on_authenticate(msg),
            RPL_SASLSUCCESS => {
                info!("SASL authentication successful");
                self.sasl_outcome = Some(true);
                self.after_cap_progress()
            }
            code if SASL_FAILURES.contains(&code) => {
                warn!(numeric = code, "SASL authentication failed");
                self.sasl_outcome = Some(false);
                self.after_cap_progress()
            }
            "433" => self.on_nick_in_use(),
            "001" => {
                self.done = true;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// After any CAP or SASL progress: start SASL once the REQ round is
    /// answered, and send CAP END + NICK/USER once SASL is settled.
    fn after_cap_progress(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        if !self.caps.negotiated() || self.cap_end_sent || self.done {
            return out;
        }

        if let Some(flow) = &self.sasl {
            if !self.sasl_started {
                if self.caps.is_enabled("sasl") {
                    let mechanism = flow.mechanism();
                    if self.server_offers(mechanism) {
                        debug!(mechanism = mechanism.as_str(), "Starting SASL");
                        self.sasl_started = true;
                        out.push(Message::authenticate(mechanism.as_str()));
                        return out;
                    }
                    warn!(
                        mechanism = mechanism.as_str(),
                        "Server does not offer our SASL mechanism"
                    );
                }
                // SASL configured but unavailable: settle as failed.
                self.sasl_outcome = Some(false);
            } else if self.sasl_outcome.is_none() {
                // Exchange still open; CAP END waits.
                return out;
            }
        }

        self.cap_end_sent = true;
        out.push(Message::from_parts("CAP", &["END"]));
        out.push(Message::nick(self.current_nick()));
        out.push(Message::from_parts(
            "USER",
            &[&self.username, "0", "*", &self.realname],
        ));
        out
    }

    /// Whether the advertised `sasl=` list (if any) includes the mechanism.
    fn server_offers(&self, mechanism: SaslMechanism) -> bool {
        match self.caps.sasl_mechanisms() {
            Some(list) if !list.is_empty() => {
                list.iter().any(|m| m.eq_ignore_ascii_case(mechanism.as_str()))
            }
            // No advertised list: try anyway.
            _ => true,
        }
    }

    fn on_authenticate(&mut self, msg: &Message) -> Vec<Message> {
        let data = msg.params.first().map(String::as_str).unwrap_or("+");
        let Some(flow) = &mut self.sasl else {
            return Vec::new();
        };

        match flow {
            SaslFlow::Plain { authcid, password } => {
                if data != "+" {
                    return Vec::new();
                }
                let payload = sasl::plain_payload(authcid, authcid, password);
                sasl::chunk_payload(&payload)
                    .into_iter()
                    .map(|c| Message::authenticate(&c))
                    .collect()
            }
            SaslFlow::External => {
                if data != "+" {
                    return Vec::new();
                }
                vec![Message::authenticate("+")]
            }
            SaslFlow::Scram(client) => match client.state().clone() {
                ScramState::Initial => {
                    let first = client.client_first();
                    sasl::chunk_payload(&first)
                        .into_iter()
                        .map(|c| Message::authenticate(&c))
                        .collect()
                }
                ScramState::AwaitServerFirst => match client.handle_server_first(data) {
                    Ok(reply) => sasl::chunk_payload(&reply)
                        .into_iter()
                        .map(|c| Message::authenticate(&c))
                        .collect(),
                    Err(e) => {
                        warn!(error = %e, "SCRAM server-first rejected, aborting");
                        vec![Message::authenticate("*")]
                    }
                },
                ScramState::AwaitServerFinal => match client.handle_server_final(data) {
                    Ok(()) => vec![Message::authenticate("+")],
                    Err(e) => {
                        warn!(error = %e, "SCRAM server verification failed, aborting");
                        vec![Message::authenticate("*")]
                    }
                },
                ScramState::Complete | ScramState::Failed(_) => Vec::new(),
            },
        }
    }

    fn on_nick_in_use(&mut self) -> Vec<Message> {
        if self.done {
            return Vec::new();
        }
        if self.nick_index + 1 < self.nicknames.len() {
            self.nick_index += 1;
        } else {
            // All fallbacks taken: grow the last one.
            let extended = format!("{}_", self.current_nick());
            if self.nick_index < self.nicknames.len() {
                self.nicknames[self.nick_index] = extended;
            } else {
                self.nicknames.push(extended);
            }
        }
        debug!(nick = %self.current_nick(), "Nickname in use, trying fallback");
        vec![Message::nick(self.current_nick())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    fn server_config(auth: AuthMode) -> ServerConfig {
        ServerConfig {
            id: "net".into(),
            host: "irc.example.org".into(),
            nicknames: vec!["munin".into(), "munin_".into()],
            auth,
            ..ServerConfig::default()
        }
    }

    fn msg(line: &str) -> Message {
        Message::parse(line).unwrap()
    }

    fn texts(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.to_string()).collect()
    }

    #[test]
    fn cap_sasl_plain_happy_path() {
        let mut reg = Registrar::new(
            &server_config(AuthMode::SaslPlain),
            Some("pw".to_string()),
        )
        .unwrap();
        // Use the account name from the scenario.
        reg.nicknames = vec!["alice".into()];
        reg.sasl = Some(SaslFlow::Plain {
            authcid: "alice".into(),
            password: "pw".into(),
        });

        assert_eq!(texts(&reg.start()), vec!["CAP LS 302"]);

        // Multi-line LS with continuation marker.
        let out = reg.handle(&msg(
            ":server CAP * LS * :sasl=PLAIN server-time message-tags account-tag multi-prefix",
        ));
        assert!(out.is_empty());
        let out = reg.handle(&msg(":server CAP * LS :msgid"));
        assert_eq!(out.len(), 1);
        assert!(out[0].to_string().starts_with("CAP REQ :"));

        // ACK of everything requested starts SASL.
        let requested = out[0].params[1].clone();
        let out = reg.handle(&msg(&format!(":server CAP alice ACK :{}", requested)));
        assert_eq!(texts(&out), vec!["AUTHENTICATE PLAIN"]);

        // Server is ready for the payload.
        let out = reg.handle(&msg("AUTHENTICATE +"));
        let expected = BASE64.encode(b"alice\0alice\0pw");
        assert_eq!(texts(&out), vec![format!("AUTHENTICATE {}", expected)]);

        // 903 releases CAP END, then NICK/USER.
        let out = reg.handle(&msg(":server 903 alice :SASL successful"));
        let lines = texts(&out);
        assert_eq!(lines[0], "CAP END");
        assert_eq!(lines[1], "NICK alice");
        assert!(lines[2].starts_with("USER "));

        assert!(!reg.is_done());
        reg.handle(&msg(":server 001 alice :Welcome"));
        assert!(reg.is_done());
        assert_eq!(reg.sasl_outcome(), Some(true));
    }

    #[test]
    fn sasl_failure_still_ends_cap() {
        let mut reg = Registrar::new(
            &server_config(AuthMode::SaslPlain),
            Some("pw".to_string()),
        )
        .unwrap();
        reg.start();
        reg.handle(&msg(":server CAP * LS :sasl=PLAIN"));
        reg.handle(&msg(":server CAP * ACK :sasl"));
        let out = reg.handle(&msg(":server 904 munin :SASL failed"));
        assert!(texts(&out).contains(&"CAP END".to_string()));
        assert_eq!(reg.sasl_outcome(), Some(false));
    }

    #[test]
    fn no_sasl_ends_immediately_after_ack() {
        let mut reg = Registrar::new(&server_config(AuthMode::None), None).unwrap();
        assert_eq!(texts(&reg.start()), vec!["CAP LS 302"]);
        reg.handle(&msg(":server CAP * LS :server-time msgid"));
        let out = reg.handle(&msg(":server CAP * ACK :server-time msgid"));
        let lines = texts(&out);
        assert_eq!(lines[0], "CAP END");
        assert_eq!(lines[1], "NICK munin");
    }

    #[test]
    fn empty_offer_registers_without_caps() {
        let mut reg = Registrar::new(&server_config(AuthMode::None), None).unwrap();
        reg.start();
        let out = reg.handle(&msg(":server CAP * LS :draft/nothing-we-want"));
        assert_eq!(texts(&out)[0], "CAP END");
    }

    #[test]
    fn pass_mode_sends_pass_before_nick() {
        let mut reg = Registrar::new(
            &server_config(AuthMode::Pass),
            Some("serverpw".to_string()),
        )
        .unwrap();
        let lines = texts(&reg.start());
        assert_eq!(lines, vec!["CAP LS 302", "PASS serverpw"]);
    }

    #[test]
    fn sasl_mechanism_not_offered_fails_soft() {
        let mut reg = Registrar::new(
            &server_config(AuthMode::SaslScramSha256),
            Some("pw".to_string()),
        )
        .unwrap();
        reg.start();
        reg.handle(&msg(":server CAP * LS :sasl=PLAIN,EXTERNAL server-time"));
        let out = reg.handle(&msg(":server CAP * ACK :sasl server-time"));
        // SCRAM not offered: settle as failed and register anyway.
        assert!(texts(&out).contains(&"CAP END".to_string()));
        assert_eq!(reg.sasl_outcome(), Some(false));
    }

    #[test]
    fn scram_flow_round_trips() {
        let mut reg = Registrar::new(
            &server_config(AuthMode::SaslScramSha256),
            Some("pencil".to_string()),
        )
        .unwrap();
        reg.start();
        reg.handle(&msg(":server CAP * LS :sasl=SCRAM-SHA-256"));
        let out = reg.handle(&msg(":server CAP * ACK :sasl"));
        assert_eq!(texts(&out), vec!["AUTHENTICATE SCRAM-SHA-256"]);

        let out = reg.handle(&msg("AUTHENTICATE +"));
        assert_eq!(out.len(), 1);
        let first = &out[0].params[0];
        let decoded = BASE64.decode(first).unwrap();
        assert!(decoded.starts_with(b"n,,n="));
    }

    #[test]
    fn nick_fallbacks_then_underscore() {
        let mut reg = Registrar::new(&server_config(AuthMode::None), None).unwrap();
        assert_eq!(reg.current_nick(), "munin");

        let out = reg.on_nick_in_use();
        assert_eq!(texts(&out), vec!["NICK munin_"]);
        let out = reg.on_nick_in_use();
        assert_eq!(texts(&out), vec!["NICK munin__"]);
    }
}
