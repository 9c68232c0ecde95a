//! Message source prefixes.

use std::fmt;

/// The source of an IRC message: a server name or a user hostmask.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Prefix {
    /// A server origin (contains a dot, no `!`/`@`).
    Server(String),
    /// A user origin, `nick[!user][@host]`.
    User {
        /// Nickname.
        nick: String,
        /// Ident/username, if present.
        user: Option<String>,
        /// Hostname, if present.
        host: Option<String>,
    },
}

impl Prefix {
    /// Parse a prefix string (without the leading `:`).
    ///
    /// A prefix with no `!` or `@` but containing a dot is taken as a
    /// server name; anything else is a user origin.
    pub fn parse(s: &str) -> Self {
        if !s.contains('!') && !s.contains('@') {
            if s.contains('.') {
                return Self::Server(s.to_string());
            }
            return Self::User {
                nick: s.to_string(),
                user: None,
                host: None,
            };
        }

        let (rest, host) = match s.split_once('@') {
            Some((r, h)) => (r, Some(h.to_string())),
            None => (s, None),
        };
        let (nick, user) = match rest.split_once('!') {
            Some((n, u)) => (n.to_string(), Some(u.to_string())),
            None => (rest.to_string(), None),
        };

        Self::User { nick, user, host }
    }

    /// The nickname, when this is a user origin.
    pub fn nick(&self) -> Option<&str> {
        match self {
            Self::Server(_) => None,
            Self::User { nick, .. } => Some(nick),
        }
    }

    /// The hostname, when this is a user origin with a host.
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Server(_) => None,
            Self::User { host, .. } => host.as_deref(),
        }
    }

    /// The full `nick!user@host` form, with `*` for missing pieces.
    pub fn hostmask(&self) -> String {
        match self {
            Self::Server(name) => name.clone(),
            Self::User { nick, user, host } => format!(
                "{}!{}@{}",
                nick,
                user.as_deref().unwrap_or("*"),
                host.as_deref().unwrap_or("*")
            ),
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(name) => f.write_str(name),
            Self::User { nick, user, host } => {
                f.write_str(nick)?;
                if let Some(user) = user {
                    write!(f, "!{}", user)?;
                }
                if let Some(host) = host {
                    write!(f, "@{}", host)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_user_prefix() {
        let p = Prefix::parse("nick!user@host.example");
        assert_eq!(p.nick(), Some("nick"));
        assert_eq!(p.host(), Some("host.example"));
        assert_eq!(p.to_string(), "nick!user@host.example");
    }

    #[test]
    fn parses_server_prefix() {
        let p = Prefix::parse("irc.example.org");
        assert!(matches!(p, Prefix::Server(_)));
        assert_eq!(p.nick(), None);
    }

    #[test]
    fn bare_nick_is_user() {
        let p = Prefix::parse("alice");
        assert_eq!(p.nick(), Some("alice"));
        assert_eq!(p.hostmask(), "alice!*@*");
    }

    #[test]
    fn nick_with_host_only() {
        let p = Prefix::parse("alice@host");
        assert_eq!(p.nick(), Some("alice"));
        assert_eq!(p.host(), Some("host"));
        assert_eq!(p.to_string(), "alice@host");
    }
}
