//! IRC message types and the line codec.
//!
//! A [`Message`] is the parsed form of one IRC line:
//! `[@tags] [:prefix] <command> [params...] [:trailing]`. Parsing is built
//! on nom combinators; serialization goes through [`std::fmt::Display`] and
//! the length-aware [`Message::to_line`].

use std::fmt::{self, Write as FmtWrite};
use std::str::FromStr;

use nom::{
    bytes::complete::take_while1,
    character::complete::{char as nom_char, space0},
    combinator::opt,
    error::ErrorKind,
    sequence::preceded,
    IResult,
};
use smallvec::SmallVec;

use crate::error::MessageParseError;
use crate::prefix::Prefix;

/// Maximum bytes of one serialized line, excluding the trailing CRLF.
pub const MAX_LINE_LEN: usize = 510;

/// A single IRCv3 message tag.
///
/// Unknown tags are preserved verbatim; values are stored unescaped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    /// Tag name, including any vendor prefix or `+` client-tag marker.
    pub key: String,
    /// Unescaped tag value. `None` for a bare tag, `Some("")` for `key=`.
    pub value: Option<String>,
}

impl Tag {
    /// Create a tag from a key and optional value.
    pub fn new(key: impl Into<String>, value: Option<&str>) -> Self {
        Self {
            key: key.into(),
            value: value.map(str::to_string),
        }
    }
}

/// A parsed IRC message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 message tags, in wire order.
    pub tags: Vec<Tag>,
    /// Message source, if present.
    pub prefix: Option<Prefix>,
    /// Command verb (uppercased) or three-digit numeric.
    pub command: String,
    /// Parameters, with any trailing parameter last.
    pub params: Vec<String>,
}

/// The serialized form of a message, with an over-length marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedLine {
    /// The line text, at most [`MAX_LINE_LEN`] bytes, without CRLF.
    pub text: String,
    /// True when the content had to be cut at a UTF-8 boundary.
    pub truncated: bool,
}

impl Message {
    /// Build a message from a command and parameters.
    pub fn new<S: Into<String>>(command: S, params: Vec<String>) -> Self {
        Self {
            tags: Vec::new(),
            prefix: None,
            command: command.into(),
            params,
        }
    }

    /// Convenience constructor taking string slices.
    pub fn from_parts(command: &str, params: &[&str]) -> Self {
        Self::new(command, params.iter().map(|p| p.to_string()).collect())
    }

    /// `PRIVMSG <target> :<text>`
    pub fn privmsg(target: &str, text: &str) -> Self {
        Self::from_parts("PRIVMSG", &[target, text])
    }

    /// `NOTICE <target> :<text>`
    pub fn notice(target: &str, text: &str) -> Self {
        Self::from_parts("NOTICE", &[target, text])
    }

    /// `JOIN <channel> [key]`
    pub fn join(channel: &str, key: Option<&str>) -> Self {
        match key {
            Some(k) => Self::from_parts("JOIN", &[channel, k]),
            None => Self::from_parts("JOIN", &[channel]),
        }
    }

    /// `PART <channel> [:reason]`
    pub fn part(channel: &str, reason: Option<&str>) -> Self {
        match reason {
            Some(r) => Self::from_parts("PART", &[channel, r]),
            None => Self::from_parts("PART", &[channel]),
        }
    }

    /// `KICK <channel> <nick> :<reason>`
    pub fn kick(channel: &str, nick: &str, reason: &str) -> Self {
        Self::from_parts("KICK", &[channel, nick, reason])
    }

    /// `MODE <target> <modestring> [args...]`
    pub fn mode(target: &str, modestring: &str, args: &[&str]) -> Self {
        let mut params = vec![target, modestring];
        params.extend_from_slice(args);
        Self::from_parts("MODE", &params)
    }

    /// `PONG :<token>`
    pub fn pong(token: &str) -> Self {
        Self::from_parts("PONG", &[token])
    }

    /// `PING :<token>`
    pub fn ping(token: &str) -> Self {
        Self::from_parts("PING", &[token])
    }

    /// `QUIT :<reason>`
    pub fn quit(reason: &str) -> Self {
        Self::from_parts("QUIT", &[reason])
    }

    /// `NICK <nick>`
    pub fn nick(nick: &str) -> Self {
        Self::from_parts("NICK", &[nick])
    }

    /// `AUTHENTICATE <data>`
    pub fn authenticate(data: &str) -> Self {
        Self::from_parts("AUTHENTICATE", &[data])
    }

    /// Attach a tag, replacing any existing tag with the same key.
    #[must_use]
    pub fn with_tag(mut self, key: &str, value: Option<&str>) -> Self {
        self.tags.retain(|t| t.key != key);
        self.tags.push(Tag::new(key, value));
        self
    }

    /// Attach a prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: Prefix) -> Self {
        self.prefix = Some(prefix);
        self
    }

    /// Look up a tag value by key. Bare tags yield `Some("")`.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags.iter().find(|t| t.key == key).map(|t| match &t.value {
            Some(v) => v.as_str(),
            None => "",
        })
    }

    /// The nickname of the message source, if the prefix carries one.
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix.as_ref().and_then(Prefix::nick)
    }

    /// True when the command is a three-digit numeric reply.
    pub fn is_numeric(&self) -> bool {
        self.command.len() == 3 && self.command.chars().all(|c| c.is_ascii_digit())
    }

    /// The numeric value of a numeric reply.
    pub fn numeric(&self) -> Option<u16> {
        if self.is_numeric() {
            self.command.parse().ok()
        } else {
            None
        }
    }

    /// Parse one line (CRLF stripped or not) into a message.
    pub fn parse(line: &str) -> Result<Self, MessageParseError> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Err(MessageParseError::EmptyMessage);
        }

        let (rest, raw) = parse_message(trimmed).map_err(|_| MessageParseError::InvalidCommand)?;

        let tags = match raw.tags {
            Some(raw_tags) => parse_tags(raw_tags)?,
            None => Vec::new(),
        };

        let prefix = raw.prefix.map(Prefix::parse);
        let params = split_params(rest);

        Ok(Self {
            tags,
            prefix,
            command: raw.command.to_ascii_uppercase(),
            params: params.into_iter().map(str::to_string).collect(),
        })
    }

    /// Serialize to a wire line, truncating over-length content at the
    /// UTF-8 boundary nearest [`MAX_LINE_LEN`] bytes.
    pub fn to_line(&self) -> EncodedLine {
        let full = self.to_string();
        if full.len() <= MAX_LINE_LEN {
            return EncodedLine {
                text: full,
                truncated: false,
            };
        }

        let mut cut = MAX_LINE_LEN;
        while !full.is_char_boundary(cut) {
            cut -= 1;
        }
        EncodedLine {
            text: full[..cut].to_string(),
            truncated: true,
        }
    }
}

impl FromStr for Message {
    type Err = MessageParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            f.write_char('@')?;
            for (i, tag) in self.tags.iter().enumerate() {
                if i > 0 {
                    f.write_char(';')?;
                }
                f.write_str(&tag.key)?;
                if let Some(value) = &tag.value {
                    f.write_char('=')?;
                    escape_tag_value(f, value)?;
                }
            }
            f.write_char(' ')?;
        }

        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }

        f.write_str(&self.command)?;

        let count = self.params.len();
        for (i, param) in self.params.iter().enumerate() {
            let last = i + 1 == count;
            if last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Wire-level parsing
// ============================================================================

/// Intermediate parse result holding borrowed slices.
struct RawMessage<'a> {
    tags: Option<&'a str>,
    prefix: Option<&'a str>,
    command: &'a str,
}

fn take_tags(input: &str) -> IResult<&str, &str> {
    preceded(nom_char('@'), take_while1(|c| c != ' '))(input)
}

fn take_prefix(input: &str) -> IResult<&str, &str> {
    preceded(nom_char(':'), take_while1(|c| c != ' '))(input)
}

/// RFC 2812: command = 1*letter / 3digit.
fn take_command(input: &str) -> IResult<&str, &str> {
    let (rest, cmd) = take_while1(|c: char| c.is_ascii_alphanumeric())(input)?;

    let is_all_letters = cmd.chars().all(|c| c.is_ascii_alphabetic());
    let is_three_digits = cmd.len() == 3 && cmd.chars().all(|c| c.is_ascii_digit());

    if is_all_letters || is_three_digits {
        Ok((rest, cmd))
    } else {
        Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::AlphaNumeric,
        )))
    }
}

fn parse_message(input: &str) -> Result<(&str, RawMessage<'_>), nom::Err<nom::error::Error<&str>>> {
    let (input, tags) = opt(take_tags)(input)?;
    let (input, _) = space0(input)?;
    let (input, prefix) = opt(take_prefix)(input)?;
    let (input, _) = space0(input)?;
    let (rest, command) = take_command(input)?;

    Ok((
        rest,
        RawMessage {
            tags,
            prefix,
            command,
        },
    ))
}

/// Split the remainder after the command into parameters.
///
/// At most 14 middle parameters; the 15th parameter, or anything after a
/// `:` marker, is the trailing parameter and may contain spaces.
fn split_params(mut rest: &str) -> SmallVec<[&str; 15]> {
    let mut params: SmallVec<[&str; 15]> = SmallVec::new();

    loop {
        // Every parameter is introduced by at least one space.
        let Some(stripped) = rest.strip_prefix(' ') else {
            break;
        };
        rest = stripped;
        while let Some(stripped) = rest.strip_prefix(' ') {
            rest = stripped;
        }
        if rest.is_empty() {
            break;
        }

        if let Some(trailing) = rest.strip_prefix(':') {
            params.push(trailing);
            break;
        }

        if params.len() == 14 {
            params.push(rest);
            break;
        }

        let end = rest.find(' ').unwrap_or(rest.len());
        params.push(&rest[..end]);
        rest = &rest[end..];
    }

    params
}

fn parse_tags(raw: &str) -> Result<Vec<Tag>, MessageParseError> {
    let mut tags = Vec::new();
    for item in raw.split(';') {
        if item.is_empty() {
            return Err(MessageParseError::InvalidTags(raw.to_string()));
        }
        match item.split_once('=') {
            Some((key, value)) => tags.push(Tag {
                key: key.to_string(),
                value: Some(unescape_tag_value(value)),
            }),
            None => tags.push(Tag {
                key: item.to_string(),
                value: None,
            }),
        }
    }
    Ok(tags)
}

// ============================================================================
// IRCv3 tag value escaping
// ============================================================================

/// Escape a tag value per the IRCv3 message-tags escape table.
pub fn escape_tag_value(f: &mut dyn FmtWrite, value: &str) -> fmt::Result {
    for c in value.chars() {
        match c {
            ';' => f.write_str("\\:")?,
            ' ' => f.write_str("\\s")?,
            '\\' => f.write_str("\\\\")?,
            '\r' => f.write_str("\\r")?,
            '\n' => f.write_str("\\n")?,
            c => f.write_char(c)?,
        }
    }
    Ok(())
}

/// Unescape a tag value from wire format.
///
/// Unknown escape sequences drop the backslash; a trailing lone backslash
/// is dropped, both per the IRCv3 spec.
pub fn unescape_tag_value(value: &str) -> String {
    let mut unescaped = String::with_capacity(value.len());
    let mut iter = value.chars();
    while let Some(c) = iter.next() {
        let out = if c == '\\' {
            match iter.next() {
                Some(':') => ';',
                Some('s') => ' ',
                Some('\\') => '\\',
                Some('r') => '\r',
                Some('n') => '\n',
                Some(other) => other,
                None => break,
            }
        } else {
            c
        };
        unescaped.push(out);
    }
    unescaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_command() {
        let msg = Message::parse("PING").unwrap();
        assert_eq!(msg.command, "PING");
        assert!(msg.params.is_empty());
        assert!(msg.tags.is_empty());
        assert!(msg.prefix.is_none());
    }

    #[test]
    fn parses_full_message() {
        let msg =
            Message::parse("@time=2023-01-01 :nick!user@host PRIVMSG #chan :hello world").unwrap();
        assert_eq!(msg.tag_value("time"), Some("2023-01-01"));
        assert_eq!(msg.source_nick(), Some("nick"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan", "hello world"]);
    }

    #[test]
    fn parses_numeric() {
        let msg = Message::parse(":server 005 nick CHANTYPES=# :are supported").unwrap();
        assert_eq!(msg.numeric(), Some(5));
        assert_eq!(msg.params.len(), 3);
    }

    #[test]
    fn rejects_two_digit_command() {
        assert!(Message::parse(":server 05 nick").is_err());
        assert!(Message::parse("").is_err());
    }

    #[test]
    fn command_is_uppercased() {
        let msg = Message::parse("privmsg #chan :hi").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
    }

    #[test]
    fn trailing_may_be_empty() {
        let msg = Message::parse("TOPIC #chan :").unwrap();
        assert_eq!(msg.params, vec!["#chan", ""]);
        // An empty trailing survives the round trip.
        let encoded = msg.to_string();
        assert_eq!(Message::parse(&encoded).unwrap(), msg);
    }

    #[test]
    fn collapses_repeated_spaces() {
        let msg = Message::parse("PRIVMSG   #chan  :text").unwrap();
        assert_eq!(msg.params, vec!["#chan", "text"]);
    }

    #[test]
    fn fifteenth_param_is_trailing() {
        let middles = (1..=14).map(|i| format!("p{}", i)).collect::<Vec<_>>().join(" ");
        let line = format!("FOO {} rest of the line", middles);
        let msg = Message::parse(&line).unwrap();
        assert_eq!(msg.params.len(), 15);
        assert_eq!(msg.params[14], "rest of the line");
    }

    #[test]
    fn bare_and_empty_tags_differ() {
        let msg = Message::parse("@a;b= PING").unwrap();
        assert_eq!(msg.tags[0].value, None);
        assert_eq!(msg.tags[1].value, Some(String::new()));
        let encoded = msg.to_string();
        assert_eq!(Message::parse(&encoded).unwrap(), msg);
    }

    #[test]
    fn tag_escapes_round_trip() {
        let msg = Message::privmsg("#c", "x").with_tag("v", Some("a;b c\\d\re\nf"));
        let encoded = msg.to_string();
        assert!(encoded.starts_with("@v=a\\:b\\sc\\\\d\\re\\nf "));
        assert_eq!(Message::parse(&encoded).unwrap(), msg);
    }

    #[test]
    fn unknown_escape_drops_backslash() {
        assert_eq!(unescape_tag_value("a\\xb"), "axb");
        assert_eq!(unescape_tag_value("test\\"), "test");
    }

    #[test]
    fn truncates_at_utf8_boundary() {
        // A payload of multi-byte characters that pushes the line over 510
        // bytes must be cut without splitting a character.
        let text = "å".repeat(400);
        let line = Message::privmsg("#chan", &text).to_line();
        assert!(line.truncated);
        assert!(line.text.len() <= MAX_LINE_LEN);
        assert!(line.text.is_char_boundary(line.text.len()));
    }

    #[test]
    fn short_line_not_truncated() {
        let line = Message::privmsg("#chan", "hi").to_line();
        assert!(!line.truncated);
        assert_eq!(line.text, "PRIVMSG #chan hi");
    }

    #[test]
    fn trailing_with_spaces_gets_colon() {
        let msg = Message::privmsg("#chan", "hello world");
        assert_eq!(msg.to_string(), "PRIVMSG #chan :hello world");
    }

    #[test]
    fn leading_colon_param_round_trips() {
        let msg = Message::privmsg("#chan", ":)");
        assert_eq!(msg.to_string(), "PRIVMSG #chan ::)");
        assert_eq!(Message::parse(&msg.to_string()).unwrap(), msg);
    }
}
