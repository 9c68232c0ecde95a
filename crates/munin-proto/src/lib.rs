//! # munin-proto
//!
//! The IRC protocol engine underneath the Munin agent.
//!
//! This crate is deliberately transport-free: it parses and serializes IRC
//! lines (RFC 1459/2812 plus IRCv3 message tags), tracks server-declared
//! capabilities and ISUPPORT features, and drives the SASL authentication
//! state machines. Networking, session state, and policy live in the agent.
//!
//! ## Parsing and serializing
//!
//! ```rust
//! use munin_proto::Message;
//!
//! let raw = "@time=2023-01-01T12:00:00Z :nick!user@host PRIVMSG #channel :Hello!";
//! let msg: Message = raw.parse().expect("valid IRC message");
//!
//! assert_eq!(msg.command, "PRIVMSG");
//! assert_eq!(msg.tag_value("time"), Some("2023-01-01T12:00:00Z"));
//! assert_eq!(msg.source_nick(), Some("nick"));
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod caps;
pub mod casemap;
pub mod error;
pub mod isupport;
pub mod message;
pub mod mode;
pub mod prefix;
pub mod sasl;

pub use caps::{CapNegotiator, CapState, WANTED_CAPS};
pub use casemap::CaseMapping;
pub use error::MessageParseError;
pub use isupport::{Isupport, ModeClass};
pub use message::{EncodedLine, Message, Tag, MAX_LINE_LEN};
pub use mode::{parse_mode_changes, ModeChange};
pub use prefix::Prefix;
