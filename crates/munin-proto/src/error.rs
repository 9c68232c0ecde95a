//! Error types for the protocol engine.

use thiserror::Error;

/// Errors encountered when parsing IRC messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MessageParseError {
    /// Message was empty.
    #[error("empty message")]
    EmptyMessage,

    /// Command was missing, or not a verb / three-digit numeric.
    #[error("invalid command")]
    InvalidCommand,

    /// Tags section was present but malformed.
    #[error("invalid tags: {0}")]
    InvalidTags(String),

    /// Message prefix was malformed.
    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),
}
