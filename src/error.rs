//! Unified error handling for the Munin agent.
//!
//! One error hierarchy for the whole agent, with automatic conversions and
//! stable code strings for audit/metric labeling. Policy lives with the
//! callers: the connection supervisor retries transient kinds, structural
//! kinds surface to whoever issued the failing operation.

use thiserror::Error;

/// Errors that can occur anywhere in the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A malformed IRC line. Logged and dropped by the reader.
    #[error("codec error: {0}")]
    Codec(#[from] munin_proto::MessageParseError),

    /// Unexpected sequence or oversize frame; the connection is closed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// SASL or control-plane authentication failure.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// TLS configuration or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// Transient I/O error; retried per reconnect policy.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Encrypt/decrypt attempted while the vault is sealed.
    #[error("vault is locked")]
    Locked,

    /// Invalid configuration; the agent refuses to start.
    #[error("configuration error: {0}")]
    Config(String),

    /// Send queue over capacity; backpressure to the caller.
    #[error("rate limited")]
    RateLimited,

    /// Unknown server, channel, or user in a control command.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller lacks the required flags.
    #[error("forbidden: {0}")]
    Forbidden(String),
}

impl AgentError {
    /// Stable code string for audit entries and metric labels.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Codec(_) => "codec",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::Auth(_) => "auth",
            Self::Tls(_) => "tls",
            Self::Io(_) => "io",
            Self::Locked => "locked",
            Self::Config(_) => "config",
            Self::RateLimited => "rate_limited",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
        }
    }

    /// Whether the connection supervisor should retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Tls(_) | Self::RateLimited)
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Result type used throughout the agent.
pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(AgentError::Locked.error_code(), "locked");
        assert_eq!(AgentError::RateLimited.error_code(), "rate_limited");
        assert_eq!(
            AgentError::Auth("bad token".into()).error_code(),
            "auth"
        );
    }

    #[test]
    fn transience_classification() {
        assert!(AgentError::Io(std::io::Error::other("reset")).is_transient());
        assert!(AgentError::Tls("handshake".into()).is_transient());
        assert!(!AgentError::Config("bad".into()).is_transient());
        assert!(!AgentError::Locked.is_transient());
    }
}
