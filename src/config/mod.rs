//! Configuration loading and management.
//!
//! The agent's configuration is one JSON document. This module is split
//! into logical submodules:
//! - [`types`]: core config structs (Config, ServerConfig, logging, control)
//! - [`secret`]: the `EncryptedValue` secret-at-rest representation
//! - [`protection`]: channel protection thresholds and actions
//! - [`validation`]: startup validation pass

mod defaults;
mod protection;
mod secret;
mod types;
mod validation;

pub use protection::{
    BadWordRule, CloneConfig, FloodConfig, MassKickConfig, ProtectionAction, ProtectionConfig,
    ProtectionOverride,
};
pub use secret::{EncryptedValue, SecretAlgorithm};
pub use types::{
    AuthMode, AutoJoin, BotnetConfig, Config, ControlTlsConfig, EncryptionConfig, LogFormat,
    LoggingConfig, ReconnectConfig, RelayProxyConfig, ScriptsConfig, SeedUser, ServerConfig,
    TlsClientConfig,
};
pub use validation::validate;

/// Environment variable overriding the configuration path.
pub const CONFIG_ENV: &str = "AGENT_CONFIG";

/// Environment variable supplying the master password (discouraged).
pub const PASSWORD_ENV: &str = "AGENT_PASSWORD";

/// Default configuration path when neither CLI nor environment names one.
pub const DEFAULT_CONFIG_PATH: &str = "munin.json";
