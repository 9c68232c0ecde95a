//! Core configuration type definitions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::defaults::*;
use super::protection::ProtectionConfig;
use super::secret::EncryptedValue;

/// Top-level agent configuration (one JSON document).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Control plane listen port. 0 disables the control server.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Require TLS on the control plane. Plain TCP only when explicitly off.
    #[serde(default = "default_true")]
    pub require_tls: bool,
    /// Control plane TLS certificate, required when `require_tls` is set.
    pub control_tls: Option<ControlTlsConfig>,
    /// Shared token for control HMAC challenge-response auth.
    pub control_auth_token: Option<EncryptedValue>,
    /// Control plane IP allow-list: `*`, exact addresses, or CIDR blocks.
    /// An empty list allows all peers.
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
    /// IRC networks to maintain.
    pub servers: Vec<ServerConfig>,
    /// User database seeds (handle -> user). The live database is kept in
    /// `users_file`; seeds only add handles the file does not know yet.
    pub users: HashMap<String, SeedUser>,
    /// Path of the persistent user database.
    #[serde(default = "default_users_file")]
    pub users_file: String,
    /// Logging output configuration.
    pub logging: LoggingConfig,
    /// Script engine boundary (engine itself is an external plug-in).
    pub scripts: ScriptsConfig,
    /// Relay companion ("botnet") settings.
    pub botnet: BotnetConfig,
    /// Channel protection thresholds and actions.
    pub channel_protection: ProtectionConfig,
    /// Secrets-at-rest state.
    pub encryption: EncryptionConfig,
    /// QUIT message used on graceful shutdown.
    #[serde(default = "default_quit_message")]
    pub quit_message: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_port: default_control_port(),
            require_tls: true,
            control_tls: None,
            control_auth_token: None,
            allowed_ips: Vec::new(),
            servers: Vec::new(),
            users: HashMap::new(),
            users_file: default_users_file(),
            logging: LoggingConfig::default(),
            scripts: ScriptsConfig::default(),
            botnet: BotnetConfig::default(),
            channel_protection: ProtectionConfig::default(),
            encryption: EncryptionConfig::default(),
            quit_message: default_quit_message(),
        }
    }
}

/// TLS material for the control listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlTlsConfig {
    /// Path to the certificate chain (PEM).
    pub cert_path: String,
    /// Path to the private key (PEM).
    pub key_path: String,
}

/// A single IRC network definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Stable identity used in logs, control commands, and state keys.
    pub id: String,
    /// Server hostname.
    pub host: String,
    /// Server port.
    #[serde(default = "default_irc_port")]
    pub port: u16,
    /// Whether this server is connected at startup.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// TLS settings for the IRC connection.
    pub tls: TlsClientConfig,
    /// Nickname plus fallbacks, tried in order.
    pub nicknames: Vec<String>,
    /// Ident/username.
    #[serde(default = "default_username")]
    pub username: String,
    /// Realname (gecos).
    #[serde(default = "default_realname")]
    pub realname: String,
    /// How to authenticate during registration.
    pub auth: AuthMode,
    /// Account name for SASL; defaults to the primary nickname.
    pub auth_username: Option<String>,
    /// Server or account password, depending on `auth`.
    pub password: Option<EncryptedValue>,
    /// Optional relay companion to tunnel this connection through.
    pub proxy: Option<RelayProxyConfig>,
    /// Channels joined after registration.
    pub auto_join: Vec<AutoJoin>,
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            host: String::new(),
            port: default_irc_port(),
            enabled: true,
            tls: TlsClientConfig::default(),
            nicknames: Vec::new(),
            username: default_username(),
            realname: default_realname(),
            auth: AuthMode::default(),
            auth_username: None,
            password: None,
            proxy: None,
            auto_join: Vec::new(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// TLS settings for an IRC server connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsClientConfig {
    /// Use TLS for this connection.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Skip certificate verification. Logged as a warning when set.
    pub accept_invalid_certificates: bool,
    /// Client certificate (PEM, cert + key) for mutual TLS / SASL EXTERNAL.
    pub client_cert_path: Option<String>,
}

impl Default for TlsClientConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            accept_invalid_certificates: false,
            client_cert_path: None,
        }
    }
}

/// Registration authentication mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMode {
    /// No authentication.
    #[default]
    #[serde(rename = "none")]
    None,
    /// Server PASS before registration.
    #[serde(rename = "pass")]
    Pass,
    /// SASL PLAIN.
    #[serde(rename = "sasl-plain")]
    SaslPlain,
    /// SASL SCRAM-SHA-256.
    #[serde(rename = "sasl-scram-sha-256")]
    SaslScramSha256,
    /// SASL EXTERNAL (TLS client certificate).
    #[serde(rename = "sasl-external")]
    SaslExternal,
}

impl AuthMode {
    /// Whether this mode runs a SASL exchange during CAP negotiation.
    pub fn is_sasl(self) -> bool {
        matches!(self, Self::SaslPlain | Self::SaslScramSha256 | Self::SaslExternal)
    }
}

/// Relay companion proxy for one server connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayProxyConfig {
    /// Relay host.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// Relay auth secret; falls back to the botnet secret when absent.
    pub secret: Option<EncryptedValue>,
}

/// An auto-join entry, optionally with a channel key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoJoin {
    /// Channel name.
    pub channel: String,
    /// Channel key (+k), if required.
    pub key: Option<String>,
}

/// Reconnect policy for one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfig {
    /// First retry delay in seconds; doubles each attempt.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    /// Upper bound on the delay in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Give up after this many attempts; 0 retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            max_attempts: 0,
        }
    }
}

/// A user database seed from the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeedUser {
    /// Global flags plus per-channel segments, e.g. `of|#ops:n`.
    pub flags: String,
    /// Hostmask globs identifying this user.
    pub hostmasks: Vec<String>,
    /// Free-form info line.
    pub info: String,
}

/// Logging output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// Directory for rolling daily log files.
    #[serde(default = "default_log_directory")]
    pub directory: String,
    /// Log level filter (trace/debug/info/warn/error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Daily files kept before pruning.
    #[serde(default = "default_retention_days")]
    pub retention_days: usize,
    /// Also log to stdout.
    #[serde(default = "default_true")]
    pub stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            level: default_log_level(),
            format: LogFormat::default(),
            retention_days: default_retention_days(),
            stdout: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// Line-delimited JSON.
    Json,
}

/// Script engine boundary configuration.
///
/// The engine itself is an external plug-in; the agent only records where
/// scripts live and which ones to hand over at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptsConfig {
    /// Whether the script boundary is initialised at startup.
    pub enabled: bool,
    /// Script directory.
    #[serde(default = "default_scripts_directory")]
    pub directory: String,
    /// Scripts loaded at startup.
    pub autoload: Vec<String>,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: default_scripts_directory(),
            autoload: Vec::new(),
        }
    }
}

/// Relay companion ("botnet") configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BotnetConfig {
    /// Whether the relay companion is available.
    pub enabled: bool,
    /// Relay host.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// Shared relay auth secret.
    pub secret: Option<EncryptedValue>,
}

/// Secrets-at-rest state for the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncryptionConfig {
    /// Whether secret fields in this file are sealed.
    pub is_encrypted: bool,
    /// Base64 PBKDF2 salt.
    pub salt: Option<String>,
    /// Base64 sealed verification token, checked before touching user data.
    pub verification_token: Option<String>,
    /// When encryption was enabled (RFC 3339).
    pub created_at: Option<String>,
    /// Layout version.
    #[serde(default = "default_encryption_version")]
    pub version: u32,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            is_encrypted: false,
            salt: None,
            verification_token: None,
            created_at: None,
            version: default_encryption_version(),
        }
    }
}

impl Config {
    /// Load and parse a configuration file.
    pub fn load(path: &str) -> crate::error::AgentResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AgentError::Config(format!("cannot read {}: {}", path, e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            crate::error::AgentError::Config(format!("cannot parse {}: {}", path, e))
        })
    }

    /// Serialize and atomically replace the configuration file.
    pub fn save(&self, path: &str) -> crate::error::AgentResult<()> {
        let data = serde_json::to_vec_pretty(self)?;
        crate::util::atomic_write(std::path::Path::new(path), &data)
    }

    /// Every secret field in the file, read-only.
    pub fn secret_fields(&self) -> Vec<&EncryptedValue> {
        let mut fields = Vec::new();
        if let Some(token) = self.control_auth_token.as_ref() {
            fields.push(token);
        }
        if let Some(secret) = self.botnet.secret.as_ref() {
            fields.push(secret);
        }
        for server in &self.servers {
            if let Some(password) = server.password.as_ref() {
                fields.push(password);
            }
            if let Some(secret) = server.proxy.as_ref().and_then(|p| p.secret.as_ref()) {
                fields.push(secret);
            }
        }
        fields
    }

    /// Every secret field in the file, for encrypt/decrypt migration.
    pub fn secret_fields_mut(&mut self) -> Vec<&mut EncryptedValue> {
        let mut fields = Vec::new();
        if let Some(token) = self.control_auth_token.as_mut() {
            fields.push(token);
        }
        if let Some(secret) = self.botnet.secret.as_mut() {
            fields.push(secret);
        }
        for server in &mut self.servers {
            if let Some(password) = server.password.as_mut() {
                fields.push(password);
            }
            if let Some(proxy) = server.proxy.as_mut() {
                if let Some(secret) = proxy.secret.as_mut() {
                    fields.push(secret);
                }
            }
        }
        fields
    }
}
