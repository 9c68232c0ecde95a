//! The agent host: startup ordering, unlock gate, connection supervision,
//! and graceful shutdown.
//!
//! Startup: load configuration -> unlock the vault when encrypted ->
//! user database -> control server -> connect enabled servers in parallel
//! -> protection sweeper -> script boundary. Shutdown runs the reverse:
//! stop accepting control sessions, QUIT every IRC link, drain with a
//! grace period, close control sessions, zero key material, flush logs.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::binds::BindRegistry;
use crate::client::{supervisor, ConnState, ConnectionHandle, Event};
use crate::config::{Config, ServerConfig, PASSWORD_ENV};
use crate::control::{ControlDeps, ControlServer};
use crate::crypto::Vault;
use crate::error::{AgentError, AgentResult};
use crate::protect::{self, ProtectionEngine};
use crate::userdb::UserDb;

/// Marker file telling the process supervisor to start us again.
pub const RESTART_MARKER: &str = ".munin-restart";

/// Wait for connections to finish their QUIT/drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(6);

/// Commands that need the agent host itself.
#[derive(Debug)]
pub enum AgentCommand {
    /// (Re)connect a configured server by id.
    ConnectServer(String),
    /// Reload the configuration file.
    ReloadConfig,
    /// Shut down and leave a restart marker.
    Restart,
}

/// How the agent run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exit {
    /// Plain shutdown.
    Shutdown,
    /// Shutdown with a restart marker written.
    Restart,
}

/// The agent host.
pub struct Agent {
    config: Config,
    config_path: String,
    vault: Arc<Vault>,
    userdb: Arc<UserDb>,
    connections: Arc<DashMap<String, ConnectionHandle>>,
    protection: Arc<ProtectionEngine>,
    binds: Arc<BindRegistry>,
    events: broadcast::Sender<Event>,
    shutdown: broadcast::Sender<()>,
}

impl Agent {
    /// Run the agent to completion.
    pub async fn run(config: Config, config_path: String) -> AgentResult<Exit> {
        // Unlock gate: with encryption enabled nothing else starts until
        // the master password checks out.
        let vault = Arc::new(Vault::new());
        if config.encryption.is_encrypted {
            unlock_vault(&vault, &config).await?;
            info!("Vault unlocked");
        }

        let userdb = Arc::new(UserDb::load(&config.users_file)?);
        userdb.seed(&config.users);
        if userdb.is_empty() {
            warn!("User database is empty; nobody is exempt and no flags can match");
        }

        let protection = Arc::new(ProtectionEngine::new(
            config.channel_protection.clone(),
            userdb.clone(),
        )?);
        let binds = Arc::new(BindRegistry::new());
        let connections = Arc::new(DashMap::new());
        let (events_tx, _) = broadcast::channel(1024);
        let (shutdown_tx, _) = broadcast::channel(8);

        let agent = Self {
            config,
            config_path,
            vault,
            userdb,
            connections,
            protection,
            binds,
            events: events_tx,
            shutdown: shutdown_tx,
        };

        agent.run_inner().await
    }

    async fn run_inner(self) -> AgentResult<Exit> {
        let (agent_tx, mut agent_rx) = mpsc::channel::<AgentCommand>(32);

        // Control server, before any IRC connection exists.
        if self.config.control_port != 0 {
            let token = self
                .config
                .control_auth_token
                .as_ref()
                .ok_or_else(|| AgentError::Config("controlAuthToken missing".to_string()))?
                .reveal(&self.vault)?;

            let deps = Arc::new(ControlDeps {
                connections: self.connections.clone(),
                userdb: self.userdb.clone(),
                binds: self.binds.clone(),
                vault: self.vault.clone(),
                protection: self.protection.clone(),
                events: self.events.clone(),
                agent_tx: agent_tx.clone(),
                shutdown: self.shutdown.clone(),
                started_at: Utc::now(),
                log_directory: self.config.logging.directory.clone(),
                auth_token: token,
            });
            let control = ControlServer::new(&self.config, deps)?;
            tokio::spawn(async move {
                if let Err(e) = control.run().await {
                    error!(error = %e, "Control server failed");
                }
            });
        } else {
            info!("Control server disabled (controlPort = 0)");
        }

        // Connect enabled servers in parallel.
        for server in self.config.servers.iter().filter(|s| s.enabled) {
            if let Err(e) = self.spawn_connection(server) {
                error!(server = %server.id, error = %e, "Cannot start connection");
            }
        }

        // Protection sweep and log retention.
        protect::spawn_sweeper(self.protection.clone(), self.shutdown.clone());
        crate::logging::spawn_log_pruner(
            self.config.logging.directory.clone(),
            self.config.logging.retention_days,
            self.shutdown.clone(),
        );

        // Script boundary: the engine is an external plug-in that attaches
        // through the bind registry.
        if self.config.scripts.enabled {
            info!(
                directory = %self.config.scripts.directory,
                autoload = self.config.scripts.autoload.len(),
                "Script boundary ready; waiting for the engine plug-in"
            );
        }

        info!(
            servers = self.connections.len(),
            users = self.userdb.len(),
            "Munin agent started"
        );

        // Signal handling.
        {
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
                    return;
                };
                let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
                    return;
                };
                tokio::select! {
                    _ = sigint.recv() => info!("Received SIGINT - initiating graceful shutdown"),
                    _ = sigterm.recv() => info!("Received SIGTERM - initiating graceful shutdown"),
                }
                let _ = shutdown.send(());
            });
        }

        // Host command loop until shutdown.
        let mut exit = Exit::Shutdown;
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                command = agent_rx.recv() => match command {
                    Some(AgentCommand::ConnectServer(id)) => self.connect_by_id(&id),
                    Some(AgentCommand::ReloadConfig) => self.reload_config(),
                    Some(AgentCommand::Restart) => {
                        exit = Exit::Restart;
                        let _ = self.shutdown.send(());
                    }
                    None => break,
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        self.shutdown_sequence().await;

        if exit == Exit::Restart {
            if let Err(e) = std::fs::write(RESTART_MARKER, b"restart\n") {
                warn!(error = %e, "Could not write restart marker");
            }
        }
        Ok(exit)
    }

    fn spawn_connection(&self, server: &ServerConfig) -> AgentResult<()> {
        let password = server
            .password
            .as_ref()
            .map(|p| p.reveal(&self.vault))
            .transpose()?;
        let relay_secret = self.relay_secret_for(server)?;

        let handle = supervisor::spawn(supervisor::ConnectionParams {
            config: server.clone(),
            password,
            relay_secret,
            protection: self.protection.clone(),
            binds: self.binds.clone(),
            userdb: self.userdb.clone(),
            quit_message: self.config.quit_message.clone(),
            shutdown: self.shutdown.clone(),
        });

        // Forward this connection's events into the aggregated stream.
        {
            let mut rx = handle.events.subscribe();
            let aggregate = self.events.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let _ = aggregate.send(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        info!(server = %server.id, host = %server.host, "Connection supervisor started");
        self.connections.insert(server.id.clone(), handle);
        Ok(())
    }

    /// Relay secret for a proxied server: per-proxy, else the botnet one.
    fn relay_secret_for(&self, server: &ServerConfig) -> AgentResult<Option<String>> {
        let Some(proxy) = &server.proxy else {
            return Ok(None);
        };
        let secret = proxy
            .secret
            .as_ref()
            .or(self.config.botnet.secret.as_ref())
            .ok_or_else(|| {
                AgentError::Config(format!(
                    "server {} uses a relay but no secret is configured",
                    server.id
                ))
            })?;
        Ok(Some(secret.reveal(&self.vault)?))
    }

    fn connect_by_id(&self, id: &str) {
        if let Some(existing) = self.connections.get(id) {
            let state = *existing.value().state.read();
            if state != ConnState::Idle {
                info!(server = %id, state = state.as_str(), "Connect request ignored; already supervised");
                return;
            }
            drop(existing);
            self.connections.remove(id);
        }

        match self.config.servers.iter().find(|s| s.id == id) {
            Some(server) => {
                if let Err(e) = self.spawn_connection(server) {
                    error!(server = %id, error = %e, "Connect command failed");
                }
            }
            None => warn!(server = %id, "Connect command for unknown server"),
        }
    }

    /// Reload what can change at runtime; structural changes need a restart.
    fn reload_config(&self) {
        match Config::load(&self.config_path) {
            Ok(new_config) => {
                if let Err(errors) = crate::config::validate(&new_config) {
                    for err in &errors {
                        error!(error = %err, "Reloaded configuration is invalid");
                    }
                    return;
                }
                self.userdb.seed(&new_config.users);
                info!(
                    audit = true,
                    "Configuration reloaded; server and protection changes apply after restart"
                );
            }
            Err(e) => error!(error = %e, "Configuration reload failed"),
        }
    }

    async fn shutdown_sequence(&self) {
        info!("Shutting down");
        // The broadcast already told the control server to stop accepting
        // and every supervisor to QUIT and drain. Wait for the links to
        // settle within the grace window.
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        loop {
            let live = self
                .connections
                .iter()
                .filter(|entry| *entry.value().state.read() != ConnState::Idle)
                .count();
            if live == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        if let Err(e) = self.userdb.save() {
            warn!(error = %e, "User database save on shutdown failed");
        }

        // Zero key material last.
        self.vault.lock();
        info!("Shutdown complete");
    }
}

/// Resolve the master password and unlock the vault against the stored
/// verification token.
async fn unlock_vault(vault: &Vault, config: &Config) -> AgentResult<()> {
    let encryption = &config.encryption;
    let salt = encryption
        .salt
        .as_ref()
        .and_then(|s| BASE64.decode(s).ok())
        .ok_or_else(|| AgentError::Config("encryption.salt missing or invalid".to_string()))?;
    let token = encryption
        .verification_token
        .as_ref()
        .and_then(|t| BASE64.decode(t).ok())
        .ok_or_else(|| {
            AgentError::Config("encryption.verificationToken missing or invalid".to_string())
        })?;

    let password = match std::env::var(PASSWORD_ENV) {
        Ok(password) => {
            warn!(
                "Master password taken from {} (prefer the interactive prompt)",
                PASSWORD_ENV
            );
            password
        }
        Err(_) => crate::prompt_password("Master password: ")?,
    };

    vault.unlock(&password, &salt, &token).await
}

/// Re-encode every secret field of a configuration between plaintext and
/// sealed form. Used by the `encrypt`/`decrypt` CLI commands.
pub fn convert_secrets(config: &mut Config, vault: &Vault, encrypt: bool) -> AgentResult<()> {
    for field in config.secret_fields_mut() {
        *field = field.convert(vault, encrypt)?;
    }
    Ok(())
}

/// Seal a fresh verification token set into the encryption section.
pub async fn enable_encryption(config: &mut Config, vault: &Vault, password: &str) -> AgentResult<()> {
    let (salt, token) = vault.enable(password).await?;
    config.encryption.is_encrypted = true;
    config.encryption.salt = Some(BASE64.encode(salt));
    config.encryption.verification_token = Some(BASE64.encode(token));
    config.encryption.created_at = Some(Utc::now().to_rfc3339());
    Ok(())
}

/// Verify a password against an encrypted config and unlock the vault.
pub async fn unlock_for_file(config: &Config, vault: &Vault, password: &str) -> AgentResult<()> {
    let salt = config
        .encryption
        .salt
        .as_ref()
        .and_then(|s| BASE64.decode(s).ok())
        .ok_or_else(|| AgentError::Config("encryption.salt missing".to_string()))?;
    let token = config
        .encryption
        .verification_token
        .as_ref()
        .and_then(|t| BASE64.decode(t).ok())
        .ok_or_else(|| AgentError::Config("encryption.verificationToken missing".to_string()))?;
    vault.unlock(password, &salt, &token).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncryptedValue, SecretAlgorithm};

    #[tokio::test]
    async fn encryption_enable_and_unlock_round_trip() {
        let vault = Vault::new();
        let mut config = Config::default();
        config.servers.push(ServerConfig {
            id: "net".into(),
            host: "irc.example.org".into(),
            nicknames: vec!["munin".into()],
            password: Some(EncryptedValue::plain("irc-pass")),
            ..ServerConfig::default()
        });
        config.control_auth_token = Some(EncryptedValue::plain("token"));

        enable_encryption(&mut config, &vault, "s3cret").await.unwrap();
        convert_secrets(&mut config, &vault, true).unwrap();
        assert!(config.encryption.is_encrypted);
        assert_eq!(
            config.servers[0].password.as_ref().unwrap().algorithm,
            SecretAlgorithm::Aes256Gcm
        );

        // Restart: a fresh vault with the wrong password fails and leaves
        // the file untouched.
        let restarted = Vault::new();
        assert!(unlock_for_file(&config, &restarted, "wrong").await.is_err());
        assert!(!restarted.is_unlocked());

        // The right password unlocks and the secrets decrypt cleanly.
        unlock_for_file(&config, &restarted, "s3cret").await.unwrap();
        let revealed = config.servers[0]
            .password
            .as_ref()
            .unwrap()
            .reveal(&restarted)
            .unwrap();
        assert_eq!(revealed, "irc-pass");

        // And back to plaintext for `decrypt <file>`.
        convert_secrets(&mut config, &restarted, false).unwrap();
        assert_eq!(
            config.servers[0].password.as_ref().unwrap().algorithm,
            SecretAlgorithm::Plain
        );
    }
}
