//! Munin - an autonomous IRC agent.
//!
//! Maintains long-lived connections to IRC networks, protects channels
//! from abuse, and exposes a mutually-authenticated control channel for
//! the operator UI.

mod agent;
mod binds;
mod client;
mod config;
mod control;
mod crypto;
mod error;
mod logging;
mod mask;
mod protect;
mod relay;
mod userdb;
mod util;

use std::io::Write;

use anyhow::{bail, Context};
use tracing::info;

use crate::agent::{Agent, Exit};
use crate::config::{Config, CONFIG_ENV, DEFAULT_CONFIG_PATH};
use crate::crypto::Vault;

/// Resolve the configuration path: `AGENT_CONFIG` overrides the default.
fn resolve_config_path() -> String {
    std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}

/// Read one line from stdin after printing a prompt.
pub(crate) fn prompt(label: &str) -> std::io::Result<String> {
    print!("{}", label);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Prompt for the master password.
pub(crate) fn prompt_password(label: &str) -> Result<String, crate::error::AgentError> {
    prompt(label).map_err(crate::error::AgentError::Io)
}

fn print_help() {
    println!("munin {}", env!("CARGO_PKG_VERSION"));
    println!("Usage: munin [command]");
    println!();
    println!("Commands:");
    println!("  (no command)     run the agent");
    println!("  setup            interactive configuration wizard");
    println!("  encrypt <file>   encrypt the secret fields of a config file");
    println!("  decrypt <file>   decrypt the secret fields of a config file");
    println!("  gentoken         generate a control auth token");
    println!("  gencert [host]   generate a self-signed TLS certificate");
    println!("  version          print the version");
    println!("  help             this text");
    println!();
    println!("Environment:");
    println!("  {}     configuration path (default {})", CONFIG_ENV, DEFAULT_CONFIG_PATH);
    println!("  AGENT_PASSWORD   master password (discouraged; prefer the prompt)");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);

    match args.next().as_deref() {
        None => run_agent().await,
        Some("setup") => setup_wizard().await,
        Some("encrypt") => {
            let path = args.next().context("usage: munin encrypt <file>")?;
            convert_file(&path, true).await
        }
        Some("decrypt") => {
            let path = args.next().context("usage: munin decrypt <file>")?;
            convert_file(&path, false).await
        }
        Some("gentoken") => {
            println!("{}", crypto::generate_token());
            println!("Put this in the config as controlAuthToken: {{\"data\": base64(token), \"algorithm\": \"PLAIN\"}}");
            Ok(())
        }
        Some("gencert") => {
            let host = args.next().unwrap_or_else(|| "localhost".to_string());
            generate_certificate(&host)
        }
        Some("version") => {
            println!("munin {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some("help") | Some("-h") | Some("--help") => {
            print_help();
            Ok(())
        }
        Some(other) => {
            print_help();
            bail!("unknown command: {}", other);
        }
    }
}

async fn run_agent() -> anyhow::Result<()> {
    let config_path = resolve_config_path();
    let config = Config::load(&config_path)
        .map_err(|e| anyhow::anyhow!("failed to load config from {}: {}", config_path, e))?;

    // Logging first, driven by the config we just loaded.
    let _log_guard = logging::init(&config.logging)?;

    if let Err(errors) = config::validate(&config) {
        for err in &errors {
            tracing::error!(error = %err, "Configuration validation failed");
        }
        bail!("configuration validation failed with {} error(s)", errors.len());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path,
        servers = config.servers.len(),
        "Starting munin"
    );

    match Agent::run(config, config_path).await? {
        Exit::Shutdown => Ok(()),
        Exit::Restart => {
            info!(marker = agent::RESTART_MARKER, "Restart marker written");
            Ok(())
        }
    }
}

/// Interactive first-run wizard: one server, control plane, auth token.
async fn setup_wizard() -> anyhow::Result<()> {
    println!("Munin setup");
    println!("-----------");

    let config_path = resolve_config_path();
    if std::path::Path::new(&config_path).exists() {
        bail!("{} already exists; move it aside first", config_path);
    }

    let host = prompt("IRC server host: ")?;
    if host.is_empty() {
        bail!("a server host is required");
    }
    let port: u16 = prompt("Port [6697]: ")?.parse().unwrap_or(6697);
    let nick = prompt("Nickname [munin]: ")?;
    let nick = if nick.is_empty() { "munin".to_string() } else { nick };
    let channel = prompt("Channel to join (blank for none): ")?;
    let control_port: u16 = prompt("Control port [8765]: ")?.parse().unwrap_or(8765);
    let owner_mask = prompt("Owner hostmask (e.g. *!you@your.host): ")?;

    let token = crypto::generate_token();

    let mut config = Config {
        control_port,
        require_tls: true,
        control_auth_token: Some(config::EncryptedValue::plain(&token)),
        quit_message: "Munin going down".to_string(),
        ..Config::default()
    };
    config.servers.push(config::ServerConfig {
        id: host.split('.').nth(1).unwrap_or("irc").to_string(),
        host,
        port,
        nicknames: vec![nick.clone(), format!("{}_", nick)],
        auto_join: if channel.is_empty() {
            Vec::new()
        } else {
            vec![config::AutoJoin { channel, key: None }]
        },
        ..config::ServerConfig::default()
    });
    if !owner_mask.is_empty() {
        config.users.insert(
            "owner".to_string(),
            config::SeedUser {
                flags: "n".to_string(),
                hostmasks: vec![owner_mask],
                info: "created by setup".to_string(),
            },
        );
    }

    config.save(&config_path).context("writing configuration")?;
    println!();
    println!("Wrote {}.", config_path);
    println!("Control auth token (also stored in the config):");
    println!("  {}", token);
    println!("Generate TLS material with `munin gencert` and set controlTls,");
    println!("or set requireTls to false for loopback-only use.");
    println!("Run `munin encrypt {}` to protect stored secrets.", config_path);
    Ok(())
}

/// Encrypt or decrypt every secret field of a configuration file.
async fn convert_file(path: &str, encrypt: bool) -> anyhow::Result<()> {
    let mut config = Config::load(path).map_err(|e| anyhow::anyhow!("{}", e))?;
    let vault = Vault::new();

    if encrypt {
        if config.encryption.is_encrypted {
            bail!("{} is already encrypted", path);
        }
        let password = prompt("New master password: ")?;
        let confirm = prompt("Confirm master password: ")?;
        if password != confirm {
            bail!("passwords do not match");
        }
        if password.len() < 8 {
            bail!("master password must be at least 8 characters");
        }

        agent::enable_encryption(&mut config, &vault, &password).await?;
        agent::convert_secrets(&mut config, &vault, true)?;
        config.save(path)?;
        println!("Encrypted secret fields of {}.", path);
    } else {
        if !config.encryption.is_encrypted {
            bail!("{} is not encrypted", path);
        }
        let password = prompt("Master password: ")?;
        agent::unlock_for_file(&config, &vault, &password).await?;
        agent::convert_secrets(&mut config, &vault, false)?;
        config.encryption = config::EncryptionConfig::default();
        config.save(path)?;
        println!("Decrypted secret fields of {}.", path);
    }

    vault.lock();
    Ok(())
}

/// Self-signed certificate for the control plane.
fn generate_certificate(host: &str) -> anyhow::Result<()> {
    let certified = rcgen::generate_simple_self_signed(vec![host.to_string()])
        .context("generating certificate")?;

    std::fs::write("munin-cert.pem", certified.cert.pem())?;
    std::fs::write("munin-key.pem", certified.key_pair.serialize_pem())?;

    println!("Wrote munin-cert.pem and munin-key.pem for {}.", host);
    println!("Point controlTls.certPath / controlTls.keyPath at them.");
    Ok(())
}
