//! Startup configuration validation.
//!
//! Collects every problem instead of stopping at the first, so an operator
//! can fix a config file in one pass. Any error refuses startup.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

use super::types::{AuthMode, Config};

/// Validate a configuration. Returns every error found.
pub fn validate(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    validate_control(config, &mut errors);
    validate_servers(config, &mut errors);
    validate_protection(config, &mut errors);
    validate_logging(config, &mut errors);
    validate_encryption(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_control(config: &Config, errors: &mut Vec<String>) {
    if config.control_port != 0 {
        if config.control_auth_token.is_none() {
            errors.push(
                "control server enabled but controlAuthToken is missing (run `munin gentoken`)"
                    .to_string(),
            );
        }
        if config.require_tls {
            match &config.control_tls {
                None => errors.push(
                    "requireTls is set but controlTls cert/key paths are missing".to_string(),
                ),
                Some(tls) => {
                    if !Path::new(&tls.cert_path).exists() {
                        errors.push(format!("controlTls.certPath not found: {}", tls.cert_path));
                    }
                    if !Path::new(&tls.key_path).exists() {
                        errors.push(format!("controlTls.keyPath not found: {}", tls.key_path));
                    }
                }
            }
        }
    }

    for entry in &config.allowed_ips {
        if entry == "*" {
            continue;
        }
        let ok = entry.parse::<IpAddr>().is_ok() || entry.parse::<ipnet::IpNet>().is_ok();
        if !ok {
            errors.push(format!(
                "allowedIPs entry is neither `*`, an IP, nor a CIDR block: {}",
                entry
            ));
        }
    }
}

fn validate_servers(config: &Config, errors: &mut Vec<String>) {
    let mut seen_ids = HashSet::new();

    for (index, server) in config.servers.iter().enumerate() {
        let label = if server.id.is_empty() {
            format!("servers[{}]", index)
        } else {
            format!("server `{}`", server.id)
        };

        if server.id.is_empty() {
            errors.push(format!("{}: id must not be empty", label));
        } else if !seen_ids.insert(server.id.clone()) {
            errors.push(format!("{}: duplicate server id", label));
        }
        if server.host.is_empty() {
            errors.push(format!("{}: host must not be empty", label));
        }
        if server.port == 0 {
            errors.push(format!("{}: port must not be 0", label));
        }
        if server.nicknames.is_empty() {
            errors.push(format!("{}: at least one nickname is required", label));
        }

        match server.auth {
            AuthMode::Pass | AuthMode::SaslPlain | AuthMode::SaslScramSha256 => {
                if server.password.is_none() {
                    errors.push(format!("{}: auth mode requires a password", label));
                }
            }
            AuthMode::SaslExternal => {
                if server.tls.client_cert_path.is_none() {
                    errors.push(format!(
                        "{}: sasl-external requires tls.clientCertPath",
                        label
                    ));
                }
            }
            AuthMode::None => {}
        }

        if server.auth == AuthMode::SaslExternal && !server.tls.enabled {
            errors.push(format!("{}: sasl-external requires TLS", label));
        }

        if let Some(path) = &server.tls.client_cert_path {
            if !Path::new(path).exists() {
                errors.push(format!("{}: client certificate not found: {}", label, path));
            }
        }

        if server.reconnect.base_delay_secs == 0 {
            errors.push(format!("{}: reconnect.baseDelaySecs must be > 0", label));
        }
        if server.reconnect.max_delay_secs < server.reconnect.base_delay_secs {
            errors.push(format!(
                "{}: reconnect.maxDelaySecs must be >= baseDelaySecs",
                label
            ));
        }
    }
}

fn validate_protection(config: &Config, errors: &mut Vec<String>) {
    let protection = &config.channel_protection;

    if protection.flood.message_threshold == 0 || protection.flood.window_secs == 0 {
        errors.push("channelProtection.flood threshold and window must be > 0".to_string());
    }
    if protection.clone.max_clones == 0 {
        errors.push("channelProtection.clone.maxClones must be > 0".to_string());
    }
    if protection.mass_kick.kick_threshold == 0 || protection.mass_kick.window_secs == 0 {
        errors.push("channelProtection.massKick threshold and window must be > 0".to_string());
    }

    for rule in &protection.bad_words {
        if rule.pattern.is_empty() {
            errors.push("channelProtection.badWords entry has an empty pattern".to_string());
        } else if rule.regex {
            if let Err(e) = regex::Regex::new(&rule.pattern) {
                errors.push(format!("bad-word regex `{}` is invalid: {}", rule.pattern, e));
            }
        }
    }
}

fn validate_encryption(config: &Config, errors: &mut Vec<String>) {
    let sealed_fields = config.secret_fields().iter().filter(|f| f.is_encrypted()).count();
    if config.encryption.is_encrypted {
        if config.encryption.salt.is_none() || config.encryption.verification_token.is_none() {
            errors.push(
                "encryption.isEncrypted is set but salt or verificationToken is missing"
                    .to_string(),
            );
        }
    } else if sealed_fields > 0 {
        errors.push(format!(
            "{} sealed secret field(s) present but encryption.isEncrypted is false",
            sealed_fields
        ));
    }
}

fn validate_logging(config: &Config, errors: &mut Vec<String>) {
    const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
    if !LEVELS.contains(&config.logging.level.as_str()) {
        errors.push(format!(
            "logging.level must be one of {:?}, got `{}`",
            LEVELS, config.logging.level
        ));
    }
    if config.logging.retention_days == 0 {
        errors.push("logging.retentionDays must be > 0".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncryptedValue, ServerConfig};

    fn valid_config() -> Config {
        let mut config = Config {
            control_port: 0,
            ..Config::default()
        };
        config.servers.push(ServerConfig {
            id: "net".to_string(),
            host: "irc.example.org".to_string(),
            nicknames: vec!["munin".to_string()],
            ..ServerConfig::default()
        });
        config
    }

    #[test]
    fn accepts_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn rejects_duplicate_server_ids() {
        let mut config = valid_config();
        let dup = config.servers[0].clone();
        config.servers.push(dup);
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("duplicate server id")));
    }

    #[test]
    fn control_needs_token_and_tls() {
        let mut config = valid_config();
        config.control_port = 9000;
        config.require_tls = true;
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("controlAuthToken")));
        assert!(errors.iter().any(|e| e.contains("controlTls")));
    }

    #[test]
    fn plain_control_allowed_when_tls_disabled() {
        let mut config = valid_config();
        config.control_port = 9000;
        config.require_tls = false;
        config.control_auth_token = Some(EncryptedValue::plain("token"));
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn sasl_requires_password() {
        let mut config = valid_config();
        config.servers[0].auth = AuthMode::SaslPlain;
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("requires a password")));
    }

    #[test]
    fn rejects_bad_allow_list_entry() {
        let mut config = valid_config();
        config.allowed_ips = vec!["*".into(), "10.0.0.0/8".into(), "not-an-ip".into()];
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("not-an-ip"));
    }

    #[test]
    fn rejects_invalid_badword_regex() {
        let mut config = valid_config();
        config.channel_protection.bad_words.push(crate::config::BadWordRule {
            pattern: "(unclosed".to_string(),
            regex: true,
            ..Default::default()
        });
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("unclosed")));
    }

    #[test]
    fn rejects_zero_windows() {
        let mut config = valid_config();
        config.channel_protection.flood.window_secs = 0;
        assert!(validate(&config).is_err());
    }
}
