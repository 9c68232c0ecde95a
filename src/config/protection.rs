//! Channel protection configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::defaults::*;

/// Graduated enforcement action for a detector hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionAction {
    /// NOTICE the offender.
    Warn,
    /// Kick from the channel.
    Kick,
    /// `MODE +b *!*@host`.
    Ban,
    /// Ban, then kick.
    Kickban,
    /// `MODE +q *!*@host`.
    Quiet,
}

/// Flood detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FloodConfig {
    /// Messages within the window that trip the detector.
    #[serde(default = "default_flood_threshold")]
    pub message_threshold: u32,
    /// Window length in seconds.
    #[serde(default = "default_flood_window_secs")]
    pub window_secs: u64,
    /// Action on breach.
    pub action: ProtectionAction,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            message_threshold: default_flood_threshold(),
            window_secs: default_flood_window_secs(),
            action: ProtectionAction::Kickban,
        }
    }
}

/// Clone detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloneConfig {
    /// Concurrent nicks from one host before the detector trips.
    #[serde(default = "default_max_clones")]
    pub max_clones: u32,
    /// Action on breach.
    pub action: ProtectionAction,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            max_clones: default_max_clones(),
            action: ProtectionAction::Warn,
        }
    }
}

/// Mass-kick detector settings. The response is fixed: deop plus kickban.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MassKickConfig {
    /// Kicks by one user within the window that trip the detector.
    #[serde(default = "default_kick_threshold")]
    pub kick_threshold: u32,
    /// Window length in seconds.
    #[serde(default = "default_kick_window_secs")]
    pub window_secs: u64,
}

impl Default for MassKickConfig {
    fn default() -> Self {
        Self {
            kick_threshold: default_kick_threshold(),
            window_secs: default_kick_window_secs(),
        }
    }
}

/// One bad-word pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BadWordRule {
    /// Literal substring, or a regular expression when `regex` is set.
    pub pattern: String,
    /// Treat `pattern` as a regular expression.
    pub regex: bool,
    /// Action on match.
    pub action: ProtectionAction,
    /// Channels this rule applies to; empty means every channel.
    pub channels: Vec<String>,
}

impl Default for BadWordRule {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            regex: false,
            action: ProtectionAction::Warn,
            channels: Vec::new(),
        }
    }
}

/// Per-channel overrides of the global detector settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtectionOverride {
    /// Flood settings for this channel.
    pub flood: Option<FloodConfig>,
    /// Clone settings for this channel.
    pub clone: Option<CloneConfig>,
}

/// Channel protection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtectionConfig {
    /// Master switch.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Flood detector.
    pub flood: FloodConfig,
    /// Clone detector.
    pub clone: CloneConfig,
    /// Mass-kick detector.
    pub mass_kick: MassKickConfig,
    /// Bad-word patterns, first match wins.
    pub bad_words: Vec<BadWordRule>,
    /// Per-channel overrides keyed by channel name.
    pub channels: HashMap<String, ProtectionOverride>,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flood: FloodConfig::default(),
            clone: CloneConfig::default(),
            mass_kick: MassKickConfig::default(),
            bad_words: Vec::new(),
            channels: HashMap::new(),
        }
    }
}

impl ProtectionConfig {
    /// Flood settings for a channel, with overrides applied.
    pub fn flood_for(&self, channel: &str) -> &FloodConfig {
        self.channels
            .get(channel)
            .and_then(|o| o.flood.as_ref())
            .unwrap_or(&self.flood)
    }

    /// Clone settings for a channel, with overrides applied.
    pub fn clone_for(&self, channel: &str) -> &CloneConfig {
        self.channels
            .get(channel)
            .and_then(|o| o.clone.as_ref())
            .unwrap_or(&self.clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ProtectionConfig::default();
        assert!(config.enabled);
        assert_eq!(config.flood.message_threshold, 5);
        assert_eq!(config.flood.window_secs, 10);
        assert_eq!(config.flood.action, ProtectionAction::Kickban);
        assert_eq!(config.clone.max_clones, 3);
        assert_eq!(config.mass_kick.kick_threshold, 3);
    }

    #[test]
    fn channel_override_wins() {
        let mut config = ProtectionConfig::default();
        config.channels.insert(
            "#strict".to_string(),
            ProtectionOverride {
                flood: Some(FloodConfig {
                    message_threshold: 2,
                    window_secs: 5,
                    action: ProtectionAction::Kick,
                }),
                clone: None,
            },
        );
        assert_eq!(config.flood_for("#strict").message_threshold, 2);
        assert_eq!(config.flood_for("#lax").message_threshold, 5);
        assert_eq!(config.clone_for("#strict").max_clones, 3);
    }

    #[test]
    fn action_serde_names() {
        let action: ProtectionAction = serde_json::from_str("\"kickban\"").unwrap();
        assert_eq!(action, ProtectionAction::Kickban);
        assert_eq!(serde_json::to_string(&ProtectionAction::Quiet).unwrap(), "\"quiet\"");
    }
}
