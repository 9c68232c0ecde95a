//! Default values for configuration fields.

pub(super) fn default_true() -> bool {
    true
}

pub(super) fn default_control_port() -> u16 {
    8765
}

pub(super) fn default_irc_port() -> u16 {
    6697
}

pub(super) fn default_username() -> String {
    "munin".to_string()
}

pub(super) fn default_realname() -> String {
    "Munin Agent".to_string()
}

pub(super) fn default_quit_message() -> String {
    "Munin going down".to_string()
}

pub(super) fn default_log_directory() -> String {
    "logs".to_string()
}

pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_retention_days() -> usize {
    7
}

pub(super) fn default_base_delay_secs() -> u64 {
    5
}

pub(super) fn default_max_delay_secs() -> u64 {
    60
}

pub(super) fn default_scripts_directory() -> String {
    "scripts".to_string()
}

pub(super) fn default_users_file() -> String {
    "users.json".to_string()
}

pub(super) fn default_encryption_version() -> u32 {
    1
}

pub(super) fn default_flood_threshold() -> u32 {
    5
}

pub(super) fn default_flood_window_secs() -> u64 {
    10
}

pub(super) fn default_max_clones() -> u32 {
    3
}

pub(super) fn default_kick_threshold() -> u32 {
    3
}

pub(super) fn default_kick_window_secs() -> u64 {
    30
}
