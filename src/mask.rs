//! Hostmask utilities.
//!
//! IRC identities are `nick!user@host` triples matched by glob patterns
//! with `*` (any run) and `?` (one char), case-insensitively.

/// Wildcard matching for IRC patterns.
///
/// Supports `*` (match zero or more chars) and `?` (match exactly one char).
///
/// # Examples
///
/// ```ignore
/// assert!(wildcard_match("*!*@*.example.org", "nick!user@irc.example.org"));
/// assert!(wildcard_match("user?", "user1"));
/// assert!(!wildcard_match("user?", "user12"));
/// ```
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let mut regex_pattern = String::with_capacity(pattern.len() * 2);
    for c in pattern.chars() {
        match c {
            '*' => regex_pattern.push_str(".*"),
            '?' => regex_pattern.push('.'),
            c => regex_pattern.push_str(&regex::escape(&c.to_string())),
        }
    }

    if let Ok(re) = regex::Regex::new(&format!("(?i)^{}$", regex_pattern)) {
        re.is_match(text)
    } else {
        // Fallback to exact match if regex compilation fails
        pattern.eq_ignore_ascii_case(text)
    }
}

/// Extract the host part of a `nick!user@host` mask.
pub fn host_of(hostmask: &str) -> Option<&str> {
    hostmask.split_once('@').map(|(_, host)| host)
}

/// The host-generalised ban mask for a hostmask: `*!*@host`.
///
/// Falls back to the nick part when no host is known.
pub fn ban_mask(hostmask: &str) -> String {
    match host_of(hostmask) {
        Some(host) if !host.is_empty() && host != "*" => format!("*!*@{}", host),
        _ => {
            let nick = hostmask.split('!').next().unwrap_or(hostmask);
            format!("{}!*@*", nick)
        }
    }
}
