//! Persistent user database.
//!
//! Maps handles to privilege flags and hostmask globs. Flags are single
//! characters: `n` owner, `m` master, `o` op, `f` friend, `v` voice-auto,
//! `b` deny. A flag string carries global flags first, then per-channel
//! segments: `of|#ops:n|#quiet:b`.
//!
//! The in-memory view sits behind a readers-writer lock; persistence is an
//! atomic temp-file swap that never runs while the lock is held.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SeedUser;
use crate::error::{AgentError, AgentResult};
use crate::mask::wildcard_match;

/// Recognised privilege flags.
pub const KNOWN_FLAGS: &[char] = &['n', 'm', 'o', 'f', 'v', 'b'];

/// One database user.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DbUser {
    /// Case-insensitive handle.
    pub handle: String,
    /// Global flag characters.
    pub flags: String,
    /// Per-channel flag overrides.
    pub channel_flags: HashMap<String, String>,
    /// Hostmask globs, in match priority order.
    pub hostmasks: Vec<String>,
    /// Free-form info line.
    pub info: String,
    /// Unix timestamp of the last sighting.
    pub last_seen: Option<i64>,
}

impl DbUser {
    /// Whether the user carries `flag` globally or on `channel`.
    pub fn has_flag(&self, flag: char, channel: Option<&str>) -> bool {
        if self.flags.contains(flag) {
            return true;
        }
        match channel {
            Some(chan) => self
                .channel_flags
                .iter()
                .any(|(name, flags)| name.eq_ignore_ascii_case(chan) && flags.contains(flag)),
            None => false,
        }
    }

    /// Whether any of `flags` is carried globally or on `channel`.
    pub fn has_any_flag(&self, flags: &str, channel: Option<&str>) -> bool {
        flags.chars().any(|f| self.has_flag(f, channel))
    }
}

#[derive(Default, Serialize, Deserialize)]
struct DbFile {
    users: Vec<DbUser>,
}

/// The user database.
pub struct UserDb {
    inner: RwLock<Vec<DbUser>>,
    path: PathBuf,
}

impl UserDb {
    /// Load the database file; a missing file yields an empty database.
    pub fn load(path: impl Into<PathBuf>) -> AgentResult<Self> {
        let path = path.into();
        let users = match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let file: DbFile = serde_json::from_str(&raw).map_err(|e| {
                    AgentError::Config(format!("cannot parse user database {:?}: {}", path, e))
                })?;
                file.users
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!(count = users.len(), path = %path.display(), "User database loaded");
        Ok(Self {
            inner: RwLock::new(users),
            path,
        })
    }

    /// Merge configuration seeds: adds handles the database does not know.
    pub fn seed(&self, seeds: &HashMap<String, SeedUser>) {
        let mut users = self.inner.write();
        for (handle, seed) in seeds {
            if users.iter().any(|u| u.handle.eq_ignore_ascii_case(handle)) {
                continue;
            }
            let mut user = DbUser {
                handle: handle.clone(),
                hostmasks: seed.hostmasks.clone(),
                info: seed.info.clone(),
                ..DbUser::default()
            };
            apply_flag_string(&mut user, &seed.flags, true);
            debug!(handle = %handle, "Seeded user from configuration");
            users.push(user);
        }
    }

    /// Number of users.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the database is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Snapshot of every user.
    pub fn list(&self) -> Vec<DbUser> {
        self.inner.read().clone()
    }

    /// Look up a user by handle.
    pub fn get(&self, handle: &str) -> Option<DbUser> {
        self.inner
            .read()
            .iter()
            .find(|u| u.handle.eq_ignore_ascii_case(handle))
            .cloned()
    }

    /// Find the user matching a hostmask.
    ///
    /// Users are walked in insertion order; the first user owning any glob
    /// that matches wins.
    pub fn match_user(&self, hostmask: &str) -> Option<DbUser> {
        self.inner
            .read()
            .iter()
            .find(|u| u.hostmasks.iter().any(|m| wildcard_match(m, hostmask)))
            .cloned()
    }

    /// Add a user with one initial hostmask.
    pub fn add_user(&self, handle: &str, hostmask: &str) -> AgentResult<()> {
        let mut users = self.inner.write();
        if users.iter().any(|u| u.handle.eq_ignore_ascii_case(handle)) {
            return Err(AgentError::Config(format!("user {} already exists", handle)));
        }
        users.push(DbUser {
            handle: handle.to_string(),
            hostmasks: vec![hostmask.to_string()],
            ..DbUser::default()
        });
        Ok(())
    }

    /// Remove a user. Returns whether one was removed.
    pub fn del_user(&self, handle: &str) -> bool {
        let mut users = self.inner.write();
        let before = users.len();
        users.retain(|u| !u.handle.eq_ignore_ascii_case(handle));
        users.len() != before
    }

    /// Append a hostmask glob to a user.
    #[allow(dead_code)] // Script-engine boundary
    pub fn add_hostmask(&self, handle: &str, mask: &str) -> AgentResult<()> {
        self.with_user(handle, |user| {
            if !user.hostmasks.iter().any(|m| m == mask) {
                user.hostmasks.push(mask.to_string());
            }
        })
    }

    /// Remove a hostmask glob from a user.
    #[allow(dead_code)] // Script-engine boundary
    pub fn del_hostmask(&self, handle: &str, mask: &str) -> AgentResult<()> {
        self.with_user(handle, |user| {
            user.hostmasks.retain(|m| m != mask);
        })
    }

    /// Grant flags from a flag string (`of|#chan:fv`).
    pub fn add_flags(&self, handle: &str, flag_string: &str) -> AgentResult<()> {
        self.with_user(handle, |user| apply_flag_string(user, flag_string, true))
    }

    /// Revoke flags from a flag string.
    pub fn remove_flags(&self, handle: &str, flag_string: &str) -> AgentResult<()> {
        self.with_user(handle, |user| apply_flag_string(user, flag_string, false))
    }

    /// Record a sighting of the user.
    pub fn touch_seen(&self, handle: &str, at: i64) {
        let mut users = self.inner.write();
        if let Some(user) = users
            .iter_mut()
            .find(|u| u.handle.eq_ignore_ascii_case(handle))
        {
            user.last_seen = Some(at);
        }
    }

    /// Persist to disk: serialize a snapshot, then temp-file + fsync + rename.
    pub fn save(&self) -> AgentResult<()> {
        let snapshot = DbFile {
            users: self.inner.read().clone(),
        };
        // Lock released here; the write happens on the snapshot alone.
        let data = serde_json::to_vec_pretty(&snapshot)?;
        crate::util::atomic_write(&self.path, &data)?;
        debug!(count = snapshot.users.len(), "User database persisted");
        Ok(())
    }

    fn with_user(&self, handle: &str, f: impl FnOnce(&mut DbUser)) -> AgentResult<()> {
        let mut users = self.inner.write();
        match users
            .iter_mut()
            .find(|u| u.handle.eq_ignore_ascii_case(handle))
        {
            Some(user) => {
                f(user);
                Ok(())
            }
            None => Err(AgentError::NotFound(format!("user {}", handle))),
        }
    }
}

/// Apply a `global|#chan:flags` string to a user, adding or removing.
fn apply_flag_string(user: &mut DbUser, flag_string: &str, add: bool) {
    let mut segments = flag_string.split('|');

    if let Some(global) = segments.next() {
        user.flags = merge_flags(&user.flags, global, add);
    }

    for segment in segments {
        let Some((channel, flags)) = segment.split_once(':') else {
            continue;
        };
        let entry = user.channel_flags.entry(channel.to_string()).or_default();
        *entry = merge_flags(entry, flags, add);
        if entry.is_empty() {
            user.channel_flags.remove(channel);
        }
    }
}

fn merge_flags(current: &str, changes: &str, add: bool) -> String {
    let mut flags: Vec<char> = current.chars().collect();
    for c in changes.chars() {
        if !KNOWN_FLAGS.contains(&c) {
            continue;
        }
        if add {
            if !flags.contains(&c) {
                flags.push(c);
            }
        } else {
            flags.retain(|&f| f != c);
        }
    }
    flags.into_iter().collect()
}
