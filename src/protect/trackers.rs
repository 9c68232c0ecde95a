//! Sliding-window bookkeeping shared by the detectors.
//!
//! Buckets are keyed by `(server, channel, subject)` in a concurrent map;
//! each bucket's interior is guarded by its own mutex. Windows are capped
//! at `threshold + 1` entries, which answers "did more than N events land
//! inside W seconds" exactly while bounding memory under sustained abuse.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::client::ServerId;

/// Bucket key: one subject in one channel on one server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// Originating server.
    pub server: ServerId,
    /// Channel, lowercased.
    pub channel: String,
    /// Subject: nickname, host, or kicker depending on the detector.
    pub subject: String,
}

impl BucketKey {
    /// Build a key with the channel and subject folded for identity.
    pub fn new(server: &ServerId, channel: &str, subject: &str) -> Self {
        Self {
            server: server.clone(),
            channel: channel.to_ascii_lowercase(),
            subject: subject.to_ascii_lowercase(),
        }
    }
}

/// A capped sliding window of event times.
#[derive(Debug)]
pub struct SlidingWindow {
    times: VecDeque<Instant>,
    cap: usize,
    last_activity: Instant,
}

impl SlidingWindow {
    fn new(cap: usize) -> Self {
        Self {
            times: VecDeque::with_capacity(cap),
            cap,
            last_activity: Instant::now(),
        }
    }

    /// Record one event and return how many landed inside `window`.
    fn record(&mut self, window: Duration) -> usize {
        let now = Instant::now();
        self.last_activity = now;

        while let Some(&front) = self.times.front() {
            if now.duration_since(front) > window {
                self.times.pop_front();
            } else {
                break;
            }
        }

        self.times.push_back(now);
        while self.times.len() > self.cap {
            self.times.pop_front();
        }

        self.times.len()
    }
}

/// Windowed event counter keyed per subject.
pub struct WindowTracker {
    buckets: DashMap<BucketKey, Mutex<SlidingWindow>>,
    cap: usize,
}

impl WindowTracker {
    /// Tracker whose windows hold at most `threshold + 1` entries.
    pub fn new(threshold: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            cap: threshold as usize + 1,
        }
    }

    /// Record one event for `key`; returns the in-window count.
    pub fn record(&self, key: BucketKey, window: Duration) -> usize {
        let bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| Mutex::new(SlidingWindow::new(self.cap)));
        let mut window_state = bucket.lock();
        window_state.record(window)
    }

    /// Evict buckets idle for longer than `max_idle`.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.lock().last_activity) <= max_idle);
        before - self.buckets.len()
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }
}

/// Per-host membership sets for clone detection.
///
/// The subject is the connecting host; the set holds the current nicks
/// seen from that host in one channel.
pub struct MembershipTracker {
    buckets: DashMap<BucketKey, Mutex<CloneSet>>,
}

#[derive(Debug)]
struct CloneSet {
    nicks: HashSet<String>,
    last_activity: Instant,
}

impl MembershipTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Record a join; returns the distinct-nick count for the host.
    ///
    /// Re-adding a present nick is a no-op, so replayed joins never double
    /// the count.
    pub fn join(&self, key: BucketKey, nick: &str) -> usize {
        let bucket = self.buckets.entry(key).or_insert_with(|| {
            Mutex::new(CloneSet {
                nicks: HashSet::new(),
                last_activity: Instant::now(),
            })
        });
        let mut set = bucket.lock();
        set.last_activity = Instant::now();
        set.nicks.insert(nick.to_ascii_lowercase());
        set.nicks.len()
    }

    /// Remove a nick from every host bucket of `(server, channel)`.
    pub fn leave(&self, server: &ServerId, channel: &str, nick: &str) {
        let channel = channel.to_ascii_lowercase();
        let nick = nick.to_ascii_lowercase();
        self.buckets.retain(|key, bucket| {
            if key.server != *server || key.channel != channel {
                return true;
            }
            let mut set = bucket.lock();
            if set.nicks.remove(&nick) {
                set.last_activity = Instant::now();
            }
            !set.nicks.is_empty()
        });
    }

    /// Rename a nick across every bucket of one server.
    pub fn rename(&self, server: &ServerId, old: &str, new: &str) {
        let old = old.to_ascii_lowercase();
        let new = new.to_ascii_lowercase();
        for entry in self.buckets.iter() {
            if entry.key().server != *server {
                continue;
            }
            let mut set = entry.value().lock();
            if set.nicks.remove(&old) {
                set.nicks.insert(new.clone());
                set.last_activity = Instant::now();
            }
        }
    }

    /// Evict buckets idle for longer than `max_idle`.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.lock().last_activity) <= max_idle);
        before - self.buckets.len()
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for MembershipTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ServerId {
        ServerId("net".to_string())
    }

    #[test]
    fn window_counts_within_window() {
        let tracker = WindowTracker::new(5);
        let key = BucketKey::new(&server(), "#chan", "spammer");
        let window = Duration::from_secs(10);

        for expected in 1..=5 {
            assert_eq!(tracker.record(key.clone(), window), expected);
        }
        // Sixth event exceeds a threshold of 5.
        assert_eq!(tracker.record(key, window), 6);
    }

    #[test]
    fn window_is_capped_at_threshold_plus_one() {
        let tracker = WindowTracker::new(3);
        let key = BucketKey::new(&server(), "#chan", "x");
        let window = Duration::from_secs(600);
        for _ in 0..100 {
            let count = tracker.record(key.clone(), window);
            assert!(count <= 4, "window grew past cap: {}", count);
        }
    }

    #[test]
    fn subjects_are_independent() {
        let tracker = WindowTracker::new(5);
        let window = Duration::from_secs(10);
        let a = BucketKey::new(&server(), "#chan", "alice");
        let b = BucketKey::new(&server(), "#chan", "bob");
        assert_eq!(tracker.record(a, window), 1);
        assert_eq!(tracker.record(b, window), 1);
    }

    #[test]
    fn keys_fold_case() {
        let a = BucketKey::new(&server(), "#Chan", "Nick");
        let b = BucketKey::new(&server(), "#chan", "nick");
        assert_eq!(a, b);
    }

    #[test]
    fn sweep_evicts_idle_buckets() {
        let tracker = WindowTracker::new(5);
        tracker.record(
            BucketKey::new(&server(), "#chan", "x"),
            Duration::from_secs(10),
        );
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.sweep_idle(Duration::ZERO), 1);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn clone_join_is_idempotent() {
        let tracker = MembershipTracker::new();
        let key = BucketKey::new(&server(), "#chan", "evil.host");
        assert_eq!(tracker.join(key.clone(), "a"), 1);
        assert_eq!(tracker.join(key.clone(), "a"), 1);
        assert_eq!(tracker.join(key.clone(), "b"), 2);
        assert_eq!(tracker.join(key, "c"), 3);
    }

    #[test]
    fn clone_leave_and_rename() {
        let tracker = MembershipTracker::new();
        let key = BucketKey::new(&server(), "#chan", "evil.host");
        tracker.join(key.clone(), "a");
        tracker.join(key.clone(), "b");

        tracker.leave(&server(), "#chan", "A");
        assert_eq!(tracker.join(key.clone(), "b"), 1);

        tracker.rename(&server(), "b", "bee");
        assert_eq!(tracker.join(key, "bee"), 1);

        // Empty buckets disappear on leave.
        tracker.leave(&server(), "#chan", "bee");
        tracker.leave(&server(), "#chan", "bee2");
        assert_eq!(tracker.len(), 0);
    }
}
