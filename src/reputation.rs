//! IP reputation engine
//!
//! Accumulates suspicious-activity marks per IP, auto-bans an IP when too
//! many marks land inside a sliding window, and keeps manual operator bans.
//! The whole store lives in one JSON file that is rewritten on every
//! mutation; load failures start the engine empty rather than failing the
//! service.
//!
//! Timed bans expire lazily: the next `is_banned` observation after the
//! deadline clears the ban fields and persists. There is no background
//! sweeper, so that expiry has exactly one code path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Sliding window in which suspicious marks are counted.
pub const SUSPICION_WINDOW_SECS: i64 = 120;

/// Marks within the window that trigger an automatic ban.
pub const AUTO_BAN_THRESHOLD: u32 = 10;

/// Lifetime of an automatic ban.
pub const AUTO_BAN_HOURS: i64 = 24;

/// Injectable time source so window and expiry logic is testable.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// One IP's reputation record.
///
/// When `banned` is false the ban fields are all empty; `window_count`
/// never exceeds `count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspiciousIp {
    pub ip: String,
    pub reason: String,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub banned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banned_at: Option<DateTime<Utc>>,
    /// Ban deadline; `None` on a banned record means permanent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ban_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_banned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub window_count: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl SuspiciousIp {
    fn clear_ban(&mut self) {
        self.banned = false;
        self.banned_at = None;
        self.ban_until = None;
        self.auto_banned = false;
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedReputation {
    entries: HashMap<String, SuspiciousIp>,
}

/// File-backed store of suspicious and banned IPs.
pub struct ReputationStore {
    entries: Mutex<HashMap<String, SuspiciousIp>>,
    path: PathBuf,
    clock: Clock,
}

impl ReputationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_clock(path, Arc::new(Utc::now))
    }

    /// Construct with an explicit time source (tests use an adjustable one).
    pub fn with_clock(path: impl Into<PathBuf>, clock: Clock) -> Self {
        let path = path.into();
        let entries = load_entries(&path);
        Self {
            entries: Mutex::new(entries),
            path,
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Whether traffic from `ip` must be dropped. Observing an expired timed
    /// ban clears it (counters are kept) and persists the change.
    pub fn is_banned(&self, ip: &str) -> bool {
        let now = self.now();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(ip) else {
            return false;
        };
        if !entry.banned {
            return false;
        }
        if let Some(until) = entry.ban_until {
            if now > until {
                entry.clear_ban();
                self.save_locked(&entries);
                return false;
            }
        }
        true
    }

    /// Record one suspicious observation. Returns whether this call crossed
    /// the auto-ban threshold, and the ban deadline if it did.
    pub fn mark_suspicious(
        &self,
        ip: &str,
        reason: &str,
    ) -> (bool, Option<DateTime<Utc>>) {
        if ip.is_empty() {
            return (false, None);
        }
        let now = self.now();
        let window = Duration::seconds(SUSPICION_WINDOW_SECS);

        let mut entries = self.entries.lock();
        if !entries.contains_key(ip) {
            entries.insert(
                ip.to_string(),
                SuspiciousIp {
                    ip: ip.to_string(),
                    reason: reason.to_string(),
                    count: 1,
                    first_seen: now,
                    last_seen: now,
                    banned: false,
                    banned_at: None,
                    ban_until: None,
                    auto_banned: false,
                    window_start: Some(now),
                    window_count: 1,
                },
            );
            self.save_locked(&entries);
            return (false, None);
        }
        let Some(entry) = entries.get_mut(ip) else {
            return (false, None);
        };

        entry.count += 1;
        entry.last_seen = now;
        if !reason.is_empty() {
            entry.reason = reason.to_string();
        }

        match entry.window_start {
            Some(start) if now - start <= window => entry.window_count += 1,
            _ => {
                entry.window_start = Some(now);
                entry.window_count = 1;
            }
        }

        if !entry.banned && entry.window_count >= AUTO_BAN_THRESHOLD {
            let until = now + Duration::hours(AUTO_BAN_HOURS);
            entry.banned = true;
            entry.auto_banned = true;
            entry.banned_at = Some(now);
            entry.ban_until = Some(until);
            self.save_locked(&entries);
            return (true, Some(until));
        }

        self.save_locked(&entries);
        (false, None)
    }

    /// Manually ban `ip`, permanently. Returns true when state changed.
    pub fn ban(&self, ip: &str) -> bool {
        if ip.is_empty() {
            return false;
        }
        let now = self.now();
        let mut entries = self.entries.lock();

        if !entries.contains_key(ip) {
            entries.insert(
                ip.to_string(),
                SuspiciousIp {
                    ip: ip.to_string(),
                    reason: "manual ban".to_string(),
                    count: 1,
                    first_seen: now,
                    last_seen: now,
                    banned: true,
                    banned_at: Some(now),
                    ban_until: None,
                    auto_banned: false,
                    window_start: None,
                    window_count: 0,
                },
            );
            self.save_locked(&entries);
            return true;
        }
        let Some(entry) = entries.get_mut(ip) else {
            return false;
        };

        // Already permanently and manually banned: nothing to change.
        if entry.banned && !entry.auto_banned && entry.ban_until.is_none() {
            return false;
        }
        if !entry.banned {
            entry.banned_at = Some(now);
        }
        entry.banned = true;
        entry.auto_banned = false;
        entry.ban_until = None;
        self.save_locked(&entries);
        true
    }

    /// Lift a ban, keeping the suspicious counters. Returns true when state
    /// changed.
    pub fn unban(&self, ip: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(ip) else {
            return false;
        };
        if !entry.banned {
            return false;
        }
        entry.clear_ban();
        self.save_locked(&entries);
        true
    }

    /// Delete an IP's record entirely. Refused while the IP is banned; the
    /// operator must unban first.
    pub fn remove(&self, ip: &str) -> bool {
        let mut entries = self.entries.lock();
        let banned = match entries.get(ip) {
            None => return false,
            Some(entry) => entry.banned,
        };
        if banned {
            return false;
        }
        entries.remove(ip);
        self.save_locked(&entries);
        true
    }

    /// Value copies of every record: unbanned entries first, then by count
    /// descending, ties by most recent activity.
    pub fn list(&self) -> Vec<SuspiciousIp> {
        let entries = self.entries.lock();
        let mut out: Vec<SuspiciousIp> = entries.values().cloned().collect();
        out.sort_by(|a, b| {
            a.banned
                .cmp(&b.banned)
                .then_with(|| b.count.cmp(&a.count))
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        out
    }

    /// The subset of records banned by the sliding-window detector.
    pub fn auto_banned_list(&self) -> Vec<SuspiciousIp> {
        self.list()
            .into_iter()
            .filter(|e| e.banned && e.auto_banned)
            .collect()
    }

    fn save_locked(&self, entries: &HashMap<String, SuspiciousIp>) {
        let doc = PersistedReputation {
            entries: entries.clone(),
        };
        if let Err(err) = write_json_file(&self.path, &doc) {
            warn!("failed to persist ip reputation to {:?}: {err}", self.path);
        }
    }
}

fn load_entries(path: &Path) -> HashMap<String, SuspiciousIp> {
    let data = match std::fs::read(path) {
        Ok(data) if !data.is_empty() => data,
        _ => return HashMap::new(),
    };
    match serde_json::from_slice::<PersistedReputation>(&data) {
        Ok(parsed) => parsed.entries,
        Err(err) => {
            debug!("ignoring unreadable ip reputation file {path:?}: {err}");
            HashMap::new()
        }
    }
}

/// Whole-document rewrite via a temp file so a crash mid-write never leaves
/// a truncated state file behind.
pub(crate) fn write_json_file<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Adjustable clock shared between the test and the store.
    #[derive(Clone)]
    struct TestClock(Arc<Mutex<DateTime<Utc>>>);

    impl TestClock {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(
                "2026-01-01T00:00:00Z".parse().unwrap(),
            )))
        }

        fn advance(&self, d: Duration) {
            let mut t = self.0.lock();
            *t = *t + d;
        }

        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }

        fn as_clock(&self) -> Clock {
            let inner = self.clone();
            Arc::new(move || inner.now())
        }
    }

    fn store() -> (ReputationStore, TestClock, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let clock = TestClock::new();
        let store = ReputationStore::with_clock(
            dir.path().join("ip_reputation.json"),
            clock.as_clock(),
        );
        (store, clock, dir)
    }

    #[test]
    fn first_mark_creates_record() {
        let (store, _, _dir) = store();
        let (banned, until) = store.mark_suspicious("203.0.113.5", "unknown host");
        assert!(!banned);
        assert!(until.is_none());

        let list = store.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].ip, "203.0.113.5");
        assert_eq!(list[0].reason, "unknown host");
        assert_eq!(list[0].count, 1);
        assert!(!list[0].banned);
    }

    #[test]
    fn count_is_monotonic_and_reason_updates_only_when_non_empty() {
        let (store, _, _dir) = store();
        store.mark_suspicious("1.2.3.4", "first");
        store.mark_suspicious("1.2.3.4", "");
        store.mark_suspicious("1.2.3.4", "second");

        let entry = &store.list()[0];
        assert_eq!(entry.count, 3);
        assert_eq!(entry.reason, "second");
    }

    #[test]
    fn ten_marks_in_window_auto_ban_exactly_once() {
        let (store, clock, _dir) = store();
        let ip = "203.0.113.9";

        let mut transitions = 0;
        for _ in 0..9 {
            clock.advance(Duration::seconds(3));
            let (banned, _) = store.mark_suspicious(ip, "suspicious path probe");
            assert!(!banned);
        }
        clock.advance(Duration::seconds(3));
        let (banned, until) = store.mark_suspicious(ip, "suspicious path probe");
        assert!(banned);
        transitions += 1;
        assert_eq!(until, Some(clock.now() + Duration::hours(24)));
        assert!(store.is_banned(ip));

        // Further marks within the ban never produce a second transition.
        for _ in 0..5 {
            let (again, _) = store.mark_suspicious(ip, "suspicious path probe");
            assert!(!again);
        }
        assert_eq!(transitions, 1);

        let entry = &store.auto_banned_list()[0];
        assert!(entry.auto_banned);
        assert_eq!(entry.banned_at, Some(entry.ban_until.unwrap() - Duration::hours(24)));
    }

    #[test]
    fn slow_marks_never_cross_the_threshold() {
        let (store, clock, _dir) = store();
        for _ in 0..30 {
            clock.advance(Duration::seconds(SUSPICION_WINDOW_SECS + 1));
            let (banned, _) = store.mark_suspicious("9.9.9.9", "probe");
            assert!(!banned);
        }
        assert!(!store.is_banned("9.9.9.9"));
        let entry = &store.list()[0];
        assert_eq!(entry.count, 30);
        assert_eq!(entry.window_count, 1);
    }

    #[test]
    fn timed_ban_expires_lazily_and_keeps_counters() {
        let (store, clock, _dir) = store();
        let ip = "203.0.113.9";
        for _ in 0..10 {
            store.mark_suspicious(ip, "probe");
        }
        assert!(store.is_banned(ip));

        clock.advance(Duration::hours(25));
        assert!(!store.is_banned(ip));

        let entry = &store.list()[0];
        assert!(!entry.banned);
        assert!(!entry.auto_banned);
        assert!(entry.banned_at.is_none());
        assert!(entry.ban_until.is_none());
        assert_eq!(entry.count, 10);
    }

    #[test]
    fn manual_ban_is_permanent_and_idempotent() {
        let (store, clock, _dir) = store();
        assert!(store.ban("9.8.7.6"));
        assert!(!store.ban("9.8.7.6"));
        clock.advance(Duration::days(365));
        assert!(store.is_banned("9.8.7.6"));

        let entry = &store.list()[0];
        assert_eq!(entry.reason, "manual ban");
        assert!(entry.ban_until.is_none());
        assert!(!entry.auto_banned);
    }

    #[test]
    fn manual_ban_overrides_auto_ban() {
        let (store, clock, _dir) = store();
        let ip = "5.5.5.5";
        for _ in 0..10 {
            store.mark_suspicious(ip, "probe");
        }
        assert!(store.list()[0].auto_banned);

        // Escalating to a manual ban clears the deadline.
        assert!(store.ban(ip));
        let entry = &store.list()[0];
        assert!(entry.banned);
        assert!(!entry.auto_banned);
        assert!(entry.ban_until.is_none());

        clock.advance(Duration::hours(48));
        assert!(store.is_banned(ip));
    }

    #[test]
    fn ban_unban_ban_law() {
        let (store, _, _dir) = store();
        assert!(store.ban("9.8.7.6"));
        assert!(store.unban("9.8.7.6"));
        assert!(!store.is_banned("9.8.7.6"));
        assert!(!store.unban("9.8.7.6"));
        assert!(store.ban("9.8.7.6"));

        let entry = &store.list()[0];
        assert!(entry.banned);
        assert!(!entry.auto_banned);
        assert!(entry.ban_until.is_none());
    }

    #[test]
    fn remove_refused_while_banned() {
        let (store, _, _dir) = store();
        store.ban("9.8.7.6");
        assert!(!store.remove("9.8.7.6"));
        assert_eq!(store.list().len(), 1);

        store.unban("9.8.7.6");
        assert!(store.remove("9.8.7.6"));
        assert!(store.list().is_empty());
        assert!(!store.remove("9.8.7.6"));
    }

    #[test]
    fn list_orders_unbanned_first_then_count_then_recency() {
        let (store, clock, _dir) = store();
        store.mark_suspicious("1.1.1.1", "a");
        store.mark_suspicious("2.2.2.2", "b");
        store.mark_suspicious("2.2.2.2", "b");
        clock.advance(Duration::seconds(200));
        store.mark_suspicious("3.3.3.3", "c");
        store.ban("4.4.4.4");

        let order: Vec<String> = store.list().into_iter().map(|e| e.ip).collect();
        // 2.2.2.2 has the highest count; 3.3.3.3 is more recent than 1.1.1.1;
        // the banned entry sorts last.
        assert_eq!(order, vec!["2.2.2.2", "3.3.3.3", "1.1.1.1", "4.4.4.4"]);
    }

    #[test]
    fn expired_ban_state_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ip_reputation.json");
        let clock = TestClock::new();

        let store = ReputationStore::with_clock(&path, clock.as_clock());
        for _ in 0..10 {
            store.mark_suspicious("7.7.7.7", "probe");
        }
        clock.advance(Duration::hours(25));
        assert!(!store.is_banned("7.7.7.7"));

        let reloaded = ReputationStore::with_clock(&path, clock.as_clock());
        let entry = &reloaded.list()[0];
        assert!(!entry.banned);
        assert_eq!(entry.count, 10);
    }

    #[test]
    fn unreadable_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ip_reputation.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = ReputationStore::new(&path);
        assert!(store.list().is_empty());
    }
}
