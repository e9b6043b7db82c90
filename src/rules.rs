//! Routing rule store
//!
//! Maps request hosts to internal backend targets, carries the global and
//! per-rule maintenance flags, and doubles as the admission policy for TLS
//! issuance (a certificate may only be requested for a host that has a
//! rule). State persists as one JSON document rewritten on every mutation.
//!
//! Two fields never persist: `service_down`, maintained by the background
//! health probe, and `last_access`, stamped by the dispatcher's lookup.
//! Both are atomics updated under the read lock; `last_access` is a
//! last-writer-wins timestamp and taking the write lock for it would
//! serialize the hot lookup path for no benefit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::reputation::write_json_file;

/// Interval between health-probe sweeps.
const PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Hard cap on one backend dial.
const PROBE_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

struct RuleEntry {
    target: String,
    maintenance: bool,
    service_down: AtomicBool,
    /// Epoch milliseconds of the last dispatch lookup; 0 = never.
    last_access: AtomicI64,
}

impl RuleEntry {
    fn new(target: String, maintenance: bool) -> Self {
        Self {
            target,
            maintenance,
            service_down: AtomicBool::new(false),
            last_access: AtomicI64::new(0),
        }
    }
}

/// Value copy of one rule, as handed to readers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSnapshot {
    pub host: String,
    pub target: String,
    pub maintenance: bool,
    pub service_down: bool,
    pub last_access: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRule {
    target: String,
    #[serde(default)]
    maintenance: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedRules {
    #[serde(default)]
    rules: HashMap<String, PersistedRule>,
    #[serde(default)]
    maintenance_mode: bool,
}

struct Inner {
    rules: HashMap<String, RuleEntry>,
    maintenance_mode: bool,
}

/// Unknown host refused by the TLS admission policy.
#[derive(Debug)]
pub struct HostNotAllowed(pub String);

impl std::fmt::Display for HostNotAllowed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "host {:?} not configured", self.0)
    }
}

impl std::error::Error for HostNotAllowed {}

/// Durable host→target routing table.
pub struct RuleStore {
    inner: RwLock<Inner>,
    path: PathBuf,
}

impl RuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let persisted = load_rules(&path);
        let rules = persisted
            .rules
            .into_iter()
            .map(|(host, rule)| (host, RuleEntry::new(rule.target, rule.maintenance)))
            .collect();
        Self {
            inner: RwLock::new(Inner {
                rules,
                maintenance_mode: persisted.maintenance_mode,
            }),
            path,
        }
    }

    /// Insert or update a rule. Empty hosts or targets are never persisted.
    pub fn add(&self, host: &str, target: &str) {
        if host.is_empty() || target.is_empty() {
            warn!("refusing to add routing rule with empty host or target");
            return;
        }
        let mut inner = self.inner.write();
        let maintenance = inner
            .rules
            .get(host)
            .map(|rule| rule.maintenance)
            .unwrap_or(false);
        inner
            .rules
            .insert(host.to_string(), RuleEntry::new(target.to_string(), maintenance));
        self.save_locked(&inner);
    }

    pub fn remove(&self, host: &str) {
        let mut inner = self.inner.write();
        if inner.rules.remove(host).is_some() {
            self.save_locked(&inner);
        }
    }

    /// Target for `host`, stamping the rule's last access time.
    pub fn get(&self, host: &str) -> Option<String> {
        let inner = self.inner.read();
        let rule = inner.rules.get(host)?;
        rule.last_access
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        Some(rule.target.clone())
    }

    /// Copy of the full rule for `host`, stamping its last access time.
    pub fn get_rule(&self, host: &str) -> Option<RuleSnapshot> {
        let inner = self.inner.read();
        let rule = inner.rules.get(host)?;
        rule.last_access
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        Some(snapshot(host, rule))
    }

    /// Copies of every rule, ordered by host.
    pub fn all(&self) -> Vec<RuleSnapshot> {
        let inner = self.inner.read();
        let mut out: Vec<RuleSnapshot> = inner
            .rules
            .iter()
            .map(|(host, rule)| snapshot(host, rule))
            .collect();
        out.sort_by(|a, b| a.host.cmp(&b.host));
        out
    }

    pub fn maintenance_mode(&self) -> bool {
        self.inner.read().maintenance_mode
    }

    pub fn set_maintenance_mode(&self, enabled: bool) {
        let mut inner = self.inner.write();
        inner.maintenance_mode = enabled;
        self.save_locked(&inner);
    }

    /// Toggle maintenance for one rule. Returns false for unknown hosts.
    pub fn set_rule_maintenance(&self, host: &str, enabled: bool) -> bool {
        let mut inner = self.inner.write();
        let Some(rule) = inner.rules.get_mut(host) else {
            return false;
        };
        rule.maintenance = enabled;
        self.save_locked(&inner);
        true
    }

    /// TLS admission callback: a certificate may be issued for `host` iff a
    /// rule for it exists. This is the only rejection source for issuance.
    pub fn host_policy(&self, host: &str) -> Result<(), HostNotAllowed> {
        if self.inner.read().rules.contains_key(host) {
            Ok(())
        } else {
            Err(HostNotAllowed(host.to_string()))
        }
    }

    fn set_service_down(&self, host: &str, down: bool) {
        let inner = self.inner.read();
        if let Some(rule) = inner.rules.get(host) {
            rule.service_down.store(down, Ordering::Relaxed);
        }
    }

    fn save_locked(&self, inner: &Inner) {
        let doc = PersistedRules {
            rules: inner
                .rules
                .iter()
                .map(|(host, rule)| {
                    (
                        host.clone(),
                        PersistedRule {
                            target: rule.target.clone(),
                            maintenance: rule.maintenance,
                        },
                    )
                })
                .collect(),
            maintenance_mode: inner.maintenance_mode,
        };
        if let Err(err) = write_json_file(&self.path, &doc) {
            warn!("failed to persist routing rules to {:?}: {err}", self.path);
        }
    }
}

fn snapshot(host: &str, rule: &RuleEntry) -> RuleSnapshot {
    let accessed = rule.last_access.load(Ordering::Relaxed);
    RuleSnapshot {
        host: host.to_string(),
        target: rule.target.clone(),
        maintenance: rule.maintenance,
        service_down: rule.service_down.load(Ordering::Relaxed),
        last_access: (accessed > 0).then(|| DateTime::from_timestamp_millis(accessed)).flatten(),
    }
}

fn load_rules(path: &Path) -> PersistedRules {
    let data = match std::fs::read(path) {
        Ok(data) if !data.is_empty() => data,
        _ => return PersistedRules::default(),
    };
    match serde_json::from_slice(&data) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("ignoring unreadable rules file {path:?}: {err}");
            PersistedRules::default()
        }
    }
}

/// Dialable `host[:port]` for a rule target: scheme stripped, any path
/// dropped, port 80 assumed when absent.
pub(crate) fn probe_addr(target: &str) -> Option<String> {
    let stripped = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
        .unwrap_or(target);
    let host_port = stripped.split('/').next()?.trim();
    if host_port.is_empty() {
        return None;
    }
    if host_port.contains(':') {
        Some(host_port.to_string())
    } else {
        Some(format!("{host_port}:80"))
    }
}

/// Probe every rule's target once and flag unreachable backends.
pub async fn probe_once(store: &RuleStore) {
    let targets: Vec<(String, String)> = store
        .all()
        .into_iter()
        .map(|rule| (rule.host, rule.target))
        .collect();

    for (host, target) in targets {
        let down = match probe_addr(&target) {
            Some(addr) => {
                match tokio::time::timeout(PROBE_DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
                    Ok(Ok(_)) => false,
                    Ok(Err(err)) => {
                        debug!("health probe for {host} ({addr}) failed: {err}");
                        true
                    }
                    Err(_) => {
                        debug!("health probe for {host} ({addr}) timed out");
                        true
                    }
                }
            }
            None => {
                debug!("health probe for {host}: target {target:?} not dialable");
                true
            }
        };
        store.set_service_down(&host, down);
    }
}

/// Background loop marking each rule's backend reachable or down.
pub async fn run_health_probes(store: Arc<RuleStore>) {
    let mut interval = tokio::time::interval(PROBE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        probe_once(&store).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (RuleStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (RuleStore::new(dir.path().join("rules.json")), dir)
    }

    #[test]
    fn add_and_get() {
        let (store, _dir) = store();
        store.add("a.test", "127.0.0.1:9000");
        assert_eq!(store.get("a.test"), Some("127.0.0.1:9000".to_string()));
        assert_eq!(store.get("missing.test"), None);
    }

    #[test]
    fn persisted_state_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rules.json");

        let store = RuleStore::new(&path);
        store.add("a.test", "127.0.0.1:9000");
        store.add("b.test", "127.0.0.1:9001");
        store.set_rule_maintenance("b.test", true);
        store.set_maintenance_mode(true);

        let reloaded = RuleStore::new(&path);
        assert!(reloaded.maintenance_mode());
        let rules = reloaded.all();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].host, "a.test");
        assert!(!rules[0].maintenance);
        assert!(rules[1].maintenance);
        // Transient fields never persist.
        assert!(!rules[0].service_down);
        assert!(rules[0].last_access.is_none());
    }

    #[test]
    fn add_then_remove_is_a_noop_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rules.json");

        let store = RuleStore::new(&path);
        store.add("a.test", "127.0.0.1:9000");
        store.remove("a.test");

        let reloaded = RuleStore::new(&path);
        assert!(reloaded.all().is_empty());
        assert!(!reloaded.maintenance_mode());
    }

    #[test]
    fn re_add_keeps_maintenance_flag() {
        let (store, _dir) = store();
        store.add("a.test", "127.0.0.1:9000");
        store.set_rule_maintenance("a.test", true);
        store.add("a.test", "127.0.0.1:9999");

        let rule = store.get_rule("a.test").unwrap();
        assert_eq!(rule.target, "127.0.0.1:9999");
        assert!(rule.maintenance);
    }

    #[test]
    fn unreadable_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, b"][").unwrap();

        let store = RuleStore::new(&path);
        assert!(store.all().is_empty());
        assert!(!store.maintenance_mode());
    }

    #[test]
    fn host_policy_admits_only_known_hosts() {
        let (store, _dir) = store();
        store.add("a.test", "127.0.0.1:9000");
        assert!(store.host_policy("a.test").is_ok());
        assert!(store.host_policy("evil.test").is_err());
    }

    #[test]
    fn get_stamps_last_access() {
        let (store, _dir) = store();
        store.add("a.test", "127.0.0.1:9000");
        assert!(store.all()[0].last_access.is_none());

        store.get("a.test");
        assert!(store.all()[0].last_access.is_some());
    }

    #[test]
    fn empty_host_or_target_rejected() {
        let (store, _dir) = store();
        store.add("", "127.0.0.1:9000");
        store.add("a.test", "");
        assert!(store.all().is_empty());
    }

    #[test]
    fn probe_addr_parsing() {
        assert_eq!(probe_addr("127.0.0.1:9000").unwrap(), "127.0.0.1:9000");
        assert_eq!(probe_addr("backend.internal").unwrap(), "backend.internal:80");
        assert_eq!(probe_addr("http://10.0.0.2:8080").unwrap(), "10.0.0.2:8080");
        assert_eq!(probe_addr("https://app.local/api").unwrap(), "app.local:80");
        assert_eq!(probe_addr("http://app.local/api/v2").unwrap(), "app.local:80");
        assert!(probe_addr("").is_none());
        assert!(probe_addr("http://").is_none());
    }

    #[tokio::test]
    async fn probe_marks_dead_and_live_backends() {
        let (store, _dir) = store();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        store.add("live.test", &live.to_string());
        // Port 9 is the discard port; nothing listens there in the test env.
        store.add("dead.test", "127.0.0.1:9");

        probe_once(&store).await;

        assert!(!store.get_rule("live.test").unwrap().service_down);
        assert!(store.get_rule("dead.test").unwrap().service_down);
    }
}
