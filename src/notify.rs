//! Notification contract
//!
//! The dispatcher and the operator surface fire events through this trait;
//! delivery (bot transport, chat allow-listing, quiet hours) lives in the
//! notification subsystem behind it. The core defines only the event keys
//! and the firing sites.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

/// A banned IP attempted a request.
pub const EVENT_BLOCKED_IP_HIT: &str = "blocked_ip_hit";
/// A request arrived for a host with no routing rule.
pub const EVENT_UNKNOWN_HOST: &str = "unknown_host";
/// A request path matched the reconnaissance token list.
pub const EVENT_SUSPICIOUS_PROBE: &str = "suspicious_probe";
/// An operator banned an IP.
pub const EVENT_MANUAL_BAN: &str = "manual_ban";
/// An operator lifted a ban.
pub const EVENT_MANUAL_UNBAN: &str = "manual_unban";
/// An operator deleted a reputation record.
pub const EVENT_MANUAL_REMOVE: &str = "manual_remove";

/// Sink for security-relevant events.
///
/// `dedupe_key` collapses repeats of the same event within the
/// implementation's cooldown; `ban_ip` carries the IP an interactive
/// transport may offer a one-tap ban action for.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &str, dedupe_key: &str, message: &str, ban_ip: Option<&str>);
}

/// Alert text shared by all dispatcher events.
pub fn build_proxy_alert(method: &str, path: &str, host: &str, ip: &str, reason: &str) -> String {
    format!("edge alert\nreason: {reason}\nip: {ip}\nhost: {host}\nmethod: {method}\npath: {path}")
}

/// Default notifier: writes events into the log stream, deduplicating
/// repeats of the same key for one minute.
pub struct LogNotifier {
    cooldown: Duration,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl LogNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cooldown: Duration::from_secs(60),
            last_sent: Mutex::new(HashMap::new()),
        })
    }

    fn should_skip(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        let now = Instant::now();
        let mut last_sent = self.last_sent.lock();
        if let Some(last) = last_sent.get(key) {
            if now.duration_since(*last) < self.cooldown {
                return true;
            }
        }
        last_sent.insert(key.to_string(), now);
        if last_sent.len() > 5000 {
            let stale = self.cooldown * 10;
            last_sent.retain(|_, t| now.duration_since(*t) <= stale);
        }
        false
    }
}

impl Notifier for LogNotifier {
    fn notify(&self, event: &str, dedupe_key: &str, message: &str, ban_ip: Option<&str>) {
        if self.should_skip(dedupe_key) {
            return;
        }
        match ban_ip {
            Some(ip) => info!(event, ip, "{message}"),
            None => info!(event, "{message}"),
        }
    }
}

/// Notifier that records nothing; used where tests need silence.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: &str, _dedupe_key: &str, _message: &str, _ban_ip: Option<&str>) {}
}
