//! Telemetry aggregator
//!
//! Rolling request samples per host, per-country counters and system gauges
//! (memory, CPU, disks, SSH sessions), composed into the one JSON snapshot
//! the operator surface serves. The dispatcher records a request only when
//! it actually forwards; gate rejections never count.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use sysinfo::{Disks, System};

use crate::reputation::ReputationStore;

/// How far back request samples are kept and charted.
const REQUEST_HORIZON_HOURS: i64 = 24;

/// Gauge samples kept per series.
const GAUGE_HISTORY: usize = 1000;

/// Interval between system gauge collections.
const COLLECT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct RequestSample {
    time: DateTime<Utc>,
    host: String,
}

#[derive(Debug, Clone, Serialize)]
struct MemorySample {
    time: DateTime<Utc>,
    used_mb: u64,
    percent: f64,
}

#[derive(Debug, Clone, Serialize)]
struct CpuSample {
    time: DateTime<Utc>,
    percent: f64,
}

/// One mounted filesystem's usage.
#[derive(Debug, Clone, Serialize)]
pub struct DiskUsage {
    pub mount: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub percent: f64,
}

/// In-memory telemetry state.
pub struct Stats {
    requests: Mutex<Vec<RequestSample>>,
    countries: Mutex<HashMap<String, u64>>,
    memory: Mutex<Vec<MemorySample>>,
    cpu: Mutex<Vec<CpuSample>>,
    disks: RwLock<Vec<DiskUsage>>,
    ssh_sessions: AtomicU32,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::with_capacity(10_000)),
            countries: Mutex::new(HashMap::new()),
            memory: Mutex::new(Vec::with_capacity(GAUGE_HISTORY)),
            cpu: Mutex::new(Vec::with_capacity(GAUGE_HISTORY)),
            disks: RwLock::new(Vec::new()),
            ssh_sessions: AtomicU32::new(0),
        }
    }

    /// Record one forwarded request with its attributed country.
    pub fn add_request(&self, host: &str, country: &str) {
        let now = Utc::now();
        let horizon = now - ChronoDuration::hours(REQUEST_HORIZON_HOURS);

        let mut requests = self.requests.lock();
        requests.push(RequestSample {
            time: now,
            host: host.to_string(),
        });
        if requests.len() % 1024 == 0 {
            requests.retain(|sample| sample.time > horizon);
        }
        drop(requests);

        *self
            .countries
            .lock()
            .entry(country.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_memory(&self, used_mb: u64, percent: f64) {
        let mut memory = self.memory.lock();
        memory.push(MemorySample {
            time: Utc::now(),
            used_mb,
            percent,
        });
        if memory.len() > GAUGE_HISTORY {
            let excess = memory.len() - GAUGE_HISTORY;
            memory.drain(..excess);
        }
    }

    pub fn record_cpu(&self, percent: f64) {
        let mut cpu = self.cpu.lock();
        cpu.push(CpuSample {
            time: Utc::now(),
            percent,
        });
        if cpu.len() > GAUGE_HISTORY {
            let excess = cpu.len() - GAUGE_HISTORY;
            cpu.drain(..excess);
        }
    }

    pub fn set_disks(&self, disks: Vec<DiskUsage>) {
        *self.disks.write() = disks;
    }

    /// Fed by an external session counter; purely a pass-through gauge.
    pub fn set_ssh_sessions(&self, sessions: u32) {
        self.ssh_sessions.store(sessions, Ordering::Relaxed);
    }

    /// Hourly per-host request buckets for the last 24 hours, shaped for the
    /// operator dashboard chart.
    pub fn request_chart_data(&self) -> serde_json::Value {
        let now = Utc::now();
        let horizon = now - ChronoDuration::hours(REQUEST_HORIZON_HOURS);

        let mut per_host: HashMap<String, [u64; 24]> = HashMap::new();
        let mut hosts: Vec<String> = Vec::new();
        {
            let requests = self.requests.lock();
            for sample in requests.iter().filter(|s| s.time > horizon) {
                let buckets = per_host.entry(sample.host.clone()).or_insert_with(|| {
                    hosts.push(sample.host.clone());
                    [0; 24]
                });
                buckets[sample.time.hour() as usize] += 1;
            }
        }

        let current_hour = now.hour() as i64;
        let hour_at = |i: i64| ((current_hour - (23 - i)).rem_euclid(24)) as usize;

        let labels: Vec<String> = (0..24).map(|i| format!("{:02}:00", hour_at(i))).collect();
        let datasets: Vec<serde_json::Value> = hosts
            .iter()
            .map(|host| {
                let buckets = &per_host[host];
                let data: Vec<u64> = (0..24).map(|i| buckets[hour_at(i)]).collect();
                json!({ "label": host, "data": data })
            })
            .collect();

        json!({ "labels": labels, "datasets": datasets })
    }

    /// Per-country request counts, most active first.
    pub fn country_rows(&self) -> Vec<serde_json::Value> {
        let countries = self.countries.lock();
        let mut rows: Vec<(String, u64)> =
            countries.iter().map(|(c, n)| (c.clone(), *n)).collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        rows.into_iter()
            .map(|(code, count)| json!({ "code": code, "count": count }))
            .collect()
    }

    /// The operator snapshot: current metrics plus the reputation list.
    pub fn snapshot(&self, reputation: &ReputationStore) -> serde_json::Value {
        let memory = self.memory.lock().clone();
        let cpu = self.cpu.lock().clone();
        let disks = self.disks.read().clone();

        json!({
            "requests": self.request_chart_data(),
            "memory": memory,
            "cpu": cpu,
            "disks": disks,
            "countries": self.country_rows(),
            "ssh": self.ssh_sessions.load(Ordering::Relaxed),
            "suspicious": reputation.list(),
        })
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Background loop feeding the system gauges.
pub async fn run_collector(stats: Arc<Stats>) {
    let mut sys = System::new();
    let mut interval = tokio::time::interval(COLLECT_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        sys.refresh_memory();
        sys.refresh_cpu_usage();

        let total = sys.total_memory();
        let used = sys.used_memory();
        let percent = if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        stats.record_memory(used / 1024 / 1024, percent);
        stats.record_cpu(f64::from(sys.global_cpu_info().cpu_usage()));

        let disks = Disks::new_with_refreshed_list();
        let usage: Vec<DiskUsage> = disks
            .iter()
            .map(|disk| {
                let total = disk.total_space();
                let used = total.saturating_sub(disk.available_space());
                DiskUsage {
                    mount: disk.mount_point().to_string_lossy().into_owned(),
                    total_gb: total as f64 / 1e9,
                    used_gb: used as f64 / 1e9,
                    percent: if total > 0 {
                        used as f64 / total as f64 * 100.0
                    } else {
                        0.0
                    },
                }
            })
            .collect();
        stats.set_disks(usage);
    }
}
