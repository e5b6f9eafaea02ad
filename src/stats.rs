//! Stats & observability (§4.11): lock-free response-size counters plus a
//! periodic logger reporting cache size and process RSS.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::info;

use crate::disk::DiskTier;
use crate::ram::RamTier;

/// Response-size counters updated via atomic CAS loops — no locks, per §5
/// "Stats counters are lock-free atomics".
pub struct Stats {
    count: AtomicU64,
    total_bytes: AtomicU64,
    min_bytes: AtomicU64,
    max_bytes: AtomicU64,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            min_bytes: AtomicU64::new(u64::MAX),
            max_bytes: AtomicU64::new(0),
        }
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one emitted 2xx response body length.
    pub fn record(&self, body_len: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(body_len, Ordering::Relaxed);
        cas_min(&self.min_bytes, body_len);
        cas_max(&self.max_bytes, body_len);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_bytes.load(Ordering::Relaxed);
        let min = self.min_bytes.load(Ordering::Relaxed);
        StatsSnapshot {
            count,
            min: if min == u64::MAX { 0 } else { min },
            max: self.max_bytes.load(Ordering::Relaxed),
            avg: if count == 0 { 0.0 } else { total as f64 / count as f64 },
        }
    }
}

fn cas_min(cell: &AtomicU64, value: u64) {
    let mut current = cell.load(Ordering::Relaxed);
    while value < current {
        match cell.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

fn cas_max(cell: &AtomicU64, value: u64) {
    let mut current = cell.load(Ordering::Relaxed);
    while value > current {
        match cell.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub avg: f64,
}

/// Best-effort resident set size, read from `/proc/self/statm` (Linux).
/// Returns `None` off Linux or if the read fails — this is explicitly a
/// best-effort OS read per §4.11.
pub fn read_rss_bytes() -> Option<u64> {
    let statm = fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = 4096u64;
    Some(pages * page_size)
}

/// Best-effort smaps_rollup breakdown (Linux only); returned verbatim as a
/// string for the log line since its format is OS-defined and not parsed.
pub fn read_smaps_rollup() -> Option<String> {
    fs::read_to_string("/proc/self/smaps_rollup").ok()
}

/// Emits the periodic stats log line (§4.11): cached key count (union of
/// RAM and disk keys), RAM total, disk total, process RSS, optional
/// smaps_rollup, response-size min/avg/max.
pub fn log_periodic_stats(ram: &RamTier, disk: &DiskTier, stats: &Stats, include_smaps: bool) {
    let ram_keys: std::collections::HashSet<String> = ram.keys().into_iter().collect();
    let disk_keys: std::collections::HashSet<String> = disk.keys().into_iter().collect();
    let key_count = ram_keys.union(&disk_keys).count();

    let snapshot = stats.snapshot();
    let rss = read_rss_bytes();

    if include_smaps {
        let smaps = read_smaps_rollup();
        info!(
            key_count,
            ram_total_bytes = ram.total_size(),
            disk_total_bytes = disk.total_size(),
            rss_bytes = ?rss,
            smaps_rollup = ?smaps,
            resp_min = snapshot.min,
            resp_avg = snapshot.avg,
            resp_max = snapshot.max,
            "cache stats"
        );
    } else {
        info!(
            key_count,
            ram_total_bytes = ram.total_size(),
            disk_total_bytes = disk.total_size(),
            rss_bytes = ?rss,
            resp_min = snapshot.min,
            resp_avg = snapshot.avg,
            resp_max = snapshot.max,
            "cache stats"
        );
    }
}

/// Spawns the periodic stats-logging task; exits when `stop` fires.
pub fn spawn_stats_task(
    ram: std::sync::Arc<RamTier>,
    disk: std::sync::Arc<DiskTier>,
    stats: std::sync::Arc<Stats>,
    every: Duration,
    include_smaps: bool,
    mut stop: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    log_periodic_stats(&ram, &disk, &stats, include_smaps);
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
