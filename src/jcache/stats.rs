//! Process-wide atomic counters plus a JSON teardown dump (C11).
//!
//! Grounded on `examples/original_source/.../file/CacheStats.hh` for the
//! field set and the per-file vs. global `HitRate` smoothing discrepancy
//! (kept deliberately, see `DESIGN.md`).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Per-file hit/miss counters, as attached to one `CachedFile` (C5).
///
/// `hit_rate()` uses `+1` Laplace smoothing, matching the original's
/// per-file computation — this differs intentionally from
/// `Stats::global_hit_rate()`, which has no such smoothing. See
/// `DESIGN.md`'s "Open Question decisions" §1.
#[derive(Debug, Default)]
pub struct FileStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

impl FileStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        (hits + 1.0) / (hits + misses + 1.0)
    }
}

/// A single bandwidth sample (bytes served in one second), collected for
/// the `bytes_per_second` JSON array.
struct BandwidthHistogram {
    samples: Mutex<Vec<u64>>,
    current_second_bytes: AtomicU64,
    current_second_start: Mutex<Instant>,
}

impl BandwidthHistogram {
    fn new() -> Self {
        Self {
            samples: Mutex::new(Vec::new()),
            current_second_bytes: AtomicU64::new(0),
            current_second_start: Mutex::new(Instant::now()),
        }
    }

    fn record(&self, bytes: u64) {
        let mut start = self.current_second_start.lock().unwrap();
        if start.elapsed().as_secs() >= 1 {
            let flushed = self.current_second_bytes.swap(0, Ordering::Relaxed);
            self.samples.lock().unwrap().push(flushed);
            *start = Instant::now();
        }
        self.current_second_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Vec<u64> {
        let mut out = self.samples.lock().unwrap().clone();
        out.push(self.current_second_bytes.load(Ordering::Relaxed));
        out
    }
}

/// Process-wide JCache statistics, shared across every `CachedFile`.
pub struct Stats {
    app_name: String,
    pid: u32,
    start_time: SystemTime,
    start_instant: Instant,
    bytes_read: AtomicU64,
    bytes_read_v: AtomicU64,
    bytes_cached: AtomicU64,
    bytes_cached_v: AtomicU64,
    read_ops: AtomicU64,
    read_v_ops: AtomicU64,
    read_v_read_ops: AtomicU64,
    nread_files: AtomicU64,
    total_data_size: AtomicI64,
    urls: Mutex<Vec<String>>,
    bandwidth: BandwidthHistogram,
}

impl Stats {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            pid: std::process::id(),
            start_time: SystemTime::now(),
            start_instant: Instant::now(),
            bytes_read: AtomicU64::new(0),
            bytes_read_v: AtomicU64::new(0),
            bytes_cached: AtomicU64::new(0),
            bytes_cached_v: AtomicU64::new(0),
            read_ops: AtomicU64::new(0),
            read_v_ops: AtomicU64::new(0),
            read_v_read_ops: AtomicU64::new(0),
            nread_files: AtomicU64::new(0),
            total_data_size: AtomicI64::new(0),
            urls: Mutex::new(Vec::new()),
            bandwidth: BandwidthHistogram::new(),
        }
    }

    pub fn record_read(&self, bytes: u64, from_cache: bool) {
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        if from_cache {
            self.bytes_cached.fetch_add(bytes, Ordering::Relaxed);
        }
        self.bandwidth.record(bytes);
    }

    pub fn record_vector_read(&self, bytes: u64, chunk_count: u64, from_cache: bool) {
        self.read_v_ops.fetch_add(1, Ordering::Relaxed);
        self.read_v_read_ops.fetch_add(chunk_count, Ordering::Relaxed);
        self.bytes_read_v.fetch_add(bytes, Ordering::Relaxed);
        if from_cache {
            self.bytes_cached_v.fetch_add(bytes, Ordering::Relaxed);
        }
        self.bandwidth.record(bytes);
    }

    pub fn record_file_opened(&self, url: &str, size: i64) {
        self.nread_files.fetch_add(1, Ordering::Relaxed);
        self.total_data_size.fetch_add(size, Ordering::Relaxed);
        self.urls.lock().unwrap().push(url.to_string());
    }

    /// Global hit rate across every recorded read, with no smoothing —
    /// deliberately inconsistent with `FileStats::hit_rate`'s `+1`
    /// smoothing. See `DESIGN.md`.
    pub fn global_hit_rate(&self) -> f64 {
        let cached = self.bytes_cached.load(Ordering::Relaxed) as f64;
        let read = self.bytes_read.load(Ordering::Relaxed) as f64;
        if read == 0.0 {
            0.0
        } else {
            cached / read
        }
    }

    pub fn dump(&self) -> StatsDump {
        StatsDump {
            appname: self.app_name.clone(),
            pid: self.pid,
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_read_v: self.bytes_read_v.load(Ordering::Relaxed),
            bytes_cached: self.bytes_cached.load(Ordering::Relaxed),
            bytes_cached_v: self.bytes_cached_v.load(Ordering::Relaxed),
            read_ops: self.read_ops.load(Ordering::Relaxed),
            read_v_ops: self.read_v_ops.load(Ordering::Relaxed),
            read_v_read_ops: self.read_v_read_ops.load(Ordering::Relaxed),
            nreadfiles: self.nread_files.load(Ordering::Relaxed),
            totaldatasize: self.total_data_size.load(Ordering::Relaxed),
            urls: self.urls.lock().unwrap().clone(),
            bytes_per_second: self.bandwidth.snapshot(),
            user_time: cpu_user_time_secs(),
            real_time: self.start_instant.elapsed().as_secs_f64(),
            sys_time: cpu_sys_time_secs(),
            start_time: self
                .start_time
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// Write the teardown JSON dump under `dir`, named `jcache-stats-<pid>.json`.
    pub fn dump_to_dir(&self, dir: &std::path::Path) -> std::io::Result<std::path::PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("jcache-stats-{}.json", self.pid));
        let json = serde_json::to_string_pretty(&self.dump())
            .expect("StatsDump serialization is infallible");
        std::fs::write(&path, json)?;
        Ok(path)
    }

    /// One-line human summary, printed on exit unless suppressed by config.
    pub fn summary_line(&self) -> String {
        let d = self.dump();
        format!(
            "jcache: {} reads ({} bytes, {:.1}% cached), {} files, uptime {:.1}s",
            d.read_ops,
            d.bytes_read,
            self.global_hit_rate() * 100.0,
            d.nreadfiles,
            d.real_time
        )
    }
}

#[derive(Debug, Serialize)]
pub struct StatsDump {
    pub appname: String,
    pub pid: u32,
    #[serde(rename = "bytesRead")]
    pub bytes_read: u64,
    #[serde(rename = "bytesReadV")]
    pub bytes_read_v: u64,
    #[serde(rename = "bytesCached")]
    pub bytes_cached: u64,
    #[serde(rename = "bytesCachedV")]
    pub bytes_cached_v: u64,
    #[serde(rename = "readOps")]
    pub read_ops: u64,
    #[serde(rename = "readVOps")]
    pub read_v_ops: u64,
    #[serde(rename = "readVreadOps")]
    pub read_v_read_ops: u64,
    pub nreadfiles: u64,
    pub totaldatasize: i64,
    pub urls: Vec<String>,
    pub bytes_per_second: Vec<u64>,
    #[serde(rename = "userTime")]
    pub user_time: f64,
    #[serde(rename = "realTime")]
    pub real_time: f64,
    #[serde(rename = "sysTime")]
    pub sys_time: f64,
    #[serde(rename = "startTime")]
    pub start_time: u64,
}

#[cfg(target_os = "linux")]
fn cpu_user_time_secs() -> f64 {
    read_proc_self_stat_field(13).unwrap_or(0.0) / clock_ticks_per_sec()
}

#[cfg(target_os = "linux")]
fn cpu_sys_time_secs() -> f64 {
    read_proc_self_stat_field(14).unwrap_or(0.0) / clock_ticks_per_sec()
}

#[cfg(target_os = "linux")]
fn clock_ticks_per_sec() -> f64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

#[cfg(target_os = "linux")]
fn read_proc_self_stat_field(field_index: usize) -> Option<f64> {
    let contents = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Fields after the process name (in parens, which may contain spaces)
    // are whitespace-separated; split past the closing paren.
    let after_comm = contents.rsplit_once(')')?.1;
    after_comm
        .split_whitespace()
        .nth(field_index - 2) // field 1 = pid, 2 = comm; we're past both
        .and_then(|s| s.parse::<f64>().ok())
}

#[cfg(not(target_os = "linux"))]
fn cpu_user_time_secs() -> f64 {
    0.0
}

#[cfg(not(target_os = "linux"))]
fn cpu_sys_time_secs() -> f64 {
    0.0
}
