//! Configuration for the S3 object store proxy and the JCache plugin.
//!
//! Loading order follows the teacher's `from_file` / `from_env` / `load`
//! chain: an explicit `--config`/`JCACHE_S3_CONFIG` path wins, then a couple
//! of default file locations, then environment variables, then built-in
//! defaults.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    #[serde(default)]
    pub jcache: JCacheConfig,

    #[serde(default)]
    pub s3: S3Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            jcache: JCacheConfig::default(),
            s3: S3Config::default(),
        }
    }
}

/// JCache plugin configuration (§6 "JCache plugin configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JCacheConfig {
    /// Cache root directory.
    #[serde(default = "default_cache_dir")]
    pub cache: PathBuf,
    /// Enables the journal (byte-range) cache.
    #[serde(default = "default_true")]
    pub journal: bool,
    /// Enables the vector-read cache.
    #[serde(default = "default_true")]
    pub vector: bool,
    /// Directory prefix for the JSON stats dump at teardown.
    #[serde(default = "default_json_dir")]
    pub json: PathBuf,
    /// Suppresses the textual summary on exit when `false`.
    #[serde(default = "default_true")]
    pub summary: bool,
    /// High watermark in bytes for the cleaner; `0` disables cleaning.
    #[serde(default)]
    pub high_watermark: u64,
    /// Scan mode for the cleaner (`true`) vs. `statfs` fast mode (`false`).
    #[serde(default = "default_true")]
    pub cleaner_scan: bool,
    /// Cleaner tick interval, in seconds.
    #[serde(default = "default_cleaner_interval_secs")]
    pub cleaner_interval_secs: u64,
    /// Tolerated mtime skew (seconds) between a journal header and the
    /// remote stamp before the journal is purged. See `DESIGN.md`.
    #[serde(default = "default_mtime_skew")]
    pub mtime_skew_tolerance_secs: u64,
}

impl Default for JCacheConfig {
    fn default() -> Self {
        Self {
            cache: default_cache_dir(),
            journal: true,
            vector: true,
            json: default_json_dir(),
            summary: true,
            high_watermark: 0,
            cleaner_scan: true,
            cleaner_interval_secs: default_cleaner_interval_secs(),
            mtime_skew_tolerance_secs: default_mtime_skew(),
        }
    }
}

impl JCacheConfig {
    /// Apply `XRD_JCACHE_*` environment overrides on top of whatever was
    /// already loaded from file/defaults.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("XRD_JCACHE_CACHE") {
            self.cache = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("XRD_JCACHE_JOURNAL") {
            self.journal = v == "true";
        }
        if let Ok(v) = std::env::var("XRD_JCACHE_VECTOR") {
            self.vector = v == "true";
        }
        if let Ok(v) = std::env::var("XRD_JCACHE_JSON") {
            self.json = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("XRD_JCACHE_SUMMARY") {
            self.summary = v != "false";
        }
    }
}

/// S3 gateway configuration (§6 "S3 configuration keys"). All but `trace`
/// are mandatory per the spec; here they carry permissive defaults so the
/// proxy still boots for local development without a config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// `s3.vmp` — virtual mount point / bucket data root.
    #[serde(default = "default_vmp")]
    pub vmp: PathBuf,
    /// `s3.config` — path to the bucket/credential mapping file.
    #[serde(default)]
    pub config: Option<PathBuf>,
    /// `s3.user_map` — `⟨user_map⟩/⟨owner⟩/⟨bucket⟩` bucket-ownership records.
    #[serde(default = "default_user_map")]
    pub user_map: PathBuf,
    /// `s3.region`
    #[serde(default = "default_region")]
    pub region: String,
    /// `s3.service` (almost always `"s3"`).
    #[serde(default = "default_service")]
    pub service: String,
    /// `s3.multipart` — scratch root for in-progress multipart uploads.
    #[serde(default = "default_multipart_root")]
    pub multipart: PathBuf,
    /// `s3.trace ∈ {all,error,warning,info,debug,none}`.
    #[serde(default = "default_trace")]
    pub trace: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            vmp: default_vmp(),
            config: None,
            user_map: default_user_map(),
            region: default_region(),
            service: default_service(),
            multipart: default_multipart_root(),
            trace: default_trace(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:9000".parse().unwrap()
}

fn default_true() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./data/jcache")
}

fn default_json_dir() -> PathBuf {
    PathBuf::from("./data/jcache/stats")
}

fn default_cleaner_interval_secs() -> u64 {
    60
}

fn default_mtime_skew() -> u64 {
    1
}

fn default_vmp() -> PathBuf {
    PathBuf::from("./data/s3")
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_service() -> String {
    "s3".to_string()
}

fn default_multipart_root() -> PathBuf {
    PathBuf::from("./data/s3-multipart")
}

fn default_user_map() -> PathBuf {
    PathBuf::from("./data/s3-user-map")
}

fn default_trace() -> String {
    "info".to_string()
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let mut config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.jcache.apply_env_overrides();
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.jcache.apply_env_overrides();

        if let Ok(addr) = std::env::var("JCACHE_S3_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.listen_addr = parsed;
            }
        }
        if let Ok(v) = std::env::var("JCACHE_S3_VMP") {
            config.s3.vmp = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("JCACHE_S3_REGION") {
            config.s3.region = v;
        }
        if let Ok(v) = std::env::var("JCACHE_S3_MULTIPART") {
            config.s3.multipart = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("JCACHE_S3_USER_MAP") {
            config.s3.user_map = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("JCACHE_S3_TRACE") {
            config.s3.trace = v;
        }

        config
    }

    pub fn load() -> Self {
        if let Ok(path) = std::env::var("JCACHE_S3_CONFIG") {
            if let Ok(config) = Self::from_file(&path) {
                return config;
            }
        }
        for path in &["jcache-s3store.toml", "/etc/jcache-s3store/config.toml"] {
            if std::path::Path::new(path).exists() {
                if let Ok(config) = Self::from_file(path) {
                    return config;
                }
            }
        }
        Self::from_env()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
}
