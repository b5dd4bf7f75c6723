//! Gateway configuration.
//!
//! Settings are resolved once at startup: environment variables (`MT_*`)
//! override built-in defaults, and CLI flags override both. Nothing re-reads
//! the environment after startup.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;

/// Resolved gateway settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// HTTP bind host.
    pub host: String,
    /// HTTP bind port.
    pub port: u16,
    /// Log level passed to workers and used as the tracing default.
    pub log_level: String,
    /// Directory holding the model records catalog and the worker binary.
    pub config_dir: PathBuf,
    /// Root directory of per-pair model directories (`<from>_<to>`).
    pub model_dir: PathBuf,
    /// Path to the translation worker executable.
    pub worker_binary: PathBuf,
    /// Skip model downloads; serve only what is already on disk.
    pub offline_mode: bool,
    /// Evict a language pair's workers after this much idle time.
    pub worker_idle_timeout: Duration,
    /// Workers per language pair (effective minimum 1).
    pub workers_per_language: usize,
    /// Estimated memory footprint of one worker.
    pub worker_memory_mb: u64,
    /// Headroom that must remain free after admitting a worker.
    pub reserved_memory_mb: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let dirs = ProjectDirs::from("com", "transgate", "transgate")
            .expect("project dirs available");
        let config_dir = dirs.config_dir().to_path_buf();
        let model_dir = dirs.data_dir().join("models");
        let worker_binary = config_dir.join("bin").join("transgate-worker");

        Self {
            host: "0.0.0.0".to_string(),
            port: 8989,
            log_level: "warn".to_string(),
            config_dir,
            model_dir,
            worker_binary,
            offline_mode: false,
            worker_idle_timeout: Duration::from_secs(60),
            workers_per_language: 1,
            worker_memory_mb: 2048,
            reserved_memory_mb: 4096,
        }
    }
}

impl Settings {
    /// Load settings from the environment on top of the defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(host) = dotenvy::var("MT_HOST") {
            cfg.host = host;
        }
        if let Ok(val) = dotenvy::var("MT_PORT")
            && let Ok(port) = val.parse()
        {
            cfg.port = port;
        }
        if let Ok(level) = dotenvy::var("MT_LOG_LEVEL") {
            cfg.log_level = level;
        }
        if let Ok(dir) = dotenvy::var("MT_CONFIG_DIR") {
            cfg.config_dir = PathBuf::from(&dir);
            cfg.worker_binary = cfg.config_dir.join("bin").join("transgate-worker");
        }
        if let Ok(dir) = dotenvy::var("MT_MODEL_DIR") {
            cfg.model_dir = PathBuf::from(dir);
        }
        if let Ok(path) = dotenvy::var("MT_WORKER_BINARY") {
            cfg.worker_binary = PathBuf::from(path);
        }
        if let Ok(val) = dotenvy::var("MT_OFFLINE") {
            cfg.offline_mode = val.eq_ignore_ascii_case("true") || val == "1";
        }
        if let Ok(val) = dotenvy::var("MT_WORKER_IDLE_TIMEOUT")
            && let Ok(secs) = val.parse()
        {
            cfg.worker_idle_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = dotenvy::var("MT_WORKERS_PER_LANGUAGE")
            && let Ok(n) = val.parse()
        {
            cfg.workers_per_language = n;
        }
        if let Ok(val) = dotenvy::var("MT_WORKER_MEMORY_MB")
            && let Ok(mb) = val.parse()
        {
            cfg.worker_memory_mb = mb;
        }
        if let Ok(val) = dotenvy::var("MT_RESERVED_MEMORY_MB")
            && let Ok(mb) = val.parse()
        {
            cfg.reserved_memory_mb = mb;
        }

        cfg
    }

    /// Workers per language pair, clamped to at least one.
    pub fn effective_workers(&self) -> usize {
        self.workers_per_language.max(1)
    }
}
