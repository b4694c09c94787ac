// src/infra/config.rs — Configuration loading (TOML)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::infra::paths;
use crate::session::log::LogLevel;

/// Server configuration snapshot. Sessions hold it behind an `Arc` and never
/// reach for a global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Upper bound for request bodies and direct uploads, in bytes.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,

    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub future_calls: FutureCallConfig,

    #[serde(default)]
    pub distributed: DistributedConfig,

    #[serde(default)]
    pub caches: CacheConfig,

    #[serde(default = "default_storages")]
    pub storage: Vec<StorageConfig>,

    #[serde(default)]
    pub passwords: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_request_size: default_max_request_size(),
            database: None,
            logging: LoggingConfig::default(),
            future_calls: FutureCallConfig::default(),
            distributed: DistributedConfig::default(),
            caches: CacheConfig::default(),
            storage: default_storages(),
            passwords: HashMap::new(),
        }
    }
}

fn default_max_request_size() -> usize {
    524_288
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file. Defaults to `<data dir>/wharf.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(paths::db_path)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_pool_size() -> usize {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub persistent_enabled: bool,
    pub console_enabled: bool,
    pub console_format: ConsoleFormat,
    /// Entries below this level are dropped when appended.
    pub log_level: LogLevel,
    pub log_all_sessions: bool,
    pub log_failed_sessions: bool,
    pub log_slow_sessions: bool,
    pub slow_session_threshold_ms: u64,
    pub log_all_queries: bool,
    pub log_slow_queries: bool,
    pub slow_query_threshold_ms: u64,
    pub log_failed_queries: bool,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            persistent_enabled: false,
            console_enabled: true,
            console_format: ConsoleFormat::Text,
            log_level: LogLevel::Info,
            log_all_sessions: false,
            log_failed_sessions: true,
            log_slow_sessions: true,
            slow_session_threshold_ms: 1_000,
            log_all_queries: false,
            log_slow_queries: true,
            slow_query_threshold_ms: 1_000,
            log_failed_queries: true,
            retention: RetentionConfig::default(),
        }
    }
}

/// Log retention. A cutoff of `None` (or `0` in TOML) disables it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: Option<u64>,
    #[serde(default = "default_max_count")]
    pub max_count: Option<u64>,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_hours: default_max_age_hours(),
            max_count: default_max_count(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl RetentionConfig {
    pub fn max_age(&self) -> Option<chrono::Duration> {
        self.max_age_hours.and_then(age_cutoff)
    }

    pub fn max_count(&self) -> Option<u64> {
        self.max_count.filter(|c| *c > 0)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// `hours` as an age cutoff. `0`, and ages too large to represent, mean no
/// cutoff.
pub fn age_cutoff(hours: u64) -> Option<chrono::Duration> {
    if hours == 0 {
        return None;
    }
    i64::try_from(hours).ok().and_then(chrono::Duration::try_hours)
}

fn default_max_age_hours() -> Option<u64> {
    Some(24 * 90)
}

fn default_max_count() -> Option<u64> {
    Some(100_000)
}

fn default_cleanup_interval_secs() -> u64 {
    86_400
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FutureCallConfig {
    /// Maximum FutureCall sessions running at once.
    pub max_concurrent: usize,
    pub scan_interval_ms: u64,
}

impl Default for FutureCallConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            scan_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Enables the `global` cache tier and global messaging.
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub local_max_entries: usize,
    pub local_prio_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_max_entries: 10_000,
            local_prio_max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Database,
    Filesystem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub id: String,
    pub kind: StorageKind,
    /// Filesystem root. Defaults to `<data dir>/storage/<id>`.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Base URL public links and upload grants are built on.
    #[serde(default = "default_public_host")]
    pub public_host: String,
    /// Key used to sign upload grants. Random per process when unset.
    #[serde(default)]
    pub upload_secret: Option<String>,
    #[serde(default)]
    pub public: bool,
}

impl StorageConfig {
    pub fn database(id: &str, public: bool) -> Self {
        Self {
            id: id.to_string(),
            kind: StorageKind::Database,
            root: None,
            public_host: default_public_host(),
            upload_secret: None,
            public,
        }
    }
}

fn default_public_host() -> String {
    "http://localhost:8080".into()
}

fn default_storages() -> Vec<StorageConfig> {
    vec![
        StorageConfig::database("public", true),
        StorageConfig::database("private", false),
    ]
}

impl ServerConfig {
    /// Load config from file, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = paths::config_file_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn storage_config(&self, id: &str) -> Option<&StorageConfig> {
        self.storage.iter().find(|s| s.id == id)
    }
}
