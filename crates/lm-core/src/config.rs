//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from TOML and carries all
//! sub-configs. Every section defaults sensibly so an empty file parses; the
//! only required values are the source root and target base, which
//! [`Config::validate`] checks.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::Error;

/// Extensions linked by default.
pub const DEFAULT_VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "ts", "iso", "rmvb", "avi", "mov", "mpeg", "mpg", "wmv", "3gp", "asf", "m4v",
    "flv", "m2ts", "strm", "tp", "f4v",
];

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub target: TargetConfig,
    pub filter: FilterConfig,
    pub watch: WatchConfig,
    pub scan: ScanConfig,
    pub remote: RemoteConfig,
    pub queue: QueueConfig,
    pub notify: NotifyConfig,
    pub database: DatabaseConfig,
    pub snapshot: SnapshotConfig,
    pub server: ServerConfig,
    pub health: HealthConfig,
}

impl Config {
    /// Deserialize a `Config` from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Apply `LINKMIRROR_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("LINKMIRROR_SOURCE_ROOT") {
            self.source.root = PathBuf::from(v);
        }
        if let Some(v) = get("LINKMIRROR_TARGET_BASE") {
            self.target.base = PathBuf::from(v);
        }
        if let Some(v) = get("LINKMIRROR_EMBY_URL") {
            self.notify.server_url = Some(v);
            self.notify.enabled = true;
        }
        if let Some(v) = get("LINKMIRROR_EMBY_API_KEY") {
            self.notify.api_key = Some(v);
        }
        if let Some(v) = get("LINKMIRROR_DB_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = get("LINKMIRROR_DRIVE_FOLDER_ID") {
            self.remote.folder_id = Some(v);
        }
    }

    /// Check the configuration.
    ///
    /// Fatal problems are returned as [`Error::Validation`]; the `Ok` value
    /// carries non-fatal warnings.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if self.source.root.as_os_str().is_empty() {
            return invalid("source.root is required");
        }
        if self.target.base.as_os_str().is_empty() {
            return invalid("target.base is required");
        }
        if self.target.base.starts_with(&self.source.root) {
            return invalid(format!(
                "target.base {} must not be inside source.root {}",
                self.target.base.display(),
                self.source.root.display()
            ));
        }
        if !(1..=16).contains(&self.queue.max_workers) {
            return invalid(format!(
                "queue.max_workers must be between 1 and 16 (got {})",
                self.queue.max_workers
            ));
        }
        if self.queue.max_depth == 0 {
            return invalid("queue.max_depth must be at least 1");
        }
        self.queue.retry.validate("queue.retry").map_err(Error::Validation)?;
        self.notify.retry.validate("notify.retry").map_err(Error::Validation)?;
        self.remote.retry.validate("remote.retry").map_err(Error::Validation)?;

        if self.remote.enabled {
            if self.remote.poll_interval_secs < 60 {
                return invalid(format!(
                    "remote.poll_interval_secs must be at least 60 (got {})",
                    self.remote.poll_interval_secs
                ));
            }
            if self.remote.folder_id.is_none() {
                return invalid("remote.folder_id is required when remote polling is enabled");
            }
            if self.remote.access_token.is_none() && self.remote.token_path.is_none() {
                warnings.push(
                    "remote is enabled but neither access_token nor token_path is set".into(),
                );
            }
        }

        if self.notify.enabled {
            if self.notify.server_url.as_deref().unwrap_or("").is_empty() {
                return invalid("notify.server_url is required when notifications are enabled");
            }
            if self.notify.api_key.is_none() {
                warnings.push("notify is enabled but notify.api_key is not set".into());
            }
        }
        for (i, section) in self.notify.sections.iter().enumerate() {
            if section.locations.is_empty() {
                warnings.push(format!("notify.sections[{i}] ({}) has no locations", section.id));
            }
        }

        if !(30..=86_400).contains(&self.scan.interval_secs) {
            warnings.push(format!(
                "scan.interval_secs {} is outside the usual 30..=86400 range",
                self.scan.interval_secs
            ));
        }
        if !self.watch.enabled && !self.scan.enabled && !self.remote.enabled {
            warnings.push("all change sources are disabled; nothing will be synchronized".into());
        }
        if self.server.enabled && self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }

        Ok(warnings)
    }

    /// Where database backups are written.
    pub fn backup_dir(&self) -> PathBuf {
        match &self.database.backup_dir {
            Some(dir) => dir.clone(),
            None => self
                .database
                .path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        }
    }
}

fn invalid<T>(message: impl Into<String>) -> Result<T> {
    Err(Error::Validation(message.into()))
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// The mirrored (mounted) tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub root: PathBuf,
    /// File that must exist under the root for it to count as mounted.
    pub sentinel: Option<String>,
    /// Require the root to be on a different device than its parent.
    pub require_mountpoint: bool,
}

/// Where symlinks are created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub base: PathBuf,
    pub overwrite_existing: bool,
}

/// Which paths are tracked and which get links.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub extensions: Vec<String>,
    pub skip_dir_names: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            extensions: DEFAULT_VIDEO_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            skip_dir_names: vec!["BDMV".into()],
        }
    }
}

/// Local filesystem watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub enabled: bool,
    pub settle_time_secs: u64,
    /// Capacity of the bridge between the notify callback and the watcher task.
    pub channel_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settle_time_secs: 5,
            channel_capacity: 1024,
        }
    }
}

/// Periodic full scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub run_on_start: bool,
    /// Also walk the target tree for orphaned or missing links.
    pub verify_target: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            run_on_start: true,
            verify_target: true,
        }
    }
}

/// Remote change feed (Google Drive changes API).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub api_base: String,
    /// Drive folder that corresponds to `source.root`.
    pub folder_id: Option<String>,
    pub access_token: Option<String>,
    /// File holding a bearer token, re-read on every request.
    pub token_path: Option<PathBuf>,
    pub poll_interval_secs: u64,
    pub page_size: u32,
    pub timeout_secs: u64,
    /// Reconcile a full remote listing before the first change poll.
    pub initial_listing: bool,
    pub retry: RetryPolicy,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: "https://www.googleapis.com/drive/v3".into(),
            folder_id: None,
            access_token: None,
            token_path: None,
            poll_interval_secs: 3600,
            page_size: 100,
            timeout_secs: 30,
            initial_listing: false,
            retry: RetryPolicy {
                base_delay_ms: 1_000,
                max_delay_ms: 900_000,
                max_attempts: u32::MAX,
                jitter_ratio: 0.25,
            },
        }
    }
}

/// Task queue sizing and retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_workers: usize,
    pub max_depth: usize,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_depth: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// A statically configured media-server library section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Absolute paths (as the media server sees them) covered by the section.
    pub locations: Vec<PathBuf>,
}

/// Media-server notification dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub server_url: Option<String>,
    pub api_key: Option<String>,
    pub flush_idle_secs: u64,
    pub flush_max_paths: usize,
    /// How long an incomplete rename pair is held back.
    pub rename_hold_secs: u64,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
    /// When non-empty, used instead of asking the server for its libraries.
    pub sections: Vec<SectionConfig>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: None,
            api_key: None,
            flush_idle_secs: 10,
            flush_max_paths: 500,
            rename_hold_secs: 30,
            timeout_secs: 10,
            retry: RetryPolicy {
                base_delay_ms: 5_000,
                max_delay_ms: 60_000,
                max_attempts: 3,
                jitter_ratio: 0.1,
            },
            sections: Vec::new(),
        }
    }
}

/// Inventory database and its maintenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub backup_dir: Option<PathBuf>,
    pub backup_count: usize,
    pub backup_interval_secs: u64,
    pub vacuum_threshold_bytes: u64,
    /// Pages released per incremental-vacuum step.
    pub vacuum_step_pages: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("linkmirror.db"),
            backup_dir: None,
            backup_count: 5,
            backup_interval_secs: 86_400,
            vacuum_threshold_bytes: 104_857_600,
            vacuum_step_pages: 256,
        }
    }
}

/// JSON tree snapshots of the inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub enabled: bool,
    pub output_dir: PathBuf,
    pub max_snapshots: usize,
    pub interval_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: PathBuf::from("snapshots"),
            max_snapshots: 10,
            interval_secs: 86_400,
        }
    }
}

/// HTTP status/control server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".into(),
            port: 8686,
        }
    }
}

/// Periodic health logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}
