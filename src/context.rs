//! Shared service state handed to every task and HTTP handler.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use lm_core::events::EventBus;
use lm_core::{Error, Result};
use lm_db::pool::DbPool;

use crate::config::{self, Config};
use crate::notifications::emby::MediaServerClient;
use crate::notifications::NotificationHandle;
use crate::queue::TaskQueue;
use crate::sources::mount::MountProbe;
use crate::sources::remote::RemoteChangeClient;
use crate::sources::RescanHandle;

/// Holds the current configuration snapshot.
///
/// Readers take an `Arc<Config>` and keep it for one unit of work; a reload
/// swaps the whole snapshot.
pub struct ConfigStore {
    current: RwLock<Arc<Config>>,
    path: Option<PathBuf>,
}

impl ConfigStore {
    pub fn new(config: Config, path: Option<PathBuf>) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            path,
        }
    }

    pub fn current(&self) -> Arc<Config> {
        self.current.read().clone()
    }

    pub fn replace(&self, config: Config) {
        *self.current.write() = Arc::new(config);
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the config file and swap it in. The running snapshot is kept
    /// when the new file fails to parse or validate.
    pub fn reload(&self) -> Result<Vec<String>> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| Error::Validation("service was started without a config file".into()))?;
        let contents = std::fs::read_to_string(path)?;
        let (config, warnings) = config::parse_config(&contents)?;

        let previous = self.current();
        if previous.notify.server_url != config.notify.server_url {
            tracing::warn!("notify.server_url changed; restart to use the new media server");
        }

        self.replace(config);
        tracing::info!(path = %path.display(), warnings = warnings.len(), "Configuration reloaded");
        Ok(warnings)
    }
}

/// A change source that can be paused independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Adapter {
    Remote,
    Local,
    Scan,
}

impl Adapter {
    pub const ALL: [Adapter; 3] = [Adapter::Remote, Adapter::Local, Adapter::Scan];

    pub fn as_str(&self) -> &'static str {
        match self {
            Adapter::Remote => "remote",
            Adapter::Local => "local",
            Adapter::Scan => "scan",
        }
    }
}

impl fmt::Display for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Adapter {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "remote" => Ok(Adapter::Remote),
            "local" => Ok(Adapter::Local),
            "scan" => Ok(Adapter::Scan),
            other => Err(format!("unknown adapter '{other}'")),
        }
    }
}

/// Operator switches and progress markers shared by the adapters.
#[derive(Default)]
pub struct Controls {
    remote_paused: AtomicBool,
    local_paused: AtomicBool,
    scan_paused: AtomicBool,
    /// Woken by `POST /api/scan`.
    pub scan_requested: Notify,
    last_poll: RwLock<Option<DateTime<Utc>>>,
    last_scan: RwLock<Option<DateTime<Utc>>>,
}

impl Controls {
    fn flag(&self, adapter: Adapter) -> &AtomicBool {
        match adapter {
            Adapter::Remote => &self.remote_paused,
            Adapter::Local => &self.local_paused,
            Adapter::Scan => &self.scan_paused,
        }
    }

    pub fn is_paused(&self, adapter: Adapter) -> bool {
        self.flag(adapter).load(Ordering::SeqCst)
    }

    /// Returns the previous state. Resuming the local watcher or the
    /// scanner requests a full scan, since their events were dropped while
    /// paused.
    pub fn set_paused(&self, adapter: Adapter, paused: bool) -> bool {
        let was_paused = self.flag(adapter).swap(paused, Ordering::SeqCst);
        if was_paused && !paused && matches!(adapter, Adapter::Local | Adapter::Scan) {
            self.request_scan();
        }
        was_paused
    }

    pub fn request_scan(&self) {
        self.scan_requested.notify_one();
    }

    pub fn record_poll(&self) {
        *self.last_poll.write() = Some(Utc::now());
    }

    pub fn record_scan(&self) {
        *self.last_scan.write() = Some(Utc::now());
    }

    pub fn last_poll(&self) -> Option<DateTime<Utc>> {
        *self.last_poll.read()
    }

    pub fn last_scan(&self) -> Option<DateTime<Utc>> {
        *self.last_scan.read()
    }
}

/// Everything a running service shares between its tasks.
#[derive(Clone)]
pub struct AppContext {
    pub db: DbPool,
    pub config: Arc<ConfigStore>,
    pub event_bus: Arc<EventBus>,
    pub controls: Arc<Controls>,
    pub queue: TaskQueue,
    pub notifier: NotificationHandle,
    pub rescan: RescanHandle,
    pub probe: Arc<dyn MountProbe>,
    /// `None` when remote polling is disabled.
    pub remote: Option<Arc<dyn RemoteChangeClient>>,
    /// `None` when notifications are disabled.
    pub media_server: Option<Arc<dyn MediaServerClient>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        [source]
        root = "/mnt/drive"
        [target]
        base = "/srv/links"
    "#;

    #[test]
    fn adapter_round_trips_through_str() {
        for adapter in Adapter::ALL {
            assert_eq!(adapter.as_str().parse::<Adapter>().unwrap(), adapter);
        }
        assert!("emby".parse::<Adapter>().is_err());
    }

    #[test]
    fn pause_flags_are_independent() {
        let controls = Controls::default();
        assert!(!controls.set_paused(Adapter::Local, true));
        assert!(controls.is_paused(Adapter::Local));
        assert!(!controls.is_paused(Adapter::Remote));
        assert!(controls.set_paused(Adapter::Local, false));
    }

    async fn wait(controls: &Controls) -> bool {
        let notified = controls.scan_requested.notified();
        tokio::time::timeout(std::time::Duration::from_millis(50), notified)
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn resuming_local_requests_full_scan() {
        let controls = Controls::default();

        controls.set_paused(Adapter::Local, true);
        assert!(!wait(&controls).await);

        controls.set_paused(Adapter::Local, false);
        assert!(wait(&controls).await);

        // Resuming something that was not paused changes nothing.
        controls.set_paused(Adapter::Local, false);
        controls.set_paused(Adapter::Remote, true);
        controls.set_paused(Adapter::Remote, false);
        assert!(!wait(&controls).await);
    }

    #[test]
    fn reload_swaps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linkmirror.toml");
        std::fs::write(&path, CONFIG).unwrap();

        let store = ConfigStore::new(Config::default(), Some(path.clone()));
        let before = store.current();
        store.reload().unwrap();
        assert_eq!(store.current().source.root, PathBuf::from("/mnt/drive"));
        // Holders of the old snapshot are unaffected.
        assert!(before.source.root.as_os_str().is_empty());
    }

    #[test]
    fn invalid_reload_keeps_running_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linkmirror.toml");
        std::fs::write(&path, CONFIG).unwrap();
        let store = ConfigStore::new(Config::default(), Some(path.clone()));
        store.reload().unwrap();

        std::fs::write(&path, "[queue]\nmax_workers = 99\n").unwrap();
        assert!(matches!(store.reload(), Err(Error::Validation(_))));
        assert_eq!(store.current().source.root, PathBuf::from("/mnt/drive"));
    }

    #[test]
    fn reload_without_path_is_rejected() {
        let store = ConfigStore::new(Config::default(), None);
        assert!(store.reload().is_err());
    }
}
