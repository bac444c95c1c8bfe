//! Source root readiness probe.
//!
//! A network mount can vanish underneath the engine. Everything that would
//! read an empty or missing root as "all files deleted" asks the probe
//! first.

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;

/// Result of one readiness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub ready: bool,
    pub detail: String,
}

impl ProbeReport {
    pub fn ready() -> Self {
        Self {
            ready: true,
            detail: "ok".into(),
        }
    }

    pub fn not_ready(detail: impl Into<String>) -> Self {
        Self {
            ready: false,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait MountProbe: Send + Sync {
    async fn check(&self) -> ProbeReport;

    async fn is_ready(&self) -> bool {
        self.check().await.ready
    }
}

/// Checks a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct DirectoryProbe {
    root: PathBuf,
    sentinel: Option<String>,
    require_mountpoint: bool,
}

impl DirectoryProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sentinel: None,
            require_mountpoint: false,
        }
    }

    pub fn from_config(config: &lm_core::config::SourceConfig) -> Self {
        Self {
            root: config.root.clone(),
            sentinel: config.sentinel.clone(),
            require_mountpoint: config.require_mountpoint,
        }
    }

    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = Some(sentinel.into());
        self
    }

    pub fn with_mountpoint_check(mut self, required: bool) -> Self {
        self.require_mountpoint = required;
        self
    }

    /// Blocking check; run it off the async executor.
    pub fn check_blocking(&self) -> ProbeReport {
        let meta = match std::fs::metadata(&self.root) {
            Ok(m) => m,
            Err(e) => return ProbeReport::not_ready(format!("{}: {e}", self.root.display())),
        };
        if !meta.is_dir() {
            return ProbeReport::not_ready(format!("{} is not a directory", self.root.display()));
        }
        if let Err(e) = std::fs::read_dir(&self.root) {
            return ProbeReport::not_ready(format!("cannot list {}: {e}", self.root.display()));
        }
        if let Some(sentinel) = &self.sentinel {
            if !self.root.join(sentinel).exists() {
                return ProbeReport::not_ready(format!("sentinel {sentinel} missing"));
            }
        }
        if self.require_mountpoint && !is_mountpoint(&self.root) {
            return ProbeReport::not_ready(format!("{} is not a mount point", self.root.display()));
        }
        ProbeReport::ready()
    }
}

#[async_trait]
impl MountProbe for DirectoryProbe {
    async fn check(&self) -> ProbeReport {
        let probe = self.clone();
        tokio::task::spawn_blocking(move || probe.check_blocking())
            .await
            .unwrap_or_else(|e| ProbeReport::not_ready(format!("probe task failed: {e}")))
    }
}

#[cfg(unix)]
fn is_mountpoint(path: &std::path::Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let Some(parent) = path.parent() else {
        return true;
    };
    match (std::fs::metadata(path), std::fs::metadata(parent)) {
        (Ok(here), Ok(above)) => here.dev() != above.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn is_mountpoint(_path: &std::path::Path) -> bool {
    true
}
