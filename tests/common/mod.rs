//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`]: temporary source and target trees, an in-memory
//! inventory, and fake mount, remote and media-server collaborators. Each
//! call to [`TestHarness::service`] builds a fresh service over the same
//! state, so a test can run several sync cycles back to back.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use linkmirror::config::Config;
use linkmirror::notifications::emby::{LibrarySection, MediaServerClient};
use linkmirror::server::create_router;
use linkmirror::service::{Dependencies, Service, SyncReport, Workers};
use linkmirror::sources::mount::{MountProbe, ProbeReport};
use linkmirror::sources::remote::{ChangePage, RemoteChangeClient, RemoteError};
use lm_core::{InventoryEntry, Observation, RetryPolicy};
use lm_db::pool::{get_conn, init_memory_pool, DbPool};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Mount probe whose readiness is flipped by the test.
pub struct FakeProbe {
    ready: AtomicBool,
}

impl FakeProbe {
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

#[async_trait]
impl MountProbe for FakeProbe {
    async fn check(&self) -> ProbeReport {
        if self.ready.load(Ordering::SeqCst) {
            ProbeReport::ready()
        } else {
            ProbeReport::not_ready("fake mount is offline")
        }
    }
}

/// Media server that records refreshes.
pub struct FakeMediaServer {
    sections: Vec<LibrarySection>,
    refreshes: Mutex<Vec<String>>,
    reachable: AtomicBool,
}

impl FakeMediaServer {
    pub fn refreshes(&self) -> Vec<String> {
        self.refreshes.lock().clone()
    }

    pub fn take_refreshes(&self) -> Vec<String> {
        std::mem::take(&mut *self.refreshes.lock())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaServerClient for FakeMediaServer {
    async fn list_sections(&self) -> lm_core::Result<Vec<LibrarySection>> {
        Ok(self.sections.clone())
    }

    async fn refresh_section(&self, id: &str) -> lm_core::Result<()> {
        self.refreshes.lock().push(id.to_string());
        Ok(())
    }

    async fn ping(&self) -> lm_core::Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(lm_core::Error::transient("connection refused"))
        }
    }
}

/// Remote change API serving scripted pages.
#[derive(Default)]
pub struct FakeRemote {
    pub pages: Mutex<VecDeque<ChangePage>>,
    pub listing: Mutex<Vec<Observation>>,
    pub down: AtomicBool,
}

#[async_trait]
impl RemoteChangeClient for FakeRemote {
    async fn start_token(&self) -> Result<String, RemoteError> {
        Ok("start".into())
    }

    async fn list_changes_since(&self, token: &str) -> Result<ChangePage, RemoteError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RemoteError::Server { status: 503 });
        }
        Ok(self.pages.lock().pop_front().unwrap_or(ChangePage {
            changes: Vec::new(),
            new_token: token.to_string(),
            has_more: false,
        }))
    }

    async fn list_all(&self, _root_id: &str) -> Result<Vec<Observation>, RemoteError> {
        Ok(self.listing.lock().clone())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        if self.down.load(Ordering::SeqCst) {
            Err(RemoteError::Transport("connection reset".into()))
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct TestHarness {
    pub source: TempDir,
    pub target: TempDir,
    pub db: DbPool,
    pub probe: Arc<FakeProbe>,
    pub media: Arc<FakeMediaServer>,
    pub remote: Option<Arc<FakeRemote>>,
    pub config: Config,
}

impl TestHarness {
    /// Source and target trees with a Movies and a Shows section, fast
    /// retries and no background adapters.
    pub fn new() -> Self {
        let source = tempfile::tempdir().expect("source tempdir");
        let target = tempfile::tempdir().expect("target tempdir");

        let mut config = Config::default();
        config.source.root = source.path().to_path_buf();
        config.target.base = target.path().to_path_buf();
        config.watch.enabled = false;
        config.scan.run_on_start = false;
        config.server.enabled = false;
        config.queue.max_workers = 2;
        config.queue.retry = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(10), 3, 0.0);
        config.notify.retry = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 2, 0.0);
        config.notify.flush_idle_secs = 3600;

        let media = Arc::new(FakeMediaServer {
            sections: vec![
                LibrarySection {
                    id: "movies".into(),
                    name: "Movies".into(),
                    locations: vec![target.path().join("Movies")],
                },
                LibrarySection {
                    id: "shows".into(),
                    name: "Shows".into(),
                    locations: vec![target.path().join("Shows")],
                },
            ],
            refreshes: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
        });

        Self {
            source,
            target,
            db: init_memory_pool().expect("failed to create in-memory pool"),
            probe: Arc::new(FakeProbe {
                ready: AtomicBool::new(true),
            }),
            media,
            remote: None,
            config,
        }
    }

    pub fn with_remote(mut self) -> Self {
        self.remote = Some(Arc::new(FakeRemote::default()));
        self.config.remote.enabled = true;
        self.config.remote.folder_id = Some("root".into());
        self
    }

    /// A fresh service over the harness state.
    pub fn service(&self) -> Service {
        let deps = Dependencies {
            probe: self.probe.clone(),
            remote: self
                .remote
                .clone()
                .map(|r| r as Arc<dyn RemoteChangeClient>),
            media_server: Some(self.media.clone()),
        };
        Service::with_dependencies(self.config.clone(), None, self.db.clone(), deps)
    }

    /// One full sync cycle.
    pub async fn sync(&self) -> SyncReport {
        self.service().run_once().await.expect("sync failed")
    }

    /// Queue workers and dispatcher without any change source.
    pub fn start(&self) -> Workers {
        self.service().start_workers().expect("failed to start workers")
    }

    /// Start an Axum server on a random port; the workers keep running so
    /// control endpoints have something to talk to.
    pub async fn with_server(&self) -> (Workers, SocketAddr) {
        let workers = self.start();
        let app = create_router(workers.context().clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        (workers, addr)
    }

    // -- Filesystem helpers -------------------------------------------------

    pub fn source_path(&self, rel: &str) -> PathBuf {
        self.source.path().join(rel)
    }

    pub fn target_path(&self, rel: &str) -> PathBuf {
        self.target.path().join(rel)
    }

    pub fn write_source(&self, rel: &str, contents: &[u8]) {
        let path = self.source_path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create source dirs");
        }
        std::fs::write(path, contents).expect("write source file");
    }

    /// Where the link at `rel` points, if it is a link.
    pub fn link_at(&self, rel: &str) -> Option<PathBuf> {
        std::fs::read_link(self.target_path(rel)).ok()
    }

    pub fn entry(&self, rel: &str) -> Option<InventoryEntry> {
        let conn = get_conn(&self.db).expect("conn");
        lm_db::queries::inventory::get(&conn, rel).expect("inventory lookup")
    }

    /// Every symlink in the target tree, relative path to destination.
    pub fn target_links(&self) -> Vec<(String, PathBuf)> {
        let mut links: Vec<(String, PathBuf)> = walkdir::WalkDir::new(self.target.path())
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_symlink())
            .map(|e| {
                let rel = e
                    .path()
                    .strip_prefix(self.target.path())
                    .expect("inside target")
                    .to_string_lossy()
                    .replace('\\', "/");
                let dest = std::fs::read_link(e.path()).expect("read link");
                (rel, dest)
            })
            .collect();
        links.sort();
        links
    }
}

pub fn file_observation(root: &Path, rel: &str) -> Observation {
    let meta = std::fs::metadata(root.join(rel)).expect("stat source file");
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Observation::file(rel, meta.len(), mtime)
}
