//! Media-server notification dispatcher.
//!
//! Applied operations report their target path through a
//! [`NotificationHandle`], which never blocks. The [`Dispatcher`] task
//! batches paths, resolves them to library sections and refreshes each
//! section once per flush. Both halves of a rename are held back until they
//! have committed so the pair lands in the same batch.

pub mod emby;

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use lm_core::config::NotifyConfig;
use lm_core::events::{EventBus, EventPayload};
use lm_core::{Error, NotificationBatch, RenameGroupId, Result, RetryPolicy};

use crate::context::ConfigStore;
use emby::{LibrarySection, MediaServerClient};

pub enum NotifyMessage {
    Applied {
        path: PathBuf,
        group: Option<RenameGroupId>,
        changed: bool,
    },
    ExpectGroup {
        group: RenameGroupId,
        members: usize,
    },
    Flush(Option<oneshot::Sender<FlushReport>>),
}

/// Result of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub sections: Vec<String>,
    pub failed: Vec<String>,
    pub unmatched: usize,
}

#[derive(Debug, Default)]
pub struct NotificationStats {
    refreshed: AtomicU64,
    failed: AtomicU64,
    flushes: AtomicU64,
    unmatched: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationCounters {
    pub refreshed: u64,
    pub failed: u64,
    pub flushes: u64,
    pub unmatched: u64,
}

impl NotificationStats {
    pub fn snapshot(&self) -> NotificationCounters {
        NotificationCounters {
            refreshed: self.refreshed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
        }
    }
}

/// Sending side of the dispatcher; cheap to clone.
#[derive(Clone)]
pub struct NotificationHandle {
    tx: mpsc::UnboundedSender<NotifyMessage>,
    stats: Arc<NotificationStats>,
}

impl NotificationHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NotifyMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                stats: Arc::new(NotificationStats::default()),
            },
            rx,
        )
    }

    fn send(&self, message: NotifyMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("Notification dispatcher is not running");
        }
    }

    /// Report an applied operation's target path.
    pub fn applied(&self, path: PathBuf, group: Option<RenameGroupId>, changed: bool) {
        self.send(NotifyMessage::Applied { path, group, changed });
    }

    /// Announce how many operations make up a rename group.
    pub fn expect_group(&self, group: RenameGroupId, members: usize) {
        self.send(NotifyMessage::ExpectGroup { group, members });
    }

    pub fn flush(&self) {
        self.send(NotifyMessage::Flush(None));
    }

    /// Flush and wait for the refreshes to finish.
    pub async fn flush_and_wait(&self) -> Result<FlushReport> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(NotifyMessage::Flush(Some(tx)))
            .map_err(|_| Error::Internal("notification dispatcher is not running".into()))?;
        rx.await
            .map_err(|_| Error::Internal("notification dispatcher stopped before flushing".into()))
    }

    pub fn stats(&self) -> Arc<NotificationStats> {
        self.stats.clone()
    }
}

struct HeldGroup {
    expected: usize,
    seen: usize,
    paths: Vec<PathBuf>,
    since: Instant,
}

pub struct Dispatcher {
    config: Arc<ConfigStore>,
    client: Option<Arc<dyn MediaServerClient>>,
    stats: Arc<NotificationStats>,
    event_bus: Arc<EventBus>,
    rx: mpsc::UnboundedReceiver<NotifyMessage>,
    pending: BTreeSet<PathBuf>,
    groups: HashMap<RenameGroupId, HeldGroup>,
    last_activity: Instant,
}

impl Dispatcher {
    pub fn new(
        config: Arc<ConfigStore>,
        client: Option<Arc<dyn MediaServerClient>>,
        handle: &NotificationHandle,
        event_bus: Arc<EventBus>,
        rx: mpsc::UnboundedReceiver<NotifyMessage>,
    ) -> Self {
        Self {
            config,
            client,
            stats: handle.stats(),
            event_bus,
            rx,
            pending: BTreeSet::new(),
            groups: HashMap::new(),
            last_activity: Instant::now(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(enabled = self.client.is_some(), "Notification dispatcher started");

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => self.handle(message, &cancel).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => self.on_timer(&cancel).await,
                _ = cancel.cancelled() => break,
            }
        }

        // Deliver what is left, without retry sleeps.
        self.release_all_groups();
        if !self.pending.is_empty() {
            let stopped = CancellationToken::new();
            stopped.cancel();
            self.flush(&stopped).await;
        }
        tracing::info!("Notification dispatcher stopped");
    }

    fn notify_config(&self) -> NotifyConfig {
        self.config.current().notify.clone()
    }

    fn next_deadline(&self) -> Instant {
        let notify = self.notify_config();
        let mut deadline = Instant::now() + Duration::from_secs(3600);
        if !self.pending.is_empty() {
            deadline = deadline.min(self.last_activity + Duration::from_secs(notify.flush_idle_secs));
        }
        let hold = Duration::from_secs(notify.rename_hold_secs);
        for group in self.groups.values() {
            deadline = deadline.min(group.since + hold);
        }
        deadline
    }

    async fn handle(&mut self, message: NotifyMessage, cancel: &CancellationToken) {
        match message {
            NotifyMessage::Applied { path, group, changed } => {
                self.last_activity = Instant::now();
                match group.and_then(|g| self.groups.get_mut(&g).map(|held| (g, held))) {
                    Some((id, held)) => {
                        held.seen += 1;
                        if changed {
                            held.paths.push(path);
                        }
                        if held.seen >= held.expected {
                            self.release_group(id);
                        }
                    }
                    None if changed => {
                        self.pending.insert(path);
                    }
                    None => {}
                }
                if self.pending.len() >= self.notify_config().flush_max_paths.max(1) {
                    self.flush(cancel).await;
                }
            }
            NotifyMessage::ExpectGroup { group, members } => {
                self.groups.insert(
                    group,
                    HeldGroup {
                        expected: members,
                        seen: 0,
                        paths: Vec::new(),
                        since: Instant::now(),
                    },
                );
            }
            NotifyMessage::Flush(reply) => {
                self.release_all_groups();
                let report = self.flush(cancel).await;
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
        }
    }

    async fn on_timer(&mut self, cancel: &CancellationToken) {
        let notify = self.notify_config();
        let now = Instant::now();

        let hold = Duration::from_secs(notify.rename_hold_secs);
        let expired: Vec<RenameGroupId> = self
            .groups
            .iter()
            .filter(|(_, held)| held.since + hold <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            tracing::debug!(group = %id, "Rename group hold expired");
            self.release_group(id);
        }

        let idle = Duration::from_secs(notify.flush_idle_secs);
        if !self.pending.is_empty() && self.last_activity + idle <= now {
            self.flush(cancel).await;
        }
    }

    fn release_group(&mut self, id: RenameGroupId) {
        if let Some(held) = self.groups.remove(&id) {
            self.pending.extend(held.paths);
        }
    }

    fn release_all_groups(&mut self) {
        let ids: Vec<RenameGroupId> = self.groups.keys().copied().collect();
        for id in ids {
            self.release_group(id);
        }
    }

    async fn flush(&mut self, cancel: &CancellationToken) -> FlushReport {
        let paths = std::mem::take(&mut self.pending);
        let mut report = FlushReport::default();
        if paths.is_empty() {
            return report;
        }
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);

        let Some(client) = self.client.clone() else {
            tracing::debug!(paths = paths.len(), "Notifications disabled, dropping batch");
            return report;
        };
        let notify = self.notify_config();

        let sections = if notify.sections.is_empty() {
            match with_retry(&notify.retry, cancel, "list sections", || client.list_sections()).await {
                Ok(sections) => sections,
                Err(e) => {
                    tracing::error!(error = %e, paths = paths.len(), "Cannot resolve library sections");
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    report.failed.push("*".into());
                    return report;
                }
            }
        } else {
            static_sections(&notify)
        };

        let mut batch = NotificationBatch::new();
        for path in &paths {
            match resolve_section(&sections, path) {
                Some(section) => {
                    batch.insert(section.id.clone());
                }
                None => {
                    tracing::warn!(path = %path.display(), "No library section covers path");
                    report.unmatched += 1;
                }
            }
        }
        self.stats.unmatched.fetch_add(report.unmatched as u64, Ordering::Relaxed);

        for id in &batch.sections {
            match with_retry(&notify.retry, cancel, "refresh", || client.refresh_section(id)).await {
                Ok(()) => {
                    self.stats.refreshed.fetch_add(1, Ordering::Relaxed);
                    report.sections.push(id.clone());
                }
                Err(e) => {
                    tracing::error!(section = %id, error = %e, "Section refresh failed");
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    report.failed.push(id.clone());
                }
            }
        }

        tracing::info!(
            paths = paths.len(),
            refreshed = report.sections.len(),
            failed = report.failed.len(),
            "Notification batch flushed"
        );
        self.event_bus.broadcast(EventPayload::SectionsRefreshed {
            sections: report.sections.clone(),
            failed: report.failed.clone(),
        });
        report
    }
}

fn static_sections(config: &NotifyConfig) -> Vec<LibrarySection> {
    config
        .sections
        .iter()
        .map(|s| LibrarySection {
            id: s.id.clone(),
            name: s.name.clone().unwrap_or_else(|| s.id.clone()),
            locations: s.locations.clone(),
        })
        .collect()
}

/// The section whose location is the longest prefix of `path`.
pub fn resolve_section<'a>(sections: &'a [LibrarySection], path: &Path) -> Option<&'a LibrarySection> {
    sections
        .iter()
        .flat_map(|s| s.locations.iter().map(move |loc| (s, loc)))
        .filter(|(_, loc)| path.starts_with(loc))
        .max_by_key(|(_, loc)| loc.components().count())
        .map(|(s, _)| s)
}

/// Retry retryable failures with the notify policy. A cancelled token
/// turns the backoff into a single attempt.
async fn with_retry<T, F, Fut>(policy: &RetryPolicy, cancel: &CancellationToken, what: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && !policy.exhausted(attempt + 1) && !cancel.is_cancelled() => {
                let delay = policy.delay(attempt);
                tracing::warn!(what, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %e, "Media server call failed, retrying");
                attempt += 1;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lm_core::config::{Config, SectionConfig};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeServer {
        refreshed: Mutex<Vec<String>>,
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl MediaServerClient for FakeServer {
        async fn list_sections(&self) -> Result<Vec<LibrarySection>> {
            Ok(vec![
                LibrarySection {
                    id: "movies".into(),
                    name: "Movies".into(),
                    locations: vec![PathBuf::from("/links/Movies")],
                },
                LibrarySection {
                    id: "kids".into(),
                    name: "Kids".into(),
                    locations: vec![PathBuf::from("/links/Movies/Kids")],
                },
            ])
        }

        async fn refresh_section(&self, id: &str) -> Result<()> {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(Error::transient("503"));
            }
            self.refreshed.lock().push(id.to_string());
            Ok(())
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn start(server: Arc<FakeServer>, config: Config) -> (NotificationHandle, CancellationToken) {
        let (handle, rx) = NotificationHandle::channel();
        let store = Arc::new(ConfigStore::new(config, None));
        let dispatcher = Dispatcher::new(store, Some(server), &handle, Arc::new(EventBus::default()), rx);
        let cancel = CancellationToken::new();
        tokio::spawn(dispatcher.run(cancel.clone()));
        (handle, cancel)
    }

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.notify.flush_idle_secs = 3600;
        config.notify.retry = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 3, 0.0);
        config
    }

    #[test]
    fn longest_location_wins() {
        let sections = vec![
            LibrarySection {
                id: "all".into(),
                name: "All".into(),
                locations: vec![PathBuf::from("/links")],
            },
            LibrarySection {
                id: "movies".into(),
                name: "Movies".into(),
                locations: vec![PathBuf::from("/links/Movies")],
            },
        ];
        let hit = resolve_section(&sections, Path::new("/links/Movies/A.mkv")).unwrap();
        assert_eq!(hit.id, "movies");
        assert_eq!(resolve_section(&sections, Path::new("/links/Shows/x.mkv")).unwrap().id, "all");
        // Component-wise, not string prefix.
        assert!(resolve_section(&sections[1..], Path::new("/links/Movies2/A.mkv")).is_none());
    }

    #[tokio::test]
    async fn batch_refreshes_each_section_once() {
        let server = Arc::new(FakeServer::default());
        let (handle, cancel) = start(server.clone(), quiet_config());

        handle.applied("/links/Movies/A.mkv".into(), None, true);
        handle.applied("/links/Movies/B.mkv".into(), None, true);
        handle.applied("/links/Movies/Kids/C.mkv".into(), None, true);
        handle.applied("/elsewhere/D.mkv".into(), None, true);
        handle.applied("/links/Movies/E.mkv".into(), None, false);

        let report = handle.flush_and_wait().await.unwrap();
        assert_eq!(report.sections, vec!["kids".to_string(), "movies".to_string()]);
        assert_eq!(report.unmatched, 1);
        assert_eq!(server.refreshed.lock().len(), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn rename_pair_is_held_until_complete() {
        let server = Arc::new(FakeServer::default());
        let mut config = quiet_config();
        config.notify.flush_max_paths = 1;
        let (handle, cancel) = start(server.clone(), config);

        let group = RenameGroupId::new();
        handle.expect_group(group, 2);
        handle.applied("/links/Movies/A.mkv".into(), Some(group), true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Held, so the size trigger did not fire.
        assert!(server.refreshed.lock().is_empty());

        handle.applied("/links/Movies/B.mkv".into(), Some(group), true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*server.refreshed.lock(), vec!["movies".to_string()]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn transient_refresh_failures_are_retried() {
        let server = Arc::new(FakeServer::default());
        *server.failures_left.lock() = 2;
        let (handle, cancel) = start(server.clone(), quiet_config());

        handle.applied("/links/Movies/A.mkv".into(), None, true);
        let report = handle.flush_and_wait().await.unwrap();
        assert_eq!(report.sections, vec!["movies".to_string()]);
        assert!(report.failed.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn static_sections_override_server_listing() {
        let server = Arc::new(FakeServer::default());
        let mut config = quiet_config();
        config.notify.sections = vec![SectionConfig {
            id: "42".into(),
            name: None,
            locations: vec![PathBuf::from("/links")],
        }];
        let (handle, cancel) = start(server.clone(), config);

        handle.applied("/links/Movies/A.mkv".into(), None, true);
        let report = handle.flush_and_wait().await.unwrap();
        assert_eq!(report.sections, vec!["42".to_string()]);
        cancel.cancel();
    }
}
