//! Local filesystem watcher.
//!
//! Bridges `notify` callbacks into change events. Writes wait in a
//! [`FileSettleTracker`] until the file stops changing. Anything the
//! watcher cannot vouch for (channel overflow, `need_rescan`, backend
//! errors) turns into a rescan request instead of a guess.

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lm_core::{normalize_path, ChangeEvent, ChangeSource, Observation};

use super::mount::MountProbe;
use super::settle::FileSettleTracker;
use super::{Intake, IntakeSender, RescanHandle};
use crate::context::{Adapter, ConfigStore, Controls};

/// How long a rename source waits for its destination half.
const RENAME_PAIR_WINDOW: Duration = Duration::from_secs(1);
const TICK: Duration = Duration::from_secs(1);
const PROBE_EVERY: Duration = Duration::from_secs(10);

/// Something the watcher wants done.
#[derive(Debug, Clone)]
pub enum WatchAction {
    Emit(ChangeEvent),
    Rescan { prefix: String, reason: &'static str },
}

/// Stat a relative path under `root`. Symlinks and missing paths yield
/// `None`.
pub fn observe_path(root: &Path, rel: &str) -> Option<Observation> {
    let meta = std::fs::symlink_metadata(root.join(rel)).ok()?;
    if meta.is_dir() {
        return Some(Observation::directory(rel));
    }
    if !meta.is_file() {
        return None;
    }
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Some(Observation::file(rel, meta.len(), mtime))
}

/// Turns raw notify events into change events and rescans.
pub struct EventTranslator {
    root: PathBuf,
    settle: FileSettleTracker,
    /// Rename sources waiting for their `Both` event.
    held_from: HashMap<String, Instant>,
}

impl EventTranslator {
    pub fn new(root: impl Into<PathBuf>, settle_time: Duration) -> Self {
        Self {
            root: root.into(),
            settle: FileSettleTracker::new(settle_time),
            held_from: HashMap::new(),
        }
    }

    fn relative(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root)
            .ok()
            .map(|rel| normalize_path(&rel.to_string_lossy()))
    }

    fn emit(obs: Option<Observation>, created: bool, out: &mut Vec<WatchAction>) {
        if let Some(obs) = obs {
            let event = if created {
                ChangeEvent::created(ChangeSource::Local, obs)
            } else {
                ChangeEvent::modified(ChangeSource::Local, obs)
            };
            out.push(WatchAction::Emit(event));
        }
    }

    pub fn translate(&mut self, event: Event, now: Instant) -> Vec<WatchAction> {
        let mut out = Vec::new();
        if event.need_rescan() {
            out.push(WatchAction::Rescan {
                prefix: String::new(),
                reason: "watcher asked for rescan",
            });
        }

        let paths: Vec<String> = event.paths.iter().filter_map(|p| self.relative(p)).collect();
        if paths.iter().any(|p| p.is_empty()) {
            out.push(WatchAction::Rescan {
                prefix: String::new(),
                reason: "event on source root",
            });
            return out;
        }

        match event.kind {
            EventKind::Create(CreateKind::Folder) => {
                for rel in paths {
                    Self::emit(observe_path(&self.root, &rel), true, &mut out);
                    // Entries created before the directory watch was armed.
                    out.push(WatchAction::Rescan {
                        prefix: rel,
                        reason: "directory created",
                    });
                }
            }
            EventKind::Create(_) => {
                for rel in paths {
                    self.settle.touch(rel, true, now);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for rel in paths {
                    self.held_from.insert(rel, now);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for rel in paths {
                    self.settle.touch(rel, true, now);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
                let (from, to) = (paths[0].clone(), paths[1].clone());
                self.held_from.remove(&from);
                self.settle.remove(&to);
                self.settle.remove(&from);
                match observe_path(&self.root, &to) {
                    Some(obs) => {
                        let is_dir = obs.kind == lm_core::EntryKind::Directory;
                        out.push(WatchAction::Emit(ChangeEvent::renamed(ChangeSource::Local, &from, obs)));
                        if is_dir {
                            out.push(WatchAction::Rescan {
                                prefix: to,
                                reason: "directory renamed",
                            });
                        }
                    }
                    None => out.push(WatchAction::Emit(ChangeEvent::deleted(ChangeSource::Local, &from))),
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                // Backends that cannot pair renames report each side alone.
                for rel in paths {
                    if self.root.join(&rel).exists() {
                        self.settle.touch(rel, true, now);
                    } else {
                        self.settle.remove(&rel);
                        out.push(WatchAction::Emit(ChangeEvent::deleted(ChangeSource::Local, &rel)));
                    }
                }
            }
            EventKind::Modify(ModifyKind::Metadata(_)) => {}
            EventKind::Modify(_) => {
                for rel in paths {
                    self.settle.touch(rel, false, now);
                }
            }
            EventKind::Remove(_) => {
                for rel in paths {
                    self.settle.remove(&rel);
                    out.push(WatchAction::Emit(ChangeEvent::deleted(ChangeSource::Local, &rel)));
                }
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }
        out
    }

    /// Release settled writes and unpaired rename sources.
    pub fn tick(&mut self, now: Instant) -> Vec<WatchAction> {
        let mut out = Vec::new();

        let expired: Vec<String> = self
            .held_from
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= RENAME_PAIR_WINDOW)
            .map(|(path, _)| path.clone())
            .collect();
        for path in expired {
            self.held_from.remove(&path);
            out.push(WatchAction::Emit(ChangeEvent::deleted(ChangeSource::Local, &path)));
        }

        for (rel, created) in self.settle.take_settled(now) {
            Self::emit(observe_path(&self.root, &rel), created, &mut out);
        }
        out
    }
}

pub struct LocalWatcher {
    pub config: Arc<ConfigStore>,
    pub controls: Arc<Controls>,
    pub probe: Arc<dyn MountProbe>,
    pub rescan: RescanHandle,
    pub intake: IntakeSender,
}

impl LocalWatcher {
    fn arm(&self, root: &Path, tx: mpsc::Sender<notify::Result<Event>>, overflow: Arc<AtomicBool>) -> Option<RecommendedWatcher> {
        let handler = move |res: notify::Result<Event>| {
            if tx.try_send(res).is_err() {
                overflow.store(true, Ordering::SeqCst);
            }
        };
        let mut watcher = match RecommendedWatcher::new(handler, notify::Config::default()) {
            Ok(watcher) => watcher,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create file watcher");
                return None;
            }
        };
        match watcher.watch(root, RecursiveMode::Recursive) {
            Ok(()) => {
                tracing::info!(root = %root.display(), "Watching source tree");
                Some(watcher)
            }
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "Cannot watch source tree yet");
                None
            }
        }
    }

    /// Returns false once the intake is closed.
    async fn dispatch(&self, actions: Vec<WatchAction>) -> bool {
        for action in actions {
            match action {
                WatchAction::Rescan { prefix, reason } => self.rescan.request(prefix, reason),
                WatchAction::Emit(event) => {
                    if self.controls.is_paused(Adapter::Local) {
                        tracing::trace!(path = %event.path, "Local adapter paused, dropping event");
                        continue;
                    }
                    if self.intake.send(Intake::Event(event)).await.is_err() {
                        return false;
                    }
                }
            }
        }
        true
    }

    pub async fn run(self, cancel: CancellationToken) {
        let config = self.config.current();
        if !config.watch.enabled {
            tracing::info!("File watcher is disabled");
            return;
        }
        let root = config.source.root.clone();
        let capacity = config.watch.channel_capacity.max(1);
        let mut translator = EventTranslator::new(&root, Duration::from_secs(config.watch.settle_time_secs));

        let (tx, mut rx) = mpsc::channel::<notify::Result<Event>>(capacity);
        let overflow = Arc::new(AtomicBool::new(false));
        let mut watcher = self.arm(&root, tx.clone(), overflow.clone());

        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_probe = Instant::now();

        loop {
            let actions = tokio::select! {
                res = rx.recv() => match res {
                    Some(Ok(event)) => translator.translate(event, Instant::now()),
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Watcher error");
                        vec![WatchAction::Rescan { prefix: String::new(), reason: "watcher error" }]
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    let now = Instant::now();
                    let mut actions = translator.tick(now);
                    if overflow.swap(false, Ordering::SeqCst) {
                        tracing::warn!("Watch channel overflowed, events were lost");
                        actions.push(WatchAction::Rescan { prefix: String::new(), reason: "watch channel overflow" });
                    }
                    if watcher.is_none() && now.duration_since(last_probe) >= PROBE_EVERY {
                        last_probe = now;
                        if self.probe.is_ready().await {
                            watcher = self.arm(&root, tx.clone(), overflow.clone());
                            if watcher.is_some() {
                                actions.push(WatchAction::Rescan { prefix: String::new(), reason: "watch re-armed" });
                            }
                        }
                    }
                    actions
                }
                _ = cancel.cancelled() => break,
            };

            if !self.dispatch(actions).await {
                tracing::debug!("Intake closed, stopping watcher");
                break;
            }
        }

        drop(watcher);
        tracing::info!("File watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lm_core::ChangeKind;
    use notify::event::RemoveKind;
    use std::fs;

    fn event(kind: EventKind, paths: &[PathBuf]) -> Event {
        let mut event = Event::new(kind);
        for p in paths {
            event = event.add_path(p.clone());
        }
        event
    }

    fn emitted(actions: &[WatchAction]) -> Vec<(String, ChangeKind)> {
        actions
            .iter()
            .filter_map(|a| match a {
                WatchAction::Emit(e) => Some((e.path.clone(), e.kind.clone())),
                WatchAction::Rescan { .. } => None,
            })
            .collect()
    }

    #[test]
    fn writes_settle_before_emitting() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mkv"), b"xx").unwrap();
        let mut t = EventTranslator::new(dir.path(), Duration::from_secs(5));
        let t0 = Instant::now();

        let actions = t.translate(event(EventKind::Create(CreateKind::File), &[dir.path().join("a.mkv")]), t0);
        assert!(actions.is_empty());
        assert!(t.tick(t0 + Duration::from_secs(2)).is_empty());

        let actions = t.tick(t0 + Duration::from_secs(6));
        assert_eq!(emitted(&actions), vec![("a.mkv".to_string(), ChangeKind::Created)]);
    }

    #[test]
    fn paired_rename_becomes_renamed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("B.mkv"), b"xx").unwrap();
        let mut t = EventTranslator::new(dir.path(), Duration::from_secs(5));
        let now = Instant::now();
        let from = dir.path().join("A.mkv");
        let to = dir.path().join("B.mkv");

        t.translate(event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &[from.clone()]), now);
        t.translate(event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), &[to.clone()]), now);
        let actions = t.translate(event(EventKind::Modify(ModifyKind::Name(RenameMode::Both)), &[from, to]), now);

        assert_eq!(
            emitted(&actions),
            vec![("B.mkv".to_string(), ChangeKind::Renamed { from: "A.mkv".into() })]
        );
        // Neither half is replayed later.
        assert!(t.tick(now + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn lone_rename_source_becomes_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = EventTranslator::new(dir.path(), Duration::from_secs(5));
        let now = Instant::now();
        t.translate(
            event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &[dir.path().join("A.mkv")]),
            now,
        );
        assert!(t.tick(now).is_empty());
        let actions = t.tick(now + Duration::from_secs(2));
        assert_eq!(emitted(&actions), vec![("A.mkv".to_string(), ChangeKind::Deleted)]);
    }

    #[test]
    fn new_directory_is_emitted_and_rescanned() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("Movies")).unwrap();
        let mut t = EventTranslator::new(dir.path(), Duration::from_secs(5));
        let actions = t.translate(
            event(EventKind::Create(CreateKind::Folder), &[dir.path().join("Movies")]),
            Instant::now(),
        );
        assert_eq!(emitted(&actions), vec![("Movies".to_string(), ChangeKind::Created)]);
        assert!(actions
            .iter()
            .any(|a| matches!(a, WatchAction::Rescan { prefix, .. } if prefix == "Movies")));
    }

    #[test]
    fn remove_cancels_pending_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = EventTranslator::new(dir.path(), Duration::ZERO);
        let now = Instant::now();
        let path = dir.path().join("a.mkv");
        t.translate(event(EventKind::Create(CreateKind::File), &[path.clone()]), now);
        let actions = t.translate(event(EventKind::Remove(RemoveKind::File), &[path]), now);
        assert_eq!(emitted(&actions), vec![("a.mkv".to_string(), ChangeKind::Deleted)]);
        assert!(t.tick(now).is_empty());
    }

    #[test]
    fn need_rescan_flag_requests_full_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = EventTranslator::new(dir.path(), Duration::ZERO);
        let event = Event::new(EventKind::Other).set_flag(notify::event::Flag::Rescan);
        let actions = t.translate(event, Instant::now());
        assert!(matches!(&actions[0], WatchAction::Rescan { prefix, .. } if prefix.is_empty()));
    }
}
