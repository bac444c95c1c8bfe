//! Full scanner.
//!
//! Walks the source tree and hands complete listings to the reconciler,
//! which diffs them against the inventory. Runs on an interval, when an
//! operator asks for it, and for subtree rescans requested by the watcher
//! or the reconciler.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use lm_core::{is_within, normalize_path, ChangeSource, Error, Observation, Result};

use super::mount::MountProbe;
use super::{Intake, IntakeSender, Listing, ScanRequest};
use crate::context::{Adapter, ConfigStore, Controls};

/// How often deferred scans are retried while the source is not ready.
const NOT_READY_RETRY: Duration = Duration::from_secs(30);

/// Walk `root/prefix` without following links.
///
/// Blocking; run it in `spawn_blocking`. Symlinks inside the source are
/// skipped, as is `prefix` itself.
pub fn scan_tree(root: &Path, prefix: &str, cancel: &CancellationToken) -> Result<Vec<Observation>> {
    let start = root.join(prefix);
    let mut observations = Vec::new();

    for entry in WalkDir::new(&start).follow_links(false).min_depth(1) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let entry = entry.map_err(|e| Error::transient(format!("scan of {} failed: {e}", start.display())))?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }

        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel = normalize_path(&rel.to_string_lossy());

        if file_type.is_dir() {
            observations.push(Observation::directory(rel));
        } else if file_type.is_file() {
            let meta = entry
                .metadata()
                .map_err(|e| Error::transient(format!("stat of {} failed: {e}", entry.path().display())))?;
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            observations.push(Observation::file(rel, meta.len(), mtime));
        }
    }

    Ok(observations)
}

/// Drop prefixes already covered by a shallower one.
fn coalesce(prefixes: &BTreeSet<String>) -> Vec<String> {
    let mut kept: Vec<String> = Vec::new();
    for prefix in prefixes {
        if !kept.iter().any(|k| is_within(prefix, k)) {
            kept.push(prefix.clone());
        }
    }
    kept
}

pub struct Scanner {
    pub config: Arc<ConfigStore>,
    pub controls: Arc<Controls>,
    pub probe: Arc<dyn MountProbe>,
    pub intake: IntakeSender,
}

impl Scanner {
    /// Scan every prefix and send the listings. Returns the prefixes that
    /// have to wait for the source to become ready.
    pub async fn scan_prefixes(&self, prefixes: Vec<String>, cancel: &CancellationToken) -> Vec<String> {
        let report = self.probe.check().await;
        if !report.ready {
            tracing::warn!(detail = %report.detail, "Source not ready, deferring scan");
            return prefixes;
        }

        let config = self.config.current();
        for prefix in prefixes {
            let root = config.source.root.clone();
            let scan_prefix = prefix.clone();
            let token = cancel.clone();
            let result = tokio::task::spawn_blocking(move || scan_tree(&root, &scan_prefix, &token)).await;

            let observations = match result {
                Ok(Ok(observations)) => observations,
                Ok(Err(Error::Cancelled)) => return Vec::new(),
                Ok(Err(e)) => {
                    tracing::warn!(prefix = %prefix, error = %e, "Scan failed");
                    continue;
                }
                Err(e) => {
                    tracing::error!(prefix = %prefix, error = %e, "Scan task panicked");
                    continue;
                }
            };

            tracing::debug!(prefix = %prefix, entries = observations.len(), "Scan finished");
            let full = prefix.is_empty();
            let listing = Listing {
                source: ChangeSource::Local,
                prefix,
                observations,
                verify_target: config.scan.verify_target,
            };
            if self.intake.send(Intake::Listing(listing)).await.is_err() {
                tracing::debug!("Intake closed, stopping scanner");
                return Vec::new();
            }
            if full {
                self.controls.record_scan();
            }
        }
        Vec::new()
    }

    pub async fn run(self, mut rescan_rx: mpsc::UnboundedReceiver<ScanRequest>, cancel: CancellationToken) {
        let initial = self.config.current().scan.clone();
        tracing::info!(
            enabled = initial.enabled,
            interval_secs = initial.interval_secs,
            "Full scanner started"
        );

        let mut pending: BTreeSet<String> = BTreeSet::new();
        if initial.enabled && initial.run_on_start {
            pending.insert(String::new());
        }
        let mut deferred = false;

        let mut interval = tokio::time::interval(Duration::from_secs(initial.interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            if !pending.is_empty() && !self.controls.is_paused(Adapter::Scan) && !deferred {
                let prefixes = coalesce(&std::mem::take(&mut pending));
                let left = self.scan_prefixes(prefixes, &cancel).await;
                deferred = !left.is_empty();
                pending.extend(left);
                if cancel.is_cancelled() {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = interval.tick() => {
                    let scan = self.config.current().scan.clone();
                    if scan.enabled && !self.controls.is_paused(Adapter::Scan) {
                        pending.insert(String::new());
                    }
                }
                _ = self.controls.scan_requested.notified() => {
                    tracing::info!("Full scan requested");
                    pending.insert(String::new());
                    deferred = false;
                }
                request = rescan_rx.recv() => {
                    let Some(request) = request else { break };
                    tracing::debug!(prefix = %request.prefix, reason = %request.reason, "Subtree rescan queued");
                    pending.insert(request.prefix);
                }
                _ = tokio::time::sleep(NOT_READY_RETRY), if deferred => {
                    deferred = false;
                }
                _ = cancel.cancelled() => break,
            }
        }

        tracing::info!("Full scanner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn scan_lists_tree_and_skips_links() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("Movies/A")).unwrap();
        fs::write(root.join("Movies/A/A.mkv"), b"1234").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(root.join("Movies/A/A.mkv"), root.join("Movies/link.mkv")).unwrap();

        let mut obs = scan_tree(root, "", &CancellationToken::new()).unwrap();
        obs.sort_by(|a, b| a.path.cmp(&b.path));
        let paths: Vec<&str> = obs.iter().map(|o| o.path.as_str()).collect();
        assert_eq!(paths, vec!["Movies", "Movies/A", "Movies/A/A.mkv"]);
        assert_eq!(obs[2].size, 4);
    }

    #[test]
    fn subtree_scan_excludes_prefix_itself() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("Movies/A")).unwrap();
        fs::write(dir.path().join("Movies/A/A.mkv"), b"").unwrap();

        let obs = scan_tree(dir.path(), "Movies/A", &CancellationToken::new()).unwrap();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].path, "Movies/A/A.mkv");
    }

    #[test]
    fn missing_root_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let result = scan_tree(&dir.path().join("gone"), "", &CancellationToken::new());
        assert!(matches!(result, Err(Error::TransientSource(_))));
    }

    #[test]
    fn cancelled_scan_stops() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mkv"), b"").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(scan_tree(dir.path(), "", &cancel), Err(Error::Cancelled)));
    }

    #[test]
    fn coalesce_keeps_shallowest() {
        let set: BTreeSet<String> = ["Movies/A", "Movies", "Shows/S1", "Movies/B/C"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(coalesce(&set), vec!["Movies".to_string(), "Shows/S1".to_string()]);

        let all: BTreeSet<String> = ["", "Movies"].into_iter().map(String::from).collect();
        assert_eq!(coalesce(&all), vec![String::new()]);
    }
}
