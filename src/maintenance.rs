//! Database backups, inventory snapshots and compaction.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use lm_core::config::Config;
use lm_core::{EntryKind, Error, InventoryEntry, LinkState, Result};
use lm_db::pool::{get_conn, DbPool};
use lm_db::queries::{inventory, maintenance};

use crate::context::ConfigStore;

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";
const SNAPSHOT_PREFIX: &str = "inventory-";

/// Write a consistent copy of the database next to it (or into
/// `database.backup_dir`) and prune old backups.
pub fn backup_database(db: &DbPool, config: &Config) -> Result<PathBuf> {
    let dir = config.backup_dir();
    if !dir.as_os_str().is_empty() {
        std::fs::create_dir_all(&dir)?;
    }
    let stem = backup_stem(config);
    let dest = dir.join(format!("{stem}.{}.bak", Utc::now().format(TIMESTAMP_FORMAT)));

    let conn = get_conn(db)?;
    maintenance::vacuum_into(&conn, &dest)?;
    tracing::info!(path = %dest.display(), "Database backup written");

    let removed = prune(&dir, |name| name.starts_with(&format!("{stem}.")) && name.ends_with(".bak"), config.database.backup_count)?;
    if removed > 0 {
        tracing::debug!(removed, "Pruned old database backups");
    }
    Ok(dest)
}

fn backup_stem(config: &Config) -> String {
    config
        .database
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "linkmirror.db".to_string())
}

/// Delete the oldest matching files in `dir` beyond `keep`. Names embed a
/// sortable timestamp, so lexical order is age order.
fn prune(dir: &Path, matches: impl Fn(&str) -> bool, keep: usize) -> Result<usize> {
    let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| matches(n))
        .collect();
    names.sort();

    let excess = names.len().saturating_sub(keep);
    for name in names.iter().take(excess) {
        if let Err(e) = std::fs::remove_file(dir.join(name)) {
            tracing::warn!(file = %name, error = %e, "Failed to prune old file");
        }
    }
    Ok(excess)
}

/// A directory in a snapshot tree.
#[derive(Debug, Default, Serialize)]
pub struct SnapshotNode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<LinkState>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub directories: BTreeMap<String, SnapshotNode>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, SnapshotFile>,
}

#[derive(Debug, Serialize)]
pub struct SnapshotFile {
    pub size: u64,
    pub modified_time: i64,
    pub state: LinkState,
}

#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub taken_at: String,
    pub entries: usize,
    pub root: SnapshotNode,
}

/// Fold flat inventory entries into a directory tree.
pub fn build_tree(entries: &[InventoryEntry]) -> SnapshotNode {
    let mut root = SnapshotNode::default();
    for entry in entries {
        let mut parts: Vec<&str> = entry.path.split('/').filter(|p| !p.is_empty()).collect();
        let Some(name) = parts.pop() else { continue };

        let mut node = &mut root;
        for part in parts {
            node = node.directories.entry(part.to_string()).or_default();
        }
        match entry.kind {
            EntryKind::Directory => {
                node.directories.entry(name.to_string()).or_default().state = Some(entry.state);
            }
            EntryKind::File => {
                node.files.insert(
                    name.to_string(),
                    SnapshotFile {
                        size: entry.size,
                        modified_time: entry.modified_time,
                        state: entry.state,
                    },
                );
            }
        }
    }
    root
}

/// Write the inventory as a JSON tree into `snapshot.output_dir`.
pub fn write_snapshot(db: &DbPool, config: &Config) -> Result<PathBuf> {
    let entries = {
        let conn = get_conn(db)?;
        inventory::snapshot(&conn)?
    };
    let now = Utc::now();
    let snapshot = Snapshot {
        taken_at: now.to_rfc3339(),
        entries: entries.len(),
        root: build_tree(&entries),
    };

    let dir = &config.snapshot.output_dir;
    std::fs::create_dir_all(dir)?;
    let dest = dir.join(format!("{SNAPSHOT_PREFIX}{}.json", now.format(TIMESTAMP_FORMAT)));
    let json = serde_json::to_vec_pretty(&snapshot).map_err(|e| Error::Internal(format!("snapshot encoding failed: {e}")))?;
    std::fs::write(&dest, json)?;
    tracing::info!(path = %dest.display(), entries = snapshot.entries, "Inventory snapshot written");

    prune(dir, |name| name.starts_with(SNAPSHOT_PREFIX) && name.ends_with(".json"), config.snapshot.max_snapshots)?;
    Ok(dest)
}

/// Reclaim free pages once the database grows past the threshold.
/// Returns the number of pages released. `cancel` is checked before every
/// step, so shutdown waits for at most one step.
pub fn compact_if_needed(db: &DbPool, config: &Config, cancel: &CancellationToken) -> Result<u64> {
    let conn = get_conn(db)?;
    let size = maintenance::database_size_bytes(&conn)?;
    if size < config.database.vacuum_threshold_bytes {
        return Ok(0);
    }

    let step = u64::from(config.database.vacuum_step_pages.max(1));
    let mut released = 0;
    loop {
        if cancel.is_cancelled() {
            tracing::info!(released_pages = released, "Compaction interrupted");
            break;
        }
        let freed = maintenance::incremental_vacuum(&conn, step)?;
        released += freed;
        if freed < step {
            break;
        }
    }
    if released > 0 {
        tracing::info!(size_bytes = size, released_pages = released, "Database compacted");
    }
    Ok(released)
}

/// Run backups, snapshots and compaction on their intervals.
pub async fn run_maintenance(db: DbPool, config: Arc<ConfigStore>, cancel: CancellationToken) {
    tracing::info!("Maintenance task started");
    let initial = config.current();
    let mut backups = tokio::time::interval(Duration::from_secs(initial.database.backup_interval_secs.max(60)));
    let mut snapshots = tokio::time::interval(Duration::from_secs(initial.snapshot.interval_secs.max(60)));
    backups.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    snapshots.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Skip the immediate first tick.
    backups.tick().await;
    snapshots.tick().await;

    loop {
        tokio::select! {
            _ = backups.tick() => {
                let (db, config, cancel) = (db.clone(), config.current(), cancel.clone());
                let result = tokio::task::spawn_blocking(move || {
                    backup_database(&db, &config)?;
                    compact_if_needed(&db, &config, &cancel)
                })
                .await;
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "Database maintenance failed"),
                    Err(e) => tracing::error!(error = %e, "Database maintenance task panicked"),
                }
            }
            _ = snapshots.tick() => {
                let (db, config) = (db.clone(), config.current());
                if config.snapshot.enabled {
                    match tokio::task::spawn_blocking(move || write_snapshot(&db, &config)).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::warn!(error = %e, "Snapshot failed"),
                        Err(e) => tracing::error!(error = %e, "Snapshot task panicked"),
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    tracing::info!("Maintenance task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use lm_core::Observation;
    use lm_db::pool::init_pool;

    fn setup() -> (tempfile::TempDir, DbPool, Config) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.database.path = dir.path().join("lm.db");
        config.database.backup_count = 2;
        config.snapshot.output_dir = dir.path().join("snapshots");
        config.snapshot.max_snapshots = 1;
        let pool = init_pool(&config.database.path.to_string_lossy()).unwrap();
        (dir, pool, config)
    }

    fn seed(pool: &DbPool) {
        let conn = get_conn(pool).unwrap();
        for obs in [
            Observation::directory("Movies"),
            Observation::file("Movies/A.mkv", 10, 1),
            Observation::file("Shows/S1/E1.mkv", 20, 2),
        ] {
            inventory::upsert(&conn, &InventoryEntry::from_observation(&obs, 1)).unwrap();
        }
    }

    #[test]
    fn backups_are_pruned_to_count() {
        let (dir, pool, config) = setup();
        for _ in 0..3 {
            backup_database(&pool, &config).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
            .count();
        assert_eq!(backups, 2);
    }

    #[test]
    fn snapshot_is_a_tree() {
        let (_dir, pool, config) = setup();
        seed(&pool);
        let first = write_snapshot(&pool, &config).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let second = write_snapshot(&pool, &config).unwrap();
        assert!(!first.exists());

        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&second).unwrap()).unwrap();
        assert_eq!(json["entries"], 3);
        assert_eq!(json["root"]["directories"]["Movies"]["files"]["A.mkv"]["size"], 10);
        assert_eq!(
            json["root"]["directories"]["Shows"]["directories"]["S1"]["files"]["E1.mkv"]["state"],
            "unlinked"
        );
    }

    #[test]
    fn compaction_skips_small_databases() {
        let (_dir, pool, config) = setup();
        assert_eq!(compact_if_needed(&pool, &config, &CancellationToken::new()).unwrap(), 0);
    }

    #[test]
    fn compaction_releases_free_pages() {
        let (_dir, pool, mut config) = setup();
        fill_and_clear(&pool);
        config.database.vacuum_threshold_bytes = 0;
        config.database.vacuum_step_pages = 8;
        assert!(compact_if_needed(&pool, &config, &CancellationToken::new()).unwrap() > 0);
    }

    #[test]
    fn cancelled_compaction_stops_between_steps() {
        let (_dir, pool, mut config) = setup();
        fill_and_clear(&pool);
        config.database.vacuum_threshold_bytes = 0;
        config.database.vacuum_step_pages = 8;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let released = compact_if_needed(&pool, &config, &cancel).unwrap();
        assert!(released <= 8, "released {released} pages after cancellation");

        // The free pages are still there for the next run.
        assert!(compact_if_needed(&pool, &config, &CancellationToken::new()).unwrap() > 0);
    }

    fn fill_and_clear(pool: &DbPool) {
        let conn = get_conn(pool).unwrap();
        for i in 0..500 {
            let obs = Observation::file(format!("Movies/{i:04}-{}.mkv", "x".repeat(200)), 1, 1);
            inventory::upsert(&conn, &InventoryEntry::from_observation(&obs, 1)).unwrap();
        }
        conn.execute("DELETE FROM inventory", []).unwrap();
    }
}
