//! Inventory queries.
//!
//! The inventory is keyed by relative path. Prefix queries match the path
//! itself and anything below it, never siblings that merely share a
//! leading string (`Movies` does not contain `MoviesExtra`).

use chrono::Utc;
use lm_core::{Error, InventoryEntry, LinkState, OperationKind, Result, SyncOperation};
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;

use crate::models::InventoryRow;

const COLS: &str = "path, kind, size, modified_time, fingerprint, state,
    last_seen_revision, remote_id, updated_at";

/// Convert rows, logging and skipping any that fail integrity checks.
fn collect_entries(rows: Vec<InventoryRow>) -> Vec<InventoryEntry> {
    rows.into_iter()
        .filter_map(|row| match row.into_entry() {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::error!(error = %e, "Skipping corrupt inventory row");
                None
            }
        })
        .collect()
}

fn query_rows<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<InventoryRow>> {
    let mut stmt = conn.prepare(sql).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map(params, InventoryRow::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Get an entry by path.
pub fn get(conn: &Connection, path: &str) -> Result<Option<InventoryEntry>> {
    let q = format!("SELECT {COLS} FROM inventory WHERE path = ?1");
    let row = conn
        .query_row(&q, [path], InventoryRow::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))?;
    row.map(InventoryRow::into_entry).transpose()
}

/// Get an entry by the remote file id recorded for it.
pub fn get_by_remote_id(conn: &Connection, remote_id: &str) -> Result<Option<InventoryEntry>> {
    let q = format!("SELECT {COLS} FROM inventory WHERE remote_id = ?1 LIMIT 1");
    let row = conn
        .query_row(&q, [remote_id], InventoryRow::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))?;
    row.map(InventoryRow::into_entry).transpose()
}

/// Insert or fully replace an entry.
pub fn upsert(conn: &Connection, entry: &InventoryEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO inventory (path, parent_path, kind, size, modified_time, fingerprint,
                                state, last_seen_revision, remote_id, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(path) DO UPDATE SET
             parent_path = excluded.parent_path,
             kind = excluded.kind,
             size = excluded.size,
             modified_time = excluded.modified_time,
             fingerprint = excluded.fingerprint,
             state = excluded.state,
             last_seen_revision = excluded.last_seen_revision,
             remote_id = excluded.remote_id,
             updated_at = excluded.updated_at",
        rusqlite::params![
            entry.path,
            entry.parent_path(),
            entry.kind.as_str(),
            entry.size as i64,
            entry.modified_time,
            entry.fingerprint,
            entry.state.as_str(),
            entry.last_seen_revision,
            entry.remote_id,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

/// Mark an entry as awaiting removal at a new revision.
pub fn mark_pending_delete(conn: &Connection, path: &str, revision: i64) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE inventory SET state = 'pending_delete', last_seen_revision = ?2, updated_at = ?3
             WHERE path = ?1",
            rusqlite::params![path, revision, Utc::now().to_rfc3339()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Delete an entry outright.
pub fn remove(conn: &Connection, path: &str) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM inventory WHERE path = ?1", [path])
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Every entry at or below `prefix`, shallowest first.
pub fn list_under(conn: &Connection, prefix: &str) -> Result<Vec<InventoryEntry>> {
    let rows = if prefix.is_empty() {
        let q = format!("SELECT {COLS} FROM inventory ORDER BY path");
        query_rows(conn, &q, [])?
    } else {
        let q = format!(
            "SELECT {COLS} FROM inventory
             WHERE path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/'
             ORDER BY path"
        );
        query_rows(conn, &q, [prefix])?
    };
    let mut entries = collect_entries(rows);
    entries.sort_by(|a, b| {
        lm_core::path_depth(&a.path)
            .cmp(&lm_core::path_depth(&b.path))
            .then_with(|| a.path.cmp(&b.path))
    });
    Ok(entries)
}

/// One page of entries under `prefix`, optionally filtered by a SQLite
/// GLOB pattern on the path.
pub fn list_page(
    conn: &Connection,
    prefix: &str,
    pattern: Option<&str>,
    offset: i64,
    limit: i64,
) -> Result<Vec<InventoryEntry>> {
    let q = format!(
        "SELECT {COLS} FROM inventory
         WHERE (?1 = '' OR path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/')
           AND (?2 IS NULL OR path GLOB ?2)
         ORDER BY path LIMIT ?3 OFFSET ?4"
    );
    let rows = query_rows(conn, &q, rusqlite::params![prefix, pattern, limit, offset])?;
    Ok(collect_entries(rows))
}

/// Total number of entries.
pub fn count(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM inventory", [], |row| row.get(0))
        .map_err(|e| Error::database(e.to_string()))
}

/// Entry counts keyed by state text.
pub fn state_counts(conn: &Connection) -> Result<BTreeMap<String, i64>> {
    let mut stmt = conn
        .prepare("SELECT state, COUNT(*) FROM inventory GROUP BY state")
        .map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<BTreeMap<_, _>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// A consistent copy of the whole inventory, read in one transaction.
pub fn snapshot(conn: &Connection) -> Result<Vec<InventoryEntry>> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;
    let q = format!("SELECT {COLS} FROM inventory ORDER BY path");
    let rows = query_rows(&tx, &q, [])?;
    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(collect_entries(rows))
}

/// Record a successfully applied operation.
///
/// In one transaction: update the entry's state if the entry still sits at
/// the operation's revision, then drop the operation's queue row (only if
/// it is still this operation). Returns whether the inventory changed.
pub fn commit_applied(conn: &Connection, op: &SyncOperation) -> Result<bool> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;
    let now = Utc::now().to_rfc3339();

    let changed = match op.kind {
        OperationKind::CreateLink | OperationKind::UpdateLink => tx
            .execute(
                "UPDATE inventory SET state = ?1, updated_at = ?2
                 WHERE path = ?3 AND last_seen_revision = ?4 AND state != ?5",
                rusqlite::params![
                    LinkState::Linked.as_str(),
                    now,
                    op.path,
                    op.revision,
                    LinkState::PendingDelete.as_str(),
                ],
            )
            .map_err(|e| Error::database(e.to_string()))?,
        OperationKind::RemoveLink => {
            let deleted = tx
                .execute(
                    "DELETE FROM inventory
                     WHERE path = ?1 AND last_seen_revision = ?2 AND state = ?3",
                    rusqlite::params![op.path, op.revision, LinkState::PendingDelete.as_str()],
                )
                .map_err(|e| Error::database(e.to_string()))?;
            if deleted > 0 {
                deleted
            } else {
                tx.execute(
                    "UPDATE inventory SET state = ?1, updated_at = ?2
                     WHERE path = ?3 AND last_seen_revision = ?4",
                    rusqlite::params![LinkState::Unlinked.as_str(), now, op.path, op.revision],
                )
                .map_err(|e| Error::database(e.to_string()))?
            }
        }
        OperationKind::NoOp => 0,
    };

    tx.execute(
        "DELETE FROM operations WHERE path = ?1 AND id = ?2",
        rusqlite::params![op.path, op.id.to_string()],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(changed > 0)
}
