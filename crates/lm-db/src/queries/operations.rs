//! Durable operation queue rows.
//!
//! One row per path. Enqueueing a newer operation for a path replaces the
//! older row, so after a restart only the latest desired mutation remains.

use lm_core::{Error, OperationId, Result, SyncOperation};
use rusqlite::Connection;

use crate::models::{OperationRow, PersistedOperation};

const COLS: &str = "path, id, kind, entry_kind, revision, idempotency_key, priority,
    attempt_count, next_retry_at, group_id, seq, created_at";

/// Persist an operation under its enqueue sequence number, replacing any
/// older operation for the same path.
pub fn upsert(conn: &Connection, op: &SyncOperation, seq: u64) -> Result<()> {
    conn.execute(
        "INSERT INTO operations (path, id, kind, entry_kind, revision, idempotency_key, priority,
                                 attempt_count, next_retry_at, group_id, seq, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(path) DO UPDATE SET
             id = excluded.id,
             kind = excluded.kind,
             entry_kind = excluded.entry_kind,
             revision = excluded.revision,
             idempotency_key = excluded.idempotency_key,
             priority = excluded.priority,
             attempt_count = excluded.attempt_count,
             next_retry_at = excluded.next_retry_at,
             group_id = excluded.group_id,
             seq = excluded.seq,
             created_at = excluded.created_at",
        rusqlite::params![
            op.path,
            op.id.to_string(),
            op.kind.as_str(),
            op.entry_kind.as_str(),
            op.revision,
            op.idempotency_key,
            op.priority,
            op.attempt_count,
            op.next_retry_at.map(|t| t.to_rfc3339()),
            op.group.map(|g| g.to_string()),
            seq as i64,
            op.created_at.to_rfc3339(),
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

/// Record a failed attempt and the time of the next one.
pub fn reschedule(conn: &Connection, op: &SyncOperation) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE operations SET attempt_count = ?1, next_retry_at = ?2
             WHERE path = ?3 AND id = ?4",
            rusqlite::params![
                op.attempt_count,
                op.next_retry_at.map(|t| t.to_rfc3339()),
                op.path,
                op.id.to_string(),
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Drop the row for `path` if it still holds operation `id`.
pub fn delete(conn: &Connection, path: &str, id: OperationId) -> Result<bool> {
    let n = conn
        .execute(
            "DELETE FROM operations WHERE path = ?1 AND id = ?2",
            rusqlite::params![path, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// All queued operations in enqueue order. Corrupt rows are logged and
/// skipped.
pub fn list_all(conn: &Connection) -> Result<Vec<PersistedOperation>> {
    let q = format!("SELECT {COLS} FROM operations ORDER BY seq ASC");
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([], OperationRow::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;

    Ok(rows
        .into_iter()
        .filter_map(|row| match row.into_operation() {
            Ok(op) => Some(op),
            Err(e) => {
                tracing::error!(error = %e, "Skipping corrupt queued operation");
                None
            }
        })
        .collect())
}

/// Whether an operation is queued for `path`.
pub fn exists_for_path(conn: &Connection, path: &str) -> Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM operations WHERE path = ?1",
        [path],
        |row| row.get(0),
    )
    .map_err(|e| Error::database(e.to_string()))
}

pub fn count(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM operations", [], |row| row.get(0))
        .map_err(|e| Error::database(e.to_string()))
}

/// Highest sequence number in use, or 0 for an empty queue.
pub fn max_seq(conn: &Connection) -> Result<u64> {
    let seq: i64 = conn
        .query_row("SELECT COALESCE(MAX(seq), 0) FROM operations", [], |row| row.get(0))
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(seq.max(0) as u64)
}

/// Operations waiting for a retry, for status display.
pub fn count_retrying(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM operations WHERE attempt_count > 0",
        [],
        |row| row.get(0),
    )
    .map_err(|e| Error::database(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{get_conn, init_memory_pool};
    use chrono::Utc;
    use lm_core::{EntryKind, OperationKind};

    #[test]
    fn newer_operation_replaces_older_for_same_path() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let create = SyncOperation::new(OperationKind::CreateLink, "Movies/A.mkv", EntryKind::File, 1);
        let remove = SyncOperation::new(OperationKind::RemoveLink, "Movies/A.mkv", EntryKind::File, 2);
        upsert(&conn, &create, 1).unwrap();
        upsert(&conn, &remove, 2).unwrap();

        let all = list_all(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].op.id, remove.id);
        assert_eq!(all[0].seq, 2);
        assert!(!delete(&conn, "Movies/A.mkv", create.id).unwrap());
        assert!(delete(&conn, "Movies/A.mkv", remove.id).unwrap());
    }

    #[test]
    fn list_all_is_in_enqueue_order() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        for (seq, path) in [(3, "c.mkv"), (1, "a.mkv"), (2, "b.mkv")] {
            let op = SyncOperation::new(OperationKind::CreateLink, path, EntryKind::File, 1);
            upsert(&conn, &op, seq).unwrap();
        }
        let paths: Vec<String> = list_all(&conn).unwrap().into_iter().map(|p| p.op.path).collect();
        assert_eq!(paths, vec!["a.mkv", "b.mkv", "c.mkv"]);
        assert_eq!(max_seq(&conn).unwrap(), 3);
        assert!(exists_for_path(&conn, "b.mkv").unwrap());
    }

    #[test]
    fn reschedule_persists_attempts() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let mut op = SyncOperation::new(OperationKind::CreateLink, "a.mkv", EntryKind::File, 1);
        upsert(&conn, &op, 1).unwrap();

        op.attempt_count = 2;
        op.next_retry_at = Some(Utc::now());
        assert!(reschedule(&conn, &op).unwrap());

        let stored = &list_all(&conn).unwrap()[0].op;
        assert_eq!(stored.attempt_count, 2);
        assert!(stored.next_retry_at.is_some());
        assert_eq!(count_retrying(&conn).unwrap(), 1);
    }
}
