//! Dead-letter log.
//!
//! Rows are only appended; a manual retry stamps `resolved_at` instead of
//! deleting the record.

use chrono::Utc;
use lm_core::{Error, Result, SyncOperation};
use rusqlite::{Connection, OptionalExtension};

use crate::models::DeadLetter;

const COLS: &str = "id, operation_id, path, kind, entry_kind, revision, idempotency_key,
    attempt_count, error, error_kind, failed_at, resolved_at";

/// Move an operation to the dead-letter log.
///
/// Inserts the record and removes the operation's queue row in one
/// transaction. Returns the new dead-letter id.
pub fn record(conn: &Connection, op: &SyncOperation, error: &Error) -> Result<i64> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;

    tx.execute(
        "INSERT INTO dead_letters (operation_id, path, kind, entry_kind, revision, idempotency_key,
                                   attempt_count, error, error_kind, failed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            op.id.to_string(),
            op.path,
            op.kind.as_str(),
            op.entry_kind.as_str(),
            op.revision,
            op.idempotency_key,
            op.attempt_count,
            error.to_string(),
            error.kind(),
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    let id = tx.last_insert_rowid();

    tx.execute(
        "DELETE FROM operations WHERE path = ?1 AND id = ?2",
        rusqlite::params![op.path, op.id.to_string()],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(id)
}

/// List dead letters, newest first.
pub fn list(conn: &Connection, include_resolved: bool, offset: i64, limit: i64) -> Result<Vec<DeadLetter>> {
    let q = format!(
        "SELECT {COLS} FROM dead_letters
         WHERE ?1 OR resolved_at IS NULL
         ORDER BY id DESC LIMIT ?2 OFFSET ?3"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map(rusqlite::params![include_resolved, limit, offset], DeadLetter::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<DeadLetter>> {
    let q = format!("SELECT {COLS} FROM dead_letters WHERE id = ?1");
    conn.query_row(&q, [id], DeadLetter::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

pub fn count_unresolved(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM dead_letters WHERE resolved_at IS NULL",
        [],
        |row| row.get(0),
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Stamp a dead letter as resolved. Returns false if it was already
/// resolved or does not exist.
pub fn mark_resolved(conn: &Connection, id: i64) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE dead_letters SET resolved_at = ?1 WHERE id = ?2 AND resolved_at IS NULL",
            rusqlite::params![Utc::now().to_rfc3339(), id],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Whether `path` has a dead letter awaiting manual action.
pub fn has_unresolved_for_path(conn: &Connection, path: &str) -> Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM dead_letters WHERE path = ?1 AND resolved_at IS NULL",
        [path],
        |row| row.get(0),
    )
    .map_err(|e| Error::database(e.to_string()))
}
