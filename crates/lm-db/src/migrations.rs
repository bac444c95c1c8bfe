//! Embedded SQL migrations and runner.
//!
//! Migrations are `&str` constants applied in order inside a transaction
//! each. A `schema_migrations` table records the applied versions.

use lm_core::{Error, Result};
use rusqlite::Connection;

/// V1: inventory, durable operation queue, dead letters, cursors.
const V1_INITIAL: &str = r#"
-- Every known source path, keyed by its relative path.
CREATE TABLE inventory (
    path               TEXT PRIMARY KEY,
    parent_path        TEXT,
    kind               TEXT NOT NULL,
    size               INTEGER NOT NULL DEFAULT 0,
    modified_time      INTEGER NOT NULL DEFAULT 0,
    fingerprint        TEXT,
    state              TEXT NOT NULL DEFAULT 'unlinked',
    last_seen_revision INTEGER NOT NULL DEFAULT 0,
    remote_id          TEXT,
    updated_at         TEXT NOT NULL
);

CREATE INDEX idx_inventory_parent ON inventory(parent_path);
CREATE INDEX idx_inventory_state ON inventory(state);
CREATE INDEX idx_inventory_remote_id ON inventory(remote_id);

-- At most one queued operation per path; a newer one replaces the older.
CREATE TABLE operations (
    path            TEXT PRIMARY KEY,
    id              TEXT NOT NULL UNIQUE,
    kind            TEXT NOT NULL,
    entry_kind      TEXT NOT NULL,
    revision        INTEGER NOT NULL,
    idempotency_key TEXT NOT NULL,
    priority        INTEGER NOT NULL DEFAULT 0,
    attempt_count   INTEGER NOT NULL DEFAULT 0,
    next_retry_at   TEXT,
    group_id        TEXT,
    seq             INTEGER NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE INDEX idx_operations_seq ON operations(seq);

-- Append-only record of operations that exhausted their retries.
CREATE TABLE dead_letters (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    operation_id    TEXT NOT NULL,
    path            TEXT NOT NULL,
    kind            TEXT NOT NULL,
    entry_kind      TEXT NOT NULL,
    revision        INTEGER NOT NULL,
    idempotency_key TEXT NOT NULL,
    attempt_count   INTEGER NOT NULL,
    error           TEXT NOT NULL,
    error_kind      TEXT NOT NULL,
    failed_at       TEXT NOT NULL,
    resolved_at     TEXT
);

CREATE INDEX idx_dead_letters_path ON dead_letters(path);

-- Resumption tokens for change sources.
CREATE TABLE cursors (
    name       TEXT PRIMARY KEY,
    token      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Ordered list of all migrations.
const MIGRATIONS: &[(i64, &str)] = &[(1, V1_INITIAL)];

/// Apply every migration that has not been recorded yet.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .map_err(|e| Error::database(format!("Failed to create schema_migrations: {e}")))?;

    for &(version, sql) in MIGRATIONS {
        let applied: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(e.to_string()))?;
        if applied {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;
        tx.execute_batch(sql)
            .map_err(|e| Error::database(format!("Migration V{version} failed: {e}")))?;
        tx.execute("INSERT INTO schema_migrations (version) VALUES (?1)", [version])
            .map_err(|e| Error::database(e.to_string()))?;
        tx.commit().map_err(|e| Error::database(e.to_string()))?;

        tracing::debug!(version, "Applied migration");
    }

    Ok(())
}
