//! Storage maintenance: size accounting, incremental vacuum, online
//! backups and a writability probe.

use lm_core::{Error, Result};
use rusqlite::Connection;
use std::path::Path;

/// Allocated size of the database file in bytes.
pub fn database_size_bytes(conn: &Connection) -> Result<u64> {
    let pages: i64 = conn
        .query_row("PRAGMA page_count", [], |row| row.get(0))
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(pages.max(0) as u64 * page_size(conn)?)
}

pub fn page_size(conn: &Connection) -> Result<u64> {
    let size: i64 = conn
        .query_row("PRAGMA page_size", [], |row| row.get(0))
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(size.max(0) as u64)
}

/// Pages on the freelist, reclaimable by incremental vacuum.
pub fn freelist_pages(conn: &Connection) -> Result<u64> {
    let pages: i64 = conn
        .query_row("PRAGMA freelist_count", [], |row| row.get(0))
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(pages.max(0) as u64)
}

/// Release up to `pages` free pages back to the filesystem. Returns the
/// number released.
pub fn incremental_vacuum(conn: &Connection, pages: u64) -> Result<u64> {
    let before = freelist_pages(conn)?;
    // The pragma returns one row per freed page; drain them.
    let mut stmt = conn
        .prepare(&format!("PRAGMA incremental_vacuum({pages})"))
        .map_err(|e| Error::database(e.to_string()))?;
    let mut rows = stmt.query([]).map_err(|e| Error::database(e.to_string()))?;
    while rows
        .next()
        .map_err(|e| Error::database(e.to_string()))?
        .is_some()
    {}
    let after = freelist_pages(conn)?;
    Ok(before.saturating_sub(after))
}

/// Write a consistent copy of the live database to `dest`.
pub fn vacuum_into(conn: &Connection, dest: &Path) -> Result<()> {
    if dest.exists() {
        return Err(Error::Validation(format!(
            "backup destination {} already exists",
            dest.display()
        )));
    }
    conn.execute("VACUUM INTO ?1", [dest.to_string_lossy().into_owned()])
        .map_err(|e| Error::database(format!("backup to {} failed: {e}", dest.display())))?;
    Ok(())
}

/// Take and release a write lock to prove the store accepts writes.
pub fn check_writable(conn: &Connection) -> Result<()> {
    conn.execute_batch("BEGIN IMMEDIATE; ROLLBACK;")
        .map_err(|e| Error::database(format!("store is not writable: {e}")))
}
