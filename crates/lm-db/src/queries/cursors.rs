//! Persisted resumption tokens for change sources.

use chrono::Utc;
use lm_core::{Error, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::models::Cursor;

pub fn get(conn: &Connection, name: &str) -> Result<Option<Cursor>> {
    conn.query_row(
        "SELECT name, token, updated_at FROM cursors WHERE name = ?1",
        [name],
        Cursor::from_row,
    )
    .optional()
    .map_err(|e| Error::database(e.to_string()))
}

pub fn get_token(conn: &Connection, name: &str) -> Result<Option<String>> {
    Ok(get(conn, name)?.map(|c| c.token))
}

pub fn set_token(conn: &Connection, name: &str, token: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO cursors (name, token, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET token = excluded.token, updated_at = excluded.updated_at",
        rusqlite::params![name, token, Utc::now().to_rfc3339()],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

pub fn clear(conn: &Connection, name: &str) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM cursors WHERE name = ?1", [name])
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{get_conn, init_memory_pool};

    #[test]
    fn token_overwrites() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        assert!(get_token(&conn, "remote.changes").unwrap().is_none());
        set_token(&conn, "remote.changes", "100").unwrap();
        set_token(&conn, "remote.changes", "142").unwrap();
        assert_eq!(get_token(&conn, "remote.changes").unwrap().as_deref(), Some("142"));
        assert!(clear(&conn, "remote.changes").unwrap());
        assert!(get_token(&conn, "remote.changes").unwrap().is_none());
    }
}
