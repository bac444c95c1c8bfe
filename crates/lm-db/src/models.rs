//! Rust structs mapping to database tables.
//!
//! Each model implements `from_row`. Inventory and operation rows keep
//! their enum columns as text so one corrupt row can be reported against
//! its path instead of failing the whole query; `into_entry` and
//! `into_operation` do the checked conversion.

use chrono::{DateTime, Utc};
use lm_core::{
    EntryKind, Error, InventoryEntry, LinkState, OperationId, OperationKind, RenameGroupId,
    Result, SyncOperation,
};
use serde::Serialize;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn conversion_failure(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    let uuid = Uuid::parse_str(&s).map_err(|e| conversion_failure(idx, e))?;
    Ok(T::from(uuid))
}

#[derive(Debug)]
struct BadEnum(String);

impl std::fmt::Display for BadEnum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for BadEnum {}

fn parse_enum<T: std::str::FromStr<Err = String>>(
    row: &rusqlite::Row,
    idx: usize,
) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_failure(idx, BadEnum(e)))
}

/// Parse an RFC 3339 timestamp written by this crate.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InventoryRow {
    pub path: String,
    pub kind: String,
    pub size: i64,
    pub modified_time: i64,
    pub fingerprint: Option<String>,
    pub state: String,
    pub last_seen_revision: i64,
    pub remote_id: Option<String>,
    pub updated_at: String,
}

impl InventoryRow {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            path: row.get(0)?,
            kind: row.get(1)?,
            size: row.get(2)?,
            modified_time: row.get(3)?,
            fingerprint: row.get(4)?,
            state: row.get(5)?,
            last_seen_revision: row.get(6)?,
            remote_id: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    /// Checked conversion; bad enum text is an integrity failure for the path.
    pub fn into_entry(self) -> Result<InventoryEntry> {
        let kind: EntryKind = self
            .kind
            .parse()
            .map_err(|e: String| Error::integrity(&self.path, e))?;
        let state: LinkState = self
            .state
            .parse()
            .map_err(|e: String| Error::integrity(&self.path, e))?;
        if self.size < 0 {
            return Err(Error::integrity(&self.path, format!("negative size {}", self.size)));
        }
        Ok(InventoryEntry {
            path: self.path,
            kind,
            size: self.size as u64,
            modified_time: self.modified_time,
            fingerprint: self.fingerprint,
            state,
            last_seen_revision: self.last_seen_revision,
            remote_id: self.remote_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// A queued operation together with its enqueue sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedOperation {
    pub seq: u64,
    pub op: SyncOperation,
}

#[derive(Debug, Clone)]
pub struct OperationRow {
    pub path: String,
    pub id: String,
    pub kind: String,
    pub entry_kind: String,
    pub revision: i64,
    pub idempotency_key: String,
    pub priority: i32,
    pub attempt_count: i64,
    pub next_retry_at: Option<String>,
    pub group_id: Option<String>,
    pub seq: i64,
    pub created_at: String,
}

impl OperationRow {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            path: row.get(0)?,
            id: row.get(1)?,
            kind: row.get(2)?,
            entry_kind: row.get(3)?,
            revision: row.get(4)?,
            idempotency_key: row.get(5)?,
            priority: row.get(6)?,
            attempt_count: row.get(7)?,
            next_retry_at: row.get(8)?,
            group_id: row.get(9)?,
            seq: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    pub fn into_operation(self) -> Result<PersistedOperation> {
        let path = self.path;
        let bad = |e: String| Error::integrity(path.clone(), e);

        let id: OperationId = self
            .id
            .parse()
            .map_err(|e: uuid::Error| bad(format!("bad operation id: {e}")))?;
        let group = match self.group_id {
            Some(raw) => Some(
                raw.parse::<RenameGroupId>()
                    .map_err(|e| bad(format!("bad group id: {e}")))?,
            ),
            None => None,
        };
        let kind: OperationKind = self.kind.parse().map_err(bad)?;
        let entry_kind: EntryKind = self.entry_kind.parse().map_err(bad)?;
        let created_at = parse_timestamp(&self.created_at)
            .ok_or_else(|| bad(format!("bad created_at '{}'", self.created_at)))?;

        Ok(PersistedOperation {
            seq: self.seq.max(0) as u64,
            op: SyncOperation {
                id,
                kind,
                path: path.clone(),
                entry_kind,
                revision: self.revision,
                idempotency_key: self.idempotency_key,
                priority: self.priority,
                attempt_count: self.attempt_count.clamp(0, u32::MAX as i64) as u32,
                next_retry_at: self.next_retry_at.as_deref().and_then(parse_timestamp),
                group,
                created_at,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// DeadLetter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: i64,
    pub operation_id: OperationId,
    pub path: String,
    pub kind: OperationKind,
    pub entry_kind: EntryKind,
    pub revision: i64,
    pub idempotency_key: String,
    pub attempt_count: u32,
    pub error: String,
    pub error_kind: String,
    pub failed_at: String,
    pub resolved_at: Option<String>,
}

impl DeadLetter {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let attempts: i64 = row.get(7)?;
        Ok(Self {
            id: row.get(0)?,
            operation_id: parse_id(row, 1)?,
            path: row.get(2)?,
            kind: parse_enum(row, 3)?,
            entry_kind: parse_enum(row, 4)?,
            revision: row.get(5)?,
            idempotency_key: row.get(6)?,
            attempt_count: attempts.clamp(0, u32::MAX as i64) as u32,
            error: row.get(8)?,
            error_kind: row.get(9)?,
            failed_at: row.get(10)?,
            resolved_at: row.get(11)?,
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Cursor {
    pub name: String,
    pub token: String,
    pub updated_at: String,
}

impl Cursor {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            token: row.get(1)?,
            updated_at: row.get(2)?,
        })
    }
}
