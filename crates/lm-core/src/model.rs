//! Domain model: inventory entries, change events, sync operations and
//! notification batches.
//!
//! Paths throughout are relative to the source root, `/`-separated, without
//! leading or trailing separators. The empty string names the root itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::ids::{OperationId, RenameGroupId};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Whether an entry is a regular file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "file" => Ok(EntryKind::File),
            "directory" => Ok(EntryKind::Directory),
            other => Err(format!("unknown entry kind '{other}'")),
        }
    }
}

/// Materialization state of an inventory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Known, but no link (or mirrored directory) exists yet.
    Unlinked,
    /// The link or mirrored directory exists in the target tree.
    Linked,
    /// The source is gone; the entry is removed once its RemoveLink commits.
    PendingDelete,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Unlinked => "unlinked",
            LinkState::Linked => "linked",
            LinkState::PendingDelete => "pending_delete",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "unlinked" => Ok(LinkState::Unlinked),
            "linked" => Ok(LinkState::Linked),
            "pending_delete" => Ok(LinkState::PendingDelete),
            other => Err(format!("unknown link state '{other}'")),
        }
    }
}

/// Which adapter observed a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    Remote,
    Local,
}

impl ChangeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeSource::Remote => "remote",
            ChangeSource::Local => "local",
        }
    }
}

impl fmt::Display for ChangeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    /// The event's `path` is the new name; `from` is the old one.
    Renamed { from: String },
}

/// The kind of link mutation an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateLink,
    UpdateLink,
    RemoveLink,
    NoOp,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CreateLink => "create_link",
            OperationKind::UpdateLink => "update_link",
            OperationKind::RemoveLink => "remove_link",
            OperationKind::NoOp => "no_op",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create_link" => Ok(OperationKind::CreateLink),
            "update_link" => Ok(OperationKind::UpdateLink),
            "remove_link" => Ok(OperationKind::RemoveLink),
            "no_op" => Ok(OperationKind::NoOp),
            other => Err(format!("unknown operation kind '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Observation / ChangeEvent
// ---------------------------------------------------------------------------

/// Metadata observed for a single path by an adapter or a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Unix seconds.
    pub modified_time: i64,
    pub fingerprint: Option<String>,
    pub remote_id: Option<String>,
}

impl Observation {
    pub fn file(path: impl AsRef<str>, size: u64, modified_time: i64) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            kind: EntryKind::File,
            size,
            modified_time,
            fingerprint: None,
            remote_id: None,
        }
    }

    pub fn directory(path: impl AsRef<str>) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            kind: EntryKind::Directory,
            size: 0,
            modified_time: 0,
            fingerprint: None,
            remote_id: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }
}

/// A normalized change reported by one of the adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub source: ChangeSource,
    pub kind: ChangeKind,
    pub path: String,
    pub observed_at: DateTime<Utc>,
    /// Opaque source token (page token, event cookie), kept for diagnostics.
    pub revision: Option<String>,
    /// Present for everything except deletes.
    pub observation: Option<Observation>,
}

impl ChangeEvent {
    pub fn created(source: ChangeSource, observation: Observation) -> Self {
        Self::with_observation(source, ChangeKind::Created, observation)
    }

    pub fn modified(source: ChangeSource, observation: Observation) -> Self {
        Self::with_observation(source, ChangeKind::Modified, observation)
    }

    pub fn renamed(source: ChangeSource, from: impl AsRef<str>, observation: Observation) -> Self {
        Self::with_observation(
            source,
            ChangeKind::Renamed {
                from: normalize_path(from.as_ref()),
            },
            observation,
        )
    }

    pub fn deleted(source: ChangeSource, path: impl AsRef<str>) -> Self {
        Self {
            source,
            kind: ChangeKind::Deleted,
            path: normalize_path(path.as_ref()),
            observed_at: Utc::now(),
            revision: None,
            observation: None,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    fn with_observation(source: ChangeSource, kind: ChangeKind, observation: Observation) -> Self {
        Self {
            source,
            kind,
            path: observation.path.clone(),
            observed_at: Utc::now(),
            revision: None,
            observation: Some(observation),
        }
    }
}

// ---------------------------------------------------------------------------
// InventoryEntry
// ---------------------------------------------------------------------------

/// The persisted record of a known source path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified_time: i64,
    pub fingerprint: Option<String>,
    pub state: LinkState,
    pub last_seen_revision: i64,
    pub remote_id: Option<String>,
}

impl InventoryEntry {
    /// A fresh, unlinked entry built from an observation.
    pub fn from_observation(obs: &Observation, revision: i64) -> Self {
        Self {
            path: obs.path.clone(),
            kind: obs.kind,
            size: obs.size,
            modified_time: obs.modified_time,
            fingerprint: obs.fingerprint.clone(),
            state: LinkState::Unlinked,
            last_seen_revision: revision,
            remote_id: obs.remote_id.clone(),
        }
    }

    /// Copy observed metadata into this entry, keeping state and revision.
    ///
    /// A missing fingerprint or remote id in the observation never erases a
    /// known one; local scans cannot see either.
    pub fn absorb(&mut self, obs: &Observation) {
        self.kind = obs.kind;
        self.size = obs.size;
        self.modified_time = obs.modified_time;
        if obs.fingerprint.is_some() {
            self.fingerprint = obs.fingerprint.clone();
        }
        if obs.remote_id.is_some() {
            self.remote_id = obs.remote_id.clone();
        }
    }

    /// Whether the observation describes different content than this entry.
    ///
    /// Fingerprints are compared when both sides carry one; otherwise size
    /// and modification time decide. Directories only differ by kind.
    pub fn content_differs(&self, obs: &Observation) -> bool {
        if self.kind != obs.kind {
            return true;
        }
        if self.kind == EntryKind::Directory {
            return false;
        }
        match (&self.fingerprint, &obs.fingerprint) {
            (Some(known), Some(seen)) => known != seen,
            _ => self.size != obs.size || self.modified_time != obs.modified_time,
        }
    }

    pub fn parent_path(&self) -> Option<&str> {
        parent_of(&self.path)
    }
}

// ---------------------------------------------------------------------------
// SyncOperation
// ---------------------------------------------------------------------------

/// Priority of directory creation; parents are mirrored before their links.
pub const PRIORITY_DIRECTORY_CREATE: i32 = 20;
/// Priority of file link operations.
pub const PRIORITY_LINK: i32 = 10;
/// Priority of directory removal; children drain first.
pub const PRIORITY_DIRECTORY_REMOVE: i32 = 0;

/// A unit of work reconciling one path's desired link state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub path: String,
    pub entry_kind: EntryKind,
    pub revision: i64,
    pub idempotency_key: String,
    pub priority: i32,
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub group: Option<RenameGroupId>,
    pub created_at: DateTime<Utc>,
}

impl SyncOperation {
    pub fn new(kind: OperationKind, path: impl AsRef<str>, entry_kind: EntryKind, revision: i64) -> Self {
        let path = normalize_path(path.as_ref());
        Self {
            id: OperationId::new(),
            idempotency_key: Self::idempotency_key_for(&path, kind, revision),
            priority: Self::default_priority(kind, entry_kind),
            kind,
            path,
            entry_kind,
            revision,
            attempt_count: 0,
            next_retry_at: None,
            group: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_group(mut self, group: RenameGroupId) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// `sha256(path, kind, revision)` as lowercase hex.
    pub fn idempotency_key_for(path: &str, kind: OperationKind, revision: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(revision.to_be_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn default_priority(kind: OperationKind, entry_kind: EntryKind) -> i32 {
        match (kind, entry_kind) {
            (OperationKind::RemoveLink, EntryKind::Directory) => PRIORITY_DIRECTORY_REMOVE,
            (_, EntryKind::Directory) => PRIORITY_DIRECTORY_CREATE,
            _ => PRIORITY_LINK,
        }
    }
}

// ---------------------------------------------------------------------------
// NotificationBatch
// ---------------------------------------------------------------------------

/// Library sections to refresh in one flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationBatch {
    pub sections: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl NotificationBatch {
    pub fn new() -> Self {
        Self {
            sections: BTreeSet::new(),
            created_at: Utc::now(),
            attempt_count: 0,
        }
    }

    /// Add a section; returns false if it was already part of the batch.
    pub fn insert(&mut self, section: impl Into<String>) -> bool {
        self.sections.insert(section.into())
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }
}

impl Default for NotificationBatch {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Normalize a relative path: `/` separators, no empty or `.` components.
pub fn normalize_path(raw: &str) -> String {
    raw.split(['/', '\\'])
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Parent of a relative path, or `None` for top-level entries.
pub fn parent_of(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

/// Whether `path` equals `prefix` or lies beneath it. The empty prefix
/// contains everything.
pub fn is_within(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() || path == prefix {
        return true;
    }
    path.len() > prefix.len() && path.starts_with(prefix) && path.as_bytes()[prefix.len()] == b'/'
}

/// Number of components in a relative path.
pub fn path_depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.split('/').count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_text_round_trip() {
        for kind in [EntryKind::File, EntryKind::Directory] {
            assert_eq!(kind.as_str().parse::<EntryKind>().unwrap(), kind);
        }
        for state in [LinkState::Unlinked, LinkState::Linked, LinkState::PendingDelete] {
            assert_eq!(state.as_str().parse::<LinkState>().unwrap(), state);
        }
        assert!("bogus".parse::<LinkState>().is_err());
        assert!("move_link".parse::<OperationKind>().is_err());
    }

    #[test]
    fn normalize_strips_separators() {
        assert_eq!(normalize_path("/Movies//A.mkv/"), "Movies/A.mkv");
        assert_eq!(normalize_path("./Shows\\S01/e1.mkv"), "Shows/S01/e1.mkv");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn prefix_containment() {
        assert!(is_within("Movies/A.mkv", "Movies"));
        assert!(is_within("Movies", "Movies"));
        assert!(is_within("anything", ""));
        assert!(!is_within("MoviesExtra/A.mkv", "Movies"));
        assert!(!is_within("Movies", "Movies/A.mkv"));
    }

    #[test]
    fn parent_and_depth() {
        assert_eq!(parent_of("Movies/A.mkv"), Some("Movies"));
        assert_eq!(parent_of("Movies"), None);
        assert_eq!(path_depth("a/b/c"), 3);
        assert_eq!(path_depth(""), 0);
    }

    #[test]
    fn idempotency_key_is_stable_and_distinct() {
        let a = SyncOperation::new(OperationKind::CreateLink, "Movies/A.mkv", EntryKind::File, 3);
        let b = SyncOperation::new(OperationKind::CreateLink, "Movies/A.mkv", EntryKind::File, 3);
        assert_ne!(a.id, b.id);
        assert_eq!(a.idempotency_key, b.idempotency_key);
        assert_eq!(a.idempotency_key.len(), 64);

        let later = SyncOperation::new(OperationKind::CreateLink, "Movies/A.mkv", EntryKind::File, 4);
        let remove = SyncOperation::new(OperationKind::RemoveLink, "Movies/A.mkv", EntryKind::File, 3);
        assert_ne!(a.idempotency_key, later.idempotency_key);
        assert_ne!(a.idempotency_key, remove.idempotency_key);
    }

    #[test]
    fn priorities_order_directories_around_files() {
        let mkdir = SyncOperation::new(OperationKind::CreateLink, "Movies", EntryKind::Directory, 1);
        let link = SyncOperation::new(OperationKind::CreateLink, "Movies/A.mkv", EntryKind::File, 1);
        let rmdir = SyncOperation::new(OperationKind::RemoveLink, "Movies", EntryKind::Directory, 2);
        assert!(mkdir.priority > link.priority);
        assert!(link.priority > rmdir.priority);
    }

    #[test]
    fn content_comparison_prefers_fingerprint() {
        let obs = Observation::file("a.mkv", 100, 10).with_fingerprint("md5:aa");
        let mut entry = InventoryEntry::from_observation(&obs, 1);
        assert!(!entry.content_differs(&obs));

        // Same fingerprint, different mtime: unchanged.
        let touched = Observation::file("a.mkv", 100, 99).with_fingerprint("md5:aa");
        assert!(!entry.content_differs(&touched));

        let rewritten = Observation::file("a.mkv", 100, 10).with_fingerprint("md5:bb");
        assert!(entry.content_differs(&rewritten));

        // Local observation without fingerprint falls back to size + mtime.
        let local = Observation::file("a.mkv", 100, 10);
        assert!(!entry.content_differs(&local));
        entry.absorb(&local);
        assert_eq!(entry.fingerprint.as_deref(), Some("md5:aa"));
        assert!(entry.content_differs(&Observation::file("a.mkv", 101, 10)));
    }

    #[test]
    fn directories_differ_only_by_kind() {
        let dir = Observation::directory("Movies");
        let entry = InventoryEntry::from_observation(&dir, 1);
        let mut later = Observation::directory("Movies");
        later.modified_time = 12345;
        assert!(!entry.content_differs(&later));
        assert!(entry.content_differs(&Observation::file("Movies", 1, 1)));
    }

    #[test]
    fn rename_event_carries_both_paths() {
        let ev = ChangeEvent::renamed(
            ChangeSource::Local,
            "/Movies/A.mkv",
            Observation::file("Movies/B.mkv", 1, 1),
        );
        assert_eq!(ev.path, "Movies/B.mkv");
        assert_eq!(
            ev.kind,
            ChangeKind::Renamed {
                from: "Movies/A.mkv".into()
            }
        );
    }

    #[test]
    fn notification_batch_dedups() {
        let mut batch = NotificationBatch::new();
        assert!(batch.insert("movies"));
        assert!(!batch.insert("movies"));
        assert!(batch.insert("shows"));
        assert_eq!(batch.len(), 2);
    }
}
