//! Symlink materializer.
//!
//! Performs the filesystem side of a [`SyncOperation`]: links under the
//! target base pointing at the same relative path under the source root.
//! Every method is blocking and idempotent; callers run it inside
//! `spawn_blocking`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use lm_core::{EntryKind, Error, OperationKind, Result, SyncOperation};

/// Marks the temporary link written beside a target during replacement.
const TEMP_MARKER: &str = ".lm-tmp-";

/// Whether the last component of `path` is a temporary link left behind by
/// an interrupted replacement.
pub fn is_temp_artifact(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.starts_with('.') && name.contains(TEMP_MARKER)
}

/// What applying an operation did to the target tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Created,
    Replaced,
    AlreadyLinked,
    Removed,
    AlreadyAbsent,
    /// Something we do not own sits at the path; left untouched.
    NotOwned,
    DirectoryCreated,
    DirectoryPresent,
    DirectoryRemoved,
    Skipped,
}

impl LinkOutcome {
    /// Whether the target tree changed.
    pub fn mutated(&self) -> bool {
        matches!(
            self,
            LinkOutcome::Created
                | LinkOutcome::Replaced
                | LinkOutcome::Removed
                | LinkOutcome::DirectoryCreated
                | LinkOutcome::DirectoryRemoved
        )
    }
}

#[derive(Debug, Clone)]
pub struct Materializer {
    source_root: PathBuf,
    target_base: PathBuf,
    overwrite: bool,
}

impl Materializer {
    pub fn new(source_root: impl Into<PathBuf>, target_base: impl Into<PathBuf>, overwrite: bool) -> Self {
        Self {
            source_root: source_root.into(),
            target_base: target_base.into(),
            overwrite,
        }
    }

    pub fn from_config(config: &lm_core::config::Config) -> Self {
        Self::new(
            &config.source.root,
            &config.target.base,
            config.target.overwrite_existing,
        )
    }

    pub fn source_path(&self, path: &str) -> PathBuf {
        self.source_root.join(path)
    }

    pub fn target_path(&self, path: &str) -> PathBuf {
        self.target_base.join(path)
    }

    pub fn apply(&self, op: &SyncOperation) -> Result<LinkOutcome> {
        if op.path.is_empty() {
            return Ok(LinkOutcome::Skipped);
        }
        match (op.kind, op.entry_kind) {
            (OperationKind::NoOp, _) => Ok(LinkOutcome::Skipped),
            (OperationKind::CreateLink | OperationKind::UpdateLink, EntryKind::Directory) => {
                self.ensure_dir(&op.path)
            }
            (OperationKind::CreateLink, EntryKind::File) => self.create_link(&op.path, false),
            (OperationKind::UpdateLink, EntryKind::File) => self.create_link(&op.path, true),
            (OperationKind::RemoveLink, EntryKind::Directory) => self.remove_dir(&op.path),
            (OperationKind::RemoveLink, EntryKind::File) => self.remove_link(&op.path),
        }
    }

    fn create_link(&self, path: &str, refresh: bool) -> Result<LinkOutcome> {
        let source = self.source_path(path);
        let target = self.target_path(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let meta = match fs::symlink_metadata(&target) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return match make_symlink(&source, &target) {
                    Ok(()) => {
                        tracing::debug!(path, "Link created");
                        Ok(LinkOutcome::Created)
                    }
                    // Raced with another writer; the retry sees what won.
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                        Err(Error::transient(format!("{} appeared while linking", target.display())))
                    }
                    Err(e) => Err(e.into()),
                };
            }
            Err(e) => return Err(e.into()),
        };

        if meta.file_type().is_symlink() {
            let current = fs::read_link(&target)?;
            if current == source {
                if refresh {
                    self.replace_atomically(&source, &target)?;
                    return Ok(LinkOutcome::Replaced);
                }
                return Ok(LinkOutcome::AlreadyLinked);
            }
            if !self.overwrite {
                return Err(Error::conflict(
                    path,
                    format!("existing link points to {}", current.display()),
                ));
            }
        } else if meta.is_dir() {
            return Err(Error::conflict(path, "a directory exists at the link path"));
        } else if !self.overwrite {
            return Err(Error::conflict(path, "a regular file exists at the link path"));
        }

        self.replace_atomically(&source, &target)?;
        tracing::info!(path, "Existing target replaced");
        Ok(LinkOutcome::Replaced)
    }

    /// Create the link beside `target` and rename it over the old entry.
    fn replace_atomically(&self, source: &Path, target: &Path) -> Result<()> {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = target.with_file_name(format!(".{name}{TEMP_MARKER}{}", uuid::Uuid::new_v4().simple()));

        let result = make_symlink(source, &tmp).and_then(|()| fs::rename(&tmp, target));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn remove_link(&self, path: &str) -> Result<LinkOutcome> {
        let target = self.target_path(path);
        match fs::symlink_metadata(&target) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(LinkOutcome::AlreadyAbsent),
            Err(e) => Err(e.into()),
            Ok(meta) if meta.file_type().is_symlink() => {
                let dest = fs::read_link(&target)?;
                let owned = dest == self.source_path(path)
                    || (is_temp_artifact(path) && dest.starts_with(&self.source_root));
                if !owned {
                    tracing::debug!(path, "Link points elsewhere, leaving it");
                    return Ok(LinkOutcome::NotOwned);
                }
                match fs::remove_file(&target) {
                    Ok(()) => Ok(LinkOutcome::Removed),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(LinkOutcome::AlreadyAbsent),
                    Err(e) => Err(e.into()),
                }
            }
            Ok(_) => {
                tracing::debug!(path, "Not a link, leaving it");
                Ok(LinkOutcome::NotOwned)
            }
        }
    }

    fn ensure_dir(&self, path: &str) -> Result<LinkOutcome> {
        let target = self.target_path(path);
        match fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => return Ok(LinkOutcome::DirectoryPresent),
            Ok(meta) if meta.file_type().is_symlink() => {
                // A file link left behind by a file that became a directory.
                if fs::read_link(&target)? != self.source_path(path) {
                    return Err(Error::conflict(path, "a foreign link exists at the directory path"));
                }
                fs::remove_file(&target)?;
            }
            Ok(_) => return Err(Error::conflict(path, "a regular file exists at the directory path")),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&target)?;
        Ok(LinkOutcome::DirectoryCreated)
    }

    fn remove_dir(&self, path: &str) -> Result<LinkOutcome> {
        let target = self.target_path(path);
        match fs::symlink_metadata(&target) {
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LinkOutcome::AlreadyAbsent),
            Err(e) => return Err(e.into()),
            Ok(meta) if !meta.is_dir() => return Ok(LinkOutcome::NotOwned),
            Ok(_) => {}
        }
        if fs::read_dir(&target)?.next().is_some() {
            return Err(Error::transient(format!("{} is not empty yet", target.display())));
        }
        match fs::remove_dir(&target) {
            Ok(()) => Ok(LinkOutcome::DirectoryRemoved),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(LinkOutcome::AlreadyAbsent),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn make_symlink(source: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, link)
}

#[cfg(windows)]
fn make_symlink(source: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(source, link)
}
