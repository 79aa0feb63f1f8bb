//! Pristine and rolling backup copies of staged files.
//!
//! Before a staged file is overwritten with patched content, [`BackupStore`]
//! secures two copies next to it:
//!
//! * `<name>.orig`, the pristine copy, written only the first time the file
//!   is ever patched and never touched again;
//! * `<name>.bak`, the rolling copy, rewritten before every patch;
//! * `<name>.bak.<n>`, a snapshot per patch that nothing else overwrites,
//!   so each push can be undone on its own.
//!
//! If any copy cannot be written the caller must not go on to modify the
//! original.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info_span, Span};

use crate::connection::session::suffixed;
use crate::error::{Error, Result};

/// Default suffix of the rolling backup
pub const DEFAULT_BACKUP_SUFFIX: &str = ".bak";

/// Default suffix of the pristine copy
pub const DEFAULT_PRISTINE_SUFFIX: &str = ".orig";

/// Where the copies of one file were secured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Pristine copy
    pub pristine: PathBuf,
    /// Rolling copy holding the content from just before this patch
    pub backup: PathBuf,
    /// Copy of the same content owned by this patch alone
    pub snapshot: PathBuf,
    /// Whether this call wrote the pristine copy
    pub pristine_created: bool,
}

/// Writes and restores backup copies on the local filesystem.
#[derive(Debug, Clone)]
pub struct BackupStore {
    backup_suffix: String,
    pristine_suffix: String,
    span: Span,
}

impl Default for BackupStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupStore {
    /// Store using `.bak` and `.orig`
    pub fn new() -> Self {
        Self {
            backup_suffix: DEFAULT_BACKUP_SUFFIX.to_string(),
            pristine_suffix: DEFAULT_PRISTINE_SUFFIX.to_string(),
            span: info_span!("backup_store"),
        }
    }

    /// Use another rolling backup suffix
    pub fn with_backup_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.backup_suffix = suffix.into();
        self
    }

    /// Use another pristine suffix
    pub fn with_pristine_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.pristine_suffix = suffix.into();
        self
    }

    /// Log under `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn backup_suffix(&self) -> &str {
        &self.backup_suffix
    }

    pub fn pristine_suffix(&self) -> &str {
        &self.pristine_suffix
    }

    /// Rolling backup path for `path`
    pub fn backup_path(&self, path: &Path) -> PathBuf {
        suffixed(path, &self.backup_suffix)
    }

    /// Pristine copy path for `path`
    pub fn pristine_path(&self, path: &Path) -> PathBuf {
        suffixed(path, &self.pristine_suffix)
    }

    /// Secure `content`, the current content of `path`.
    ///
    /// The pristine copy is created with create-new semantics, so an
    /// existing one is never overwritten even by concurrent callers.
    pub fn secure(&self, path: &Path, content: &[u8]) -> Result<BackupRecord> {
        let _enter = self.span.enter();
        let pristine = self.pristine_path(path);
        let backup = self.backup_path(path);

        let pristine_created = write_new(&pristine, content)?;
        if pristine_created {
            debug!(path = %pristine.display(), "Created pristine copy");
        }

        std::fs::write(&backup, content).map_err(|e| Error::backup(&backup, e))?;
        debug!(path = %backup.display(), bytes = content.len(), "Wrote rolling backup");

        let snapshot = self.snapshot(&backup, content)?;

        Ok(BackupRecord {
            pristine,
            backup,
            snapshot,
            pristine_created,
        })
    }

    /// Write `content` to the first free `<backup>.<n>`.
    fn snapshot(&self, backup: &Path, content: &[u8]) -> Result<PathBuf> {
        for n in 1..=u32::MAX {
            let path = suffixed(backup, &format!(".{}", n));
            if write_new(&path, content)? {
                debug!(path = %path.display(), "Wrote snapshot");
                return Ok(path);
            }
        }
        Err(Error::backup(
            backup,
            std::io::Error::new(ErrorKind::AlreadyExists, "no free snapshot name"),
        ))
    }

    /// Remove a snapshot that is no longer needed.
    ///
    /// A snapshot that is already gone is not an error.
    pub fn discard(snapshot: &Path) -> Result<()> {
        match std::fs::remove_file(snapshot) {
            Ok(()) => {
                debug!(path = %snapshot.display(), "Discarded snapshot");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::file_io(snapshot, e)),
        }
    }

    /// Copy the rolling backup of `path` back over it.
    pub fn restore_backup(&self, path: &Path) -> Result<PathBuf> {
        self.restore(path, self.backup_path(path))
    }

    /// Copy the pristine copy of `path` back over it.
    pub fn restore_pristine(&self, path: &Path) -> Result<PathBuf> {
        self.restore(path, self.pristine_path(path))
    }

    fn restore(&self, path: &Path, copy: PathBuf) -> Result<PathBuf> {
        let _enter = self.span.enter();
        if !copy.exists() {
            return Err(Error::file_io_msg(&copy, "no copy to restore from"));
        }
        std::fs::copy(&copy, path).map_err(|e| Error::file_io(path, e))?;
        debug!(from = %copy.display(), to = %path.display(), "Restored");
        Ok(copy)
    }
}

/// Create `path` holding `content`; `false` if it already exists.
fn write_new(path: &Path, content: &[u8]) -> Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(content)
                .and_then(|_| file.sync_all())
                .map_err(|e| Error::backup(path, e))?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(Error::backup(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pristine_written_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nova.conf");
        let store = BackupStore::new();

        let first = store.secure(&path, b"v1\n").unwrap();
        assert!(first.pristine_created);
        assert_eq!(first.pristine, dir.path().join("nova.conf.orig"));

        let second = store.secure(&path, b"v2\n").unwrap();
        assert!(!second.pristine_created);
        assert_eq!(std::fs::read(&second.pristine).unwrap(), b"v1\n");
        assert_eq!(std::fs::read(&second.backup).unwrap(), b"v2\n");
    }

    #[test]
    fn test_snapshots_are_per_call() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nova.conf");
        let store = BackupStore::new();

        let first = store.secure(&path, b"v1\n").unwrap();
        let second = store.secure(&path, b"v2\n").unwrap();
        assert_eq!(first.snapshot, dir.path().join("nova.conf.bak.1"));
        assert_eq!(second.snapshot, dir.path().join("nova.conf.bak.2"));
        assert_eq!(std::fs::read(&first.snapshot).unwrap(), b"v1\n");
        assert_eq!(std::fs::read(&second.snapshot).unwrap(), b"v2\n");

        BackupStore::discard(&first.snapshot).unwrap();
        assert!(!first.snapshot.exists());
        BackupStore::discard(&first.snapshot).unwrap();
    }

    #[test]
    fn test_custom_suffixes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exports");
        let store = BackupStore::new()
            .with_backup_suffix(".prev")
            .with_pristine_suffix(".dist");

        let record = store.secure(&path, b"x").unwrap();
        assert_eq!(record.backup, dir.path().join("exports.prev"));
        assert_eq!(record.pristine, dir.path().join("exports.dist"));
    }

    #[test]
    fn test_failure_is_backup_creation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing-dir").join("file.conf");
        let err = BackupStore::new().secure(&path, b"x").unwrap_err();
        assert!(matches!(err, Error::BackupCreation { .. }));
    }

    #[test]
    fn test_restore() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("libvirtd.conf");
        let store = BackupStore::new();

        store.secure(&path, b"original\n").unwrap();
        store.secure(&path, b"first patch\n").unwrap();
        std::fs::write(&path, b"second patch\n").unwrap();

        store.restore_backup(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first patch\n");

        store.restore_pristine(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"original\n");
    }

    #[test]
    fn test_restore_without_copy_fails() {
        let dir = TempDir::new().unwrap();
        let err = BackupStore::new()
            .restore_backup(&dir.path().join("nothing"))
            .unwrap_err();
        assert!(matches!(err, Error::FileIo { .. }));
    }
}
