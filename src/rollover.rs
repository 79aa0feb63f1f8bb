//! Journal of pushed patches and the way back.
//!
//! Every successful push made by [`crate::sync::RemoteFileSync`] is recorded
//! here together with the snapshot of the content it replaced. When a later
//! step fails the journal is replayed newest first, pushing each snapshot
//! back to its host. Snapshots are deleted once their entry leaves the
//! journal. The journal can be persisted as JSON so that a
//! rollback also works from a later process.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::backup::BackupStore;
use crate::connection::{RemoteSession, RemoteTarget, ReplaceOptions};
use crate::error::{Error, Result};
use crate::generate::write_atomic;

/// File name of the persisted journal inside the staging directory
pub const JOURNAL_FILE: &str = "rollover.json";

/// One pushed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverEntry {
    /// Host name, as understood by a [`TargetResolver`]
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Path of the file on the host
    pub remote_path: PathBuf,
    /// Local snapshot of the content from before this push
    pub backup: PathBuf,
    /// Local copy of the content from before the first push ever
    pub pristine: PathBuf,
    pub recorded_at: DateTime<Utc>,
}

impl RolloverEntry {
    /// Entry for a push to `target`, stamped now
    pub fn new(
        target: &RemoteTarget,
        remote_path: impl Into<PathBuf>,
        backup: impl Into<PathBuf>,
        pristine: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: target.name.clone(),
            port: target.port,
            user: target.user.clone(),
            remote_path: remote_path.into(),
            backup: backup.into(),
            pristine: pristine.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Maps a host name from the journal back to a connectable target.
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, host: &str) -> Result<RemoteTarget>;
}

impl TargetResolver for RemoteTarget {
    fn resolve(&self, host: &str) -> Result<RemoteTarget> {
        if host == self.name {
            Ok(self.clone())
        } else {
            Err(Error::HostNotFound(host.to_string()))
        }
    }
}

impl TargetResolver for Vec<RemoteTarget> {
    fn resolve(&self, host: &str) -> Result<RemoteTarget> {
        self.iter()
            .find(|t| t.name == host)
            .cloned()
            .ok_or_else(|| Error::HostNotFound(host.to_string()))
    }
}

/// Records pushes and undoes them.
#[derive(Debug)]
pub struct RolloverManager {
    session: RemoteSession,
    entries: Mutex<Vec<RolloverEntry>>,
    journal: Option<PathBuf>,
    span: Span,
}

impl RolloverManager {
    /// In-memory journal
    pub fn new(session: RemoteSession) -> Self {
        Self {
            session,
            entries: Mutex::new(Vec::new()),
            journal: None,
            span: info_span!("rollover"),
        }
    }

    /// Journal persisted at `path`, loading any entries already there.
    pub fn with_journal(session: RemoteSession, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let data = std::fs::read(&path).map_err(|e| Error::file_io(&path, e))?;
            serde_json::from_slice(&data)?
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), entries = entries.len(), "Loaded rollover journal");

        Ok(Self {
            session,
            entries: Mutex::new(entries),
            journal: Some(path),
            span: info_span!("rollover"),
        })
    }

    /// Log under `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_deref()
    }

    /// Snapshot of the recorded entries, oldest first
    pub fn entries(&self) -> Vec<RolloverEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Append `entry` to the journal.
    pub fn record(&self, entry: RolloverEntry) -> Result<()> {
        let _enter = self.span.enter();
        debug!(host = %entry.host, path = %entry.remote_path.display(), "Recording push");
        let mut entries = self.entries.lock();
        entries.push(entry);
        self.save(&entries)
    }

    /// Forget every entry; the pushed changes are kept.
    pub fn commit(&self) -> Result<()> {
        let _enter = self.span.enter();
        let mut entries = self.entries.lock();
        info!(entries = entries.len(), "Committing rollover journal");
        let dropped: Vec<_> = entries.drain(..).collect();
        self.save(&entries)?;
        discard_snapshots(&dropped);
        Ok(())
    }

    /// Push back the snapshot of the newest entry.
    ///
    /// Returns the entry undone, or `None` for an empty journal. The entry
    /// stays in the journal if the push fails.
    pub async fn rollback_last(&self, resolver: &dyn TargetResolver) -> Result<Option<RolloverEntry>> {
        let Some(entry) = self.entries.lock().last().cloned() else {
            return Ok(None);
        };

        self.push_copy(resolver, &entry, &entry.backup)
            .instrument(self.span.clone())
            .await?;

        let mut entries = self.entries.lock();
        if entries.last() == Some(&entry) {
            entries.pop();
        }
        self.save(&entries)?;
        discard_snapshots(std::slice::from_ref(&entry));
        Ok(Some(entry))
    }

    /// Undo every entry, newest first, stopping at the first failure.
    pub async fn rollback_all(&self, resolver: &dyn TargetResolver) -> Result<Vec<RolloverEntry>> {
        let mut undone = Vec::new();
        while let Some(entry) = self.rollback_last(resolver).await? {
            undone.push(entry);
        }
        info!(undone = undone.len(), "Rolled back all recorded pushes");
        Ok(undone)
    }

    /// Push the pristine copy of `remote_path` back to `host`.
    ///
    /// Journal entries for that file are dropped, since the file is back to
    /// its state from before any of them.
    pub async fn restore_pristine(
        &self,
        resolver: &dyn TargetResolver,
        host: &str,
        remote_path: &Path,
    ) -> Result<()> {
        let entry = self
            .entries
            .lock()
            .iter()
            .rev()
            .find(|e| e.host == host && e.remote_path == remote_path)
            .cloned()
            .ok_or_else(|| {
                Error::Rollback(format!(
                    "no recorded push of '{}' to {}",
                    remote_path.display(),
                    host
                ))
            })?;

        self.push_copy(resolver, &entry, &entry.pristine)
            .instrument(self.span.clone())
            .await?;

        let mut entries = self.entries.lock();
        let (dropped, kept): (Vec<_>, Vec<_>) = entries
            .drain(..)
            .partition(|e| e.host == host && e.remote_path == remote_path);
        *entries = kept;
        self.save(&entries)?;
        discard_snapshots(&dropped);
        Ok(())
    }

    async fn push_copy(
        &self,
        resolver: &dyn TargetResolver,
        entry: &RolloverEntry,
        copy: &Path,
    ) -> Result<()> {
        let target = resolver.resolve(&entry.host)?;
        let content = tokio::fs::read(copy).await.map_err(|e| {
            Error::Rollback(format!("cannot read '{}': {}", copy.display(), e))
        })?;

        info!(
            host = %entry.host,
            path = %entry.remote_path.display(),
            from = %copy.display(),
            "Rolling back"
        );
        if let Err(e) = self
            .session
            .replace(&target, &content, &entry.remote_path, &ReplaceOptions::default())
            .await
        {
            warn!(host = %entry.host, error = %e, "Rollback push failed");
            return Err(e);
        }
        Ok(())
    }

    fn save(&self, entries: &[RolloverEntry]) -> Result<()> {
        let Some(path) = &self.journal else {
            return Ok(());
        };
        let data = serde_json::to_vec_pretty(entries)?;
        write_atomic(path, &data)
    }
}

fn discard_snapshots(entries: &[RolloverEntry]) {
    for entry in entries {
        if let Err(e) = BackupStore::discard(&entry.backup) {
            warn!(path = %entry.backup.display(), error = %e, "Could not remove snapshot");
        }
    }
}
