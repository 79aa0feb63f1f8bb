//! Patching files that live on remote hosts.
//!
//! [`RemoteFileSync`] composes a [`RemoteSession`] with the [`ConfigPatcher`]
//! and the [`BackupStore`]:
//!
//! 1. fetch the remote file into `<staging>/<host>/<remote path>`;
//! 2. patch it in memory;
//! 3. if anything changed, secure the pristine, rolling and per-push copies
//!    of the fetched content and write the result over the staged copy;
//! 4. push it back through a staged remote file and a rename.
//!
//! The remote file is only written in step 4, after everything else has
//! succeeded. Each step opens its own connection.

use futures::future::join_all;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, info_span, Instrument, Span};

use crate::backup::{BackupRecord, BackupStore};
use crate::connection::{Connector, RemoteSession, RemoteTarget, ReplaceOptions, TransferDirection};
use crate::error::{Error, Result};
use crate::generate::{write_atomic, GeneratedFile, GeneratedFileWriter};
use crate::patch::{ConfigDocument, ConfigPatcher, PatchDirective, PatchReport};
use crate::rollover::{RolloverEntry, RolloverManager};

/// Result of patching one remote file.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    /// Host the file lives on
    pub host: String,
    pub remote_path: PathBuf,
    /// Local staged copy, holding the patched content
    pub staged: PathBuf,
    /// Copies secured before the push; `None` when nothing was pushed
    pub backup: Option<BackupRecord>,
    pub report: PatchReport,
    /// Unified diff from the fetched content to the patched content
    pub diff: String,
    /// Whether the file was pushed back; unchanged files are not
    pub pushed: bool,
}

/// Fetch, patch and push remote files.
#[derive(Debug, Clone)]
pub struct RemoteFileSync {
    session: RemoteSession,
    patcher: ConfigPatcher,
    backups: BackupStore,
    writer: GeneratedFileWriter,
    staging_dir: PathBuf,
    mirror_pristine: bool,
    rollover: Option<Arc<RolloverManager>>,
    span: Span,
}

impl RemoteFileSync {
    /// Sync through `connector`, staging files under `staging_dir`
    pub fn new(connector: Arc<dyn Connector>, staging_dir: impl Into<PathBuf>) -> Self {
        Self::with_session(RemoteSession::new(connector), staging_dir)
    }

    /// Sync through an existing session layer
    pub fn with_session(session: RemoteSession, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            session,
            patcher: ConfigPatcher::new(),
            backups: BackupStore::new(),
            writer: GeneratedFileWriter::new(),
            staging_dir: staging_dir.into(),
            mirror_pristine: false,
            rollover: None,
            span: info_span!("remote_file_sync"),
        }
    }

    /// Use `backups` for the staged copies
    pub fn with_backups(mut self, backups: BackupStore) -> Self {
        self.backups = backups;
        self
    }

    /// Record successful pushes in `rollover`
    pub fn with_rollover(mut self, rollover: Arc<RolloverManager>) -> Self {
        self.rollover = Some(rollover);
        self
    }

    /// Also keep a pristine copy on the remote host, next to the file
    pub fn mirror_pristine(mut self, enabled: bool) -> Self {
        self.mirror_pristine = enabled;
        self
    }

    /// Log under `span`; the session, patcher and backup store follow it
    pub fn with_span(mut self, span: Span) -> Self {
        self.session = self.session.with_span(span.clone());
        self.patcher = self.patcher.with_span(span.clone());
        self.backups = self.backups.with_span(span.clone());
        self.writer = self.writer.with_span(span.clone());
        self.span = span;
        self
    }

    pub fn session(&self) -> &RemoteSession {
        &self.session
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn rollover(&self) -> Option<&Arc<RolloverManager>> {
        self.rollover.as_ref()
    }

    /// Local staging path of `remote_path` on `target`.
    ///
    /// Root and `..` components are dropped so the result always stays
    /// inside the host's staging directory.
    pub fn staged_path(&self, target: &RemoteTarget, remote_path: &Path) -> PathBuf {
        let mut staged = self.staging_dir.join(&target.name);
        for component in remote_path.components() {
            if let Component::Normal(part) = component {
                staged.push(part);
            }
        }
        staged
    }

    /// Download `remote_path` into the staging area.
    pub async fn fetch(&self, target: &RemoteTarget, remote_path: &Path) -> Result<PathBuf> {
        let staged = self.staged_path(target, remote_path);
        if let Some(parent) = staged.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::file_io(parent, e))?;
        }
        self.session
            .copy(target, TransferDirection::Get, &staged, remote_path)
            .await?;
        debug!(host = %target.name, remote = %remote_path.display(), staged = %staged.display(), "Fetched");
        Ok(staged)
    }

    /// Replace `remote_path` with the content of `local_path`.
    pub async fn push(&self, target: &RemoteTarget, local_path: &Path, remote_path: &Path) -> Result<()> {
        let content = tokio::fs::read(local_path)
            .await
            .map_err(|e| Error::file_io(local_path, e))?;
        let options = ReplaceOptions {
            pristine_suffix: self
                .mirror_pristine
                .then(|| self.backups.pristine_suffix().to_string()),
            ..ReplaceOptions::default()
        };
        self.session.replace(target, &content, remote_path, &options).await
    }

    /// Apply `directives` to `remote_path` on `target`.
    ///
    /// On any error the remote file is left as it was. With nothing to
    /// change nothing is backed up or pushed.
    pub async fn patch_remote(
        &self,
        target: &RemoteTarget,
        remote_path: &Path,
        directives: &[PatchDirective],
    ) -> Result<SyncOutcome> {
        let span = info_span!(parent: &self.span, "patch_remote", host = %target.name, path = %remote_path.display());
        async {
            let staged = self.fetch(target, remote_path).await?;
            let content = tokio::fs::read(&staged)
                .await
                .map_err(|e| Error::file_io(&staged, e))?;

            let document = ConfigDocument::from_bytes(remote_path.display().to_string(), &content)?;
            let (patched, report) = self.patcher.apply(&document, directives)?;
            let diff = document.unified_diff(&patched);

            if !report.changed {
                info!(host = %target.name, path = %remote_path.display(), "Already up to date");
                return Ok(SyncOutcome {
                    host: target.name.clone(),
                    remote_path: remote_path.to_path_buf(),
                    staged,
                    backup: None,
                    report,
                    diff,
                    pushed: false,
                });
            }

            let backup = self.backups.secure(&staged, &content)?;
            write_atomic(&staged, patched.to_text().as_bytes())?;
            self.push_recorded(target, &staged, remote_path, &backup).await?;
            info!(host = %target.name, "{}", report.summary());

            Ok(SyncOutcome {
                host: target.name.clone(),
                remote_path: remote_path.to_path_buf(),
                staged,
                backup: Some(backup),
                report,
                diff,
                pushed: true,
            })
        }
        .instrument(span)
        .await
    }

    /// Write `file` locally and push it to `remote_path`.
    ///
    /// An existing remote file is fetched and backed up first, and only
    /// then is the push recorded for rollback.
    pub async fn write_generated(
        &self,
        target: &RemoteTarget,
        remote_path: &Path,
        file: &GeneratedFile,
    ) -> Result<PathBuf> {
        let span = info_span!(parent: &self.span, "write_generated", host = %target.name, path = %remote_path.display());
        async {
            let existing = self.remote_exists(target, remote_path).await?;
            let backup = if existing {
                let staged = self.fetch(target, remote_path).await?;
                let content = tokio::fs::read(&staged)
                    .await
                    .map_err(|e| Error::file_io(&staged, e))?;
                Some(self.backups.secure(&staged, &content)?)
            } else {
                None
            };

            let staged = self.writer.write(&self.staged_path(target, remote_path), file)?;
            match backup {
                Some(backup) => self.push_recorded(target, &staged, remote_path, &backup).await?,
                None => self.push(target, &staged, remote_path).await?,
            }
            info!(host = %target.name, path = %remote_path.display(), "Generated file pushed");
            Ok(staged)
        }
        .instrument(span)
        .await
    }

    /// Patch the same file on several hosts at once.
    ///
    /// Each host gets its own sessions; one host failing does not stop the
    /// others. Results are in the order of `targets`.
    pub async fn patch_hosts(
        &self,
        targets: &[RemoteTarget],
        remote_path: &Path,
        directives: &[PatchDirective],
    ) -> Vec<(String, Result<SyncOutcome>)> {
        let futures = targets.iter().map(|target| async move {
            let result = self.patch_remote(target, remote_path, directives).await;
            (target.name.clone(), result)
        });
        join_all(futures).await
    }

    async fn remote_exists(&self, target: &RemoteTarget, remote_path: &Path) -> Result<bool> {
        let command = format!(
            "test -e {}",
            crate::connection::escape_shell_arg(&remote_path.to_string_lossy())
        );
        let result = self.session.execute_checked(target, &command, &[0, 1]).await?;
        Ok(result.exit_code == 0)
    }

    /// Push, then journal the push against its own snapshot.
    ///
    /// The snapshot is dropped again when the push fails or there is no
    /// journal to hand it to.
    async fn push_recorded(
        &self,
        target: &RemoteTarget,
        local_path: &Path,
        remote_path: &Path,
        backup: &BackupRecord,
    ) -> Result<()> {
        let Some(rollover) = &self.rollover else {
            self.push(target, local_path, remote_path).await?;
            return BackupStore::discard(&backup.snapshot);
        };
        if let Err(e) = self.push(target, local_path, remote_path).await {
            if let Err(discard) = BackupStore::discard(&backup.snapshot) {
                debug!(error = %discard, "Could not discard snapshot");
            }
            return Err(e);
        }
        rollover.record(RolloverEntry::new(
            target,
            remote_path,
            &backup.snapshot,
            &backup.pristine,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LocalConnector;
    use crate::patch::NotFoundPolicy;
    use tempfile::TempDir;

    fn sync(staging: &Path) -> RemoteFileSync {
        RemoteFileSync::new(Arc::new(LocalConnector), staging)
    }

    #[test]
    fn test_staged_path_stays_inside_staging() {
        let sync = sync(Path::new("/stage"));
        let target = RemoteTarget::new("compute1");
        assert_eq!(
            sync.staged_path(&target, Path::new("/etc/nova/nova.conf")),
            PathBuf::from("/stage/compute1/etc/nova/nova.conf")
        );
        assert_eq!(
            sync.staged_path(&target, Path::new("/../../etc/hosts")),
            PathBuf::from("/stage/compute1/etc/hosts")
        );
    }

    #[tokio::test]
    async fn test_patch_remote_local_round_trip() {
        let remote_dir = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let remote = remote_dir.path().join("libvirtd.conf");
        std::fs::write(&remote, "#listen_tcp = 1\nauth_tcp = \"sasl\"\n").unwrap();

        let target = RemoteTarget::new("localhost").local();
        let sync = sync(staging.path());
        let outcome = sync
            .patch_remote(
                &target,
                &remote,
                &[
                    PatchDirective::new("listen_tcp", "1"),
                    PatchDirective::new("auth_tcp", "\"none\""),
                    PatchDirective::new("listen_tls", "0").not_found(NotFoundPolicy::Append),
                ],
            )
            .await
            .unwrap();

        assert!(outcome.pushed);
        assert_eq!(
            std::fs::read_to_string(&remote).unwrap(),
            "listen_tcp = 1\nauth_tcp = \"none\"\nlisten_tls=0\n"
        );
        assert_eq!(
            std::fs::read_to_string(&outcome.backup.as_ref().unwrap().pristine).unwrap(),
            "#listen_tcp = 1\nauth_tcp = \"sasl\"\n"
        );
        assert!(outcome.diff.contains("+listen_tls=0"));
    }

    #[tokio::test]
    async fn test_unchanged_file_not_pushed() {
        let remote_dir = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let remote = remote_dir.path().join("qemu.conf");
        std::fs::write(&remote, "user = \"root\"\n").unwrap();

        let outcome = sync(staging.path())
            .patch_remote(
                &RemoteTarget::new("localhost"),
                &remote,
                &[PatchDirective::new("user", "\"root\"")],
            )
            .await
            .unwrap();
        assert!(!outcome.pushed);
        assert!(outcome.diff.is_empty());
    }

    #[tokio::test]
    async fn test_fail_policy_leaves_remote_untouched() {
        let remote_dir = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let remote = remote_dir.path().join("nova.conf");
        std::fs::write(&remote, "bar = 2\n").unwrap();

        let err = sync(staging.path())
            .patch_remote(
                &RemoteTarget::new("localhost"),
                &remote,
                &[PatchDirective::new("foo", "9").literal("=").not_found(NotFoundPolicy::Fail)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PatchNotFound { .. }));
        assert_eq!(std::fs::read_to_string(&remote).unwrap(), "bar = 2\n");
    }

    #[tokio::test]
    async fn test_write_generated_new_file() {
        let remote_dir = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let remote = remote_dir.path().join("exports");

        let mut file = GeneratedFile::new(["/var/lib/nova/instances", "10.0.0.0/24", "(rw)"]);
        file.merge(1..=2).unwrap();
        sync(staging.path())
            .write_generated(&RemoteTarget::new("localhost"), &remote, &file)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&remote).unwrap(),
            "/var/lib/nova/instances   10.0.0.0/24(rw)\n"
        );
    }
}
