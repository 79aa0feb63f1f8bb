//! Local connection module
//!
//! This module provides command execution and file operations on the
//! control node itself, without any network transport. It backs targets
//! marked `local` (the controller when the tool runs there) and the tests.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::session::OutputLine;
use super::{
    CommandResult, Connection, ConnectionError, ConnectionResult, ExecuteOptions, FileStat,
    TransferOptions,
};

/// Local connection for executing commands on the current host
#[derive(Debug, Clone)]
pub struct LocalConnection {
    /// Identifier for this connection
    identifier: String,
}

impl LocalConnection {
    /// Create a new local connection
    pub fn new() -> Self {
        let identifier = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        Self { identifier }
    }

    /// Create a local connection with a custom identifier
    pub fn with_identifier(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    /// Build the command
    fn build_command(&self, command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd
    }

    async fn create_parent(path: &Path) -> ConnectionResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ConnectionError::TransferFailed(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Set file mode/permissions
    async fn set_mode(&self, path: &Path, mode: u32) -> ConnectionResult<()> {
        use std::os::unix::fs::PermissionsExt;

        let permissions = std::fs::Permissions::from_mode(mode);
        fs::set_permissions(path, permissions).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to set permissions on {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Set file ownership, skipping the call when it already matches
    fn set_ownership(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> ConnectionResult<()> {
        use std::os::unix::fs::MetadataExt;

        let metadata = std::fs::metadata(path).map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to stat {}: {}", path.display(), e))
        })?;
        if uid.map_or(true, |u| u == metadata.uid()) && gid.map_or(true, |g| g == metadata.gid()) {
            return Ok(());
        }
        std::os::unix::fs::chown(path, uid, gid).map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to set ownership on {}: {}",
                path.display(),
                e
            ))
        })
    }

    async fn apply_attributes(&self, path: &Path, options: &TransferOptions) -> ConnectionResult<()> {
        if options.owner.is_some() || options.group.is_some() {
            self.set_ownership(path, options.owner, options.group)?;
        }
        if let Some(mode) = options.mode {
            self.set_mode(path, mode).await?;
        }
        Ok(())
    }
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        let options = options.unwrap_or_default();
        debug!(command = %command, "Executing local command");

        let mut cmd = self.build_command(command);
        let child = cmd.spawn().map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to spawn process: {}", e))
        })?;

        let output = if let Some(timeout_secs) = options.timeout {
            let timeout = tokio::time::Duration::from_secs(timeout_secs);
            match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(result) => result.map_err(|e| {
                    ConnectionError::ExecutionFailed(format!("Failed to wait for process: {}", e))
                })?,
                Err(_) => return Err(ConnectionError::Timeout(timeout_secs)),
            }
        } else {
            child.wait_with_output().await.map_err(|e| {
                ConnectionError::ExecutionFailed(format!("Failed to wait for process: {}", e))
            })?
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        trace!(exit_code = %exit_code, stdout_len = %stdout.len(), stderr_len = %stderr.len(), "Command completed");

        if output.status.success() {
            Ok(CommandResult::success(stdout, stderr))
        } else {
            Ok(CommandResult::failure(exit_code, stdout, stderr))
        }
    }

    async fn execute_streaming(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
        lines: mpsc::Sender<OutputLine>,
    ) -> ConnectionResult<CommandResult> {
        let options = options.unwrap_or_default();
        debug!(command = %command, "Executing local command with streamed output");

        let mut cmd = self.build_command(command);
        let mut child = cmd.spawn().map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to spawn process: {}", e))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectionError::ExecutionFailed("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ConnectionError::ExecutionFailed("stderr not captured".into()))?;

        let out_tx = lines.clone();
        let out_task = tokio::spawn(async move {
            let mut collected = String::new();
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
                let _ = out_tx.send(OutputLine::Stdout(line)).await;
            }
            collected
        });
        let err_task = tokio::spawn(async move {
            let mut collected = String::new();
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
                let _ = lines.send(OutputLine::Stderr(line)).await;
            }
            collected
        });

        let status = match options.timeout {
            Some(timeout_secs) => {
                let timeout = tokio::time::Duration::from_secs(timeout_secs);
                tokio::time::timeout(timeout, child.wait())
                    .await
                    .map_err(|_| ConnectionError::Timeout(timeout_secs))?
            }
            None => child.wait().await,
        }
        .map_err(|e| ConnectionError::ExecutionFailed(format!("Failed to wait for process: {}", e)))?;
        let stdout = out_task
            .await
            .map_err(|e| ConnectionError::ExecutionFailed(format!("Output reader failed: {}", e)))?;
        let stderr = err_task
            .await
            .map_err(|e| ConnectionError::ExecutionFailed(format!("Output reader failed: {}", e)))?;

        if status.success() {
            Ok(CommandResult::success(stdout, stderr))
        } else {
            Ok(CommandResult::failure(status.code().unwrap_or(-1), stdout, stderr))
        }
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        let options = options.unwrap_or_default();
        debug!(src = %local_path.display(), dst = %remote_path.display(), "Copying file locally");

        fs::copy(local_path, remote_path).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to copy {} to {}: {}",
                local_path.display(),
                remote_path.display(),
                e
            ))
        })?;

        self.apply_attributes(remote_path, &options).await
    }

    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        let options = options.unwrap_or_default();
        debug!(dst = %remote_path.display(), size = %content.len(), "Writing content locally");

        fs::write(remote_path, content).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to write to {}: {}",
                remote_path.display(),
                e
            ))
        })?;

        self.apply_attributes(remote_path, &options).await
    }

    async fn download(&self, remote_path: &Path, local_path: &Path) -> ConnectionResult<()> {
        debug!(src = %remote_path.display(), dst = %local_path.display(), "Copying file locally");

        Self::create_parent(local_path).await?;

        fs::copy(remote_path, local_path).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to copy {} to {}: {}",
                remote_path.display(),
                local_path.display(),
                e
            ))
        })?;

        Ok(())
    }

    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>> {
        debug!(src = %remote_path.display(), "Reading file content locally");

        fs::read(remote_path).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to read {}: {}",
                remote_path.display(),
                e
            ))
        })
    }

    async fn path_exists(&self, path: &Path) -> ConnectionResult<bool> {
        Ok(fs::try_exists(path).await.unwrap_or(false))
    }

    async fn stat(&self, path: &Path) -> ConnectionResult<FileStat> {
        use std::os::unix::fs::MetadataExt;

        let metadata = fs::metadata(path).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to stat {}: {}", path.display(), e))
        })?;

        Ok(FileStat {
            size: metadata.len(),
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            is_file: metadata.is_file(),
        })
    }

    async fn rename(&self, from: &Path, to: &Path) -> ConnectionResult<()> {
        fs::rename(from, to).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to rename {} to {}: {}",
                from.display(),
                to.display(),
                e
            ))
        })
    }

    async fn remove(&self, path: &Path) -> ConnectionResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConnectionError::TransferFailed(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn close(&self) -> ConnectionResult<()> {
        // Nothing to close for local connection
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_execute() {
        let conn = LocalConnection::new();
        let result = conn.execute("echo 'hello world'", None).await.unwrap();

        assert!(result.success);
        assert!(result.stdout.contains("hello world"));
    }

    #[tokio::test]
    async fn test_local_execute_failure() {
        let conn = LocalConnection::new();
        let result = conn.execute("exit 42", None).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, 42);
    }

    #[tokio::test]
    async fn test_local_timeout() {
        let conn = LocalConnection::new();
        let options = ExecuteOptions::new().with_timeout(1);
        let result = conn.execute("sleep 10", Some(options)).await;

        assert!(matches!(result, Err(ConnectionError::Timeout(1))));
    }

    #[tokio::test]
    async fn test_local_upload_download() {
        let conn = LocalConnection::new();
        let temp_dir = tempfile::tempdir().unwrap();

        let src_path = temp_dir.path().join("exports");
        let dst_path = temp_dir.path().join("exports.copy");
        std::fs::write(&src_path, b"/srv/nova   10.0.0.0/24(rw)\n").unwrap();

        conn.upload(&src_path, &dst_path, None).await.unwrap();

        let content = conn.download_content(&dst_path).await.unwrap();
        assert_eq!(content, b"/srv/nova   10.0.0.0/24(rw)\n");
    }

    #[tokio::test]
    async fn test_local_upload_content_applies_attributes() {
        let conn = LocalConnection::new();
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nova.conf");
        let own = std::fs::metadata(temp_dir.path()).unwrap();

        use std::os::unix::fs::MetadataExt;
        let options = TransferOptions::new()
            .with_mode(0o640)
            .with_owner(own.uid(), own.gid());
        conn.upload_content(b"[DEFAULT]\n", &path, Some(options)).await.unwrap();

        let stat = conn.stat(&path).await.unwrap();
        assert_eq!(stat.mode & 0o7777, 0o640);
        assert_eq!(stat.uid, own.uid());
        assert_eq!(stat.size, 10);
        assert!(stat.is_file);
    }

    #[tokio::test]
    async fn test_local_streaming_timeout() {
        let conn = LocalConnection::new();
        let (tx, _rx) = mpsc::channel(8);
        let result = conn
            .execute_streaming("sleep 10", Some(ExecuteOptions::new().with_timeout(1)), tx)
            .await;

        assert!(matches!(result, Err(ConnectionError::Timeout(1))));
    }

    #[tokio::test]
    async fn test_local_rename_replaces_target() {
        let conn = LocalConnection::new();
        let temp_dir = tempfile::tempdir().unwrap();
        let staged = temp_dir.path().join("hosts.staged");
        let target = temp_dir.path().join("hosts");
        std::fs::write(&target, "old").unwrap();
        std::fs::write(&staged, "new").unwrap();

        conn.rename(&staged, &target).await.unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "new");
        assert!(!conn.path_exists(&staged).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_remove_missing_is_ok() {
        let conn = LocalConnection::new();
        let temp_dir = tempfile::tempdir().unwrap();
        conn.remove(&temp_dir.path().join("absent")).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_streaming_collects_output() {
        let conn = LocalConnection::new();
        let (tx, mut rx) = mpsc::channel(8);

        let result = conn
            .execute_streaming("printf 'a\\nb\\n'; exit 2", None, tx)
            .await
            .unwrap();

        assert_eq!(result.exit_code, 2);
        assert_eq!(result.stdout, "a\nb\n");
        assert_eq!(rx.recv().await, Some(OutputLine::Stdout("a".into())));
        assert_eq!(rx.recv().await, Some(OutputLine::Stdout("b".into())));
    }
}
