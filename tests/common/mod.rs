//! Shared test utilities for the crucible test suite.
//!
//! This module provides:
//! - A mock [`Connection`] backed by an in-memory remote filesystem
//! - A mock [`Connector`] handing out per-host mocks
//! - Failure injection for connect, upload, rename and execute
//! - Staging directory and target helpers
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tempfile::TempDir;

use crucible::connection::{
    CommandResult, Connection, ConnectionError, ConnectionResult, Connector, ExecuteOptions,
    FileStat, RemoteSession, RemoteTarget, RetryConfig, TransferOptions,
};
use crucible::rollover::RolloverManager;
use crucible::sync::RemoteFileSync;

// ============================================================================
// Mock Connection Implementation
// ============================================================================

#[derive(Debug)]
struct MockState {
    alive: AtomicBool,
    commands_executed: RwLock<Vec<String>>,
    files_uploaded: RwLock<Vec<PathBuf>>,
    files_downloaded: RwLock<Vec<PathBuf>>,
    command_results: RwLock<HashMap<String, CommandResult>>,
    default_result: RwLock<CommandResult>,
    fail_connect: AtomicBool,
    fail_upload: AtomicBool,
    fail_rename: AtomicBool,
    fail_execute: AtomicBool,
    connect_count: AtomicU32,
    command_count: AtomicU32,
    virtual_filesystem: RwLock<HashMap<PathBuf, Vec<u8>>>,
}

/// A mock connection over an in-memory remote filesystem.
///
/// Clones share state, so a test keeps one handle while the connector
/// hands out others.
///
/// # Example
///
/// ```rust,ignore
/// let mock = MockConnection::new("compute1");
/// mock.add_virtual_file("/etc/app.conf", "a = 1\n");
///
/// let content = mock.download_content(Path::new("/etc/app.conf")).await.unwrap();
/// assert_eq!(content, b"a = 1\n");
/// ```
#[derive(Debug, Clone)]
pub struct MockConnection {
    identifier: String,
    state: Arc<MockState>,
}

impl MockConnection {
    /// Create a new mock connection with the given identifier.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            state: Arc::new(MockState {
                alive: AtomicBool::new(true),
                commands_executed: RwLock::new(Vec::new()),
                files_uploaded: RwLock::new(Vec::new()),
                files_downloaded: RwLock::new(Vec::new()),
                command_results: RwLock::new(HashMap::new()),
                default_result: RwLock::new(CommandResult::success(String::new(), String::new())),
                fail_connect: AtomicBool::new(false),
                fail_upload: AtomicBool::new(false),
                fail_rename: AtomicBool::new(false),
                fail_execute: AtomicBool::new(false),
                connect_count: AtomicU32::new(0),
                command_count: AtomicU32::new(0),
                virtual_filesystem: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Set the result for a specific command.
    pub fn set_command_result(&self, command: impl Into<String>, result: CommandResult) {
        self.state
            .command_results
            .write()
            .insert(command.into(), result);
    }

    /// Set the default result for commands not explicitly configured.
    pub fn set_default_result(&self, result: CommandResult) {
        *self.state.default_result.write() = result;
    }

    /// Refuse new connections.
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Fail every upload.
    pub fn set_fail_upload(&self, fail: bool) {
        self.state.fail_upload.store(fail, Ordering::SeqCst);
    }

    /// Fail every rename, after the staged file was written.
    pub fn set_fail_rename(&self, fail: bool) {
        self.state.fail_rename.store(fail, Ordering::SeqCst);
    }

    /// Fail every command at the transport level.
    pub fn set_fail_execute(&self, fail: bool) {
        self.state.fail_execute.store(fail, Ordering::SeqCst);
    }

    /// Number of connections opened through a [`MockConnector`].
    pub fn connect_count(&self) -> u32 {
        self.state.connect_count.load(Ordering::SeqCst)
    }

    /// Get the number of commands executed.
    pub fn command_count(&self) -> u32 {
        self.state.command_count.load(Ordering::SeqCst)
    }

    /// Get all commands that were executed.
    pub fn get_commands(&self) -> Vec<String> {
        self.state.commands_executed.read().clone()
    }

    /// Get every remote path written by an upload.
    pub fn get_uploaded_files(&self) -> Vec<PathBuf> {
        self.state.files_uploaded.read().clone()
    }

    /// Get all files that were downloaded.
    pub fn get_downloaded_files(&self) -> Vec<PathBuf> {
        self.state.files_downloaded.read().clone()
    }

    /// Add a virtual file to the mock filesystem.
    pub fn add_virtual_file(&self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) {
        self.state
            .virtual_filesystem
            .write()
            .insert(path.into(), content.into());
    }

    /// Check if a virtual file exists.
    pub fn virtual_file_exists(&self, path: impl AsRef<Path>) -> bool {
        self.state
            .virtual_filesystem
            .read()
            .contains_key(path.as_ref())
    }

    /// Content of a virtual file, as text.
    pub fn virtual_file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.state
            .virtual_filesystem
            .read()
            .get(path.as_ref())
            .map(|c| String::from_utf8_lossy(c).into_owned())
    }

    /// Every path in the virtual filesystem.
    pub fn virtual_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.state.virtual_filesystem.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Kill the mock connection (mark as not alive).
    pub fn kill(&self) {
        self.state.alive.store(false, Ordering::SeqCst);
    }

    /// Reset counters and failure injection; files are kept.
    pub fn reset(&self) {
        self.state.commands_executed.write().clear();
        self.state.files_uploaded.write().clear();
        self.state.files_downloaded.write().clear();
        self.state.command_count.store(0, Ordering::SeqCst);
        self.state.connect_count.store(0, Ordering::SeqCst);
        self.set_fail_connect(false);
        self.set_fail_upload(false);
        self.set_fail_rename(false);
        self.set_fail_execute(false);
        self.state.alive.store(true, Ordering::SeqCst);
    }

    fn not_found(path: &Path) -> ConnectionError {
        ConnectionError::TransferFailed(format!(
            "File not found in virtual filesystem: {}",
            path.display()
        ))
    }

    /// Answers `test -e '<path>'` from the virtual filesystem.
    fn builtin_result(&self, command: &str) -> Option<CommandResult> {
        let quoted = command.strip_prefix("test -e ")?;
        let path = quoted.trim_matches('\'');
        if self.virtual_file_exists(path) {
            Some(CommandResult::success(String::new(), String::new()))
        } else {
            Some(CommandResult::failure(1, String::new(), String::new()))
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    async fn execute(
        &self,
        command: &str,
        _options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        if self.state.fail_execute.load(Ordering::SeqCst) {
            return Err(ConnectionError::ExecutionFailed(
                "Mock execute failed".to_string(),
            ));
        }

        self.state.command_count.fetch_add(1, Ordering::SeqCst);
        self.state
            .commands_executed
            .write()
            .push(command.to_string());

        if let Some(result) = self.state.command_results.read().get(command) {
            return Ok(result.clone());
        }
        if let Some(result) = self.builtin_result(command) {
            return Ok(result);
        }

        Ok(self.state.default_result.read().clone())
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        let content = std::fs::read(local_path)?;
        self.upload_content(&content, remote_path, options).await
    }

    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        _options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        if self.state.fail_upload.load(Ordering::SeqCst) {
            return Err(ConnectionError::TransferFailed(
                "Mock upload failed".to_string(),
            ));
        }

        self.state
            .files_uploaded
            .write()
            .push(remote_path.to_path_buf());
        self.add_virtual_file(remote_path, content);
        Ok(())
    }

    async fn download(&self, remote_path: &Path, local_path: &Path) -> ConnectionResult<()> {
        let content = self.download_content(remote_path).await?;
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local_path, content)?;
        Ok(())
    }

    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>> {
        self.state
            .files_downloaded
            .write()
            .push(remote_path.to_path_buf());

        self.state
            .virtual_filesystem
            .read()
            .get(remote_path)
            .cloned()
            .ok_or_else(|| Self::not_found(remote_path))
    }

    async fn path_exists(&self, path: &Path) -> ConnectionResult<bool> {
        Ok(self.virtual_file_exists(path))
    }

    async fn stat(&self, path: &Path) -> ConnectionResult<FileStat> {
        let fs = self.state.virtual_filesystem.read();
        let content = fs.get(path).ok_or_else(|| Self::not_found(path))?;
        Ok(FileStat {
            size: content.len() as u64,
            mode: 0o100644,
            uid: 0,
            gid: 0,
            is_file: true,
        })
    }

    async fn rename(&self, from: &Path, to: &Path) -> ConnectionResult<()> {
        if self.state.fail_rename.load(Ordering::SeqCst) {
            return Err(ConnectionError::ExecutionFailed(
                "Mock rename failed".to_string(),
            ));
        }

        let mut fs = self.state.virtual_filesystem.write();
        let content = fs.remove(from).ok_or_else(|| Self::not_found(from))?;
        fs.insert(to.to_path_buf(), content);
        Ok(())
    }

    async fn remove(&self, path: &Path) -> ConnectionResult<()> {
        self.state.virtual_filesystem.write().remove(path);
        Ok(())
    }

    async fn close(&self) -> ConnectionResult<()> {
        Ok(())
    }
}

// ============================================================================
// Mock Connector
// ============================================================================

/// Connector that hands out one shared [`MockConnection`] per host name.
#[derive(Debug, Default)]
pub struct MockConnector {
    hosts: RwLock<HashMap<String, MockConnection>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mock behind `host`, created on first use.
    pub fn host(&self, host: &str) -> MockConnection {
        self.hosts
            .write()
            .entry(host.to_string())
            .or_insert_with(|| MockConnection::new(host))
            .clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, target: &RemoteTarget) -> ConnectionResult<Box<dyn Connection>> {
        let mock = self.host(&target.name);
        if mock.state.fail_connect.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionFailed(format!(
                "Mock connection to {} refused",
                target.name
            )));
        }
        mock.state.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(mock))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// A target that never waits between retries.
pub fn target(name: &str) -> RemoteTarget {
    RemoteTarget::new(name).retry(RetryConfig::none())
}

/// A mock connector plus a staging directory that lives as long as the fixture.
pub struct SyncFixture {
    pub connector: Arc<MockConnector>,
    pub staging: TempDir,
}

impl SyncFixture {
    pub fn new() -> Self {
        Self {
            connector: Arc::new(MockConnector::new()),
            staging: TempDir::new().expect("Failed to create staging directory"),
        }
    }

    pub fn session(&self) -> RemoteSession {
        RemoteSession::new(self.connector.clone())
    }

    pub fn sync(&self) -> RemoteFileSync {
        RemoteFileSync::new(self.connector.clone(), self.staging.path())
    }

    /// A sync that records pushes in a journal under the staging directory.
    pub fn sync_with_rollover(&self) -> (RemoteFileSync, Arc<RolloverManager>) {
        let rollover = Arc::new(
            RolloverManager::with_journal(
                self.session(),
                self.staging.path().join("rollover.json"),
            )
            .expect("Failed to open journal"),
        );
        (self.sync().with_rollover(rollover.clone()), rollover)
    }

    pub fn host(&self, name: &str) -> MockConnection {
        self.connector.host(name)
    }
}

impl Default for SyncFixture {
    fn default() -> Self {
        Self::new()
    }
}
