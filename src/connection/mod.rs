//! Connection layer for remote host communication.
//!
//! This module provides a unified interface for executing commands and transferring
//! files to the hosts being prepared for live migration.
//!
//! # Overview
//!
//! Callers never hold a connection directly. A [`RemoteSession`] opens one
//! connection through a [`Connector`] for every call, performs the operation and
//! closes it again. All transports implement the [`Connection`] trait.
//!
//! # Supported Transports
//!
//! - **SSH** (via `russh`): password, key file or agent authentication, SFTP for files
//! - **Local**: direct execution on the control node, used for `localhost` and in tests
//!
//! # Example
//!
//! ```rust,ignore
//! use crucible::connection::{RemoteSession, RemoteTarget, SshConnector};
//!
//! let target = RemoteTarget::new("compute1").user("root").password("secret");
//! let session = RemoteSession::new(Arc::new(SshConnector::default()));
//!
//! let result = session.execute(&target, "systemctl restart libvirtd").await?;
//! println!("exit: {}", result.exit_code);
//! ```

/// Connection configuration types.
pub mod config;

/// Local execution connection implementation.
pub mod local;

/// Pure Rust SSH implementation using russh.
#[cfg(feature = "russh")]
pub mod russh;

/// Per-call sessions, targets and connectors.
pub mod session;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use tokio::sync::mpsc;

pub use config::{ConnectionConfig, HostConfig, RetryConfig};
pub use local::LocalConnection;
#[cfg(feature = "russh")]
pub use russh::{RusshConnection, SshConnector};
pub use session::{
    Connector, Credentials, LocalConnector, OutputLine, RemoteSession, RemoteTarget,
    ReplaceOptions, TransferDirection,
};

/// Russh-related error type - wraps russh::Error for compatibility with the Handler trait
#[cfg(feature = "russh")]
#[derive(Debug)]
pub struct RusshError(pub ::russh::Error);

#[cfg(feature = "russh")]
impl From<::russh::Error> for RusshError {
    fn from(err: ::russh::Error) -> Self {
        RusshError(err)
    }
}

#[cfg(feature = "russh")]
impl std::fmt::Display for RusshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Russh error: {}", self.0)
    }
}

#[cfg(feature = "russh")]
impl std::error::Error for RusshError {}

#[cfg(feature = "russh")]
impl From<::russh::Error> for ConnectionError {
    fn from(err: ::russh::Error) -> Self {
        ConnectionError::SshError(format!("Russh error: {}", err))
    }
}

#[cfg(feature = "russh")]
impl From<russh_sftp::client::error::Error> for ConnectionError {
    fn from(e: russh_sftp::client::error::Error) -> Self {
        ConnectionError::TransferFailed(format!("SFTP error: {}", e))
    }
}

/// Errors that can occur during connection operations.
///
/// A non-zero exit status is not an error at this layer; it is reported in
/// [`CommandResult`] and judged by the caller.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Failed to establish initial connection to the host.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication was rejected by the remote host.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Command execution failed (not to be confused with non-zero exit code).
    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),

    /// File upload or download operation failed.
    #[error("File transfer failed: {0}")]
    TransferFailed(String),

    /// Connection or operation timed out.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// The specified host could not be resolved.
    #[error("Host not found: {0}")]
    HostNotFound(String),

    /// Configuration is invalid or incomplete.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// SSH-specific error from the underlying implementation.
    #[error("SSH error: {0}")]
    SshError(String),

    /// I/O error during connection operations.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Connection was closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The requested operation is not supported by this transport.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
}

impl ConnectionError {
    /// Returns true when the failure happened while reaching or
    /// authenticating to the host, so that reconnecting may help.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionFailed(_)
                | ConnectionError::Timeout(_)
                | ConnectionError::HostNotFound(_)
                | ConnectionError::SshError(_)
                | ConnectionError::ConnectionClosed
        )
    }
}

/// Result type for connection operations.
///
/// A type alias for `Result<T, ConnectionError>`.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// The result of executing a command on a connection.
///
/// Contains the exit code, stdout, stderr, and a convenience boolean
/// indicating whether the command succeeded (exit code 0).
///
/// # Example
///
/// ```rust
/// use crucible::connection::CommandResult;
///
/// let result = CommandResult::success("active\n".into(), String::new());
/// assert!(result.success);
/// assert_eq!(result.stdout_lines(), vec!["active"]);
///
/// let failed = CommandResult::failure(3, String::new(), "inactive".into());
/// assert!(!failed.success);
/// ```
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit code of the command (0 typically indicates success).
    pub exit_code: i32,
    /// Content written to standard output.
    pub stdout: String,
    /// Content written to standard error.
    pub stderr: String,
    /// Convenience flag: `true` if `exit_code == 0`.
    pub success: bool,
}

impl CommandResult {
    /// Create a new successful command result
    pub fn success(stdout: String, stderr: String) -> Self {
        Self {
            exit_code: 0,
            stdout,
            stderr,
            success: true,
        }
    }

    /// Create a new failed command result
    pub fn failure(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            success: false,
        }
    }

    /// Standard output split into lines, without terminators.
    pub fn stdout_lines(&self) -> Vec<&str> {
        self.stdout.lines().collect()
    }

    /// Standard error split into lines, without terminators.
    pub fn stderr_lines(&self) -> Vec<&str> {
        self.stderr.lines().collect()
    }
}

/// Options for command execution
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Timeout in seconds (None for no timeout)
    pub timeout: Option<u64>,
}

impl ExecuteOptions {
    /// Create new execute options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Options for file transfer
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// File mode (permissions) to set
    pub mode: Option<u32>,
    /// Owner UID to set
    pub owner: Option<u32>,
    /// Group GID to set
    pub group: Option<u32>,
}

impl TransferOptions {
    /// Create new transfer options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set file mode
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set owner and group
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.owner = Some(uid);
        self.group = Some(gid);
        self
    }

    /// Options giving a new file the permissions and ownership in `stat`
    pub fn matching(stat: &FileStat) -> Self {
        Self::new()
            .with_mode(stat.mode & 0o7777)
            .with_owner(stat.uid, stat.gid)
    }
}

/// File statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// File size in bytes
    pub size: u64,
    /// File mode, type bits included
    pub mode: u32,
    /// Owner UID
    pub uid: u32,
    /// Group GID
    pub gid: u32,
    /// Is this a regular file?
    pub is_file: bool,
}

/// The main connection trait that all transport implementations must implement
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the connection identifier (user@host:port or hostname)
    fn identifier(&self) -> &str;

    /// Check if the connection is still alive
    async fn is_alive(&self) -> bool;

    /// Execute a command on the remote host
    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult>;

    /// Upload a file to the remote host
    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()>;

    /// Upload content directly to a remote file
    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()>;

    /// Download a file from the remote host
    async fn download(&self, remote_path: &Path, local_path: &Path) -> ConnectionResult<()>;

    /// Download a file content from the remote host
    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>>;

    /// Check if a path exists on the remote host
    async fn path_exists(&self, path: &Path) -> ConnectionResult<bool>;

    /// Get file stats (size, mode, owner)
    async fn stat(&self, path: &Path) -> ConnectionResult<FileStat>;

    /// Atomically replace `to` with `from` on the remote host
    async fn rename(&self, from: &Path, to: &Path) -> ConnectionResult<()>;

    /// Remove a remote file; a missing file is not an error
    async fn remove(&self, path: &Path) -> ConnectionResult<()>;

    /// Close the connection
    async fn close(&self) -> ConnectionResult<()>;

    /// Execute a command, forwarding output lines to `lines`
    ///
    /// The default implementation forwards the lines once the command has
    /// finished. Transports that can read output incrementally override it.
    async fn execute_streaming(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
        lines: mpsc::Sender<OutputLine>,
    ) -> ConnectionResult<CommandResult> {
        let result = self.execute(command, options).await?;
        for line in result.stdout_lines() {
            let _ = lines.send(OutputLine::Stdout(line.to_string())).await;
        }
        for line in result.stderr_lines() {
            let _ = lines.send(OutputLine::Stderr(line.to_string())).await;
        }
        Ok(result)
    }
}

/// Quote a string for safe use as a single POSIX shell word.
pub fn escape_shell_arg(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
