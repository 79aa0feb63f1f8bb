//! Per-call remote sessions.
//!
//! A [`RemoteSession`] never keeps a connection between calls: every
//! operation opens one authenticated connection through its [`Connector`],
//! runs to completion and closes it. Only connection establishment is
//! retried; a command that ran and exited badly is reported, not repeated.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info_span, trace, warn, Instrument, Span};

use super::config::{RetryConfig, DEFAULT_PORT, DEFAULT_TIMEOUT};
use super::local::LocalConnection;
use super::{
    escape_shell_arg, CommandResult, Connection, ConnectionResult, ExecuteOptions,
    TransferOptions,
};
use crate::error::{Error, Result};

/// How to authenticate to a target.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Plain password authentication.
    Password(String),
    /// Private key file, optionally protected by a passphrase.
    KeyFile {
        /// Path to the private key
        path: PathBuf,
        /// Passphrase for an encrypted key
        passphrase: Option<String>,
    },
    /// Identities offered by the running SSH agent.
    Agent,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password(<redacted>)"),
            Credentials::KeyFile { path, .. } => {
                f.debug_struct("KeyFile").field("path", path).finish()
            }
            Credentials::Agent => f.write_str("Agent"),
        }
    }
}

/// A host a session can be opened to.
///
/// Targets are supplied by the caller for each call; nothing here is
/// persisted.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    /// Name used in logs, errors and the rollover journal
    pub name: String,
    /// Address to connect to
    pub address: String,
    /// SSH port
    pub port: u16,
    /// Login user
    pub user: String,
    /// Authentication material
    pub credentials: Credentials,
    /// Timeout for connection establishment
    pub timeout: Duration,
    /// Retry policy for connection establishment
    pub retry: RetryConfig,
    /// Run on the control node instead of over SSH
    pub local: bool,
}

impl RemoteTarget {
    /// Create a target for `name`, addressed by the same name on port 22.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            address: name.clone(),
            name,
            port: DEFAULT_PORT,
            user: "root".to_string(),
            credentials: Credentials::Agent,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT),
            retry: RetryConfig::default(),
            local: false,
        }
    }

    /// Set the address to connect to
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the login user
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Authenticate with a password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.credentials = Credentials::Password(password.into());
        self
    }

    /// Authenticate with a private key file
    pub fn key_file(mut self, path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        self.credentials = Credentials::KeyFile {
            path: path.into(),
            passphrase,
        };
        self
    }

    /// Set the connect timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the connect retry policy
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Mark the target as the control node itself
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }
}

/// Opens connections to targets.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open and authenticate one connection to `target`.
    async fn open(&self, target: &RemoteTarget) -> ConnectionResult<Box<dyn Connection>>;
}

/// Connector that runs everything on the control node.
#[derive(Debug, Clone, Default)]
pub struct LocalConnector;

#[async_trait]
impl Connector for LocalConnector {
    async fn open(&self, target: &RemoteTarget) -> ConnectionResult<Box<dyn Connection>> {
        Ok(Box::new(LocalConnection::with_identifier(&target.name)))
    }
}

/// Direction of a [`RemoteSession::copy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Remote to local
    Get,
    /// Local to remote
    Put,
}

/// A line of command output delivered while the command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// Line written to standard output
    Stdout(String),
    /// Line written to standard error
    Stderr(String),
}

/// How [`RemoteSession::replace`] writes a file into place.
#[derive(Debug, Clone)]
pub struct ReplaceOptions {
    /// Suffix of the temporary file uploaded next to the target
    pub staged_suffix: String,
    /// When set, copy the current remote file to `<path><suffix>` first,
    /// unless that copy already exists
    pub pristine_suffix: Option<String>,
}

impl Default for ReplaceOptions {
    fn default() -> Self {
        Self {
            staged_suffix: ".crucible-staged".to_string(),
            pristine_suffix: None,
        }
    }
}

/// Runs commands and transfers files, one connection per call.
#[derive(Clone)]
pub struct RemoteSession {
    connector: Arc<dyn Connector>,
    span: Span,
}

impl fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSession").finish_non_exhaustive()
    }
}

impl RemoteSession {
    /// Create a session layer over `connector`
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            span: info_span!("remote_session"),
        }
    }

    /// Log under `span` instead of the default one
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Open a connection, retrying connection-level failures.
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn Connection>> {
        let retry = &target.retry;
        let mut attempt = 0;

        loop {
            match self.connector.open(target).await {
                Ok(conn) => {
                    trace!(host = %target.name, id = %conn.identifier(), "Connection opened");
                    return Ok(conn);
                }
                Err(e) if e.is_connect_failure() && attempt < retry.max_retries => {
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        host = %target.name,
                        attempt = %attempt,
                        delay = ?delay,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::Connectivity {
                        host: target.name.clone(),
                        message: e.to_string(),
                        source: Some(e),
                    })
                }
            }
        }
    }

    async fn release(&self, target: &RemoteTarget, conn: Box<dyn Connection>) {
        if let Err(e) = conn.close().await {
            debug!(host = %target.name, error = %e, "Ignoring error while closing connection");
        }
    }

    /// Run `command` and return its exit status and output.
    ///
    /// A non-zero exit status is not an error here.
    pub async fn execute(&self, target: &RemoteTarget, command: &str) -> Result<CommandResult> {
        self.execute_with(target, command, ExecuteOptions::new()).await
    }

    /// Run `command` with explicit options.
    pub async fn execute_with(
        &self,
        target: &RemoteTarget,
        command: &str,
        options: ExecuteOptions,
    ) -> Result<CommandResult> {
        async {
            debug!(host = %target.name, command = %command, "Executing");
            let conn = self.connect(target).await?;
            let result = conn.execute(command, Some(options)).await;
            self.release(target, conn).await;

            let result = result.map_err(|e| Error::from_connection(&target.name, None, e))?;
            debug!(host = %target.name, exit_code = %result.exit_code, "Command finished");
            Ok(result)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Run `command` and fail unless its exit status is in `valid`.
    pub async fn execute_checked(
        &self,
        target: &RemoteTarget,
        command: &str,
        valid: &[i32],
    ) -> Result<CommandResult> {
        let result = self.execute(target, command).await?;
        if !valid.contains(&result.exit_code) {
            return Err(Error::RemoteCommand {
                host: target.name.clone(),
                command: command.to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr.trim_end().to_string(),
            });
        }
        Ok(result)
    }

    /// Run `command`, forwarding each output line to `lines` as it arrives.
    ///
    /// The complete result is still returned at the end. A dropped receiver
    /// does not stop the command.
    pub async fn execute_streaming(
        &self,
        target: &RemoteTarget,
        command: &str,
        options: ExecuteOptions,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<CommandResult> {
        async {
            let conn = self.connect(target).await?;
            let result = conn.execute_streaming(command, Some(options), lines).await;
            self.release(target, conn).await;
            result.map_err(|e| Error::from_connection(&target.name, None, e))
        }
        .instrument(self.span.clone())
        .await
    }

    /// Copy one file between the control node and `target`.
    pub async fn copy(
        &self,
        target: &RemoteTarget,
        direction: TransferDirection,
        local_path: &Path,
        remote_path: &Path,
    ) -> Result<()> {
        async {
            debug!(
                host = %target.name,
                direction = ?direction,
                local = %local_path.display(),
                remote = %remote_path.display(),
                "Copying file"
            );
            let conn = self.connect(target).await?;
            let result = match direction {
                TransferDirection::Get => conn.download(remote_path, local_path).await,
                TransferDirection::Put => conn.upload(local_path, remote_path, None).await,
            };
            self.release(target, conn).await;

            let failed_path = match direction {
                TransferDirection::Get => remote_path,
                TransferDirection::Put => local_path,
            };
            result.map_err(|e| Error::from_connection(&target.name, Some(failed_path), e))
        }
        .instrument(self.span.clone())
        .await
    }

    /// Replace `remote_path` with `content` without a window where the file
    /// is partially written.
    ///
    /// The content goes to a staged file beside the target and is renamed
    /// over it. On failure the target is untouched and the staged file is
    /// removed on a best-effort basis.
    pub async fn replace(
        &self,
        target: &RemoteTarget,
        content: &[u8],
        remote_path: &Path,
        options: &ReplaceOptions,
    ) -> Result<()> {
        async {
            let staged = suffixed(remote_path, &options.staged_suffix);
            let conn = self.connect(target).await?;

            let result =
                Self::replace_on(conn.as_ref(), target, content, remote_path, &staged, options)
                    .await;
            if result.is_err() {
                if let Err(e) = conn.remove(&staged).await {
                    debug!(path = %staged.display(), error = %e, "Could not remove staged file");
                }
            }
            self.release(target, conn).await;
            result
        }
        .instrument(self.span.clone())
        .await
    }

    async fn replace_on(
        conn: &dyn Connection,
        target: &RemoteTarget,
        content: &[u8],
        remote_path: &Path,
        staged: &Path,
        options: &ReplaceOptions,
    ) -> Result<()> {
        if let Some(suffix) = &options.pristine_suffix {
            let original = escape_shell_arg(&remote_path.to_string_lossy());
            let pristine = escape_shell_arg(&suffixed(remote_path, suffix).to_string_lossy());
            let command = format!(
                "test ! -e {original} || test -e {pristine} || cp -p {original} {pristine}"
            );
            let result = conn
                .execute(&command, None)
                .await
                .map_err(|e| Error::from_connection(&target.name, Some(remote_path), e))?;
            if !result.success {
                return Err(Error::RemoteCommand {
                    host: target.name.clone(),
                    command,
                    exit_code: result.exit_code,
                    stderr: result.stderr.trim_end().to_string(),
                });
            }
        }

        let existing = conn
            .path_exists(remote_path)
            .await
            .map_err(|e| Error::from_connection(&target.name, Some(remote_path), e))?;
        let attributes = if existing {
            let stat = conn
                .stat(remote_path)
                .await
                .map_err(|e| Error::from_connection(&target.name, Some(remote_path), e))?;
            Some(TransferOptions::matching(&stat))
        } else {
            None
        };

        conn.upload_content(content, staged, attributes)
            .await
            .map_err(|e| Error::from_connection(&target.name, Some(staged), e))?;
        conn.rename(staged, remote_path)
            .await
            .map_err(|e| Error::from_connection(&target.name, Some(remote_path), e))?;

        debug!(
            host = %target.name,
            path = %remote_path.display(),
            bytes = content.len(),
            "Replaced remote file"
        );
        Ok(())
    }
}

/// `path` with `suffix` appended to its final component.
pub(crate) fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
