//! Russh connection module
//!
//! SSH transport built on the pure Rust `russh` stack. Commands run on a
//! fresh session channel each; files move over SFTP. One [`RusshConnection`]
//! lives for exactly one [`RemoteSession`](super::RemoteSession) call.

use async_trait::async_trait;
use russh::client::{Handle, Handler};
use russh::keys::key::PublicKey;
use russh::keys::load_secret_key;
use russh::ChannelMsg;
use russh_keys::agent::client::AgentClient;
use russh_sftp::client::SftpSession;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace, warn};

use super::config::default_identity_files;
use super::session::{Connector, Credentials, OutputLine, RemoteTarget};
use super::{
    escape_shell_arg, CommandResult, Connection, ConnectionError, ConnectionResult,
    ExecuteOptions, FileStat, LocalConnection, RusshError, TransferOptions,
};

/// Client handler for russh with known_hosts verification
struct ClientHandler {
    host: String,
    port: u16,
    /// Accept hosts missing from known_hosts (StrictHostKeyChecking=accept-new)
    accept_unknown: bool,
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = RusshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => {
                debug!(host = %self.host, "Host key verified against known_hosts");
                Ok(true)
            }
            Ok(false) if self.accept_unknown => {
                warn!(host = %self.host, "Host not found in known_hosts, accepting");
                Ok(true)
            }
            Ok(false) => {
                warn!(host = %self.host, "Host not found in known_hosts, rejecting");
                Ok(false)
            }
            Err(russh::keys::Error::KeyChanged { line }) => {
                warn!(
                    host = %self.host,
                    line = %line,
                    "HOST KEY VERIFICATION FAILED! Server key does not match known_hosts entry."
                );
                Ok(false)
            }
            Err(e) => {
                debug!(host = %self.host, error = %e, "Could not read known_hosts");
                Ok(self.accept_unknown)
            }
        }
    }
}

/// A single authenticated SSH connection
pub struct RusshConnection {
    /// user@host:port
    identifier: String,
    /// Read lock for channel operations, write lock only to close
    handle: Arc<RwLock<Option<Handle<ClientHandler>>>>,
    connected: AtomicBool,
}

impl RusshConnection {
    /// Connect and authenticate to `target`.
    pub async fn connect(target: &RemoteTarget, accept_unknown: bool) -> ConnectionResult<Self> {
        debug!(
            host = %target.address,
            port = %target.port,
            user = %target.user,
            "Connecting via SSH (russh)"
        );

        let handle = Self::do_connect(target, accept_unknown).await?;

        Ok(Self {
            identifier: format!("{}@{}:{}", target.user, target.address, target.port),
            handle: Arc::new(RwLock::new(Some(handle))),
            connected: AtomicBool::new(true),
        })
    }

    async fn do_connect(
        target: &RemoteTarget,
        accept_unknown: bool,
    ) -> ConnectionResult<Handle<ClientHandler>> {
        let timeout = target.timeout;
        let mut config = russh::client::Config::default();
        config.inactivity_timeout = Some(timeout.max(Duration::from_secs(60)));
        let config = Arc::new(config);

        let addr = format!("{}:{}", target.address, target.port);
        let socket = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout.as_secs()))?
            .map_err(|e| {
                ConnectionError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e))
            })?;

        socket.set_nodelay(true).map_err(|e| {
            ConnectionError::ConnectionFailed(format!("Failed to set TCP_NODELAY: {}", e))
        })?;

        let handler = ClientHandler {
            host: target.address.clone(),
            port: target.port,
            accept_unknown,
        };

        let mut session = tokio::time::timeout(
            timeout,
            russh::client::connect_stream(config, socket, handler),
        )
        .await
        .map_err(|_| ConnectionError::Timeout(timeout.as_secs()))?
        .map_err(|e| ConnectionError::ConnectionFailed(format!("SSH handshake failed: {}", e)))?;

        Self::authenticate(&mut session, target).await?;

        debug!(host = %target.address, "SSH connection established");
        Ok(session)
    }

    async fn authenticate(
        session: &mut Handle<ClientHandler>,
        target: &RemoteTarget,
    ) -> ConnectionResult<()> {
        let user = target.user.as_str();

        match &target.credentials {
            Credentials::Password(password) => {
                let authenticated = session
                    .authenticate_password(user, password)
                    .await
                    .map_err(|e| {
                        ConnectionError::AuthenticationFailed(format!(
                            "Password authentication failed: {}",
                            e
                        ))
                    })?;
                if authenticated {
                    debug!("Authenticated using password");
                    return Ok(());
                }
                Err(ConnectionError::AuthenticationFailed(format!(
                    "Password rejected for {}@{}",
                    user, target.address
                )))
            }
            Credentials::KeyFile { path, passphrase } => {
                Self::try_key_auth(session, user, path, passphrase.as_deref()).await?;
                debug!(key = %path.display(), "Authenticated using key");
                Ok(())
            }
            Credentials::Agent => {
                if Self::try_agent_auth(session, user).await.is_ok() {
                    debug!("Authenticated using SSH agent");
                    return Ok(());
                }
                for key_path in default_identity_files() {
                    if Self::try_key_auth(session, user, &key_path, None).await.is_ok() {
                        debug!(key = %key_path.display(), "Authenticated using key");
                        return Ok(());
                    }
                }
                Err(ConnectionError::AuthenticationFailed(
                    "All authentication methods failed".to_string(),
                ))
            }
        }
    }

    async fn try_agent_auth(
        session: &mut Handle<ClientHandler>,
        user: &str,
    ) -> ConnectionResult<()> {
        let mut agent = AgentClient::connect_env().await.map_err(|e| {
            ConnectionError::AuthenticationFailed(format!("Failed to connect to SSH agent: {}", e))
        })?;

        let identities = agent.request_identities().await.map_err(|e| {
            ConnectionError::AuthenticationFailed(format!("Failed to get agent identities: {}", e))
        })?;

        for identity in identities {
            let (returned_agent, result) = session
                .authenticate_future(user, identity.clone(), agent)
                .await;
            agent = returned_agent;

            match result {
                Ok(true) => return Ok(()),
                Ok(false) => trace!("Identity rejected, trying next"),
                Err(e) => trace!(error = %e, "Agent authentication attempt failed"),
            }
        }

        Err(ConnectionError::AuthenticationFailed(
            "All SSH agent identities rejected".to_string(),
        ))
    }

    async fn try_key_auth(
        session: &mut Handle<ClientHandler>,
        user: &str,
        key_path: &Path,
        passphrase: Option<&str>,
    ) -> ConnectionResult<()> {
        if !key_path.exists() {
            return Err(ConnectionError::AuthenticationFailed(format!(
                "Key file not found: {}",
                key_path.display()
            )));
        }

        let key_pair = load_secret_key(key_path, passphrase).map_err(|e| {
            ConnectionError::AuthenticationFailed(format!(
                "Failed to load key {}: {}",
                key_path.display(),
                e
            ))
        })?;

        let authenticated = session
            .authenticate_publickey(user, Arc::new(key_pair))
            .await
            .map_err(|e| {
                ConnectionError::AuthenticationFailed(format!(
                    "Key authentication failed for {}: {}",
                    key_path.display(),
                    e
                ))
            })?;

        if authenticated {
            Ok(())
        } else {
            Err(ConnectionError::AuthenticationFailed(format!(
                "Key {} rejected",
                key_path.display()
            )))
        }
    }

    async fn open_sftp(&self) -> ConnectionResult<SftpSession> {
        let handle_guard = self.handle.read().await;
        let handle = handle_guard
            .as_ref()
            .ok_or(ConnectionError::ConnectionClosed)?;

        let channel = handle.channel_open_session().await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to open channel: {}", e))
        })?;
        drop(handle_guard);

        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to request SFTP subsystem: {}", e))
        })?;

        SftpSession::new(channel.into_stream()).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to create SFTP session: {}", e))
        })
    }

    /// Run a command, optionally forwarding complete lines as they arrive.
    async fn run(
        &self,
        command: &str,
        options: ExecuteOptions,
        lines: Option<mpsc::Sender<OutputLine>>,
    ) -> ConnectionResult<CommandResult> {
        trace!(command = %command, "Executing remote command");

        let execute_future = async {
            let handle_guard = self.handle.read().await;
            let handle = handle_guard
                .as_ref()
                .ok_or(ConnectionError::ConnectionClosed)?;
            let mut channel = handle.channel_open_session().await.map_err(|e| {
                ConnectionError::ExecutionFailed(format!("Failed to open channel: {}", e))
            })?;
            drop(handle_guard);

            channel.exec(true, command).await.map_err(|e| {
                ConnectionError::ExecutionFailed(format!("Failed to execute command: {}", e))
            })?;

            let mut stdout = LineBuffer::default();
            let mut stderr = LineBuffer::default();
            let mut exit_code = None;

            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => {
                        for line in stdout.push(data) {
                            if let Some(tx) = &lines {
                                let _ = tx.send(OutputLine::Stdout(line)).await;
                            }
                        }
                    }
                    // Extended data type 1 is stderr
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                        for line in stderr.push(data) {
                            if let Some(tx) = &lines {
                                let _ = tx.send(OutputLine::Stderr(line)).await;
                            }
                        }
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        exit_code = Some(exit_status);
                    }
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }

            if let Some(tx) = &lines {
                if let Some(rest) = stdout.remainder() {
                    let _ = tx.send(OutputLine::Stdout(rest)).await;
                }
                if let Some(rest) = stderr.remainder() {
                    let _ = tx.send(OutputLine::Stderr(rest)).await;
                }
            }

            // No exit status means the remote side never reported one
            let exit_code: i32 = exit_code.map(|e| e as i32).unwrap_or(i32::MAX);
            let stdout = stdout.into_string();
            let stderr = stderr.into_string();
            trace!(exit_code = %exit_code, "Command completed");

            if exit_code == 0 {
                Ok(CommandResult::success(stdout, stderr))
            } else {
                Ok(CommandResult::failure(exit_code, stdout, stderr))
            }
        };

        if let Some(timeout_secs) = options.timeout {
            match tokio::time::timeout(Duration::from_secs(timeout_secs), execute_future).await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Timeout(timeout_secs)),
            }
        } else {
            execute_future.await
        }
    }

    async fn run_simple(&self, command: &str) -> ConnectionResult<()> {
        let result = self.run(command, ExecuteOptions::default(), None).await?;
        if result.success {
            Ok(())
        } else {
            Err(ConnectionError::TransferFailed(format!(
                "'{}' exited with {}: {}",
                command,
                result.exit_code,
                result.stderr.trim_end()
            )))
        }
    }
}

/// Accumulates raw channel output and splits off complete lines.
#[derive(Default)]
struct LineBuffer {
    all: Vec<u8>,
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.all.extend_from_slice(data);
        self.pending.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    fn remainder(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).to_string();
        self.pending.clear();
        Some(rest)
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.all).to_string()
    }
}

#[async_trait]
impl Connection for RusshConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.handle.read().await.is_some()
    }

    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        self.run(command, options.unwrap_or_default(), None).await
    }

    async fn execute_streaming(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
        lines: mpsc::Sender<OutputLine>,
    ) -> ConnectionResult<CommandResult> {
        self.run(command, options.unwrap_or_default(), Some(lines))
            .await
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        let content = tokio::fs::read(local_path).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to read local file {}: {}",
                local_path.display(),
                e
            ))
        })?;
        self.upload_content(&content, remote_path, options).await
    }

    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        let options = options.unwrap_or_default();
        debug!(
            remote = %remote_path.display(),
            size = %content.len(),
            "Uploading content via SFTP"
        );

        let sftp = self.open_sftp().await?;
        let remote_path_str = remote_path.to_string_lossy().to_string();
        let mut remote_file = sftp.create(&remote_path_str).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to create remote file {}: {}",
                remote_path.display(),
                e
            ))
        })?;

        remote_file.write_all(content).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to write to remote file: {}", e))
        })?;
        remote_file.shutdown().await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to close remote file: {}", e))
        })?;

        if options.mode.is_some() || options.owner.is_some() || options.group.is_some() {
            let mut attrs = russh_sftp::protocol::FileAttributes::default();
            attrs.permissions = options.mode;
            if options.owner.is_some() || options.group.is_some() {
                // chown only when the ids differ
                let current = sftp.metadata(&remote_path_str).await.map_err(|e| {
                    ConnectionError::TransferFailed(format!(
                        "Failed to stat {}: {}",
                        remote_path.display(),
                        e
                    ))
                })?;
                let uid = options.owner.or(current.uid);
                let gid = options.group.or(current.gid);
                if uid != current.uid || gid != current.gid {
                    attrs.uid = uid;
                    attrs.gid = gid;
                }
            }
            sftp.set_metadata(&remote_path_str, attrs)
                .await
                .map_err(|e| {
                    ConnectionError::TransferFailed(format!(
                        "Failed to set file attributes: {}",
                        e
                    ))
                })?;
        }

        Ok(())
    }

    async fn download(&self, remote_path: &Path, local_path: &Path) -> ConnectionResult<()> {
        let content = self.download_content(remote_path).await?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ConnectionError::TransferFailed(format!(
                    "Failed to create local directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        tokio::fs::write(local_path, &content).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to write local file {}: {}",
                local_path.display(),
                e
            ))
        })
    }

    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>> {
        debug!(remote = %remote_path.display(), "Downloading content via SFTP");

        let sftp = self.open_sftp().await?;
        let remote_path_str = remote_path.to_string_lossy().to_string();
        let mut remote_file = sftp.open(&remote_path_str).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to open remote file {}: {}",
                remote_path.display(),
                e
            ))
        })?;

        let mut content = Vec::new();
        remote_file.read_to_end(&mut content).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to read remote file: {}", e))
        })?;

        debug!(size = %content.len(), "Content download completed");
        Ok(content)
    }

    async fn path_exists(&self, path: &Path) -> ConnectionResult<bool> {
        let sftp = self.open_sftp().await?;
        match sftp.try_exists(path.to_string_lossy().to_string()).await {
            Ok(exists) => Ok(exists),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Error checking path existence");
                Ok(false)
            }
        }
    }

    async fn stat(&self, path: &Path) -> ConnectionResult<FileStat> {
        trace!(path = %path.display(), "Getting file stats via SFTP");
        let sftp = self.open_sftp().await?;
        let attrs = sftp
            .metadata(path.to_string_lossy().to_string())
            .await
            .map_err(|e| {
                ConnectionError::TransferFailed(format!("Failed to stat {}: {}", path.display(), e))
            })?;

        Ok(FileStat {
            size: attrs.size.unwrap_or(0),
            mode: attrs.permissions.unwrap_or(0),
            uid: attrs.uid.unwrap_or(0),
            gid: attrs.gid.unwrap_or(0),
            is_file: attrs.is_regular(),
        })
    }

    async fn rename(&self, from: &Path, to: &Path) -> ConnectionResult<()> {
        // SFTP v3 rename refuses to overwrite, mv -f does not
        let command = format!(
            "mv -f {} {}",
            escape_shell_arg(&from.to_string_lossy()),
            escape_shell_arg(&to.to_string_lossy())
        );
        self.run_simple(&command).await
    }

    async fn remove(&self, path: &Path) -> ConnectionResult<()> {
        let command = format!("rm -f {}", escape_shell_arg(&path.to_string_lossy()));
        self.run_simple(&command).await
    }

    async fn close(&self) -> ConnectionResult<()> {
        debug!(identifier = %self.identifier, "Closing SSH connection");
        self.connected.store(false, Ordering::SeqCst);

        let handle = self.handle.write().await.take();
        if let Some(handle) = handle {
            let _ = handle
                .disconnect(
                    russh::Disconnect::ByApplication,
                    "Connection closed by client",
                    "en",
                )
                .await;
        }

        Ok(())
    }
}

impl std::fmt::Debug for RusshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshConnection")
            .field("identifier", &self.identifier)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

/// Connector opening russh connections, or local ones for `local` targets.
#[derive(Debug, Clone)]
pub struct SshConnector {
    accept_unknown_hosts: bool,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self {
            accept_unknown_hosts: true,
        }
    }
}

impl SshConnector {
    /// Connector that accepts hosts missing from known_hosts
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject hosts that are not already in known_hosts
    pub fn strict_host_keys(mut self) -> Self {
        self.accept_unknown_hosts = false;
        self
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn open(&self, target: &RemoteTarget) -> ConnectionResult<Box<dyn Connection>> {
        if target.local {
            return Ok(Box::new(LocalConnection::with_identifier(&target.name)));
        }
        let conn = RusshConnection::connect(target, self.accept_unknown_hosts).await?;
        Ok(Box::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_splits_across_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"listen_tc").is_empty());
        assert_eq!(buffer.push(b"p = 1\r\nauth_"), vec!["listen_tcp = 1"]);
        assert_eq!(buffer.remainder(), Some("auth_".to_string()));
        assert_eq!(buffer.remainder(), None);
        assert_eq!(buffer.into_string(), "listen_tcp = 1\r\nauth_");
    }

    #[tokio::test]
    async fn test_connector_uses_local_for_local_targets() {
        let connector = SshConnector::new();
        let target = RemoteTarget::new("controller").local();
        let conn = connector.open(&target).await.unwrap();
        assert_eq!(conn.identifier(), "controller");
    }
}
