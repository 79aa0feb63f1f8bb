//! Host inventory and retry settings
//!
//! Turns the `[defaults]` and `[hosts.<name>]` tables into the
//! [`RemoteTarget`]s sessions connect to.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::session::{Credentials, RemoteTarget};

/// Default connection timeout in seconds
pub const DEFAULT_TIMEOUT: u64 = 30;

/// Default number of connection retries
pub const DEFAULT_RETRIES: u32 = 3;

/// Default delay between retries in seconds
pub const DEFAULT_RETRY_DELAY: u64 = 1;

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// Upper bound on the backoff between connection attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Inventory: shared defaults plus per-host overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub defaults: ConnectionDefaults,

    #[serde(default)]
    pub hosts: HashMap<String, HostConfig>,
}

impl ConnectionConfig {
    /// Build the [`RemoteTarget`] used to open sessions to `host`.
    ///
    /// Hosts missing from the inventory still resolve, using the defaults and
    /// the name itself as the address.
    pub fn target_for(&self, host: &str) -> RemoteTarget {
        self.merged(host).to_target(host)
    }

    /// `host`'s entry with every unset field taken from the defaults.
    fn merged(&self, host: &str) -> HostConfig {
        let defaults = &self.defaults;
        let mut config = self.hosts.get(host).cloned().unwrap_or_default();

        config.user.get_or_insert_with(|| defaults.user.clone());
        config.port.get_or_insert(defaults.port);
        config.connect_timeout.get_or_insert(defaults.timeout);
        config.retries.get_or_insert(defaults.retries);
        config.retry_delay.get_or_insert(defaults.retry_delay);
        if config.password.is_none() {
            config.password = defaults.password.clone();
        }
        if config.identity_file.is_none() {
            config.identity_file = defaults.identity_file.clone();
        }
        config
    }
}

/// Default connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDefaults {
    /// Default username for connections
    #[serde(default = "default_user")]
    pub user: String,

    /// Default port for SSH connections
    #[serde(default = "default_port")]
    pub port: u16,

    /// Default connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Default number of connection retries
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Delay between retries in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,

    /// Password shared by every host (the lab clusters use one root password)
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Private key tried for every host without its own
    #[serde(default)]
    pub identity_file: Option<String>,
}

fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY
}

impl Default for ConnectionDefaults {
    fn default() -> Self {
        Self {
            user: default_user(),
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            password: None,
            identity_file: None,
        }
    }
}

/// Host-specific configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// Actual hostname or IP address
    pub hostname: Option<String>,

    /// Port to connect to
    pub port: Option<u16>,

    /// Username for authentication
    pub user: Option<String>,

    /// Path to private key file
    pub identity_file: Option<String>,

    /// Passphrase protecting `identity_file`
    #[serde(skip_serializing)]
    pub passphrase: Option<String>,

    /// Password for authentication (not recommended)
    #[serde(skip_serializing)]
    pub password: Option<String>,

    /// Connection timeout in seconds
    pub connect_timeout: Option<u64>,

    /// Number of connection retries
    pub retries: Option<u32>,

    /// Retry delay in seconds
    pub retry_delay: Option<u64>,

    /// `local` runs on the control node instead of over SSH
    pub connection: Option<String>,
}

impl HostConfig {
    fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retries.unwrap_or(DEFAULT_RETRIES),
            retry_delay: Duration::from_secs(self.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY)),
            ..RetryConfig::default()
        }
    }

    /// Convert into a session target named `name`.
    ///
    /// Credentials are chosen key file first, then password, then agent.
    pub fn to_target(&self, name: &str) -> RemoteTarget {
        let credentials = match (&self.identity_file, &self.password) {
            (Some(path), _) => Credentials::KeyFile {
                path: expand_path(path),
                passphrase: self.passphrase.clone(),
            },
            (None, Some(password)) => Credentials::Password(password.clone()),
            (None, None) => Credentials::Agent,
        };

        RemoteTarget {
            name: name.to_string(),
            address: self.hostname.clone().unwrap_or_else(|| name.to_string()),
            port: self.port.unwrap_or(DEFAULT_PORT),
            user: self.user.clone().unwrap_or_else(default_user),
            credentials,
            timeout: Duration::from_secs(self.connect_timeout.unwrap_or(DEFAULT_TIMEOUT)),
            retry: self.retry_config(),
            local: self.connection.as_deref() == Some("local"),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: u32,

    /// Initial delay between retries
    pub retry_delay: Duration,

    /// Use exponential backoff
    pub exponential_backoff: bool,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RETRIES,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY),
            exponential_backoff: true,
            max_delay: MAX_RETRY_DELAY,
        }
    }
}

impl RetryConfig {
    /// A configuration that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculate delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.exponential_backoff {
            let delay = self.retry_delay * 2u32.pow(attempt.min(10));
            delay.min(self.max_delay)
        } else {
            self.retry_delay
        }
    }
}

/// Expand `~` and environment variables in a path
pub fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or_else(|_| path.into());
    PathBuf::from(expanded.as_ref())
}

/// Default private keys present under `~/.ssh`
pub fn default_identity_files() -> Vec<PathBuf> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    let ssh_dir = home.join(".ssh");

    vec![
        ssh_dir.join("id_ed25519"),
        ssh_dir.join("id_ecdsa"),
        ssh_dir.join("id_rsa"),
    ]
    .into_iter()
    .filter(|p| p.exists())
    .collect()
}
