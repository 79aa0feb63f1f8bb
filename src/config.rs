//! Settings for crucible
//!
//! Loaded from the first TOML file found among:
//! - the path given on the command line
//! - `$CRUCIBLE_CONFIG`
//! - `./crucible.toml`
//! - `~/.config/crucible/crucible.toml`
//!
//! then adjusted by environment variables.
//!
//! ```toml
//! [defaults]
//! user = "root"
//! password = "secret"
//! staging_dir = "~/.crucible/staging"
//! failure_policy = "halt"
//!
//! [hosts.compute1]
//! hostname = "10.0.0.11"
//!
//! [hosts.controller]
//! hostname = "10.0.0.10"
//! identity_file = "~/.ssh/id_ed25519"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::backup::{BackupStore, DEFAULT_BACKUP_SUFFIX, DEFAULT_PRISTINE_SUFFIX};
use crate::connection::config::{expand_path, ConnectionDefaults};
use crate::connection::{ConnectionConfig, HostConfig, RemoteTarget};
use crate::error::{Error, Result};
use crate::pipeline::FailurePolicy;
use crate::rollover::{TargetResolver, JOURNAL_FILE};

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub defaults: Defaults,
    pub hosts: HashMap<String, HostConfig>,
}

/// The `[defaults]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Connection defaults shared by every host
    #[serde(flatten)]
    pub connection: ConnectionDefaults,

    /// Where fetched files and their backups are kept
    pub staging_dir: Option<String>,

    pub backup_suffix: String,

    pub pristine_suffix: String,

    /// Also keep a pristine copy next to each file on the remote host
    pub mirror_pristine: bool,

    pub failure_policy: FailurePolicy,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            connection: ConnectionDefaults::default(),
            staging_dir: None,
            backup_suffix: DEFAULT_BACKUP_SUFFIX.to_string(),
            pristine_suffix: DEFAULT_PRISTINE_SUFFIX.to_string(),
            mirror_pristine: false,
            failure_policy: FailurePolicy::Halt,
        }
    }
}

impl Settings {
    /// Load settings from the first file found, then apply the environment.
    ///
    /// An explicit path that does not exist is an error; finding no file
    /// anywhere else just means defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut settings = match Self::find_config(explicit)? {
            Some(path) => {
                debug!(path = %path.display(), "Loading settings");
                Self::from_file(&path)?
            }
            None => Settings::default(),
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn find_config(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file '{}' does not exist",
                    path.display()
                )));
            }
            return Ok(Some(path.to_path_buf()));
        }

        let mut paths = Vec::new();
        if let Ok(env_config) = std::env::var("CRUCIBLE_CONFIG") {
            paths.push(expand_path(&env_config));
        }
        paths.push(PathBuf::from("crucible.toml"));
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("crucible").join("crucible.toml"));
        }

        Ok(paths.into_iter().find(|p| p.exists()))
    }

    /// Read settings from one TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::file_io(path, e))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `CRUCIBLE_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var("CRUCIBLE_USER") {
            self.defaults.connection.user = user;
        }
        if let Ok(password) = std::env::var("CRUCIBLE_PASSWORD") {
            self.defaults.connection.password = Some(password);
        }
        if let Ok(dir) = std::env::var("CRUCIBLE_STAGING_DIR") {
            self.defaults.staging_dir = Some(dir);
        }
    }

    /// Connection inventory built from these settings
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            defaults: self.defaults.connection.clone(),
            hosts: self.hosts.clone(),
        }
    }

    /// Session target for `host`.
    ///
    /// Hosts not listed are reached by their name with the defaults, except
    /// `localhost`, which runs on the control node.
    pub fn target(&self, host: &str) -> RemoteTarget {
        let target = self.connection_config().target_for(host);
        if host == "localhost" && !self.hosts.contains_key(host) {
            target.local()
        } else {
            target
        }
    }

    /// Names of the configured hosts, sorted
    pub fn host_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.hosts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Staging directory with `~` and variables expanded
    pub fn staging_dir(&self) -> PathBuf {
        match &self.defaults.staging_dir {
            Some(dir) => expand_path(dir),
            None => dirs::data_local_dir()
                .map(|d| d.join("crucible").join("staging"))
                .unwrap_or_else(|| PathBuf::from(".crucible/staging")),
        }
    }

    /// Location of the persisted rollover journal
    pub fn journal_path(&self) -> PathBuf {
        self.staging_dir().join(JOURNAL_FILE)
    }

    /// Backup store using the configured suffixes
    pub fn backup_store(&self) -> BackupStore {
        BackupStore::new()
            .with_backup_suffix(&self.defaults.backup_suffix)
            .with_pristine_suffix(&self.defaults.pristine_suffix)
    }
}

impl TargetResolver for Settings {
    fn resolve(&self, host: &str) -> Result<RemoteTarget> {
        Ok(self.target(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Credentials;
    use serial_test::serial;

    const SAMPLE: &str = r#"
[defaults]
user = "stack"
password = "secret"
retries = 1
staging_dir = "/var/tmp/crucible"
backup_suffix = ".prev"
mirror_pristine = true
failure_policy = "continue"

[hosts.compute1]
hostname = "10.0.0.11"
port = 2222

[hosts.controller]
hostname = "10.0.0.10"
user = "root"
identity_file = "/keys/controller"
"#;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.defaults.backup_suffix, ".bak");
        assert_eq!(settings.defaults.pristine_suffix, ".orig");
        assert_eq!(settings.defaults.failure_policy, FailurePolicy::Halt);
        assert_eq!(settings.defaults.connection.port, 22);
        assert!(!settings.defaults.mirror_pristine);
    }

    #[test]
    fn test_parse_settings() {
        let settings = Settings::from_toml(SAMPLE).unwrap();
        assert_eq!(settings.defaults.connection.user, "stack");
        assert_eq!(settings.defaults.failure_policy, FailurePolicy::Continue);
        assert!(settings.defaults.mirror_pristine);
        assert_eq!(settings.staging_dir(), PathBuf::from("/var/tmp/crucible"));
        assert_eq!(settings.journal_path(), PathBuf::from("/var/tmp/crucible/rollover.json"));
        assert_eq!(settings.host_names(), vec!["compute1", "controller"]);
    }

    #[test]
    fn test_targets() {
        let settings = Settings::from_toml(SAMPLE).unwrap();

        let compute = settings.target("compute1");
        assert_eq!(compute.address, "10.0.0.11");
        assert_eq!(compute.port, 2222);
        assert_eq!(compute.user, "stack");
        assert_eq!(compute.credentials, Credentials::Password("secret".into()));
        assert_eq!(compute.retry.max_retries, 1);

        let controller = settings.target("controller");
        assert_eq!(controller.user, "root");
        assert!(matches!(controller.credentials, Credentials::KeyFile { .. }));

        assert!(settings.target("localhost").local);
        assert_eq!(settings.resolve("compute9").unwrap().address, "compute9");
    }

    #[test]
    fn test_backup_store_suffixes() {
        let settings = Settings::from_toml(SAMPLE).unwrap();
        let store = settings.backup_store();
        assert_eq!(store.backup_suffix(), ".prev");
        assert_eq!(store.pristine_suffix(), ".orig");
    }

    #[test]
    fn test_missing_explicit_config() {
        let err = Settings::load(Some(Path::new("/nonexistent/crucible.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("CRUCIBLE_USER", "migrator");
        std::env::set_var("CRUCIBLE_STAGING_DIR", "/tmp/stage");
        let mut settings = Settings::default();
        settings.apply_env_overrides();
        std::env::remove_var("CRUCIBLE_USER");
        std::env::remove_var("CRUCIBLE_STAGING_DIR");

        assert_eq!(settings.defaults.connection.user, "migrator");
        assert_eq!(settings.staging_dir(), PathBuf::from("/tmp/stage"));
    }
}
