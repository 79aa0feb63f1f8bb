//! Subcommands module for the crucible CLI
//!
//! This module contains all the subcommand implementations.

pub mod apply;
pub mod exec;
pub mod export;
pub mod patch;
pub mod rollback;

use crate::cli::output::{HostStatus, OutputFormatter, RecapStats};
use crucible::config::Settings;
use crucible::connection::{Connector, RemoteSession, RemoteTarget};
use crucible::rollover::RolloverManager;
use crucible::sync::{RemoteFileSync, SyncOutcome};
use std::sync::Arc;

/// Common context shared between commands
pub struct CommandContext {
    /// Loaded settings
    pub settings: Settings,
    /// Output formatter
    pub output: OutputFormatter,
    /// Verbosity level
    pub verbosity: u8,
    /// Diff mode
    pub diff_mode: bool,
}

impl CommandContext {
    /// Create a new command context from CLI arguments
    pub fn new(cli: &crate::cli::Cli, settings: Settings) -> Self {
        Self {
            settings,
            output: OutputFormatter::new(!cli.no_color, cli.verbosity()),
            verbosity: cli.verbosity(),
            diff_mode: cli.diff_mode,
        }
    }

    /// Transport used for every session
    pub fn connector(&self) -> Arc<dyn Connector> {
        #[cfg(feature = "russh")]
        {
            Arc::new(crucible::connection::SshConnector::default())
        }
        #[cfg(not(feature = "russh"))]
        {
            Arc::new(crucible::connection::LocalConnector)
        }
    }

    pub fn session(&self) -> RemoteSession {
        RemoteSession::new(self.connector())
    }

    /// Rollover manager backed by the journal in the staging directory
    pub fn rollover(&self) -> crucible::Result<Arc<RolloverManager>> {
        let manager = RolloverManager::with_journal(self.session(), self.settings.journal_path())?;
        Ok(Arc::new(manager))
    }

    /// File sync configured from the settings, recording into the journal
    pub fn sync(&self, mirror_pristine: bool) -> crucible::Result<RemoteFileSync> {
        let mirror = mirror_pristine || self.settings.defaults.mirror_pristine;
        Ok(
            RemoteFileSync::with_session(self.session(), self.settings.staging_dir())
                .with_backups(self.settings.backup_store())
                .with_rollover(self.rollover()?)
                .mirror_pristine(mirror),
        )
    }

    /// Targets for the named hosts
    pub fn targets(&self, hosts: &[String]) -> Vec<RemoteTarget> {
        hosts.iter().map(|h| self.settings.target(h)).collect()
    }

    /// Print per-host patch results and return the exit code they imply
    pub fn report_outcomes(&self, results: &[(String, crucible::Result<SyncOutcome>)]) -> i32 {
        let mut recap = RecapStats::new();
        let mut exit_code = 0;

        for (host, result) in results {
            match result {
                Ok(outcome) => {
                    let status = if outcome.pushed {
                        HostStatus::Changed
                    } else {
                        HostStatus::Ok
                    };
                    self.output
                        .host_result(host, status, Some(&outcome.report.summary()));
                    for (line, text) in &outcome.report.duplicates {
                        self.output.warning(&format!(
                            "{}: {} line {} sets a token again: {}",
                            host,
                            outcome.remote_path.display(),
                            line,
                            text.trim_end()
                        ));
                    }
                    if self.diff_mode {
                        self.output.diff(&outcome.diff);
                    }
                    recap.record(host, status);
                }
                Err(e) => {
                    let status = HostStatus::from_error(e);
                    self.output.host_result(host, status, Some(&e.to_string()));
                    recap.record(host, status);
                    if exit_code == 0 {
                        exit_code = e.exit_code();
                    }
                }
            }
        }

        self.output.recap(&recap);
        exit_code
    }
}

/// Parse `KEY=VALUE` arguments, keeping their order
pub fn parse_assignments(items: &[String]) -> crucible::Result<indexmap::IndexMap<String, String>> {
    let mut map = indexmap::IndexMap::new();
    for item in items {
        let (key, value) = item.split_once('=').ok_or_else(|| {
            crucible::Error::InvalidInput(format!("expected KEY=VALUE, got '{}'", item))
        })?;
        map.insert(key.trim().to_string(), value.to_string());
    }
    Ok(map)
}
