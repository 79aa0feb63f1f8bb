//! CLI module for crucible
//!
//! Argument parsing and subcommand dispatch.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// crucible - patch configuration files on remote hosts, safely
///
/// Fetches files over SSH, patches them locally, keeps pristine and rolling
/// backups, pushes the result back and can undo it.
#[derive(Parser, Debug, Clone)]
#[command(name = "crucible")]
#[command(version)]
#[command(about = "Patch configuration files on remote hosts, with backups and rollback", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true, env = "CRUCIBLE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Show a diff of every patched file
    #[arg(long = "diff", global = true)]
    pub diff_mode: bool,

    /// Also log to /tmp/crucible-<timestamp>.log
    #[arg(long, global = true)]
    pub log_file: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Set values in a remote configuration file
    Patch(commands::patch::PatchArgs),

    /// Run a command on hosts
    Exec(commands::exec::ExecArgs),

    /// Write a generated file to hosts
    Export(commands::export::ExportArgs),

    /// Run the steps of a plan file
    Apply(commands::apply::ApplyArgs),

    /// Undo recorded pushes
    Rollback(commands::rollback::RollbackArgs),

    /// Keep recorded pushes and clear the rollback journal
    Commit,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Get the effective verbosity level (0-3)
    pub fn verbosity(&self) -> u8 {
        self.verbose.min(3)
    }
}
