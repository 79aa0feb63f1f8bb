//! # crucible - safe patching of remote configuration files
//!
//! crucible prepares hosts (typically a controller and its compute nodes) for
//! VM live migration by editing their configuration files over SSH. The core
//! is a patch engine with a safe-apply protocol: fetch a remote file, patch
//! its `key = value` lines locally, keep backups, push the result back and
//! be able to undo it.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                Pipeline / CLI (plan steps)               │
//! └──────────────────────────────────────────────────────────┘
//!                  │                          │
//!                  ▼                          ▼
//! ┌─────────────────────────────┐  ┌─────────────────────────┐
//! │       RemoteFileSync        │─▶│    RolloverManager      │
//! │  fetch -> patch -> push     │  │  journal, rollback      │
//! └─────────────────────────────┘  └─────────────────────────┘
//!        │          │         │
//!        ▼          ▼         ▼
//! ┌────────────┐ ┌────────┐ ┌───────────────────┐
//! │ConfigPatch-│ │Backup- │ │GeneratedFileWriter│
//! │er (pure)   │ │Store   │ │                   │
//! └────────────┘ └────────┘ └───────────────────┘
//!        │
//!        ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │   RemoteSession: one connection per call (russh, local)  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use crucible::prelude::*;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> crucible::Result<()> {
//! let target = RemoteTarget::new("compute1")
//!     .address("10.0.0.11")
//!     .password("secret");
//!
//! let sync = RemoteFileSync::new(Arc::new(SshConnector::default()), "/var/tmp/crucible");
//! let outcome = sync
//!     .patch_remote(
//!         &target,
//!         Path::new("/etc/libvirt/libvirtd.conf"),
//!         &[
//!             PatchDirective::new("listen_tls", "0"),
//!             PatchDirective::new("listen_tcp", "1"),
//!             PatchDirective::new("auth_tcp", "\"none\"").not_found(NotFoundPolicy::Append),
//!         ],
//!     )
//!     .await?;
//!
//! println!("{}", outcome.report.summary());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

/// Commonly used types
pub mod prelude {
    pub use crate::backup::{BackupRecord, BackupStore};
    pub use crate::config::Settings;
    pub use crate::connection::{
        CommandResult, Connection, ConnectionError, Connector, Credentials, LocalConnector,
        RemoteSession, RemoteTarget, RetryConfig, TransferDirection,
    };
    #[cfg(feature = "russh")]
    pub use crate::connection::SshConnector;
    pub use crate::error::{Error, Result};
    pub use crate::generate::{GeneratedFile, GeneratedFileWriter};
    pub use crate::ini::IniFile;
    pub use crate::patch::{
        ConfigDocument, ConfigPatcher, Delimiter, NotFoundPolicy, PatchDirective, PatchReport,
    };
    pub use crate::pipeline::{FailurePolicy, Pipeline, Plan, Step, StepAction};
    pub use crate::rollover::{RolloverEntry, RolloverManager, TargetResolver};
    pub use crate::sync::{RemoteFileSync, SyncOutcome};
}

pub mod backup;
pub mod config;
pub mod connection;
pub mod error;
pub mod generate;
pub mod ini;
pub mod patch;
pub mod pipeline;
pub mod rollover;
pub mod sync;

pub use error::{Error, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
