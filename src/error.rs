//! Error types for Crucible.
//!
//! This module defines the error taxonomy shared by the patch engine, the
//! backup store, the remote session layer and the rollover journal. Each
//! variant carries enough context (host, path, command) to explain a failed
//! step without re-running it.

use std::path::PathBuf;
use thiserror::Error;

use crate::connection::ConnectionError;

/// Result type alias for Crucible operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Crucible.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Connectivity Errors
    // ========================================================================
    /// The remote host could not be reached or the session could not be
    /// authenticated.
    #[error("Cannot reach '{host}': {message}")]
    Connectivity {
        /// Target host
        host: String,
        /// Error message
        message: String,
        /// Underlying transport error
        #[source]
        source: Option<ConnectionError>,
    },

    /// A remote command ran but exited with a status outside the allowed set.
    #[error("Command '{command}' failed on '{host}' with exit code {exit_code}: {stderr}")]
    RemoteCommand {
        /// Target host
        host: String,
        /// The command that was run
        command: String,
        /// Exit code reported by the remote side
        exit_code: i32,
        /// Captured standard error
        stderr: String,
    },

    // ========================================================================
    // Patch Errors
    // ========================================================================
    /// One or more directives with the `fail` policy found no matching line.
    #[error("Token(s) {} not found in '{file}'", tokens.join(", "))]
    PatchNotFound {
        /// Name of the document being patched
        file: String,
        /// Every token that failed to match
        tokens: Vec<String>,
    },

    /// Invalid input supplied to an operation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ========================================================================
    // File Errors
    // ========================================================================
    /// The pristine or rolling backup copy could not be written.
    #[error("Failed to create backup of '{path}': {source}")]
    BackupCreation {
        /// File being backed up
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// A local read, write or transfer failed.
    #[error("File operation on '{path}' failed: {message}")]
    FileIo {
        /// Path involved in the failed operation
        path: PathBuf,
        /// Error message
        message: String,
        /// Underlying IO error
        #[source]
        source: Option<std::io::Error>,
    },

    // ========================================================================
    // Rollover Errors
    // ========================================================================
    /// A rollback could not be completed.
    #[error("Rollback failed: {0}")]
    Rollback(String),

    // ========================================================================
    // Pipeline Errors
    // ========================================================================
    /// A pipeline step failed and the pipeline halted.
    #[error("Step '{step}' failed: {source}")]
    StepFailed {
        /// Step name
        step: String,
        /// Cause
        #[source]
        source: Box<Error>,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Host not found in the configured inventory.
    #[error("Host '{0}' not found in inventory")]
    HostNotFound(String),

    // ========================================================================
    // Serialization Errors
    // ========================================================================
    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    // ========================================================================
    // Other Errors
    // ========================================================================
    /// Generic error with source.
    #[error("{message}")]
    Other {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Creates a new connectivity error without an underlying cause.
    pub fn connectivity(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connectivity {
            host: host.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new file IO error from an `std::io::Error`.
    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileIo {
            path: path.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Creates a new file IO error carrying only a message.
    pub fn file_io_msg(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::FileIo {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new backup creation error.
    pub fn backup(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::BackupCreation {
            path: path.into(),
            source,
        }
    }

    /// Wraps an error as the cause of a failed pipeline step.
    pub fn step_failed(step: impl Into<String>, source: Error) -> Self {
        Self::StepFailed {
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// Converts a transport error raised while talking to `host`.
    ///
    /// Transfer and local IO failures become [`Error::FileIo`]; everything
    /// else means the host was not usable and becomes [`Error::Connectivity`].
    pub fn from_connection(host: &str, path: Option<&std::path::Path>, err: ConnectionError) -> Self {
        match err {
            ConnectionError::TransferFailed(message) => Self::FileIo {
                path: path.map(PathBuf::from).unwrap_or_default(),
                message,
                source: None,
            },
            ConnectionError::IoError(source) => Self::FileIo {
                path: path.map(PathBuf::from).unwrap_or_default(),
                message: source.to_string(),
                source: Some(source),
            },
            other => Self::Connectivity {
                host: host.to_string(),
                message: other.to_string(),
                source: Some(other),
            },
        }
    }

    /// Returns true if retrying the same operation may succeed.
    ///
    /// Only connectivity failures qualify; a remote command that exited badly
    /// is never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connectivity { .. })
    }

    /// Returns the error code for CLI exit status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::RemoteCommand { .. } => 2,
            Error::Connectivity { .. } => 3,
            Error::PatchNotFound { .. } | Error::InvalidInput(_) => 4,
            Error::Config(_) | Error::HostNotFound(_) | Error::TomlParse(_) => 5,
            Error::BackupCreation { .. } | Error::FileIo { .. } => 6,
            Error::Rollback(_) => 7,
            Error::StepFailed { source, .. } => source.exit_code(),
            _ => 1,
        }
    }
}

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Adds context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Adds context with a closure that is only evaluated on error.
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Other {
            message: message.into(),
            source: Some(Box::new(e)),
        })
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| Error::Other {
            message: f().into(),
            source: Some(Box::new(e)),
        })
    }
}
