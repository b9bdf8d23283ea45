//! Error types for observer and service management.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from manager, observer and handler operations.
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Invalid handler configuration: {reason}")]
    Configuration { reason: String },

    #[error("Path does not exist: {path}")]
    PathNotFound { path: PathBuf },

    #[error("Path is not a directory: {path}")]
    NotADirectory { path: PathBuf },

    #[error("Cannot read directory {path}: {reason}")]
    PathUnreadable { path: PathBuf, reason: String },

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Observer with name '{name}' already exists")]
    NameConflict { name: String },

    #[error("Observer with name '{name}' does not exist")]
    UnknownObserver { name: String },

    #[error("'{name}' is already running")]
    AlreadyRunning { name: String },

    #[error("Observer '{name}' is not running")]
    NotRunning { name: String },

    #[error("Observer '{name}' runs in a one-shot process and must be re-created to start again")]
    NotRestartable { name: String },

    #[error("Service with name '{name}' already exists")]
    ServiceExists { name: String },

    #[error("Service with name '{name}' does not exist")]
    UnknownService { name: String },

    #[error("Service '{name}' is not running")]
    ServiceNotRunning { name: String },

    #[error("Execution resource error: {reason}")]
    Resource { reason: String },
}

impl From<notify::Error> for ManagerError {
    fn from(e: notify::Error) -> Self {
        ManagerError::Resource {
            reason: e.to_string(),
        }
    }
}

impl From<std::io::Error> for ManagerError {
    fn from(e: std::io::Error) -> Self {
        ManagerError::Resource {
            reason: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;
