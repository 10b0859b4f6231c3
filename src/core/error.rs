//! Error types for the backup engine

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during backup and restore
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error at {}: {source}", path.display())]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Invalid backup archive: {0}")]
    InvalidArchive(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Database is not ready after {attempts} attempts: {last_error}")]
    NotReady { attempts: u32, last_error: String },

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Another backup or restore is already running{}", .0.map(|pid| format!(" (pid {})", pid)).unwrap_or_default())]
    Locked(Option<u32>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Attach a path to an io::Error
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::IoAt {
            path: path.into(),
            source,
        }
    }
}

/// Extension for adding path context to io results
pub trait IoContext<T> {
    fn at_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn at_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| Error::io_at(path, e))
    }
}
