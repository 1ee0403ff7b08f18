//! Error types for the rotating writer.

use std::io;
use std::path::PathBuf;

/// Result type for rotolog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while constructing or rotating a log writer.
///
/// Only construction surfaces these to the caller. Once the writer is
/// running, rotation and write failures are logged and retried; the
/// producer-facing write path never returns an error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configured output path is empty.
    #[error("log output path is empty")]
    EmptyOutputPath,

    /// Failed to scan the output directory for existing backups.
    #[error("failed to scan backups in {dir}")]
    Scan {
        /// Directory that was being scanned.
        dir: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Failed to create the directory holding the output file.
    #[error("failed to create log directory {dir}")]
    CreateDir {
        /// Directory that could not be created.
        dir: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Failed to open or create the active log file.
    #[error("failed to open log file {path}")]
    Open {
        /// Path of the file that could not be opened.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Failed to spawn a background loop thread.
    #[error("failed to spawn background thread")]
    Spawn {
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Failed to rename the active file to its backup path during rotation.
    #[error("failed to rename log file {from} to {to}")]
    Rename {
        /// The active file path.
        from: PathBuf,
        /// The backup path it was being renamed to.
        to: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}
