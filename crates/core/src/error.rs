//! Common error types for the core crate.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while preparing or scanning the staging tree.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The configured base directory does not exist.
    #[error("base directory {0} does not exist")]
    MissingBase(PathBuf),
    /// A staging subdirectory exists but could not be written to.
    #[error("staging directory {dir} is not writable: {source}")]
    Unwritable {
        /// Directory that failed the write probe.
        dir: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
