//! Sink-specific error types.
//!
//! Every persistence operation returns [`SinkError`] on failure. The sampling
//! loop treats any of them as fatal.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::collector::CollectorError;

/// Errors that can occur in the persistence sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// File system operation failed.
    #[error("io error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An on-rotate collector failed while starting a new file.
    #[error("on-rotate collection failed: {0}")]
    Collector(#[from] CollectorError),

    /// Write attempted after `close()`.
    #[error("sink is closed")]
    Closed,
}

impl SinkError {
    /// Build a closure mapping an `io::Error` on `path` into a `SinkError`.
    pub fn io(path: &Path) -> impl FnOnce(std::io::Error) -> SinkError + '_ {
        move |source| SinkError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
