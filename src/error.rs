//! Error taxonomy
//!
//! Everything here aborts the run before any test executes. Execution-time
//! expansion failures never reach this type; they become failure reasons on
//! the test whose field was being expanded.

use std::path::PathBuf;

/// Errors produced while loading and resolving a configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed configuration — reported with file/field context.
    #[error("{}: {}: {}", .file.display(), .context, .message)]
    Config {
        file: PathBuf,
        /// Where in the file the problem is (group/test/field path)
        context: String,
        message: String,
    },

    #[error("could not read {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not valid JSON: {}", .path.display(), .source)]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub fn config(
        file: impl Into<PathBuf>,
        context: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Config {
            file: file.into(),
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
