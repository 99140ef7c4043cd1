use std::path::PathBuf;

use thiserror::Error;

/// The primary error type for all operations in the `otaforge` crate.
///
/// Every variant is fatal to the build in progress; nothing is retried and no
/// partial package is left behind.
#[derive(Debug, Error)]
pub enum OtaError {
    /// Contradictory or incomplete build configuration, e.g. a file that is both
    /// required and prohibited verbatim, or size checks without a board config.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The bootloader requirement is absent from the input manifest.
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// An external collaborator (ownership oracle, delta generator, image
    /// assembler, signer) failed, timed out, or produced malformed output.
    #[error("{tool} failed: {message}")]
    Tooling { tool: String, message: String },

    /// An expected entry is absent from a target-files archive.
    #[error("Archive entry '{0}' not found")]
    MissingEntry(String),

    /// A property is missing from a build-properties file.
    #[error("Couldn't find '{0}' in build.prop")]
    MissingProperty(String),

    /// A structural problem with an archive other than a missing entry.
    #[error("Archive error: {0}")]
    Archive(String),

    /// An I/O error, with the path where it happened when one is known.
    #[error("I/O error on path '{}': {source}", path.display())]
    Io { source: std::io::Error, path: PathBuf },

    /// An error from the underlying `zip` crate.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// An error serializing a plan summary.
    #[error("Serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl OtaError {
    pub fn tooling(tool: impl Into<String>, message: impl Into<String>) -> Self {
        OtaError::Tooling { tool: tool.into(), message: message.into() }
    }

    pub fn io_at(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        OtaError::Io { source, path: path.into() }
    }
}

// Generic IO error conversion that doesn't carry a path
impl From<std::io::Error> for OtaError {
    fn from(err: std::io::Error) -> Self {
        OtaError::Io { source: err, path: PathBuf::new() }
    }
}

pub type Result<T, E = OtaError> = std::result::Result<T, E>;
