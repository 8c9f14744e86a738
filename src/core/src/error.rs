use thiserror::Error;

use crate::unit::TransferFailure;

/// A3S Mirror error types
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Transport failed to copy or delete an image
    #[error("Transfer failed: {reference} - {message}")]
    Transfer { reference: String, message: String },

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// No manifest exists at the reference
    #[error("Manifest not found: {0}")]
    ManifestNotFound(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// Reference could not be parsed
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Signature of an image could not be resolved
    #[error("Signature error: {reference} - {message}")]
    Signature { reference: String, message: String },

    /// Archive production error
    #[error("Archive error: {0}")]
    Archive(String),

    /// A single file does not fit into one archive segment
    #[error("Archive size exceeded: {path} is {size} bytes, maximum segment size is {max} bytes")]
    ArchiveSizeExceeded { path: String, size: u64, max: u64 },

    /// History ledger error
    #[error("History error: {0}")]
    History(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation not supported by a collaborator
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// A release image failed; the whole workflow must stop
    #[error("Fatal transfer failure: {0}")]
    Fatal(Box<TransferFailure>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for MirrorError {
    fn from(err: serde_yaml::Error) -> Self {
        MirrorError::Serialization(err.to_string())
    }
}

/// Result type alias for A3S Mirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;
