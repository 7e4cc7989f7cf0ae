//! Error types for Nimbus
//!
//! This module defines the common error taxonomy used by the storage
//! target: object-path failures surfaced to clients, upstream (cloud)
//! failures, lock timeouts, and configuration errors.

use std::io;
use std::path::Path;
use thiserror::Error;

/// Common result type for Nimbus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Nimbus
#[derive(Debug, Error)]
pub enum Error {
    // Object path errors
    #[error("object not found: {bucket}/{object}")]
    ObjectNotFound { bucket: String, object: String },

    #[error("permission denied: access forbidden to {0}")]
    Forbidden(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("invalid object {0}: bad checksum")]
    InvalidObject(String),

    #[error("disk I/O error: {0}")]
    DiskIo(#[from] io::Error),

    // Upstream errors
    #[error("cloud backend error: {0}")]
    Cloud(String),

    #[error("peer transfer failed: {0}")]
    Transfer(String),

    // Concurrency
    #[error("timed out waiting for lock on {key}")]
    LockTimeout { key: String },

    #[error("operation aborted")]
    Aborted,

    // Request errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a cloud backend error
    pub fn cloud(msg: impl Into<String>) -> Self {
        Self::Cloud(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Classify an I/O error raised while accessing `path`.
    ///
    /// Permission denials become [`Error::Forbidden`]; everything else is
    /// annotated with the path and kept as a disk error.
    pub fn from_io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::Forbidden(path.display().to_string()),
            kind => Self::DiskIo(io::Error::new(kind, format!("{}: {err}", path.display()))),
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ObjectNotFound { .. } => true,
            Self::DiskIo(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Get the HTTP status code reported to the client
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidRequest(_) | Self::Serialization(_) => 400,

            // 403 Forbidden
            Self::Forbidden(_) => 403,

            // 404 Not Found
            Self::ObjectNotFound { .. } => 404,

            // 503 Service Unavailable
            Self::Aborted => 503,

            // 500 Internal Server Error
            Self::ChecksumMismatch { .. }
            | Self::InvalidObject(_)
            | Self::DiskIo(_)
            | Self::Cloud(_)
            | Self::Transfer(_)
            | Self::LockTimeout { .. }
            | Self::Configuration(_)
            | Self::Internal(_) => 500,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
