//! Error types for fieldcam.
//!
//! This module defines all error types used throughout the fieldcam crate.
//! Most of them never leave the component that raised them: the pipeline
//! converts them into a health status plus a counter. Only exhausting every
//! camera backend is fatal.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for fieldcam operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Sensor Errors ===
    /// A sentence from the position sensor could not be parsed.
    #[error("malformed sensor input: {reason}")]
    SensorParse {
        /// Why the sentence was rejected.
        reason: String,
    },

    // === Device Errors ===
    /// A device could not be opened or stopped responding.
    #[error("device '{device}' unavailable: {message}")]
    DeviceUnavailable {
        /// Name of the device or backend.
        device: String,
        /// Description of what went wrong.
        message: String,
    },

    /// A capture did not finish within its time budget.
    #[error("capture timed out after {elapsed_ms}ms")]
    CaptureTimeout {
        /// How long the stage ran before it was cancelled.
        elapsed_ms: u64,
    },

    // === Tagging Errors ===
    /// Encoding the frame or embedding metadata failed.
    #[error("failed to encode frame {sequence}: {message}")]
    Encoding {
        /// Sequence number of the frame that was dropped.
        sequence: u64,
        /// Description of what went wrong.
        message: String,
    },

    // === Storage Errors ===
    /// Free space is below the configured floor and eviction could not recover it.
    #[error("storage exhausted: {free_bytes} bytes free, {required_bytes} required")]
    StorageExhausted {
        /// Bytes currently free on the storage volume.
        free_bytes: u64,
        /// Bytes the policy requires to be free.
        required_bytes: u64,
    },

    /// Writing an image or its sidecar failed.
    #[error("failed to persist {path}: {source}")]
    Persist {
        /// Path that was being written.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to open or create the catalog database.
    #[error("failed to open catalog at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A catalog query failed.
    #[error("catalog query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run catalog migrations.
    #[error("catalog migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// The operation was cancelled by shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for fieldcam operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new sensor parse error.
    #[must_use]
    pub fn sensor_parse(reason: impl Into<String>) -> Self {
        Self::SensorParse {
            reason: reason.into(),
        }
    }

    /// Create a new device unavailable error.
    #[must_use]
    pub fn device_unavailable(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Create a new encoding error for the given frame.
    #[must_use]
    pub fn encoding(sequence: u64, message: impl Into<String>) -> Self {
        Self::Encoding {
            sequence,
            message: message.into(),
        }
    }

    /// Create a new timeout error.
    #[must_use]
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error should stop the process.
    ///
    /// Only a camera that cannot be opened through any backend qualifies;
    /// the pipeline raises that itself once every candidate failed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceUnavailable { device, .. } if device == "camera")
    }

    /// Check if this error indicates the storage volume is full.
    #[must_use]
    pub fn is_storage_exhausted(&self) -> bool {
        match self {
            Self::StorageExhausted { .. } => true,
            Self::Persist { source, .. } | Self::Io(source) => {
                source.kind() == std::io::ErrorKind::StorageFull
            }
            _ => false,
        }
    }
}
