//! Error types shared by every engine component

use thiserror::Error;

/// Errors that can occur while ingesting or exporting sensor data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Unknown measurement: {0}")]
    UnknownMeasurement(u32),

    #[error("Unknown modality {modality} in measurement {measurement}")]
    UnknownModality { measurement: u32, modality: u64 },

    #[error("Modality {modality} in measurement {measurement} is already retired")]
    AlreadyRetired { measurement: u32, modality: u64 },

    #[error("Allocation failure: {0}")]
    AllocationFailure(String),

    #[error("Buffer {0} is not checked out")]
    BufferNotCheckedOut(u32),

    #[error("Invalid export parameters: {0}")]
    InvalidExportParameters(String),

    #[error("Null pointer passed for {0}")]
    NullPointer(&'static str),
}

impl SensorError {
    /// Shorthand for building an [`SensorError::InvalidPayload`]
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }
}

impl From<std::collections::TryReserveError> for SensorError {
    fn from(e: std::collections::TryReserveError) -> Self {
        Self::AllocationFailure(e.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, SensorError>;
