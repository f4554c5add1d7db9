//! Top-level error taxonomy.

use crate::capture::{ConfigError, SensorError};
use crate::extraction::ExtractionError;
use crate::storage::{ArbiterViolation, BlockDeviceError, MountFailure, StorageError, StorageFailure};
use crate::usb::UsbError;
use thiserror::Error;

/// Failure of one capture step on the dispatcher thread.
///
/// Extraction, storage and sensor failures end the current cycle only.
/// Arbiter violations stop the dispatcher. Mount failures surface at
/// bring-up as [`StartupError::Mount`].
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("storage failed: {0}")]
    Storage(#[from] StorageFailure),
    #[error("sensor failed: {0}")]
    Sensor(#[from] SensorError),
    #[error("arbiter violation: {0}")]
    Arbiter(#[from] ArbiterViolation),
}

impl CaptureError {
    /// Returns true if the system cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CaptureError::Arbiter(_))
    }
}

impl From<StorageError> for CaptureError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Failure(failure) => CaptureError::Storage(failure),
            StorageError::Arbiter(violation) => CaptureError::Arbiter(violation),
        }
    }
}

/// Errors that abort bring-up.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("block device init failed: {0}")]
    Device(#[from] BlockDeviceError),
    #[error("storage unavailable: {0}")]
    Mount(#[from] MountFailure),
    #[error("sensor setup failed: {0}")]
    Sensor(#[from] SensorError),
    #[error("USB export failed: {0}")]
    Usb(#[from] UsbError),
}
