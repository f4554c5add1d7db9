//! USB mass-storage export.
//!
//! The class driver's protocol handling is outside this crate; a
//! [`HostPort`] delivers decoded sector requests and takes their results.
//! [`UsbMassStorage`] serves them against the shared block device through
//! the arbiter, from the main loop.

mod host;
mod mass_storage;

pub use host::{HostPort, HostRequest, HostResponse, ScriptedHost, SimulatedHost};
pub use mass_storage::{UsbMassStorage, UsbStats};

use crate::storage::{ArbiterViolation, BlockDeviceError};
use thiserror::Error;

/// Errors from the export path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsbError {
    #[error("block device has not been exported")]
    NotExported,
    #[error("sector size {sector_size} incompatible with erase size {erase_size}")]
    SectorSize { sector_size: u64, erase_size: u64 },
    #[error("sectors {lba}+{count} outside volume of {sector_count}")]
    OutOfRange {
        lba: u64,
        count: u64,
        sector_count: u64,
    },
    #[error("write of {len} bytes is not a whole number of {sector_size}-byte sectors")]
    PartialSector { len: u64, sector_size: u64 },
    #[error("device error: {0}")]
    Device(#[from] BlockDeviceError),
    #[error(transparent)]
    Arbiter(#[from] ArbiterViolation),
}

impl UsbError {
    /// Returns true for errors that must stop the export loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UsbError::Arbiter(_))
    }
}
