//! Filesystem collaborator interface.
//!
//! Every call receives the block device explicitly. The only way to
//! obtain one is through [`BlockDeviceArbiter::acquire`], so filesystem
//! I/O cannot bypass the arbiter.
//!
//! [`BlockDeviceArbiter::acquire`]: super::BlockDeviceArbiter::acquire

use super::block_device::{BlockDevice, BlockDeviceError};
use thiserror::Error;

/// Filesystem errors, each mapped to a negative errno-style code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("filesystem not mounted")]
    NotMounted,
    #[error("no filesystem found on device")]
    NoFilesystem,
    #[error("filesystem corrupt: {0}")]
    Corrupt(String),
    #[error("device geometry unsupported: {0}")]
    Geometry(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("file already exists: {0}")]
    Exists(String),
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("stale or foreign file handle")]
    BadHandle,
    #[error("no space left on device")]
    NoSpace,
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },
    #[error("device error: {0}")]
    Device(#[from] BlockDeviceError),
}

impl FsError {
    /// Negative errno-style code reported on the console.
    pub fn code(&self) -> i32 {
        match self {
            FsError::NotFound(_) => -2,
            FsError::Device(_) | FsError::ShortWrite { .. } => -5,
            FsError::BadHandle => -9,
            FsError::Exists(_) => -17,
            FsError::NotMounted => -19,
            FsError::NoFilesystem
            | FsError::InvalidName(_)
            | FsError::InvalidArgument(_)
            | FsError::Geometry(_) => -22,
            FsError::NoSpace => -28,
            FsError::Corrupt(_) => -84,
        }
    }
}

/// An open file being written.
#[derive(Debug)]
pub struct FileHandle {
    pub(crate) name: String,
    /// Distinguishes this handle from earlier ones for the same slot.
    pub(crate) token: u64,
    /// Device offset of the first data byte.
    pub(crate) start: u64,
    /// Bytes already written to the device.
    pub(crate) flushed: u64,
    /// Device offset up to which the data region has been erased.
    pub(crate) erased_to: u64,
    /// Bytes waiting for a full program unit.
    pub(crate) pending: Vec<u8>,
}

impl FileHandle {
    pub(crate) fn new(name: impl Into<String>, start: u64, token: u64) -> Self {
        Self {
            name: name.into(),
            token,
            start,
            flushed: 0,
            erased_to: start,
            pending: Vec::new(),
        }
    }

    /// Name the file was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes accepted so far, including unflushed ones.
    pub fn len(&self) -> u64 {
        self.flushed + self.pending.len() as u64
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Operations the capture pipeline needs from a filesystem.
pub trait FileSystem: Send {
    /// Mounts an existing filesystem from the device.
    fn mount(&mut self, device: &mut dyn BlockDevice) -> Result<(), FsError>;

    /// Forgets the mounted state. Open handles become stale.
    fn unmount(&mut self);

    /// Returns true while mounted.
    fn is_mounted(&self) -> bool;

    /// Destroys all contents and writes an empty filesystem. Leaves it unmounted.
    fn reformat(&mut self, device: &mut dyn BlockDevice) -> Result<(), FsError>;

    /// Creates a new, empty file. A handle still open from an earlier
    /// create is abandoned: its data is never committed.
    fn create_file(
        &mut self,
        device: &mut dyn BlockDevice,
        name: &str,
    ) -> Result<FileHandle, FsError>;

    /// Appends `bytes` to an open file. Returns the number of bytes accepted.
    fn write(
        &mut self,
        device: &mut dyn BlockDevice,
        file: &mut FileHandle,
        bytes: &[u8],
    ) -> Result<usize, FsError>;

    /// Flushes buffered bytes and makes the file visible.
    fn close(&mut self, device: &mut dyn BlockDevice, file: FileHandle) -> Result<(), FsError>;

    /// Names of all committed files, in creation order.
    fn list_directory(&mut self, device: &mut dyn BlockDevice) -> Result<Vec<String>, FsError>;

    /// Reads a committed file in full.
    fn read_file(&mut self, device: &mut dyn BlockDevice, name: &str) -> Result<Vec<u8>, FsError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(FsError::NoSpace.code(), -28);
        assert_eq!(FsError::NotFound("x".into()).code(), -2);
        assert_eq!(
            FsError::Device(BlockDeviceError::NotInitialized).code(),
            -5
        );
    }

    #[test]
    fn test_handle_length_counts_pending() {
        let mut handle = FileHandle::new("jpeg_1.jpg", 8192, 1);
        assert!(handle.is_empty());
        handle.flushed = 16;
        handle.pending.extend_from_slice(&[1, 2, 3]);
        assert_eq!(handle.len(), 19);
    }
}
