//! Flash storage: block device, arbiter, filesystem and payload writer.
//!
//! # Layering
//!
//! ```text
//! StorageWriter ──► FileSystem ──┐
//!                                ├──► BlockDeviceArbiter ──► BlockDevice
//! UsbMassStorage ────────────────┘
//! ```
//!
//! Both clients reach the device only through a guard from the arbiter,
//! so at most one of them has device I/O in flight at any time.

mod arbiter;
mod block_device;
mod filesystem;
mod flatfs;
mod writer;

pub use arbiter::{ArbiterStats, ArbiterViolation, BlockDeviceArbiter, Client, DeviceGuard};
pub use block_device::{BlockDevice, BlockDeviceError, FaultInjector, Geometry, MemBlockDevice};
pub use filesystem::{FileHandle, FileSystem, FsError};
pub use flatfs::{FlatFileSystem, MAX_NAME_LEN};
pub use writer::{
    file_name, FsOperation, MountFailure, MountOutcome, StorageError, StorageFailure,
    StorageWriter, StoredFile,
};
