//! Raw block device interface and an in-memory flash implementation.

use crate::capture::DeviceConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by block device operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockDeviceError {
    #[error("block device not initialized")]
    NotInitialized,
    #[error("access of {len} bytes at {offset:#x} exceeds device bounds")]
    OutOfBounds { offset: u64, len: u64 },
    #[error("access of {len} bytes at {offset:#x} not aligned to {unit}")]
    Misaligned { offset: u64, len: u64, unit: u64 },
    #[error("{op} failed at {offset:#x}")]
    Io { op: &'static str, offset: u64 },
}

/// Size and access units of a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub size: u64,
    pub read_size: u64,
    pub program_size: u64,
    pub erase_size: u64,
}

impl From<&DeviceConfig> for Geometry {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            size: config.size,
            read_size: config.read_size,
            program_size: config.program_size,
            erase_size: config.erase_size,
        }
    }
}

/// A flash region addressed in bytes and erased in blocks.
///
/// Erased bytes read as 0xFF. Writes can only clear bits, so a region
/// must be erased before it is rewritten. Offsets and lengths must be
/// multiples of the corresponding access unit.
pub trait BlockDevice: Send {
    /// Prepares the device for use.
    fn init(&mut self) -> Result<(), BlockDeviceError>;

    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Minimum read unit in bytes.
    fn read_size(&self) -> u64;

    /// Minimum write unit in bytes.
    fn program_size(&self) -> u64;

    /// Erase block size in bytes.
    fn erase_size(&self) -> u64;

    /// Reads `buf.len()` bytes starting at `offset`.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), BlockDeviceError>;

    /// Writes `data` starting at `offset`.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), BlockDeviceError>;

    /// Erases `len` bytes starting at `offset`.
    fn erase(&mut self, offset: u64, len: u64) -> Result<(), BlockDeviceError>;

    /// Returns all size parameters at once.
    fn geometry(&self) -> Geometry {
        Geometry {
            size: self.size(),
            read_size: self.read_size(),
            program_size: self.program_size(),
            erase_size: self.erase_size(),
        }
    }
}

/// Shared switch for making upcoming device operations fail.
///
/// Clones control the same device, so a test can keep one after the
/// device has been moved behind the arbiter.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    reads: Arc<AtomicU32>,
    writes: Arc<AtomicU32>,
    erases: Arc<AtomicU32>,
}

impl FaultInjector {
    /// Fails the next `n` reads.
    pub fn fail_reads(&self, n: u32) {
        self.reads.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` writes.
    pub fn fail_writes(&self, n: u32) {
        self.writes.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` erases.
    pub fn fail_erases(&self, n: u32) {
        self.erases.store(n, Ordering::SeqCst);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-memory NOR flash.
///
/// Simulates flash semantics for tests and the simulator:
/// - Erased state is 0xFF and writes AND into the existing contents
/// - Alignment is enforced for every access unit
/// - Erase counts are tracked per block
/// - Faults can be injected through a [`FaultInjector`]
///
/// # Example
///
/// ```
/// use flash_capture::storage::{BlockDevice, Geometry, MemBlockDevice};
///
/// let mut flash = MemBlockDevice::new(Geometry {
///     size: 8192,
///     read_size: 1,
///     program_size: 8,
///     erase_size: 2048,
/// });
/// flash.init().unwrap();
///
/// flash.erase(2048, 2048).unwrap();
/// flash.write(2048, b"JPEGDATA").unwrap();
///
/// let mut buf = [0u8; 8];
/// flash.read(2048, &mut buf).unwrap();
/// assert_eq!(&buf, b"JPEGDATA");
/// assert_eq!(flash.erase_count(2048), 1);
/// ```
#[derive(Debug)]
pub struct MemBlockDevice {
    storage: Vec<u8>,
    geometry: Geometry,
    erase_counts: Vec<u32>,
    initialized: bool,
    faults: FaultInjector,
}

impl MemBlockDevice {
    /// Creates a fully erased device.
    pub fn new(geometry: Geometry) -> Self {
        let blocks = (geometry.size / geometry.erase_size.max(1)) as usize;
        Self {
            storage: vec![0xFF; geometry.size as usize],
            geometry,
            erase_counts: vec![0; blocks],
            initialized: false,
            faults: FaultInjector::default(),
        }
    }

    /// Returns a handle for injecting faults into this device.
    pub fn fault_injector(&self) -> FaultInjector {
        self.faults.clone()
    }

    /// Returns how many times the block containing `offset` has been erased.
    pub fn erase_count(&self, offset: u64) -> u32 {
        let block = (offset / self.geometry.erase_size) as usize;
        self.erase_counts.get(block).copied().unwrap_or(0)
    }

    /// Returns a copy of device contents, bypassing alignment checks.
    pub fn contents(&self, offset: u64, len: usize) -> Vec<u8> {
        let start = offset as usize;
        self.storage[start..start + len].to_vec()
    }

    fn check(&self, offset: u64, len: u64, unit: u64) -> Result<(), BlockDeviceError> {
        if !self.initialized {
            return Err(BlockDeviceError::NotInitialized);
        }
        let end = offset
            .checked_add(len)
            .ok_or(BlockDeviceError::OutOfBounds { offset, len })?;
        if end > self.geometry.size {
            return Err(BlockDeviceError::OutOfBounds { offset, len });
        }
        if offset % unit != 0 || len % unit != 0 {
            return Err(BlockDeviceError::Misaligned { offset, len, unit });
        }
        Ok(())
    }
}

impl BlockDevice for MemBlockDevice {
    fn init(&mut self) -> Result<(), BlockDeviceError> {
        self.initialized = true;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.geometry.size
    }

    fn read_size(&self) -> u64 {
        self.geometry.read_size
    }

    fn program_size(&self) -> u64 {
        self.geometry.program_size
    }

    fn erase_size(&self) -> u64 {
        self.geometry.erase_size
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), BlockDeviceError> {
        self.check(offset, buf.len() as u64, self.geometry.read_size)?;
        if FaultInjector::take(&self.faults.reads) {
            return Err(BlockDeviceError::Io { op: "read", offset });
        }
        let start = offset as usize;
        buf.copy_from_slice(&self.storage[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), BlockDeviceError> {
        self.check(offset, data.len() as u64, self.geometry.program_size)?;
        if FaultInjector::take(&self.faults.writes) {
            return Err(BlockDeviceError::Io { op: "write", offset });
        }
        let start = offset as usize;
        for (cell, &byte) in self.storage[start..start + data.len()].iter_mut().zip(data) {
            *cell &= byte;
        }
        Ok(())
    }

    fn erase(&mut self, offset: u64, len: u64) -> Result<(), BlockDeviceError> {
        self.check(offset, len, self.geometry.erase_size)?;
        if FaultInjector::take(&self.faults.erases) {
            return Err(BlockDeviceError::Io { op: "erase", offset });
        }
        let start = offset as usize;
        self.storage[start..start + len as usize].fill(0xFF);

        let first = (offset / self.geometry.erase_size) as usize;
        let count = (len / self.geometry.erase_size) as usize;
        for block in &mut self.erase_counts[first..first + count] {
            *block += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> MemBlockDevice {
        let mut device = MemBlockDevice::new(Geometry {
            size: 8192,
            read_size: 1,
            program_size: 8,
            erase_size: 2048,
        });
        device.init().unwrap();
        device
    }

    #[test]
    fn test_requires_init() {
        let mut device = MemBlockDevice::new(Geometry {
            size: 4096,
            read_size: 1,
            program_size: 8,
            erase_size: 2048,
        });
        let mut buf = [0u8; 4];
        assert_eq!(
            device.read(0, &mut buf),
            Err(BlockDeviceError::NotInitialized)
        );
    }

    #[test]
    fn test_write_clears_bits_only() {
        let mut device = small();
        device.write(0, &[0x0F; 8]).unwrap();
        device.write(0, &[0xF3; 8]).unwrap();
        assert_eq!(device.contents(0, 8), vec![0x03; 8]);

        device.erase(0, 2048).unwrap();
        assert_eq!(device.contents(0, 8), vec![0xFF; 8]);
    }

    #[test]
    fn test_alignment_enforced() {
        let mut device = small();
        assert!(matches!(
            device.write(4, &[0; 8]),
            Err(BlockDeviceError::Misaligned { unit: 8, .. })
        ));
        assert!(matches!(
            device.erase(0, 1024),
            Err(BlockDeviceError::Misaligned { unit: 2048, .. })
        ));
        assert!(matches!(
            device.erase(8192, 2048),
            Err(BlockDeviceError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_erase_counts() {
        let mut device = small();
        device.erase(0, 8192).unwrap();
        device.erase(2048, 2048).unwrap();
        assert_eq!(device.erase_count(0), 1);
        assert_eq!(device.erase_count(2048), 2);
        assert_eq!(device.erase_count(4096), 1);
    }

    #[test]
    fn test_injected_faults_are_consumed() {
        let mut device = small();
        let faults = device.fault_injector();
        faults.fail_writes(1);

        assert!(matches!(
            device.write(0, &[0; 8]),
            Err(BlockDeviceError::Io { op: "write", .. })
        ));
        assert!(device.write(0, &[0; 8]).is_ok());
    }
}
