//! Raw-sector export of the shared block device.

use super::host::{HostPort, HostRequest, HostResponse};
use super::UsbError;
use crate::storage::{BlockDevice, BlockDeviceArbiter, Client, Geometry};
use std::sync::Arc;

/// Request counters for the export path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsbStats {
    pub reads: u64,
    pub writes: u64,
    pub sectors_read: u64,
    pub sectors_written: u64,
    pub errors: u64,
}

impl UsbStats {
    /// Requests served, successful or not.
    pub fn requests(&self) -> u64 {
        self.reads + self.writes + self.errors
    }
}

struct Export<D> {
    arbiter: Arc<BlockDeviceArbiter<D>>,
    geometry: Geometry,
    sector_count: u64,
}

/// Presents the block device to a host as fixed-size sectors.
///
/// Each host request is served under one arbiter acquisition. Writes are
/// applied as read-modify-erase-program of every erase block they touch.
pub struct UsbMassStorage<D, H> {
    host: H,
    sector_size: u64,
    export: Option<Export<D>>,
    stats: UsbStats,
}

impl<D: BlockDevice, H: HostPort> UsbMassStorage<D, H> {
    pub fn new(host: H, sector_size: u64) -> Self {
        Self {
            host,
            sector_size,
            export: None,
            stats: UsbStats::default(),
        }
    }

    /// Exposes the device to the host. Returns the number of sectors.
    pub fn export(&mut self, arbiter: Arc<BlockDeviceArbiter<D>>) -> Result<u64, UsbError> {
        let geometry = arbiter.acquire(Client::UsbExport)?.geometry();
        let sector = self.sector_size;
        if sector == 0
            || sector % geometry.read_size != 0
            || sector % geometry.program_size != 0
            || geometry.erase_size % sector != 0
        {
            return Err(UsbError::SectorSize {
                sector_size: sector,
                erase_size: geometry.erase_size,
            });
        }

        let sector_count = geometry.size / sector;
        self.host.attach(sector, sector_count);
        tracing::info!(sector_size = sector, sector_count, "USB mass storage exported");

        self.export = Some(Export {
            arbiter,
            geometry,
            sector_count,
        });
        Ok(sector_count)
    }

    /// Serves at most one pending host request.
    ///
    /// Returns `Ok(true)` if a request was served. Device and range errors
    /// are completed back to the host; only arbiter violations are returned.
    pub fn process(&mut self) -> Result<bool, UsbError> {
        let Some(export) = &self.export else {
            return Err(UsbError::NotExported);
        };
        let Some(request) = self.host.poll() else {
            return Ok(false);
        };

        let result = serve(export, self.sector_size, &request);
        match &result {
            Ok(HostResponse::Data { data, .. }) => {
                self.stats.reads += 1;
                self.stats.sectors_read += data.len() as u64 / self.sector_size;
            }
            Ok(HostResponse::Written { count, .. }) => {
                self.stats.writes += 1;
                self.stats.sectors_written += u64::from(*count);
            }
            Err(UsbError::Arbiter(violation)) => return Err(violation.clone().into()),
            Err(error) => {
                self.stats.errors += 1;
                tracing::warn!(lba = request.lba(), %error, "Host request failed");
            }
        }
        self.host.complete(result);
        Ok(true)
    }

    /// Returns true once [`export`](Self::export) has succeeded.
    pub fn is_exported(&self) -> bool {
        self.export.is_some()
    }

    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }

    pub fn stats(&self) -> UsbStats {
        self.stats
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }
}

fn serve<D: BlockDevice>(
    export: &Export<D>,
    sector_size: u64,
    request: &HostRequest,
) -> Result<HostResponse, UsbError> {
    match request {
        HostRequest::Read { lba, count } => {
            let offset = sector_range(export, *lba, u64::from(*count), sector_size)?;
            let mut data = vec![0u8; (u64::from(*count) * sector_size) as usize];
            let mut device = export.arbiter.acquire(Client::UsbExport)?;
            device.read(offset, &mut data)?;
            Ok(HostResponse::Data { lba: *lba, data })
        }
        HostRequest::Write { lba, data } => {
            let len = data.len() as u64;
            if len == 0 || len % sector_size != 0 {
                return Err(UsbError::PartialSector { len, sector_size });
            }
            let count = len / sector_size;
            let offset = sector_range(export, *lba, count, sector_size)?;
            let mut device = export.arbiter.acquire(Client::UsbExport)?;
            read_modify_write(&mut *device, &export.geometry, offset, data)?;
            Ok(HostResponse::Written {
                lba: *lba,
                count: count as u32,
            })
        }
    }
}

fn sector_range<D>(
    export: &Export<D>,
    lba: u64,
    count: u64,
    sector_size: u64,
) -> Result<u64, UsbError> {
    match lba.checked_add(count) {
        Some(end) if count > 0 && end <= export.sector_count => Ok(lba * sector_size),
        _ => Err(UsbError::OutOfRange {
            lba,
            count,
            sector_count: export.sector_count,
        }),
    }
}

/// Rewrites `data` at `offset`, preserving the rest of each erase block.
fn read_modify_write(
    device: &mut dyn BlockDevice,
    geometry: &Geometry,
    offset: u64,
    data: &[u8],
) -> Result<(), UsbError> {
    let erase = geometry.erase_size;
    let end = offset + data.len() as u64;
    let mut block_start = offset / erase * erase;
    let mut block = vec![0u8; erase as usize];

    while block_start < end {
        device.read(block_start, &mut block)?;

        let from = offset.max(block_start);
        let to = end.min(block_start + erase);
        let dst = (from - block_start) as usize..(to - block_start) as usize;
        let src = (from - offset) as usize..(to - offset) as usize;
        if block[dst.clone()] != data[src.clone()] {
            block[dst].copy_from_slice(&data[src]);
            device.erase(block_start, erase)?;
            device.write(block_start, &block)?;
        }
        block_start += erase;
    }
    Ok(())
}
