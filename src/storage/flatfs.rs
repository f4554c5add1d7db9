//! Flat append-only filesystem for NOR flash.
//!
//! # Device Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Directory region (directory_blocks erase blocks)         │  Offset: 0
//! │   slot 0: superblock                                     │
//! │     magic: [u8; 4] = b"FCFS" | version: u32 = 1          │
//! │     erase_size: u32 | directory_blocks: u32              │
//! │     data_start: u32 | size: u32 | reserved: [u8; 8]      │
//! │   slot 1..: file entries (32 bytes each)                 │
//! │     name: [u8; 20] (NUL padded) | offset: u32            │
//! │     length: u32 | reserved: u32                          │
//! │   free slots read as 0xFF                                │
//! ├──────────────────────────────────────────────────────────┤
//! │ Data region                                              │  Offset: data_start
//! │   each file starts on an erase-block boundary            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Integers are little-endian. A file becomes visible only when its
//! directory entry is written by `close`, so data from an interrupted
//! write is ignored and its blocks are erased again on reuse.

use super::block_device::{BlockDevice, Geometry};
use crate::capture::DeviceConfig;
use super::filesystem::{FileHandle, FileSystem, FsError};

/// Magic number for the superblock ("FCFS")
const MAGIC: [u8; 4] = *b"FCFS";

/// On-device format version
const VERSION: u32 = 1;

/// Size of the superblock and of each directory entry
const SLOT_SIZE: usize = 32;

/// Maximum file name length in bytes
pub const MAX_NAME_LEN: usize = 20;

#[derive(Debug, Clone)]
struct DirEntry {
    name: String,
    offset: u64,
    len: u64,
}

#[derive(Debug)]
struct Mounted {
    geometry: Geometry,
    data_start: u64,
    slots: usize,
    entries: Vec<DirEntry>,
    next_free: u64,
    open_token: Option<u64>,
}

/// Filesystem storing whole files contiguously in flash.
#[derive(Debug)]
pub struct FlatFileSystem {
    directory_blocks: u64,
    mounted: Option<Mounted>,
    next_token: u64,
}

impl FlatFileSystem {
    /// Creates an unmounted filesystem that formats with `directory_blocks`
    /// erase blocks of directory.
    pub fn new(directory_blocks: u64) -> Self {
        Self {
            directory_blocks: directory_blocks.max(1),
            mounted: None,
            next_token: 0,
        }
    }

    /// Number of files that fit in the directory, if mounted.
    pub fn capacity(&self) -> Option<usize> {
        self.mounted.as_ref().map(|m| m.slots - 1)
    }

    fn state(&mut self) -> Result<&mut Mounted, FsError> {
        self.mounted.as_mut().ok_or(FsError::NotMounted)
    }
}

impl Default for FlatFileSystem {
    fn default() -> Self {
        Self::new(4)
    }
}

impl From<&DeviceConfig> for FlatFileSystem {
    fn from(config: &DeviceConfig) -> Self {
        Self::new(config.directory_blocks)
    }
}

fn align_up(value: u64, unit: u64) -> u64 {
    value.div_ceil(unit) * unit
}

fn le_u32(bytes: &[u8], at: usize) -> u64 {
    u64::from(u32::from_le_bytes([
        bytes[at],
        bytes[at + 1],
        bytes[at + 2],
        bytes[at + 3],
    ]))
}

fn to_u32(value: u64) -> Result<[u8; 4], FsError> {
    u32::try_from(value)
        .map(u32::to_le_bytes)
        .map_err(|_| FsError::Geometry(format!("{value:#x} exceeds 32-bit layout")))
}

fn check_geometry(geometry: &Geometry, directory_blocks: u64) -> Result<u64, FsError> {
    let slot = SLOT_SIZE as u64;
    if slot % geometry.program_size != 0 || slot % geometry.read_size != 0 {
        return Err(FsError::Geometry(format!(
            "program size {} / read size {} must divide {SLOT_SIZE}",
            geometry.program_size, geometry.read_size
        )));
    }
    if geometry.erase_size % geometry.read_size != 0 {
        return Err(FsError::Geometry("read size must divide erase size".into()));
    }
    let data_start = directory_blocks * geometry.erase_size;
    if data_start >= geometry.size {
        return Err(FsError::Geometry(format!(
            "directory of {directory_blocks} blocks leaves no data region"
        )));
    }
    to_u32(geometry.size)?;
    Ok(data_start)
}

fn validate_name(name: &str) -> Result<(), FsError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b'/' && b != b'\\');
    if valid {
        Ok(())
    } else {
        Err(FsError::InvalidName(name.to_string()))
    }
}

fn encode_superblock(geometry: &Geometry, directory_blocks: u64) -> Result<[u8; SLOT_SIZE], FsError> {
    let mut slot = [0u8; SLOT_SIZE];
    slot[0..4].copy_from_slice(&MAGIC);
    slot[4..8].copy_from_slice(&VERSION.to_le_bytes());
    slot[8..12].copy_from_slice(&to_u32(geometry.erase_size)?);
    slot[12..16].copy_from_slice(&to_u32(directory_blocks)?);
    slot[16..20].copy_from_slice(&to_u32(directory_blocks * geometry.erase_size)?);
    slot[20..24].copy_from_slice(&to_u32(geometry.size)?);
    Ok(slot)
}

fn encode_entry(entry: &DirEntry) -> Result<[u8; SLOT_SIZE], FsError> {
    let mut slot = [0u8; SLOT_SIZE];
    slot[..entry.name.len()].copy_from_slice(entry.name.as_bytes());
    slot[20..24].copy_from_slice(&to_u32(entry.offset)?);
    slot[24..28].copy_from_slice(&to_u32(entry.len)?);
    Ok(slot)
}

/// Reads and validates the superblock. Returns (directory_blocks, data_start).
fn read_superblock(device: &mut dyn BlockDevice) -> Result<(u64, u64), FsError> {
    let geometry = device.geometry();
    let mut slot = [0u8; SLOT_SIZE];
    device.read(0, &mut slot)?;

    if slot[0..4] != MAGIC {
        return Err(FsError::NoFilesystem);
    }
    let version = le_u32(&slot, 4);
    if version != u64::from(VERSION) {
        return Err(FsError::Corrupt(format!("unsupported version {version}")));
    }
    if le_u32(&slot, 8) != geometry.erase_size || le_u32(&slot, 20) != geometry.size {
        return Err(FsError::Corrupt("geometry differs from device".into()));
    }
    let directory_blocks = le_u32(&slot, 12);
    let data_start = le_u32(&slot, 16);
    if data_start != check_geometry(&geometry, directory_blocks)? {
        return Err(FsError::Corrupt(format!("bad data start {data_start:#x}")));
    }
    Ok((directory_blocks, data_start))
}

fn read_entries(device: &mut dyn BlockDevice, data_start: u64) -> Result<Vec<DirEntry>, FsError> {
    let size = device.size();
    let mut directory = vec![0u8; data_start as usize];
    device.read(0, &mut directory)?;

    let mut entries = Vec::new();
    for slot in directory.chunks_exact(SLOT_SIZE).skip(1) {
        if slot[0] == 0xFF {
            break;
        }
        let name_len = slot[..MAX_NAME_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_NAME_LEN);
        let name = std::str::from_utf8(&slot[..name_len])
            .map_err(|_| FsError::Corrupt("non-UTF-8 file name".into()))?
            .to_string();
        let offset = le_u32(slot, 20);
        let len = le_u32(slot, 24);
        if offset < data_start || offset + len > size {
            return Err(FsError::Corrupt(format!(
                "entry {name:?} spans {offset:#x}+{len} outside data region"
            )));
        }
        entries.push(DirEntry { name, offset, len });
    }
    Ok(entries)
}

/// Erases whole blocks until the file's erased region reaches `end`.
fn ensure_erased(
    device: &mut dyn BlockDevice,
    file: &mut FileHandle,
    end: u64,
    erase_size: u64,
) -> Result<(), FsError> {
    while file.erased_to < end {
        device.erase(file.erased_to, erase_size)?;
        file.erased_to += erase_size;
    }
    Ok(())
}

impl FileSystem for FlatFileSystem {
    fn mount(&mut self, device: &mut dyn BlockDevice) -> Result<(), FsError> {
        let geometry = device.geometry();
        let (directory_blocks, data_start) = read_superblock(device)?;
        let entries = read_entries(device, data_start)?;

        let next_free = entries
            .iter()
            .map(|e| align_up(e.offset + e.len, geometry.erase_size))
            .fold(data_start, u64::max);

        tracing::info!(
            files = entries.len(),
            directory_blocks,
            free_bytes = geometry.size - next_free,
            "Filesystem mounted"
        );

        self.mounted = Some(Mounted {
            geometry,
            data_start,
            slots: data_start as usize / SLOT_SIZE,
            entries,
            next_free,
            open_token: None,
        });
        Ok(())
    }

    fn unmount(&mut self) {
        if self.mounted.take().is_some() {
            tracing::debug!("Filesystem unmounted");
        }
    }

    fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    fn reformat(&mut self, device: &mut dyn BlockDevice) -> Result<(), FsError> {
        let geometry = device.geometry();
        check_geometry(&geometry, self.directory_blocks)?;
        self.mounted = None;

        device.erase(0, geometry.size)?;
        device.write(0, &encode_superblock(&geometry, self.directory_blocks)?)?;

        tracing::info!(
            size = geometry.size,
            directory_blocks = self.directory_blocks,
            "Filesystem formatted"
        );
        Ok(())
    }

    fn create_file(
        &mut self,
        _device: &mut dyn BlockDevice,
        name: &str,
    ) -> Result<FileHandle, FsError> {
        validate_name(name)?;
        self.next_token += 1;
        let token = self.next_token;
        let state = self.state()?;

        if state.entries.iter().any(|e| e.name == name) {
            return Err(FsError::Exists(name.to_string()));
        }
        if state.entries.len() + 1 >= state.slots || state.next_free >= state.geometry.size {
            return Err(FsError::NoSpace);
        }
        if state.open_token.replace(token).is_some() {
            tracing::warn!("Abandoning uncommitted file");
        }
        Ok(FileHandle::new(name, state.next_free, token))
    }

    fn write(
        &mut self,
        device: &mut dyn BlockDevice,
        file: &mut FileHandle,
        bytes: &[u8],
    ) -> Result<usize, FsError> {
        let state = self.state()?;
        if state.open_token != Some(file.token) || file.start != state.next_free {
            return Err(FsError::BadHandle);
        }
        if file.start + file.len() + bytes.len() as u64 > state.geometry.size {
            return Err(FsError::NoSpace);
        }

        file.pending.extend_from_slice(bytes);
        let unit = state.geometry.program_size as usize;
        let ready = file.pending.len() / unit * unit;
        if ready > 0 {
            let at = file.start + file.flushed;
            ensure_erased(device, file, at + ready as u64, state.geometry.erase_size)?;
            device.write(at, &file.pending[..ready])?;
            file.flushed += ready as u64;
            file.pending.drain(..ready);
        }
        Ok(bytes.len())
    }

    fn close(&mut self, device: &mut dyn BlockDevice, mut file: FileHandle) -> Result<(), FsError> {
        let state = self.state()?;
        if state.open_token != Some(file.token) || file.start != state.next_free {
            return Err(FsError::BadHandle);
        }

        let len = file.len();
        if !file.pending.is_empty() {
            let at = file.start + file.flushed;
            let padded = align_up(file.pending.len() as u64, state.geometry.program_size) as usize;
            file.pending.resize(padded, 0xFF);
            ensure_erased(device, &mut file, at + padded as u64, state.geometry.erase_size)?;
            device.write(at, &file.pending)?;
        }

        let entry = DirEntry {
            name: file.name,
            offset: file.start,
            len,
        };
        let slot = (state.entries.len() + 1) * SLOT_SIZE;
        device.write(slot as u64, &encode_entry(&entry)?)?;

        tracing::debug!(name = %entry.name, offset = entry.offset, len, "File committed");
        state.next_free = align_up(entry.offset + len, state.geometry.erase_size);
        state.entries.push(entry);
        state.open_token = None;
        Ok(())
    }

    fn list_directory(&mut self, device: &mut dyn BlockDevice) -> Result<Vec<String>, FsError> {
        let data_start = self.state()?.data_start;
        Ok(read_entries(device, data_start)?
            .into_iter()
            .map(|e| e.name)
            .collect())
    }

    fn read_file(&mut self, device: &mut dyn BlockDevice, name: &str) -> Result<Vec<u8>, FsError> {
        let data_start = self.state()?.data_start;
        let entry = read_entries(device, data_start)?
            .into_iter()
            .find(|e| e.name == name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;

        let mut data = vec![0u8; align_up(entry.len, device.read_size()) as usize];
        device.read(entry.offset, &mut data)?;
        data.truncate(entry.len as usize);
        Ok(data)
    }
}
