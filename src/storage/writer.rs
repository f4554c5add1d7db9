//! Persists extracted payloads as files.

use super::arbiter::{ArbiterViolation, BlockDeviceArbiter, Client};
use super::block_device::BlockDevice;
use super::filesystem::{FileSystem, FsError};
use crate::capture::RawFrameBuffer;
use crate::extraction::ExtractedPayload;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Filesystem call that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOperation {
    Mount,
    Reformat,
    Create,
    Write,
    Close,
    List,
    Read,
}

impl fmt::Display for FsOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsOperation::Mount => "mount",
            FsOperation::Reformat => "reformat",
            FsOperation::Create => "create",
            FsOperation::Write => "write",
            FsOperation::Close => "close",
            FsOperation::List => "list",
            FsOperation::Read => "read",
        };
        f.write_str(name)
    }
}

/// A filesystem error tagged with the operation that raised it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{op} failed ({code}): {source}", code = .source.code())]
pub struct StorageFailure {
    pub op: FsOperation,
    pub source: FsError,
}

impl StorageFailure {
    pub fn new(op: FsOperation, source: FsError) -> Self {
        Self { op, source }
    }

    /// Underlying negative error code.
    pub fn code(&self) -> i32 {
        self.source.code()
    }
}

/// Errors from [`StorageWriter`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error(transparent)]
    Failure(#[from] StorageFailure),
    #[error(transparent)]
    Arbiter(#[from] ArbiterViolation),
}

/// Startup mount could not produce a usable filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MountFailure {
    #[error(transparent)]
    Arbiter(#[from] ArbiterViolation),
    #[error("mount failed ({}) and reformat failed ({})", .mount_error.code(), .reformat_error.code())]
    ReformatFailed {
        mount_error: FsError,
        reformat_error: FsError,
    },
    #[error("mount after reformat failed ({}): {0}", .0.code())]
    RemountFailed(FsError),
}

/// How the filesystem came to be mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    /// An existing filesystem was mounted.
    Mounted,
    /// Mount failed; the device was reformatted and mounted empty.
    Reformatted,
}

/// A file written by [`StorageWriter::persist`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub name: String,
    pub path: String,
    pub bytes: usize,
    pub digest: blake3::Hash,
}

/// Deterministic file name for a capture sequence number.
pub fn file_name(sequence: u32) -> String {
    format!("jpeg_{sequence}.jpg")
}

/// Writes payloads through the filesystem, holding the device only while
/// each operation runs.
pub struct StorageWriter<F, D> {
    fs: F,
    arbiter: Arc<BlockDeviceArbiter<D>>,
    mount_point: String,
}

impl<F: FileSystem, D: BlockDevice> StorageWriter<F, D> {
    pub fn new(fs: F, arbiter: Arc<BlockDeviceArbiter<D>>, mount_point: impl Into<String>) -> Self {
        Self {
            fs,
            arbiter,
            mount_point: mount_point.into(),
        }
    }

    /// Mounts the filesystem, reformatting once if the first mount fails.
    pub fn mount_or_reformat(&mut self) -> Result<MountOutcome, MountFailure> {
        let mut device = self.arbiter.acquire(Client::FileSystem)?;

        let mount_error = match self.fs.mount(&mut *device) {
            Ok(()) => return Ok(MountOutcome::Mounted),
            Err(e) => e,
        };
        tracing::warn!(code = mount_error.code(), error = %mount_error, "Mount failed, reformatting");

        if let Err(reformat_error) = self.fs.reformat(&mut *device) {
            return Err(MountFailure::ReformatFailed {
                mount_error,
                reformat_error,
            });
        }
        self.fs
            .mount(&mut *device)
            .map_err(MountFailure::RemountFailed)?;
        Ok(MountOutcome::Reformatted)
    }

    /// Writes the payload bytes from `frame` to `jpeg_<sequence>.jpg`.
    ///
    /// The device is held from create through close. If create succeeds
    /// and a later step fails, the partial file is abandoned uncommitted.
    pub fn persist(
        &mut self,
        frame: &RawFrameBuffer,
        payload: &ExtractedPayload,
        sequence: u32,
    ) -> Result<StoredFile, StorageError> {
        let bytes = payload.bytes(frame).ok_or_else(|| {
            StorageFailure::new(
                FsOperation::Write,
                FsError::InvalidArgument(format!(
                    "payload {:?} outside {}-byte frame",
                    payload.range(),
                    frame.capacity()
                )),
            )
        })?;
        let name = file_name(sequence);

        let mut device = self.arbiter.acquire(Client::FileSystem)?;
        let mut file = self
            .fs
            .create_file(&mut *device, &name)
            .map_err(|e| StorageFailure::new(FsOperation::Create, e))?;

        let written = self
            .fs
            .write(&mut *device, &mut file, bytes)
            .map_err(|e| StorageFailure::new(FsOperation::Write, e))?;
        if written != bytes.len() {
            return Err(StorageFailure::new(
                FsOperation::Write,
                FsError::ShortWrite {
                    expected: bytes.len(),
                    written,
                },
            )
            .into());
        }

        self.fs
            .close(&mut *device, file)
            .map_err(|e| StorageFailure::new(FsOperation::Close, e))?;
        drop(device);

        Ok(StoredFile {
            path: self.path_for(&name),
            name,
            bytes: written,
            digest: blake3::hash(bytes),
        })
    }

    /// Names of all stored files.
    pub fn list_directory(&mut self) -> Result<Vec<String>, StorageError> {
        let mut device = self.arbiter.acquire(Client::FileSystem)?;
        Ok(self
            .fs
            .list_directory(&mut *device)
            .map_err(|e| StorageFailure::new(FsOperation::List, e))?)
    }

    /// Reads back a stored file.
    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>, StorageError> {
        let mut device = self.arbiter.acquire(Client::FileSystem)?;
        Ok(self
            .fs
            .read_file(&mut *device, name)
            .map_err(|e| StorageFailure::new(FsOperation::Read, e))?)
    }

    /// Absolute path of `name` under the mount point.
    pub fn path_for(&self, name: &str) -> String {
        format!("/{}/{}", self.mount_point, name)
    }

    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    pub fn is_mounted(&self) -> bool {
        self.fs.is_mounted()
    }

    /// The shared device arbiter.
    pub fn arbiter(&self) -> &Arc<BlockDeviceArbiter<D>> {
        &self.arbiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::extract_payload;
    use crate::storage::{FlatFileSystem, Geometry, MemBlockDevice};

    fn arbiter() -> Arc<BlockDeviceArbiter<MemBlockDevice>> {
        let mut device = MemBlockDevice::new(Geometry {
            size: 0x70000,
            read_size: 1,
            program_size: 8,
            erase_size: 2048,
        });
        device.init().unwrap();
        Arc::new(BlockDeviceArbiter::new(device))
    }

    fn reference_frame() -> RawFrameBuffer {
        let mut data = vec![0x00, 0xFF, 0xD8, 0xFF];
        data.extend(0x10..0x1A);
        data.extend([0xFF, 0xD9]);
        data.resize(256, 0x00);
        RawFrameBuffer::from_bytes(&data)
    }

    /// Filesystem double recording calls and failing mounts on demand.
    #[derive(Default)]
    struct ScriptedFs {
        inner: FlatFileSystem,
        failing_mounts: u32,
        failing_reformats: u32,
        reformats: u32,
    }

    impl FileSystem for ScriptedFs {
        fn mount(&mut self, device: &mut dyn BlockDevice) -> Result<(), FsError> {
            if self.failing_mounts > 0 {
                self.failing_mounts -= 1;
                return Err(FsError::Corrupt("scripted".into()));
            }
            self.inner.mount(device)
        }
        fn unmount(&mut self) {
            self.inner.unmount()
        }
        fn is_mounted(&self) -> bool {
            self.inner.is_mounted()
        }
        fn reformat(&mut self, device: &mut dyn BlockDevice) -> Result<(), FsError> {
            self.reformats += 1;
            if self.failing_reformats > 0 {
                self.failing_reformats -= 1;
                return Err(FsError::Device(crate::storage::BlockDeviceError::Io {
                    op: "erase",
                    offset: 0,
                }));
            }
            self.inner.reformat(device)
        }
        fn create_file(
            &mut self,
            device: &mut dyn BlockDevice,
            name: &str,
        ) -> Result<crate::storage::FileHandle, FsError> {
            self.inner.create_file(device, name)
        }
        fn write(
            &mut self,
            device: &mut dyn BlockDevice,
            file: &mut crate::storage::FileHandle,
            bytes: &[u8],
        ) -> Result<usize, FsError> {
            // Accept one byte less than asked.
            let n = bytes.len().saturating_sub(1);
            self.inner.write(device, file, &bytes[..n])
        }
        fn close(
            &mut self,
            device: &mut dyn BlockDevice,
            file: crate::storage::FileHandle,
        ) -> Result<(), FsError> {
            self.inner.close(device, file)
        }
        fn list_directory(&mut self, device: &mut dyn BlockDevice) -> Result<Vec<String>, FsError> {
            self.inner.list_directory(device)
        }
        fn read_file(&mut self, device: &mut dyn BlockDevice, name: &str) -> Result<Vec<u8>, FsError> {
            self.inner.read_file(device, name)
        }
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name(3), "jpeg_3.jpg");
        assert_eq!(file_name(u32::MAX), "jpeg_4294967295.jpg");
    }

    #[test]
    fn test_reference_payload_persisted() {
        let mut writer = StorageWriter::new(FlatFileSystem::default(), arbiter(), "fs");
        assert_eq!(writer.mount_or_reformat().unwrap(), MountOutcome::Reformatted);

        let frame = reference_frame();
        let payload = extract_payload(frame.as_slice()).unwrap();
        assert_eq!((payload.offset(), payload.len()), (1, 15));

        let stored = writer.persist(&frame, &payload, 3).unwrap();
        assert_eq!(stored.name, "jpeg_3.jpg");
        assert_eq!(stored.path, "/fs/jpeg_3.jpg");
        assert_eq!(stored.bytes, 15);
        assert_eq!(stored.digest, blake3::hash(&frame.as_slice()[1..16]));

        assert_eq!(writer.list_directory().unwrap(), vec!["jpeg_3.jpg"]);
        assert_eq!(writer.read_file("jpeg_3.jpg").unwrap(), &frame.as_slice()[1..16]);
        assert_eq!(writer.arbiter().holder(), None);
    }

    #[test]
    fn test_failed_mount_reformats_once() {
        let fs = ScriptedFs {
            failing_mounts: 1,
            ..Default::default()
        };
        let mut writer = StorageWriter::new(fs, arbiter(), "fs");

        assert_eq!(writer.mount_or_reformat().unwrap(), MountOutcome::Reformatted);
        assert_eq!(writer.fs.reformats, 1);
        assert!(writer.list_directory().unwrap().is_empty());
    }

    #[test]
    fn test_existing_filesystem_is_kept() {
        let arbiter = arbiter();
        let frame = reference_frame();
        let payload = extract_payload(frame.as_slice()).unwrap();

        let mut first = StorageWriter::new(FlatFileSystem::default(), Arc::clone(&arbiter), "fs");
        first.mount_or_reformat().unwrap();
        first.persist(&frame, &payload, 1).unwrap();

        let mut second = StorageWriter::new(FlatFileSystem::default(), arbiter, "fs");
        assert_eq!(second.mount_or_reformat().unwrap(), MountOutcome::Mounted);
        assert_eq!(second.list_directory().unwrap(), vec!["jpeg_1.jpg"]);
    }

    #[test]
    fn test_reformat_failure_is_reported() {
        let fs = ScriptedFs {
            failing_mounts: 1,
            failing_reformats: 1,
            ..Default::default()
        };
        let mut writer = StorageWriter::new(fs, arbiter(), "fs");
        assert!(matches!(
            writer.mount_or_reformat(),
            Err(MountFailure::ReformatFailed { .. })
        ));
        assert_eq!(writer.fs.reformats, 1);
    }

    #[test]
    fn test_write_fault_reports_io_code() {
        let arbiter = arbiter();
        let faults = arbiter.acquire(Client::UsbExport).unwrap().fault_injector();
        let mut writer = StorageWriter::new(FlatFileSystem::default(), arbiter, "fs");
        writer.mount_or_reformat().unwrap();

        let frame = reference_frame();
        let payload = extract_payload(frame.as_slice()).unwrap();
        faults.fail_writes(1);

        let err = writer.persist(&frame, &payload, 1).unwrap_err();
        match err {
            StorageError::Failure(failure) => {
                assert_eq!(failure.op, FsOperation::Write);
                assert_eq!(failure.code(), -5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(writer.list_directory().unwrap().is_empty());

        // The next attempt succeeds under a fresh name.
        writer.persist(&frame, &payload, 2).unwrap();
        assert_eq!(writer.list_directory().unwrap(), vec!["jpeg_2.jpg"]);
    }

    #[test]
    fn test_short_write_is_failure() {
        let mut writer = StorageWriter::new(ScriptedFs::default(), arbiter(), "fs");
        writer.mount_or_reformat().unwrap();

        let frame = reference_frame();
        let payload = extract_payload(frame.as_slice()).unwrap();
        let err = writer.persist(&frame, &payload, 1).unwrap_err();
        assert_eq!(
            err,
            StorageError::Failure(StorageFailure::new(
                FsOperation::Write,
                FsError::ShortWrite {
                    expected: 15,
                    written: 14
                }
            ))
        );
        assert!(writer.list_directory().unwrap().is_empty());
    }

    #[test]
    fn test_persist_unmounted_fails_create() {
        let mut writer = StorageWriter::new(FlatFileSystem::default(), arbiter(), "fs");
        let frame = reference_frame();
        let payload = extract_payload(frame.as_slice()).unwrap();

        let err = writer.persist(&frame, &payload, 1).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Failure(StorageFailure {
                op: FsOperation::Create,
                source: FsError::NotMounted
            })
        ));
    }

    #[test]
    fn test_persist_while_held_is_violation() {
        let mut writer = StorageWriter::new(FlatFileSystem::default(), arbiter(), "fs");
        writer.mount_or_reformat().unwrap();
        let arbiter = Arc::clone(writer.arbiter());
        let _held = arbiter.acquire(Client::UsbExport).unwrap();

        let frame = reference_frame();
        let payload = extract_payload(frame.as_slice()).unwrap();
        assert!(matches!(
            writer.persist(&frame, &payload, 1),
            Err(StorageError::Arbiter(ArbiterViolation::Recursive { .. }))
        ));
    }
}
