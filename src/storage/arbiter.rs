//! Exclusive access to the shared block device.
//!
//! The flash region is mounted as a filesystem on the dispatcher thread
//! and exported as raw sectors from the USB loop on the main thread.
//! Every device operation from either side happens while holding the
//! single [`DeviceGuard`] handed out by [`BlockDeviceArbiter::acquire`].

use crate::dispatch::in_interrupt_context;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use thiserror::Error;

/// The two logical users of the block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Client {
    /// Mount, file writes and directory reads.
    FileSystem,
    /// Host-issued sector reads and writes.
    UsbExport,
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Client::FileSystem => f.write_str("filesystem"),
            Client::UsbExport => f.write_str("usb-export"),
        }
    }
}

/// Breach of the device exclusivity invariant. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArbiterViolation {
    #[error("{client} requested the block device while {holder} already holds it on the same thread")]
    Recursive { client: Client, holder: Client },
    #[error("{client} requested the block device from interrupt context")]
    InterruptContext { client: Client },
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    client: Client,
    thread: ThreadId,
}

/// Point-in-time acquisition counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArbiterStats {
    pub filesystem_acquisitions: u64,
    pub usb_acquisitions: u64,
    /// Acquisitions that had to wait for the other client.
    pub contended: u64,
}

/// Serialises all access to one block device.
///
/// Acquisition blocks until the device is free, with no timeout: each
/// critical section covers a bounded run of device operations. Asking
/// again from the thread that already holds the device, or from
/// interrupt context, fails with [`ArbiterViolation`] instead of
/// deadlocking.
pub struct BlockDeviceArbiter<D> {
    device: Mutex<D>,
    holder: Mutex<Option<Holder>>,
    filesystem_acquisitions: AtomicU64,
    usb_acquisitions: AtomicU64,
    contended: AtomicU64,
}

impl<D> BlockDeviceArbiter<D> {
    pub fn new(device: D) -> Self {
        Self {
            device: Mutex::new(device),
            holder: Mutex::new(None),
            filesystem_acquisitions: AtomicU64::new(0),
            usb_acquisitions: AtomicU64::new(0),
            contended: AtomicU64::new(0),
        }
    }

    /// Blocks until `client` has exclusive access to the device.
    pub fn acquire(&self, client: Client) -> Result<DeviceGuard<'_, D>, ArbiterViolation> {
        if in_interrupt_context() {
            return Err(ArbiterViolation::InterruptContext { client });
        }

        let current = thread::current().id();
        if let Some(holder) = *self.holder.lock() {
            if holder.thread == current {
                return Err(ArbiterViolation::Recursive {
                    client,
                    holder: holder.client,
                });
            }
        }

        let device = match self.device.try_lock() {
            Some(device) => device,
            None => {
                self.contended.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(%client, "Waiting for block device");
                self.device.lock()
            }
        };

        *self.holder.lock() = Some(Holder {
            client,
            thread: current,
        });
        match client {
            Client::FileSystem => &self.filesystem_acquisitions,
            Client::UsbExport => &self.usb_acquisitions,
        }
        .fetch_add(1, Ordering::Relaxed);

        Ok(DeviceGuard {
            device,
            holder: &self.holder,
            client,
        })
    }

    /// Returns the client currently holding the device.
    pub fn holder(&self) -> Option<Client> {
        self.holder.lock().map(|h| h.client)
    }

    /// Returns acquisition counters.
    pub fn stats(&self) -> ArbiterStats {
        ArbiterStats {
            filesystem_acquisitions: self.filesystem_acquisitions.load(Ordering::Relaxed),
            usb_acquisitions: self.usb_acquisitions.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
        }
    }

    /// Consumes the arbiter and returns the device.
    pub fn into_inner(self) -> D {
        self.device.into_inner()
    }
}

/// Exclusive access to the device, released on drop.
pub struct DeviceGuard<'a, D> {
    device: MutexGuard<'a, D>,
    holder: &'a Mutex<Option<Holder>>,
    client: Client,
}

impl<D> DeviceGuard<'_, D> {
    /// The client holding this guard.
    pub fn client(&self) -> Client {
        self.client
    }
}

impl<D> Deref for DeviceGuard<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.device
    }
}

impl<D> DerefMut for DeviceGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

impl<D> Drop for DeviceGuard<'_, D> {
    fn drop(&mut self) {
        // Cleared before the device lock is released (fields drop after this body).
        *self.holder.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::InterruptContext;
    use crate::storage::{BlockDevice, Geometry, MemBlockDevice};
    use proptest::prelude::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    fn arbiter() -> BlockDeviceArbiter<MemBlockDevice> {
        let mut device = MemBlockDevice::new(Geometry {
            size: 16 * 2048,
            read_size: 1,
            program_size: 8,
            erase_size: 2048,
        });
        device.init().unwrap();
        BlockDeviceArbiter::new(device)
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let arbiter = arbiter();
        {
            let guard = arbiter.acquire(Client::FileSystem).unwrap();
            assert_eq!(guard.client(), Client::FileSystem);
            assert_eq!(arbiter.holder(), Some(Client::FileSystem));
        }
        assert_eq!(arbiter.holder(), None);

        let _usb = arbiter.acquire(Client::UsbExport).unwrap();
        assert_eq!(arbiter.holder(), Some(Client::UsbExport));
        assert_eq!(arbiter.stats().filesystem_acquisitions, 1);
        assert_eq!(arbiter.stats().usb_acquisitions, 1);
    }

    #[test]
    fn test_recursive_acquire_is_violation() {
        let arbiter = arbiter();
        let _guard = arbiter.acquire(Client::FileSystem).unwrap();

        assert_eq!(
            arbiter.acquire(Client::FileSystem).err(),
            Some(ArbiterViolation::Recursive {
                client: Client::FileSystem,
                holder: Client::FileSystem,
            })
        );
        assert_eq!(
            arbiter.acquire(Client::UsbExport).err(),
            Some(ArbiterViolation::Recursive {
                client: Client::UsbExport,
                holder: Client::FileSystem,
            })
        );
    }

    #[test]
    fn test_interrupt_context_is_violation() {
        let arbiter = arbiter();
        let _irq = InterruptContext::enter();
        assert_eq!(
            arbiter.acquire(Client::UsbExport).err(),
            Some(ArbiterViolation::InterruptContext {
                client: Client::UsbExport
            })
        );
        assert_eq!(arbiter.holder(), None);
    }

    #[test]
    fn test_second_client_blocks_until_release() {
        let arbiter = Arc::new(arbiter());
        let barrier = Arc::new(Barrier::new(2));
        let usb_done = Arc::new(AtomicBool::new(false));

        let guard = arbiter.acquire(Client::FileSystem).unwrap();

        let worker = {
            let arbiter = Arc::clone(&arbiter);
            let barrier = Arc::clone(&barrier);
            let usb_done = Arc::clone(&usb_done);
            thread::spawn(move || {
                barrier.wait();
                let _usb = arbiter.acquire(Client::UsbExport).unwrap();
                usb_done.store(true, Ordering::SeqCst);
            })
        };

        barrier.wait();
        thread::sleep(Duration::from_millis(30));
        assert!(!usb_done.load(Ordering::SeqCst));

        drop(guard);
        worker.join().unwrap();
        assert!(usb_done.load(Ordering::SeqCst));
        assert_eq!(arbiter.stats().contended, 1);
    }

    /// Records every critical section and flags any overlap.
    #[derive(Default)]
    struct OverlapProbe {
        inside: AtomicU64,
        overlaps: AtomicU64,
    }

    impl OverlapProbe {
        fn enter(&self) {
            if self.inside.fetch_add(1, Ordering::SeqCst) != 0 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn exit(&self) {
            self.inside.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn run_client(
        arbiter: &BlockDeviceArbiter<MemBlockDevice>,
        probe: &OverlapProbe,
        client: Client,
        ops: &[(u8, bool)],
    ) {
        for &(block, write) in ops {
            let mut device = arbiter.acquire(client).unwrap();
            probe.enter();
            let offset = u64::from(block % 16) * 2048;
            if write {
                device.erase(offset, 2048).unwrap();
                device.write(offset, &[block; 64]).unwrap();
            } else {
                let mut buf = [0u8; 64];
                device.read(offset, &mut buf).unwrap();
            }
            thread::yield_now();
            probe.exit();
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_no_overlapping_critical_sections(
            fs_ops in proptest::collection::vec((any::<u8>(), any::<bool>()), 1..40),
            usb_ops in proptest::collection::vec((any::<u8>(), any::<bool>()), 1..40),
        ) {
            let arbiter = Arc::new(arbiter());
            let probe = Arc::new(OverlapProbe::default());
            let expected = (fs_ops.len() + usb_ops.len()) as u64;

            let fs = {
                let arbiter = Arc::clone(&arbiter);
                let probe = Arc::clone(&probe);
                thread::spawn(move || run_client(&arbiter, &probe, Client::FileSystem, &fs_ops))
            };
            run_client(&arbiter, &probe, Client::UsbExport, &usb_ops);
            fs.join().unwrap();

            prop_assert_eq!(probe.overlaps.load(Ordering::SeqCst), 0);
            prop_assert_eq!(arbiter.holder(), None);
            let stats = arbiter.stats();
            prop_assert_eq!(stats.filesystem_acquisitions + stats.usb_acquisitions, expected);
        }
    }
}
