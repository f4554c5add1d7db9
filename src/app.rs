//! Board bring-up.
//!
//! Wires the collaborators into a running system in boot order:
//! block device, filesystem, work queue, sensor. USB export is attached
//! afterwards from the main context.

use crate::capture::{FileConfig, Sensor};
use crate::dispatch::{Dispatcher, EventQueue, InterruptShim, RequestGate};
use crate::error::StartupError;
use crate::extraction::Extractor;
use crate::orchestrator::{CaptureContext, CaptureOrchestrator};
use crate::storage::{BlockDevice, BlockDeviceArbiter, FileSystem, MountOutcome, StorageWriter};
use crate::usb::{HostPort, UsbMassStorage};
use std::sync::Arc;
use std::time::Duration;

/// The assembled pipeline, ready to dispatch.
pub struct System<S, F, D> {
    /// Work queue drained by the dispatcher.
    pub queue: Arc<EventQueue>,
    /// Outstanding-capture gate shared by the button shim and the orchestrator.
    pub gate: Arc<RequestGate>,
    /// Handler body for the capture button interrupt.
    pub button: InterruptShim,
    /// Shared block device.
    pub arbiter: Arc<BlockDeviceArbiter<D>>,
    /// Capture state machine, handed to the dispatcher.
    pub orchestrator: CaptureOrchestrator<S, F, D>,
    /// How the filesystem came up.
    pub mount: MountOutcome,
    idle_wait: Duration,
}

impl<S, F, D> System<S, F, D>
where
    S: Sensor,
    F: FileSystem,
    D: BlockDevice,
{
    /// Exports the shared device to a USB host.
    pub fn export_usb<H: HostPort>(
        &self,
        host: H,
        sector_size: u64,
    ) -> Result<UsbMassStorage<D, H>, StartupError> {
        let mut usb = UsbMassStorage::new(host, sector_size);
        usb.export(Arc::clone(&self.arbiter))?;
        Ok(usb)
    }

    /// Builds the dispatcher around the orchestrator, leaving the rest of
    /// the system to the caller.
    pub fn into_dispatcher(self) -> (Dispatcher<CaptureOrchestrator<S, F, D>>, Handles<D>) {
        let dispatcher = Dispatcher::new(Arc::clone(&self.queue), self.orchestrator)
            .with_idle_wait(self.idle_wait);
        let handles = Handles {
            queue: self.queue,
            gate: self.gate,
            button: self.button,
            arbiter: self.arbiter,
        };
        (dispatcher, handles)
    }
}

/// Shared handles kept by the main context once the dispatcher owns the orchestrator.
#[allow(missing_docs)]
pub struct Handles<D> {
    pub queue: Arc<EventQueue>,
    pub gate: Arc<RequestGate>,
    pub button: InterruptShim,
    pub arbiter: Arc<BlockDeviceArbiter<D>>,
}

impl<D> Clone for Handles<D> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            gate: Arc::clone(&self.gate),
            button: self.button.clone(),
            arbiter: Arc::clone(&self.arbiter),
        }
    }
}

/// Brings up storage and the sensor and returns the assembled system.
///
/// Mount failures trigger one destructive reformat; if that fails too,
/// bring-up fails.
pub fn bring_up<S, F, D>(
    config: &FileConfig,
    mut device: D,
    fs: F,
    mut sensor: S,
) -> Result<System<S, F, D>, StartupError>
where
    S: Sensor,
    F: FileSystem,
    D: BlockDevice,
{
    config.validate()?;

    device.init()?;
    let geometry = device.geometry();
    tracing::info!(
        size = geometry.size,
        read_size = geometry.read_size,
        program_size = geometry.program_size,
        erase_size = geometry.erase_size,
        "Block device ready"
    );

    let arbiter = Arc::new(BlockDeviceArbiter::new(device));
    let mut storage = StorageWriter::new(fs, Arc::clone(&arbiter), config.capture.mount_point.clone());
    let mount = storage.mount_or_reformat()?;
    match mount {
        MountOutcome::Mounted => tracing::info!(mount = %storage.mount_point(), "Filesystem mounted"),
        MountOutcome::Reformatted => {
            tracing::warn!(mount = %storage.mount_point(), "Filesystem reformatted and mounted")
        }
    }

    let queue = Arc::new(EventQueue::with_capacity(config.dispatch.queue_capacity));
    let gate = Arc::new(RequestGate::new());

    sensor.initialize(&config.capture.sensor)?;
    sensor.on_frame_ready(InterruptShim::frame_ready(Arc::clone(&queue)));

    let extractor =
        Extractor::with_deadline(Duration::from_millis(config.capture.processing_timeout_ms));
    let orchestrator = CaptureOrchestrator::new(CaptureContext {
        sensor,
        storage,
        extractor,
        gate: Arc::clone(&gate),
        flash_enabled: config.capture.flash_enabled,
    });

    Ok(System {
        button: InterruptShim::button(Arc::clone(&queue), Arc::clone(&gate)),
        queue,
        gate,
        arbiter,
        orchestrator,
        mount,
        idle_wait: Duration::from_millis(config.dispatch.idle_wait_ms),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{MockSensor, SyntheticFrame};
    use crate::storage::{FlatFileSystem, Geometry, MemBlockDevice, MountFailure};
    use crate::usb::SimulatedHost;
    use std::thread;

    fn device(config: &FileConfig) -> MemBlockDevice {
        MemBlockDevice::new(Geometry::from(&config.device))
    }

    fn fs(config: &FileConfig) -> FlatFileSystem {
        FlatFileSystem::from(&config.device)
    }

    fn sensor() -> MockSensor {
        MockSensor::new(16 * 1024).with_frame_shape(SyntheticFrame {
            lead: 40,
            body_len: 5000,
        })
    }

    #[test]
    fn test_blank_device_is_reformatted() {
        let config = FileConfig::default();
        let mut system = bring_up(&config, device(&config), fs(&config), sensor()).unwrap();

        assert_eq!(system.mount, MountOutcome::Reformatted);
        assert!(system
            .orchestrator
            .storage_mut()
            .list_directory()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_reformat_failure_aborts_bring_up() {
        let config = FileConfig::default();
        let device = device(&config);
        device.fault_injector().fail_erases(1);

        let result = bring_up(&config, device, fs(&config), sensor());
        assert!(matches!(
            result,
            Err(StartupError::Mount(MountFailure::ReformatFailed { .. }))
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = FileConfig::default();
        config.dispatch.queue_capacity = 0;
        let result = bring_up(&config, device(&config), fs(&config), sensor());
        assert!(matches!(result, Err(StartupError::Config(_))));
    }

    #[test]
    fn test_captures_alongside_usb_export() {
        let config = FileConfig::default();
        let system = bring_up(&config, device(&config), fs(&config), sensor()).unwrap();
        let mut usb = system
            .export_usb(SimulatedHost::new(9).with_activity(1.0), config.usb.sector_size)
            .unwrap();

        let (dispatcher, handles) = system.into_dispatcher();
        let stats = dispatcher.handler().stats();
        let running = dispatcher.spawn().unwrap();

        let presses = {
            let handles = handles.clone();
            thread::spawn(move || {
                for _ in 0..4 {
                    while !handles.button.fire() {
                        thread::sleep(Duration::from_millis(1));
                    }
                    while handles.gate.is_outstanding() {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            })
        };

        // Main context: service the host until the presses are done.
        while !presses.is_finished() {
            usb.process().unwrap();
        }
        presses.join().unwrap();

        let mut orchestrator = running.shutdown().unwrap();
        assert_eq!(stats.snapshot().stored, 4);
        assert_eq!(
            orchestrator.storage_mut().list_directory().unwrap(),
            vec!["jpeg_1.jpg", "jpeg_2.jpg", "jpeg_3.jpg", "jpeg_4.jpg"]
        );
        assert!(usb.stats().reads > 0);

        let arbiter = handles.arbiter.stats();
        assert!(arbiter.filesystem_acquisitions > 0);
        assert_eq!(handles.arbiter.holder(), None);
    }
}
