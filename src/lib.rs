//! Flash Capture Library
//!
//! Button-triggered JPEG snapshot capture for a camera board whose flash
//! is both a mounted filesystem and a USB mass-storage volume.
//!
//! # Architecture
//!
//! Work flows from interrupts to a single dispatcher thread:
//!
//! ```text
//! button IRQ ─► ArmCapture ─► sensor.arm_snapshot
//! sensor IRQ ─► ProcessFrame ─► extraction ─► storage ─► report
//!                                               │
//!                                     BlockDeviceArbiter ◄── usb (main loop)
//! ```
//!
//! # Design Principles
//!
//! - **Interrupts only enqueue**: shims post one work item and return
//! - **One consumer**: extraction and file writes run only on the dispatcher thread
//! - **Exclusive device access**: the filesystem and the USB export never
//!   have block device I/O in flight at the same time
//! - **Local failures stay local**: a bad frame or failed write ends one
//!   cycle; mount failures and arbiter violations end the boot
//!
//! # Example
//!
//! ```no_run
//! use flash_capture::{
//!     app::bring_up,
//!     capture::{FileConfig, MockSensor},
//!     storage::{FlatFileSystem, Geometry, MemBlockDevice},
//!     usb::SimulatedHost,
//! };
//!
//! let config = FileConfig::default();
//! let device = MemBlockDevice::new(Geometry::from(&config.device));
//! let sensor = MockSensor::new(config.capture.frame_buffer_capacity);
//!
//! let system = bring_up(&config, device, FlatFileSystem::from(&config.device), sensor).unwrap();
//! let mut usb = system.export_usb(SimulatedHost::new(1), config.usb.sector_size).unwrap();
//!
//! let (dispatcher, handles) = system.into_dispatcher();
//! let running = dispatcher.spawn().unwrap();
//!
//! // Simulated button press; the main context keeps serving the host.
//! handles.button.fire();
//! while handles.gate.is_outstanding() {
//!     usb.process().unwrap();
//! }
//!
//! let mut orchestrator = running.shutdown().unwrap();
//! println!("{:?}", orchestrator.storage_mut().list_directory().unwrap());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod app;
pub mod capture;
pub mod dispatch;
pub mod error;
pub mod extraction;
pub mod metrics;
pub mod orchestrator;
pub mod storage;
pub mod usb;

// Re-export commonly used types at crate root
pub use capture::{CaptureConfig, FileConfig, MockSensor, RawFrameBuffer, Sensor};
pub use dispatch::{Dispatcher, EventQueue, InterruptShim, WorkItem};
pub use error::{CaptureError, StartupError};
pub use extraction::{extract_payload, ExtractedPayload, ExtractionError, Extractor};
pub use orchestrator::{CaptureOrchestrator, CaptureState, SequenceCounter};
pub use storage::{BlockDevice, BlockDeviceArbiter, FileSystem, FlatFileSystem, StorageWriter};
pub use usb::UsbMassStorage;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
