//! Camera sensor abstraction.
//!
//! The sensor driver owns exposure, the JPEG codec and the DMA transfer
//! into the raw frame buffer. This module only describes the calls the
//! capture pipeline makes into it, plus a mock used by tests and the
//! simulator binary.

use super::config::{CaptureMode, SensorSettings};
use super::frame::RawFrameBuffer;
use crate::dispatch::InterruptShim;
use crate::extraction::{END_MARKER, START_MARKER};
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::collections::VecDeque;
use thiserror::Error;

/// Errors that can occur during sensor operations.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor not initialized")]
    NotInitialized,
    #[error("sensor initialization failed: {0}")]
    InitFailed(String),
    #[error("sensor is not in snapshot mode")]
    NotSnapshotMode,
    #[error("failed to arm snapshot: {0}")]
    ArmFailed(String),
}

/// Calls the capture pipeline makes into the sensor driver.
pub trait Sensor: Send {
    /// Configures the sensor. Must succeed before any snapshot is armed.
    fn initialize(&mut self, settings: &SensorSettings) -> Result<(), SensorError>;

    /// Registers the handler run from the frame-complete interrupt.
    fn on_frame_ready(&mut self, shim: InterruptShim);

    /// Starts one snapshot. The frame-ready handler fires when the buffer is filled.
    fn arm_snapshot(&mut self, flash_enabled: bool) -> Result<(), SensorError>;

    /// Returns true if the last frame carries a compressed payload.
    fn is_payload_present(&self) -> bool;

    /// Returns the buffer the sensor writes frames into.
    fn raw_frame_buffer(&self) -> &RawFrameBuffer;
}

/// Shape of a synthesised frame.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticFrame {
    /// Bytes of filler before the start marker.
    pub lead: usize,
    /// Bytes of image body between the markers.
    pub body_len: usize,
}

impl Default for SyntheticFrame {
    fn default() -> Self {
        Self {
            lead: 32,
            body_len: 12 * 1024,
        }
    }
}

/// Mock sensor that synthesises JPEG-delimited frames.
///
/// Frames come from a script when one is queued, otherwise they are
/// generated: filler, start marker, a pseudo-random body that never
/// contains the end marker, end marker, zero padding. Every
/// `corrupt_every`-th generated frame has its end marker left out.
pub struct MockSensor {
    buffer: RawFrameBuffer,
    settings: Option<SensorSettings>,
    frame_ready: Option<InterruptShim>,
    scripted: VecDeque<Vec<u8>>,
    shape: SyntheticFrame,
    corrupt_every: Option<u64>,
    rng: ChaCha8Rng,
    snapshots: u64,
    last_flash: Option<bool>,
}

impl MockSensor {
    /// Creates a mock sensor with a buffer of the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: RawFrameBuffer::new(capacity),
            settings: None,
            frame_ready: None,
            scripted: VecDeque::new(),
            shape: SyntheticFrame::default(),
            corrupt_every: None,
            rng: ChaCha8Rng::seed_from_u64(0x0005_640C),
            snapshots: 0,
            last_flash: None,
        }
    }

    /// Sets the shape of generated frames.
    pub fn with_frame_shape(mut self, shape: SyntheticFrame) -> Self {
        self.shape = shape;
        self
    }

    /// Drops the end marker from every `n`-th generated frame.
    pub fn with_corrupt_every(mut self, n: u64) -> Self {
        self.corrupt_every = (n > 0).then_some(n);
        self
    }

    /// Seeds the body generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// Queues a raw frame to be delivered by the next snapshot.
    pub fn push_frame(&mut self, frame: Vec<u8>) {
        self.scripted.push_back(frame);
    }

    /// Number of snapshots taken.
    pub fn snapshots(&self) -> u64 {
        self.snapshots
    }

    /// Flash state requested by the most recent snapshot.
    pub fn last_flash(&self) -> Option<bool> {
        self.last_flash
    }

    fn synthesize(&mut self) {
        let corrupt = self
            .corrupt_every
            .is_some_and(|n| self.snapshots % n == 0);
        let capacity = self.buffer.capacity();
        let lead = self.shape.lead.min(capacity);
        let body_end = (lead + START_MARKER.len() + self.shape.body_len)
            .min(capacity.saturating_sub(END_MARKER.len()));

        let data = self.buffer.as_mut_slice();
        data.fill(0);
        if lead + START_MARKER.len() <= body_end {
            data[lead..lead + START_MARKER.len()].copy_from_slice(&START_MARKER);
            let body = &mut data[lead + START_MARKER.len()..body_end];
            self.rng.fill_bytes(body);
            // 0xFF never appears in the body, so neither marker can.
            for byte in body.iter_mut().filter(|b| **b == 0xFF) {
                *byte = 0xFE;
            }
            // APP0 segment tag, so the start marker's 0xFF is never read as 0xFF 0xD9.
            if let Some(first) = body.first_mut() {
                *first = 0xE0;
            }
            if !corrupt {
                data[body_end..body_end + END_MARKER.len()].copy_from_slice(&END_MARKER);
            }
        }
        self.buffer.mark_filled();
    }
}

impl Sensor for MockSensor {
    fn initialize(&mut self, settings: &SensorSettings) -> Result<(), SensorError> {
        if settings.frame_rate == 0 {
            return Err(SensorError::InitFailed("frame rate must be non-zero".into()));
        }
        let (width, height) = settings.resolution.dimensions();
        tracing::info!(
            width,
            height,
            fps = settings.frame_rate,
            jpeg = settings.jpeg,
            mode = ?settings.mode,
            "MockSensor initialized"
        );
        self.settings = Some(settings.clone());
        Ok(())
    }

    fn on_frame_ready(&mut self, shim: InterruptShim) {
        self.frame_ready = Some(shim);
    }

    fn arm_snapshot(&mut self, flash_enabled: bool) -> Result<(), SensorError> {
        let settings = self.settings.as_ref().ok_or(SensorError::NotInitialized)?;
        if settings.mode != CaptureMode::Snapshot {
            return Err(SensorError::NotSnapshotMode);
        }

        self.snapshots += 1;
        self.last_flash = Some(flash_enabled);
        match self.scripted.pop_front() {
            Some(frame) => {
                self.buffer.load(&frame);
            }
            None => self.synthesize(),
        }

        // The transfer completes immediately; raise the frame-complete interrupt.
        if let Some(shim) = &self.frame_ready {
            shim.fire();
        }
        Ok(())
    }

    fn is_payload_present(&self) -> bool {
        self.settings.as_ref().is_some_and(|s| s.jpeg) && self.buffer.generation() > 0
    }

    fn raw_frame_buffer(&self) -> &RawFrameBuffer {
        &self.buffer
    }
}
