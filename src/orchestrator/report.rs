//! Per-capture reports and running counters.

use crate::extraction::ExtractionError;
use crate::storage::{StorageFailure, StoredFile};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Result of one capture attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    Stored(StoredFile),
    ExtractionFailed(ExtractionError),
    StorageFailed(StorageFailure),
}

impl CaptureOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, CaptureOutcome::Stored(_))
    }

    /// True if the cycle ran out of its processing budget.
    pub fn is_deadline_miss(&self) -> bool {
        matches!(
            self,
            CaptureOutcome::ExtractionFailed(ExtractionError::DeadlineExceeded { .. })
        )
    }
}

/// Status line material for one capture attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureReport {
    pub sequence: u32,
    pub outcome: CaptureOutcome,
    /// Time from arming the sensor to the end of persistence.
    pub elapsed: Duration,
    pub captured_at: DateTime<Utc>,
}

impl CaptureReport {
    /// Emits the console line for this attempt.
    pub fn log(&self) {
        let elapsed_ms = self.elapsed.as_secs_f64() * 1000.0;
        match &self.outcome {
            CaptureOutcome::Stored(file) => tracing::info!(
                path = %file.path,
                digest = %file.digest.to_hex(),
                elapsed_ms,
                "JPEG {} stored: {} bytes",
                self.sequence,
                file.bytes
            ),
            CaptureOutcome::ExtractionFailed(error) => tracing::warn!(
                %error,
                elapsed_ms,
                "JPEG {} extraction failed",
                self.sequence
            ),
            CaptureOutcome::StorageFailed(failure) => tracing::error!(
                op = %failure.op,
                code = failure.code(),
                error = %failure.source,
                "JPEG {} write failed",
                self.sequence
            ),
        }
    }
}

/// Counters shared between the dispatcher thread and observers.
#[derive(Debug, Default)]
pub struct CaptureStats {
    attempts: AtomicU64,
    stored: AtomicU64,
    extraction_failures: AtomicU64,
    storage_failures: AtomicU64,
    bytes_stored: AtomicU64,
    busy_drops: AtomicU64,
    spurious_frames: AtomicU64,
    arm_failures: AtomicU64,
}

/// Point-in-time copy of [`CaptureStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStatsSnapshot {
    pub attempts: u64,
    pub stored: u64,
    pub extraction_failures: u64,
    pub storage_failures: u64,
    pub bytes_stored: u64,
    /// Arm requests that arrived while a capture was in flight.
    pub busy_drops: u64,
    /// Frame-ready events with no armed capture.
    pub spurious_frames: u64,
    pub arm_failures: u64,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, outcome: &CaptureOutcome) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        match outcome {
            CaptureOutcome::Stored(file) => {
                self.stored.fetch_add(1, Ordering::Relaxed);
                self.bytes_stored
                    .fetch_add(file.bytes as u64, Ordering::Relaxed);
            }
            CaptureOutcome::ExtractionFailed(_) => {
                self.extraction_failures.fetch_add(1, Ordering::Relaxed);
            }
            CaptureOutcome::StorageFailed(_) => {
                self.storage_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn busy_drop(&self) {
        self.busy_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn spurious_frame(&self) {
        self.spurious_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn arm_failure(&self) {
        self.arm_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            extraction_failures: self.extraction_failures.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
            bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            busy_drops: self.busy_drops.load(Ordering::Relaxed),
            spurious_frames: self.spurious_frames.load(Ordering::Relaxed),
            arm_failures: self.arm_failures.load(Ordering::Relaxed),
        }
    }
}
