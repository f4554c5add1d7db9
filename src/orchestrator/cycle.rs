//! Capture orchestrator: runs the capture cycle on the dispatcher thread.

use super::report::{CaptureOutcome, CaptureReport, CaptureStats};
use super::state::{CaptureState, SequenceCounter};
use crate::capture::Sensor;
use crate::dispatch::{RequestGate, WorkHandler, WorkItem};
use crate::error::CaptureError;
use crate::extraction::Extractor;
use crate::storage::{BlockDevice, FileSystem, StorageError, StorageWriter, StoredFile};
use std::sync::Arc;
use std::time::Instant;

/// Everything one capture cycle touches.
pub struct CaptureContext<S, F, D> {
    pub sensor: S,
    pub storage: StorageWriter<F, D>,
    pub extractor: Extractor,
    /// Reopened when a cycle returns to idle.
    pub gate: Arc<RequestGate>,
    pub flash_enabled: bool,
}

/// Sequences arm, frame-ready, extract, persist and report.
///
/// Owns the state machine and the sequence counter. All methods run on
/// the dispatcher thread, one work item at a time.
pub struct CaptureOrchestrator<S, F, D> {
    ctx: CaptureContext<S, F, D>,
    state: CaptureState,
    counter: SequenceCounter,
    stats: Arc<CaptureStats>,
    last_report: Option<CaptureReport>,
}

impl<S, F, D> CaptureOrchestrator<S, F, D>
where
    S: Sensor,
    F: FileSystem,
    D: BlockDevice,
{
    pub fn new(ctx: CaptureContext<S, F, D>) -> Self {
        Self {
            ctx,
            state: CaptureState::Idle,
            counter: SequenceCounter::new(),
            stats: Arc::new(CaptureStats::new()),
            last_report: None,
        }
    }

    /// Continues numbering from an existing counter.
    pub fn with_counter(mut self, counter: SequenceCounter) -> Self {
        self.counter = counter;
        self
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn sequence(&self) -> u32 {
        self.counter.current()
    }

    /// Shared counters, readable from other threads.
    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }

    pub fn last_report(&self) -> Option<&CaptureReport> {
        self.last_report.as_ref()
    }

    pub fn sensor(&self) -> &S {
        &self.ctx.sensor
    }

    pub fn sensor_mut(&mut self) -> &mut S {
        &mut self.ctx.sensor
    }

    pub fn storage_mut(&mut self) -> &mut StorageWriter<F, D> {
        &mut self.ctx.storage
    }

    /// Consumes the orchestrator and returns its context.
    pub fn into_context(self) -> CaptureContext<S, F, D> {
        self.ctx
    }

    fn arm(&mut self) -> Result<(), CaptureError> {
        if !self.state.is_idle() {
            self.stats.busy_drop();
            tracing::debug!(state = %self.state, "Capture in flight, dropping button press");
            return Ok(());
        }

        self.state = CaptureState::Armed;
        if let Err(error) = self.ctx.sensor.arm_snapshot(self.ctx.flash_enabled) {
            self.stats.arm_failure();
            self.finish();
            return Err(error.into());
        }
        Ok(())
    }

    fn process_frame(&mut self) -> Result<(), CaptureError> {
        if self.state != CaptureState::Armed {
            self.stats.spurious_frame();
            tracing::warn!(state = %self.state, "Frame ready with no capture armed");
            return Ok(());
        }
        // The processing budget covers extract and persist only.
        self.state = CaptureState::FrameReady;
        let started = Instant::now();

        self.state = CaptureState::Extracting;
        let sequence = self.counter.advance();
        let outcome = match self.extract_and_persist(sequence, started) {
            Ok(file) => CaptureOutcome::Stored(file),
            Err(CaptureError::Extraction(error)) => CaptureOutcome::ExtractionFailed(error),
            Err(CaptureError::Storage(failure)) => CaptureOutcome::StorageFailed(failure),
            Err(fatal) => {
                self.finish();
                return Err(fatal);
            }
        };

        self.state = CaptureState::Reporting;
        let report = CaptureReport {
            sequence,
            outcome,
            elapsed: started.elapsed(),
            captured_at: chrono::Utc::now(),
        };
        report.log();
        self.stats.record(&report.outcome);

        let listed = if report.outcome.is_stored() {
            self.log_directory()
        } else {
            Ok(())
        };
        self.last_report = Some(report);
        self.finish();
        listed
    }

    fn extract_and_persist(
        &mut self,
        sequence: u32,
        started: Instant,
    ) -> Result<StoredFile, CaptureError> {
        let frame = self.ctx.sensor.raw_frame_buffer();
        let present = self.ctx.sensor.is_payload_present();
        let payload = self.ctx.extractor.extract(frame, present)?;

        self.state = CaptureState::Persisting;
        self.ctx.extractor.check_deadline(started)?;
        Ok(self.ctx.storage.persist(frame, &payload, sequence)?)
    }

    fn log_directory(&mut self) -> Result<(), CaptureError> {
        match self.ctx.storage.list_directory() {
            Ok(names) => {
                tracing::info!(
                    mount = %self.ctx.storage.mount_point(),
                    files = names.len(),
                    "Directory: {}",
                    names.join(" ")
                );
                Ok(())
            }
            Err(StorageError::Failure(failure)) => {
                tracing::warn!(code = failure.code(), error = %failure, "Directory listing failed");
                Ok(())
            }
            Err(StorageError::Arbiter(violation)) => Err(violation.into()),
        }
    }

    fn finish(&mut self) {
        self.state = CaptureState::Idle;
        self.ctx.gate.release();
    }
}

impl<S, F, D> WorkHandler for CaptureOrchestrator<S, F, D>
where
    S: Sensor,
    F: FileSystem,
    D: BlockDevice,
{
    fn handle(&mut self, item: WorkItem) -> Result<(), CaptureError> {
        let result = match item {
            WorkItem::ArmCapture => self.arm(),
            WorkItem::ProcessFrame => self.process_frame(),
        };
        match result {
            Err(error) if !error.is_fatal() => {
                tracing::error!(%error, ?item, "Capture step failed");
                Ok(())
            }
            other => other,
        }
    }
}
