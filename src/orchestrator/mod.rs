//! Capture orchestration.
//!
//! The orchestrator is the dispatcher's work handler. A button press
//! arms the sensor; the frame-ready item then runs extraction,
//! persistence and the status report in one go:
//!
//! ```text
//! ArmCapture ──► arm_snapshot ──► (sensor IRQ) ──► ProcessFrame
//!                                                     │
//!        Idle ◄── report ◄── persist ◄── extract ◄────┘
//! ```

mod cycle;
mod report;
mod state;

pub use cycle::{CaptureContext, CaptureOrchestrator};
pub use report::{CaptureOutcome, CaptureReport, CaptureStats, CaptureStatsSnapshot};
pub use state::{CaptureState, SequenceCounter};
