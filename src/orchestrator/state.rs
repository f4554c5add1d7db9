//! Capture state machine and sequence counter.

use std::fmt;

/// Phase of the current capture cycle.
///
/// ```text
/// Idle ─► Armed ─► FrameReady ─► Extracting ─► Persisting ─► Reporting ─► Idle
///                                    └──────── (failure) ────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    #[default]
    Idle,
    Armed,
    FrameReady,
    Extracting,
    Persisting,
    Reporting,
}

impl CaptureState {
    /// Returns true if a new capture may be armed.
    pub fn is_idle(self) -> bool {
        self == CaptureState::Idle
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::Idle => "idle",
            CaptureState::Armed => "armed",
            CaptureState::FrameReady => "frame-ready",
            CaptureState::Extracting => "extracting",
            CaptureState::Persisting => "persisting",
            CaptureState::Reporting => "reporting",
        };
        f.write_str(name)
    }
}

/// Capture attempt counter used to name output files.
///
/// Starts at zero; the first attempt is number 1. Saturates at
/// `u32::MAX`, after which creates fail with an existing-file error
/// instead of reusing an older name.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter {
    value: u32,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter whose next attempt is `value + 1`.
    pub fn starting_at(value: u32) -> Self {
        Self { value }
    }

    /// Number of the latest attempt.
    pub fn current(&self) -> u32 {
        self.value
    }

    /// Records a new attempt and returns its number.
    pub fn advance(&mut self) -> u32 {
        self.value = self.value.saturating_add(1);
        self.value
    }
}
