//! Payload extraction from raw sensor frames.
//!
//! The sensor writes a whole frame into a fixed buffer; the compressed
//! image inside it is delimited by JPEG start and end markers. This
//! module finds that region without copying it.

mod markers;
mod payload;

pub use markers::{extract_payload, END_MARKER, START_MARKER};
pub use payload::ExtractedPayload;

use crate::capture::RawFrameBuffer;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Reasons a frame yields no payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("sensor reported no compressed payload")]
    PayloadAbsent,
    #[error("no start-of-image marker in frame")]
    MissingStartMarker,
    #[error("start-of-image marker at offset {start} has no end-of-image marker")]
    MissingEndMarker { start: usize },
    #[error("processing took {elapsed:?}, over the {limit:?} budget")]
    DeadlineExceeded { elapsed: Duration, limit: Duration },
}

/// Extracts payloads and enforces the processing budget.
#[derive(Debug, Clone, Default)]
pub struct Extractor {
    deadline: Option<Duration>,
}

impl Extractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an extractor that fails cycles running longer than `limit`.
    ///
    /// A zero limit disables the check.
    pub fn with_deadline(limit: Duration) -> Self {
        Self {
            deadline: (!limit.is_zero()).then_some(limit),
        }
    }

    /// Returns the processing budget, if any.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Locates the payload in `frame`.
    ///
    /// `payload_present` is the sensor's own verdict; when false the frame
    /// is not scanned.
    pub fn extract(
        &self,
        frame: &RawFrameBuffer,
        payload_present: bool,
    ) -> Result<ExtractedPayload, ExtractionError> {
        if !payload_present {
            return Err(ExtractionError::PayloadAbsent);
        }
        let payload = extract_payload(frame.as_slice())?;

        tracing::trace!(
            offset = payload.offset(),
            len = payload.len(),
            capacity = frame.capacity(),
            "Payload located"
        );
        Ok(payload)
    }

    /// Fails if the cycle started at `started` has used up its budget.
    pub fn check_deadline(&self, started: Instant) -> Result<(), ExtractionError> {
        match self.deadline {
            Some(limit) => {
                let elapsed = started.elapsed();
                if elapsed > limit {
                    return Err(ExtractionError::DeadlineExceeded { elapsed, limit });
                }
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_frame() -> RawFrameBuffer {
        let mut data = vec![0x00, 0xFF, 0xD8, 0xFF];
        data.extend(1..=10u8);
        data.extend([0xFF, 0xD9]);
        data.resize(64, 0);
        RawFrameBuffer::from_bytes(&data)
    }

    #[test]
    fn test_extract_reference_frame() {
        let extractor = Extractor::new();
        let payload = extractor
            .extract(&reference_frame(), true)
            .unwrap();
        assert_eq!(payload.offset(), 1);
        assert_eq!(payload.len(), 15);
    }

    #[test]
    fn test_absent_payload_not_scanned() {
        let extractor = Extractor::new();
        assert_eq!(
            extractor.extract(&reference_frame(), false),
            Err(ExtractionError::PayloadAbsent)
        );
    }

    #[test]
    fn test_deadline_expiry() {
        let extractor = Extractor::with_deadline(Duration::from_millis(5));
        let started = Instant::now() - Duration::from_millis(50);

        assert!(matches!(
            extractor.check_deadline(started),
            Err(ExtractionError::DeadlineExceeded { .. })
        ));
        assert!(extractor.check_deadline(Instant::now()).is_ok());
    }

    #[test]
    fn test_zero_deadline_disabled() {
        let extractor = Extractor::with_deadline(Duration::ZERO);
        assert_eq!(extractor.deadline(), None);
        let started = Instant::now() - Duration::from_secs(10);
        assert!(extractor.check_deadline(started).is_ok());
    }
}
