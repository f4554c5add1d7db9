//! Located payload region.

use crate::capture::RawFrameBuffer;
use std::ops::Range;

/// A view of the compressed payload inside a [`RawFrameBuffer`].
///
/// Holds only the offset and length; the bytes stay in the frame buffer
/// and are valid until the sensor is armed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractedPayload {
    offset: usize,
    len: usize,
}

impl ExtractedPayload {
    pub(crate) fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    /// Offset of the start marker.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Payload length including both markers.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false for a payload produced by extraction.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte range within the frame buffer.
    #[inline]
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    /// Returns the payload bytes from the frame it was extracted from.
    ///
    /// Returns `None` if the frame is too short for this region.
    pub fn bytes<'a>(&self, frame: &'a RawFrameBuffer) -> Option<&'a [u8]> {
        frame.as_slice().get(self.range())
    }
}
