//! Raw frame buffer filled by the sensor.

/// Fixed-capacity byte buffer the sensor writes each snapshot into.
///
/// The buffer is allocated once at startup and reused for every capture.
/// Its contents are undefined before the first capture and overwritten
/// by every subsequent one, so a payload located in it must be consumed
/// before the sensor is armed again.
#[derive(Clone)]
pub struct RawFrameBuffer {
    /// Backing storage, never resized after construction.
    data: Box<[u8]>,
    /// Number of times the sensor has filled the buffer.
    generation: u64,
}

impl RawFrameBuffer {
    /// Creates a zeroed buffer of the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            generation: 0,
        }
    }

    /// Creates a buffer holding exactly `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec().into_boxed_slice(),
            generation: 0,
        }
    }

    /// Returns the buffer contents.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Returns the buffer contents for the sensor to fill.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Returns the fixed capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Returns how many frames have been written into the buffer.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Overwrites the buffer with `frame`, zero-filling any remainder.
    ///
    /// Bytes beyond the capacity are discarded, the way a DMA transfer
    /// stops at the end of its target region. Returns the number of
    /// bytes copied.
    pub fn load(&mut self, frame: &[u8]) -> usize {
        let copied = frame.len().min(self.data.len());
        self.data[..copied].copy_from_slice(&frame[..copied]);
        self.data[copied..].fill(0);
        self.generation += 1;
        copied
    }

    /// Marks the buffer as freshly written after an in-place fill.
    pub fn mark_filled(&mut self) {
        self.generation += 1;
    }
}

impl std::fmt::Debug for RawFrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFrameBuffer")
            .field("capacity", &self.data.len())
            .field("generation", &self.generation)
            .finish()
    }
}
