/// Audio buffer module for accumulating streamed PCM bytes
///
/// Implements a bounded, append-only buffer with a logical read cursor.
/// Consumed bytes before the cursor are reclaimed by the underlying `BytesMut`.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace};

/// Default ceiling: 10 seconds of 16kHz, 16-bit mono audio (~320KB)
pub const DEFAULT_CAPACITY_BYTES: usize = 10 * 16000 * 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BufferError {
    #[error("Buffer overflow: appending {attempted} bytes to {retained} retained exceeds capacity of {capacity}")]
    Overflow {
        attempted: usize,
        retained: usize,
        capacity: usize,
    },

    #[error("Insufficient audio: requested {requested} bytes, but only {available} available")]
    Insufficient { requested: usize, available: usize },
}

/// Bounded streaming buffer owned by a single session
#[derive(Debug)]
pub struct SessionBuffer {
    data: BytesMut,
    capacity: usize,
    total_appended: u64,
}

impl SessionBuffer {
    /// Create a buffer with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY_BYTES)
    }

    /// Create a buffer with a custom hard ceiling
    pub fn with_capacity(capacity: usize) -> Self {
        debug!("Creating session buffer with capacity: {} bytes", capacity);

        Self {
            data: BytesMut::new(),
            capacity,
            total_appended: 0,
        }
    }

    /// Append a chunk, copying it into the buffer
    ///
    /// Nothing is written when the chunk would push the retained byte count
    /// past the ceiling.
    pub fn append(&mut self, chunk: &[u8]) -> Result<(), BufferError> {
        let retained = self.data.len();

        if retained + chunk.len() > self.capacity {
            return Err(BufferError::Overflow {
                attempted: chunk.len(),
                retained,
                capacity: self.capacity,
            });
        }

        self.data.extend_from_slice(chunk);
        self.total_appended += chunk.len() as u64;
        trace!("Appended {} bytes, {} retained", chunk.len(), self.data.len());

        Ok(())
    }

    /// Copy out the first `size` unconsumed bytes without consuming them
    pub fn take_window(&self, size: usize) -> Result<Bytes, BufferError> {
        if size > self.data.len() {
            return Err(BufferError::Insufficient {
                requested: size,
                available: self.data.len(),
            });
        }

        Ok(Bytes::copy_from_slice(&self.data[..size]))
    }

    /// Advance the read cursor by `n` bytes (clamped to what is retained)
    pub fn drop_consumed(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.advance(n);
        trace!("Dropped {} consumed bytes, {} retained", n, self.data.len());
    }

    /// Number of unconsumed bytes currently retained
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Space left before the ceiling is reached
    pub fn free_space(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Bytes appended since creation or the last clear
    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }

    /// Discard all retained data
    pub fn clear(&mut self) {
        self.data.clear();
        self.total_appended = 0;
        debug!("Cleared session buffer");
    }
}

impl Default for SessionBuffer {
    fn default() -> Self {
        Self::new()
    }
}
