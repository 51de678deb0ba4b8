//! Fixed-capacity ring buffer for reconnecting-PTY scrollback.
//!
//! Pushing more bytes than `capacity` silently evicts the oldest bytes from
//! the front, so memory usage is bounded regardless of how long a session
//! has been running. A late-attaching subscriber calls [`RingBuffer::to_vec`]
//! under the buffer's read lock (see [`super::registry`]) to replay exactly
//! the prefix of output the process has produced, up to `capacity` bytes.

use std::collections::VecDeque;

/// Scrollback capacity mandated by the reconnecting-PTY engine: 64 KiB.
pub const SCROLLBACK_CAPACITY: usize = 64 * 1024;

/// Fixed-capacity byte ring buffer.
pub struct RingBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl RingBuffer {
    /// Create a new ring buffer with the given byte capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RingBuffer capacity must be > 0");
        Self {
            buf: VecDeque::with_capacity(capacity.min(65_536)),
            capacity,
        }
    }

    /// Create a ring buffer sized to [`SCROLLBACK_CAPACITY`] (64 KiB).
    #[must_use]
    pub fn with_scrollback_capacity() -> Self {
        Self::new(SCROLLBACK_CAPACITY)
    }

    /// Append `data`, evicting the oldest bytes if the buffer would
    /// otherwise exceed its capacity.
    ///
    /// If `data.len() >= capacity`, only the last `capacity` bytes of
    /// `data` are retained.
    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if data.len() >= self.capacity {
            self.buf.clear();
            let start = data.len() - self.capacity;
            self.buf.extend(&data[start..]);
            return;
        }

        let needed = self.buf.len() + data.len();
        if needed > self.capacity {
            let to_drain = needed - self.capacity;
            self.buf.drain(..to_drain);
        }

        self.buf.extend(data);
    }

    /// Return a contiguous copy of all buffered bytes (oldest first).
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let (a, b) = self.buf.as_slices();
        let mut v = Vec::with_capacity(a.len() + b.len());
        v.extend_from_slice(a);
        v.extend_from_slice(b);
        v
    }

    /// Current number of buffered bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if no bytes are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
