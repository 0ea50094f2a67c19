//! Fixed-capacity byte buffer shared between a worker and a listener.
//!
//! `IoBuffer` keeps a `position`/`limit` pair over a fixed allocation:
//! bytes in `position..limit` are the readable window. Output callbacks
//! receive the window of newly read bytes and mark what they consumed by
//! advancing `position` (through [`IoBuffer::consume`] or [`bytes::Buf`]).
//! The stdin fill callback receives a cleared buffer and appends with
//! [`IoBuffer::put_slice`] or [`std::io::Write`].

use std::fmt;

/// Position/limit window over a fixed allocation.
pub struct IoBuffer {
    data: Box<[u8]>,
    position: usize,
    limit: usize,
}

impl IoBuffer {
    /// An empty buffer in fill mode (`position = 0`, `limit = capacity`).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            limit: capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes between `position` and `limit`.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// The readable window.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// Mark `count` bytes of the window consumed.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds [`remaining`](Self::remaining).
    pub fn consume(&mut self, count: usize) {
        assert!(
            count <= self.remaining(),
            "cannot consume {} bytes, only {} remaining",
            count,
            self.remaining()
        );
        self.position += count;
    }

    /// Mark the whole window consumed.
    pub fn consume_all(&mut self) {
        self.position = self.limit;
    }

    /// Move `position`, clamped to `limit`.
    pub fn set_position(&mut self, position: usize) {
        self.position = position.min(self.limit);
    }

    /// Append as much of `src` as fits before `limit`; returns the count copied.
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let count = src.len().min(self.remaining());
        self.data[self.position..self.position + count].copy_from_slice(&src[..count]);
        self.position += count;
        count
    }

    /// Reset to fill mode over the whole capacity.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.data.len();
    }

    /// Switch from filling to draining: the filled prefix becomes the window.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Move unconsumed bytes to the front and switch back to fill mode.
    pub fn compact(&mut self) {
        let remaining = self.remaining();
        self.data.copy_within(self.position..self.limit, 0);
        self.position = remaining;
        self.limit = self.data.len();
    }

    /// True in fill mode when no space is left.
    pub(crate) fn is_full(&self) -> bool {
        self.position == self.data.len()
    }

    /// Writable space in fill mode.
    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.position..self.limit]
    }

    /// Record `count` bytes written into [`spare_mut`](Self::spare_mut).
    pub(crate) fn advance_filled(&mut self, count: usize) {
        debug_assert!(count <= self.remaining());
        self.position += count;
    }
}

impl bytes::Buf for IoBuffer {
    fn remaining(&self) -> usize {
        IoBuffer::remaining(self)
    }

    fn chunk(&self) -> &[u8] {
        self.as_slice()
    }

    fn advance(&mut self, cnt: usize) {
        self.consume(cnt);
    }
}

impl std::io::Write for IoBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(self.put_slice(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("capacity", &self.data.len())
            .finish()
    }
}
