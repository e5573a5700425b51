//! Receive buffer
//!
//! Accumulates inbound bytes across ticks. The engine appends at `size`;
//! the codec consumes from `position`. Nothing is dropped until the next
//! step attempt resets the buffer.

use super::{DEFAULT_RECEIVE_CAPACITY, RECEIVE_SLACK};

/// Growable inbound byte buffer
#[derive(Debug)]
pub struct ReceiveBuffer {
    /// Backing storage; its length is the capacity
    data: Vec<u8>,
    /// Bytes held
    size: usize,
    /// Consumer cursor, owned by the codec
    position: usize,
    /// Extra bytes added on every growth
    slack: usize,
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RECEIVE_CAPACITY, RECEIVE_SLACK)
    }
}

impl ReceiveBuffer {
    /// Create a buffer with an initial capacity and growth slack
    pub fn with_capacity(capacity: usize, slack: usize) -> Self {
        Self {
            data: vec![0; capacity],
            size: 0,
            position: 0,
            slack,
        }
    }

    /// Bytes held
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current capacity
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Consumer cursor
    pub fn position(&self) -> usize {
        self.position
    }

    /// True if no bytes are held
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// All bytes held since the last reset
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Bytes not yet consumed by the codec
    pub fn unread(&self) -> &[u8] {
        &self.data[self.position..self.size]
    }

    /// Mark `n` unread bytes as consumed
    pub fn consume(&mut self, n: usize) {
        self.position = (self.position + n).min(self.size);
    }

    /// Make room for `incoming` more bytes
    ///
    /// Grows to `size + incoming + slack` only when the bytes would not fit.
    pub fn reserve(&mut self, incoming: usize) {
        let needed = self.size + incoming;
        if needed > self.data.len() {
            self.data.resize(needed + self.slack, 0);
        }
    }

    /// Writable region of exactly `incoming` bytes past the held data
    ///
    /// Call [`commit`](Self::commit) with the number of bytes actually
    /// written.
    pub fn spare_mut(&mut self, incoming: usize) -> &mut [u8] {
        self.reserve(incoming);
        &mut self.data[self.size..self.size + incoming]
    }

    /// Account for `n` bytes written into [`spare_mut`](Self::spare_mut)
    pub fn commit(&mut self, n: usize) {
        self.size = (self.size + n).min(self.data.len());
    }

    /// Copy bytes in, growing if needed
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        let n = bytes.len();
        self.spare_mut(n).copy_from_slice(bytes);
        self.commit(n);
    }

    /// Forget all held bytes; capacity is kept
    pub fn reset(&mut self) {
        self.size = 0;
        self.position = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_growth_when_it_fits() {
        let mut buf = ReceiveBuffer::with_capacity(16, 20);
        buf.extend_from_slice(&[1; 10]);
        buf.reserve(6);
        assert_eq!(buf.capacity(), 16);
    }

    #[test]
    fn test_growth_adds_slack() {
        let mut buf = ReceiveBuffer::with_capacity(16, 20);
        buf.extend_from_slice(&[1; 10]);
        buf.extend_from_slice(&[2; 10]);
        // 10 held + 10 incoming + 20 slack
        assert_eq!(buf.capacity(), 40);
        assert_eq!(buf.size(), 20);
        assert_eq!(&buf.as_slice()[..10], &[1; 10]);
        assert_eq!(&buf.as_slice()[10..], &[2; 10]);
    }

    #[test]
    fn test_consume_and_reset() {
        let mut buf = ReceiveBuffer::default();
        buf.extend_from_slice(b"abcdef");
        buf.consume(2);
        assert_eq!(buf.unread(), b"cdef");
        buf.consume(100);
        assert!(buf.unread().is_empty());

        let capacity = buf.capacity();
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.capacity(), capacity);
    }

    #[test]
    fn test_partial_commit() {
        let mut buf = ReceiveBuffer::with_capacity(4, 20);
        let spare = buf.spare_mut(8);
        spare[..3].copy_from_slice(&[7, 8, 9]);
        buf.commit(3);
        assert_eq!(buf.as_slice(), &[7, 8, 9]);
    }
}
