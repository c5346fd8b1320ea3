//! Fixed-capacity byte FIFO.
//!
//! Used for UART-style transmit/receive FIFOs: pushes fail once the buffer
//! is full rather than overwriting the oldest byte.

use thiserror::Error;

/// Returned by [`ByteRing::push`] when the ring has no free slot.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("byte ring is full")]
pub struct RingFull;

/// Circular buffer of bytes with a capacity fixed at construction.
#[derive(Debug, Clone)]
pub struct ByteRing {
    data: Box<[u8]>,
    /// Index of the oldest byte.
    front: usize,
    /// Number of bytes stored.
    len: usize,
}

impl ByteRing {
    /// Create an empty ring that holds up to `capacity` bytes.
    ///
    /// A zero-capacity ring is valid; every push on it fails.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            front: 0,
            len: 0,
        }
    }

    /// Append a byte at the back.
    pub fn push(&mut self, byte: u8) -> Result<(), RingFull> {
        if self.is_full() {
            return Err(RingFull);
        }
        let rear = (self.front + self.len) % self.data.len();
        self.data[rear] = byte;
        self.len += 1;
        Ok(())
    }

    /// Remove and return the byte at the front.
    pub fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let byte = self.data[self.front];
        self.front = (self.front + 1) % self.data.len();
        self.len -= 1;
        Some(byte)
    }

    /// Return the byte at the front without removing it.
    pub fn peek(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[self.front])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Drop every stored byte.
    pub fn clear(&mut self) {
        self.front = 0;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut ring = ByteRing::new(4);
        for b in [1, 2, 3] {
            ring.push(b).unwrap();
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_full_rejects_push() {
        let mut ring = ByteRing::new(2);
        ring.push(0xaa).unwrap();
        ring.push(0xbb).unwrap();
        assert!(ring.is_full());
        assert_eq!(ring.push(0xcc), Err(RingFull));
        assert_eq!(ring.peek(), Some(0xaa));
    }

    #[test]
    fn test_wraps_around() {
        let mut ring = ByteRing::new(3);
        let mut out = Vec::new();
        for b in 0..10u8 {
            ring.push(b).unwrap();
            if ring.len() == 2 {
                out.push(ring.pop().unwrap());
            }
        }
        while let Some(b) = ring.pop() {
            out.push(b);
        }
        assert_eq!(out, (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn test_zero_capacity() {
        let mut ring = ByteRing::new(0);
        assert!(ring.is_empty());
        assert!(ring.is_full());
        assert_eq!(ring.push(1), Err(RingFull));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_clear() {
        let mut ring = ByteRing::new(4);
        ring.push(7).unwrap();
        ring.push(8).unwrap();
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.capacity(), 4);
        ring.push(9).unwrap();
        assert_eq!(ring.pop(), Some(9));
    }
}
