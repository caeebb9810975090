//! # Bounded Response Buffer
//!
//! Fixed-capacity byte buffer for assembling plate responses.
//!
//! The capacity is set once from `bus.buf_size`; [`ResponseBuffer::push`]
//! refuses to write past it, so no response, however malformed, can overrun
//! the buffer.

use core::fmt;

/// Returned when a write would exceed the buffer capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityExceeded {
    pub capacity: usize,
}

impl fmt::Display for CapacityExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "response buffer full ({} bytes)", self.capacity)
    }
}

impl std::error::Error for CapacityExceeded {}

/// Bounds-checked response buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct ResponseBuffer {
    /// Backing storage, allocated to capacity up front
    bytes: Vec<u8>,
    /// Fixed capacity
    capacity: usize,
}

impl ResponseBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append one byte.
    pub fn push(&mut self, byte: u8) -> Result<(), CapacityExceeded> {
        if self.bytes.len() >= self.capacity {
            return Err(CapacityExceeded {
                capacity: self.capacity,
            });
        }
        self.bytes.push(byte);
        Ok(())
    }

    /// Drop all contents, keeping the capacity.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.bytes.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

impl AsRef<[u8]> for ResponseBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for ResponseBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseBuffer({}/{}: ", self.bytes.len(), self.capacity)?;
        for byte in &self.bytes {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_within_capacity() {
        let mut buf = ResponseBuffer::with_capacity(4);
        for b in 0..4 {
            buf.push(b).unwrap();
        }
        assert_eq!(buf.as_slice(), &[0, 1, 2, 3]);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_push_past_capacity() {
        let mut buf = ResponseBuffer::with_capacity(2);
        buf.push(1).unwrap();
        buf.push(2).unwrap();
        assert_eq!(buf.push(3), Err(CapacityExceeded { capacity: 2 }));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut buf = ResponseBuffer::with_capacity(3);
        buf.push(9).unwrap();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 3);
        assert_eq!(buf.remaining(), 3);
    }

    #[test]
    fn test_debug_format() {
        let mut buf = ResponseBuffer::with_capacity(8);
        buf.push(0x18).unwrap();
        buf.push(0xFF).unwrap();
        assert_eq!(format!("{:?}", buf), "ResponseBuffer(2/8: 18ff)");
    }
}
