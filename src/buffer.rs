//! Growable byte accumulator backing the per-connection queues.
//!
//! Data read from a socket lands here until the classifier recognizes a
//! complete request, or until the peer on the other side is ready to take
//! it. The buffer itself imposes no upper bound; the session enforces its
//! configured limit on top.

use bytes::{Bytes, BytesMut};

/// Initial capacity for the internal buffer.
const INITIAL_CAPACITY: usize = 4 * 1024;

#[derive(Debug, Default)]
pub(crate) struct Buffer {
    buf: BytesMut,
}

impl Buffer {
    pub(crate) fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Appends new data without discarding unread content.
    pub(crate) fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the unconsumed bytes.
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Removes and returns the first `n` bytes.
    pub(crate) fn take(&mut self, n: usize) -> Bytes {
        self.buf.split_to(n).freeze()
    }

    /// Removes and returns all content, resetting the length to zero.
    pub(crate) fn take_all(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_accumulates() {
        let mut b = Buffer::new();
        b.append(b"abc");
        b.append(b"def");
        assert_eq!(b.as_slice(), b"abcdef");
        assert_eq!(b.len(), 6);
    }

    #[test]
    fn take_all_resets() {
        let mut b = Buffer::new();
        b.append(b"hello");
        assert_eq!(&b.take_all()[..], b"hello");
        assert!(b.is_empty());
        b.append(b"again");
        assert_eq!(b.as_slice(), b"again");
    }

    #[test]
    fn take_leaves_remainder() {
        let mut b = Buffer::new();
        b.append(b"abcdef");
        assert_eq!(&b.take(4)[..], b"abcd");
        assert_eq!(b.as_slice(), b"ef");
    }
}
