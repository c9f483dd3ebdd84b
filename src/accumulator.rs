/// Per-connection byte accumulator for contiguous receive data.
///
/// The decode loop always sees a contiguous `&[u8]` window; a partial
/// trailing frame simply stays in the buffer until the next readiness event
/// delivers the missing bytes. Consumed bytes are released in O(1) via
/// `advance()` instead of shifting.
use bytes::{Buf, BytesMut};

pub(crate) struct RecvAccumulator {
    buf: BytesMut,
}

impl RecvAccumulator {
    /// Create a new accumulator with the given initial capacity.
    pub fn new(capacity: usize) -> Self {
        RecvAccumulator {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Append received bytes. Grows the buffer if necessary.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The current contiguous window.
    pub fn data(&self) -> &[u8] {
        &self.buf[..]
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Consume `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        debug_assert!(
            n <= self.buf.len(),
            "consume({n}) exceeds buffer length {}",
            self.buf.len()
        );
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_consume() {
        let mut acc = RecvAccumulator::new(64);
        acc.append(b"hello ");
        acc.append(b"world");
        assert_eq!(acc.data(), b"hello world");
        acc.consume(6);
        assert_eq!(acc.data(), b"world");
        acc.consume(5);
        assert_eq!(acc.data(), b"");
        assert_eq!(acc.len(), 0);
    }

    #[test]
    fn grow_on_overflow() {
        let mut acc = RecvAccumulator::new(4);
        acc.append(b"abcdef");
        assert_eq!(acc.data(), b"abcdef");
    }

    #[test]
    fn consume_zero_is_noop() {
        let mut acc = RecvAccumulator::new(8);
        acc.append(b"xy");
        acc.consume(0);
        assert_eq!(acc.data(), b"xy");
    }
}
