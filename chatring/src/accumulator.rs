//! Per-connection re-framing of the byte stream onto record boundaries.
//!
//! A recv that does not align with the 515-byte record grid lands here:
//! bytes accumulate until at least one full record fits, complete
//! records are drained, and the partial tail waits for the next recv.

use std::collections::HashMap;
use std::os::fd::RawFd;

use bytes::{Buf, BytesMut};

pub struct RecvAccumulator {
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

    /// Get a reference to the accumulated data.
    pub fn data(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Consume `n` bytes from the front — O(1) via `BytesMut::advance`.
    pub fn consume(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        debug_assert!(n <= self.buf.len());
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Accumulators keyed by client descriptor. An entry exists only while a
/// connection has a partial record pending.
pub struct AccumulatorTable {
    map: HashMap<RawFd, RecvAccumulator>,
    capacity: usize,
}

impl AccumulatorTable {
    pub fn new(capacity: usize) -> Self {
        AccumulatorTable {
            map: HashMap::new(),
            capacity,
        }
    }

    /// Append data for a connection, creating its accumulator on demand.
    pub fn append(&mut self, fd: RawFd, data: &[u8]) {
        let capacity = self.capacity;
        self.map
            .entry(fd)
            .or_insert_with(|| RecvAccumulator::new(capacity))
            .append(data);
    }

    /// Pending bytes for a connection; empty when none accumulated.
    pub fn data(&self, fd: RawFd) -> &[u8] {
        self.map.get(&fd).map(|a| a.data()).unwrap_or(&[])
    }

    /// Consume `n` bytes from a connection's accumulator, dropping the
    /// entry once it drains.
    pub fn consume(&mut self, fd: RawFd, n: usize) {
        if let Some(acc) = self.map.get_mut(&fd) {
            acc.consume(n);
            if acc.is_empty() {
                self.map.remove(&fd);
            }
        }
    }

    /// Whether a connection has bytes waiting for a record boundary.
    pub fn has_pending(&self, fd: RawFd) -> bool {
        self.map.contains_key(&fd)
    }

    /// Discard any pending bytes for a connection.
    pub fn remove(&mut self, fd: RawFd) {
        self.map.remove(&fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_chat::FRAME_LEN;

    #[test]
    fn append_and_consume() {
        let mut acc = RecvAccumulator::new(64);
        acc.append(b"hello ");
        acc.append(b"world");
        assert_eq!(acc.data(), b"hello world");
        acc.consume(6);
        assert_eq!(acc.data(), b"world");
        acc.consume(5);
        assert!(acc.is_empty());
    }

    #[test]
    fn straddled_record_reassembles() {
        let mut table = AccumulatorTable::new(FRAME_LEN);
        let mut record = vec![0u8; FRAME_LEN];
        record[0] = 0x13;
        record[1] = 2; // length = 2
        record[3] = b'h';
        record[4] = b'i';

        // The record arrives split across two receives.
        table.append(9, &record[..300]);
        assert!(table.data(9).len() < FRAME_LEN);
        table.append(9, &record[300..]);
        assert_eq!(table.data(9).len(), FRAME_LEN);
        assert_eq!(table.data(9), &record[..]);

        table.consume(9, FRAME_LEN);
        assert!(!table.has_pending(9));
    }

    #[test]
    fn multiple_records_drain_in_order() {
        let mut table = AccumulatorTable::new(64);
        table.append(1, b"aaa");
        table.append(1, b"bbb");
        assert_eq!(table.data(1), b"aaabbb");
        table.consume(1, 3);
        assert_eq!(table.data(1), b"bbb");
    }

    #[test]
    fn remove_discards_partial_tail() {
        let mut table = AccumulatorTable::new(64);
        table.append(2, b"partial");
        table.remove(2);
        assert!(table.data(2).is_empty());
        assert!(!table.has_pending(2));
    }
}
