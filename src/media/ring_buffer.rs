// src/media/ring_buffer.rs - Bounded byte FIFO between ingest and the media binder
//
// Core features:
// - Lock-free single-producer/single-consumer ring (`ringbuf::HeapRb<u8>`)
// - The channel context owns the producer half; the binder thread owns the consumer half
// - `put` accepts as much as fits and never blocks; the rest is the caller's to drop

use ringbuf::traits::{Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// Writing half, held by the receive path.
pub type RingProducer = HeapProd<u8>;

/// Reading half, moved into the binder thread.
pub type RingConsumer = HeapCons<u8>;

/// Anything that accepts bytes without blocking, possibly fewer than offered.
pub trait ByteSink {
    /// Enqueues a prefix of `data` and returns its length (0 when full).
    fn put(&mut self, data: &[u8]) -> usize;
}

impl ByteSink for RingProducer {
    fn put(&mut self, data: &[u8]) -> usize {
        self.push_slice(data)
    }
}

/// Allocates a ring of `capacity` bytes (at least one) and splits it.
pub fn byte_ring(capacity: usize) -> (RingProducer, RingConsumer) {
    HeapRb::<u8>::new(capacity.max(1)).split()
}
