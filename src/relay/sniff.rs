//! First-byte container detection and the lossy bridge into the ring buffer.

use crate::media::{ByteSink, MediaType};

const FLV_MARKER: u8 = b'F';
const TS_SYNC_BYTE: u8 = 0x47;

/// Classifies a stream from the first byte of its first payload.
pub fn detect(data: &[u8]) -> MediaType {
    match data.first() {
        Some(&FLV_MARKER) => MediaType::Flv,
        Some(&TS_SYNC_BYTE) => MediaType::Ts,
        _ => MediaType::Unknown,
    }
}

/// Outcome of [`push_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pushed {
    pub written: usize,
    pub dropped: usize,
}

/// Offers `data` to `sink` until every byte is accepted or a put accepts
/// nothing; whatever is left at that point is dropped.
pub fn push_all<S: ByteSink + ?Sized>(sink: &mut S, data: &[u8]) -> Pushed {
    let mut written = 0;
    while written < data.len() {
        let n = sink.put(&data[written..]);
        if n == 0 {
            break;
        }
        written += n;
    }
    Pushed {
        written,
        dropped: data.len() - written,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::byte_ring;
    use ringbuf::traits::Observer;

    /// Accepts at most `chunk` bytes per put, up to `limit` in total.
    struct ChunkySink {
        chunk: usize,
        limit: usize,
        received: Vec<u8>,
        calls: usize,
    }

    impl ChunkySink {
        fn new(chunk: usize, limit: usize) -> Self {
            Self {
                chunk,
                limit,
                received: Vec::new(),
                calls: 0,
            }
        }
    }

    impl ByteSink for ChunkySink {
        fn put(&mut self, data: &[u8]) -> usize {
            self.calls += 1;
            let room = self.limit - self.received.len();
            let n = data.len().min(self.chunk).min(room);
            self.received.extend_from_slice(&data[..n]);
            n
        }
    }

    #[test]
    fn test_detect_markers() {
        assert_eq!(detect(b"FLV\x01\x05"), MediaType::Flv);
        assert_eq!(detect(&[0x47, 0x40, 0x00, 0x10]), MediaType::Ts);
        assert_eq!(detect(b"\x00\x00\x01\xba"), MediaType::Unknown);
        assert_eq!(detect(b""), MediaType::Unknown);
    }

    #[test]
    fn test_push_all_retries_short_puts() {
        let mut sink = ChunkySink::new(3, usize::MAX);
        let pushed = push_all(&mut sink, b"0123456789");

        assert_eq!(pushed, Pushed { written: 10, dropped: 0 });
        assert_eq!(&sink.received[..], b"0123456789");
        assert_eq!(sink.calls, 4);
    }

    #[test]
    fn test_push_all_drops_tail_when_full() {
        let mut sink = ChunkySink::new(3, 7);
        let pushed = push_all(&mut sink, b"0123456789");

        assert_eq!(pushed, Pushed { written: 7, dropped: 3 });
        assert_eq!(&sink.received[..], b"0123456");
    }

    #[test]
    fn test_push_all_into_ring_buffer() {
        let (mut producer, _consumer) = byte_ring(8);
        assert_eq!(push_all(&mut producer, b"abcdef").dropped, 0);

        let pushed = push_all(&mut producer, b"ghijkl");
        assert_eq!(pushed, Pushed { written: 2, dropped: 4 });
        assert_eq!(producer.occupied_len(), 8);
    }
}
