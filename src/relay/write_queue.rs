// src/relay/write_queue.rs - Outbound byte queue for non-blocking sockets
//
// Core features:
// - Partial write support (per-entry offset)
// - WouldBlock leaves the remainder queued for the next writable event
// - Used for the request a pull connection sends after connecting

use bytes::Bytes;
use std::collections::VecDeque;
use std::io::{self, Write};

/// Queue entry
struct WriteEntry {
    data: Bytes,
    offset: usize,
}

impl WriteEntry {
    fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    fn advance(&mut self, n: usize) {
        self.offset += n;
    }

    fn is_complete(&self) -> bool {
        self.offset >= self.data.len()
    }
}

/// Flush result
#[derive(Debug)]
pub enum FlushResult {
    /// Queue fully flushed
    Complete { bytes_written: usize },
    /// WouldBlock encountered, partial write
    WouldBlock { bytes_written: usize },
    /// Connection closed
    Closed,
}

/// Write queue with partial write support
pub struct WriteQueue {
    queue: VecDeque<WriteEntry>,
    total_bytes: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::with_capacity(4),
            total_bytes: 0,
        }
    }

    pub fn enqueue(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.total_bytes += data.len();
        self.queue.push_back(WriteEntry { data, offset: 0 });
    }

    /// Try to flush to writer
    pub fn try_flush<W: Write>(&mut self, writer: &mut W) -> io::Result<FlushResult> {
        let mut bytes_written = 0;

        while let Some(entry) = self.queue.front_mut() {
            match writer.write(entry.remaining()) {
                Ok(0) => return Ok(FlushResult::Closed),
                Ok(n) => {
                    bytes_written += n;
                    self.total_bytes = self.total_bytes.saturating_sub(n);
                    entry.advance(n);
                    if entry.is_complete() {
                        self.queue.pop_front();
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushResult::WouldBlock { bytes_written });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(FlushResult::Complete { bytes_written })
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Bytes still waiting to be written
    pub fn pending_bytes(&self) -> usize {
        self.total_bytes
    }
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}
