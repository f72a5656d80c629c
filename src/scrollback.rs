use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Byte-bounded terminal output history.
///
/// Chunks are appended verbatim. Once the total exceeds `capacity`, bytes are
/// evicted from the head until it fits again; the retained bytes always form
/// a suffix of everything ever pushed.
#[derive(Debug)]
pub struct Scrollback {
    chunks: VecDeque<Bytes>,
    len: usize,
    capacity: usize,
    evicted: u64,
}

impl Scrollback {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
            capacity,
            evicted: 0,
        }
    }

    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);

        let mut excess = self.len.saturating_sub(self.capacity);
        while excess > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.len() <= excess {
                let dropped = front.len();
                self.chunks.pop_front();
                excess -= dropped;
                self.len -= dropped;
                self.evicted += dropped as u64;
            } else {
                let _ = front.split_to(excess);
                self.len -= excess;
                self.evicted += excess as u64;
                excess = 0;
            }
        }
    }

    /// Contiguous copy of the retained output.
    pub fn snapshot(&self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks[0].clone(),
            _ => {
                let mut buf = BytesMut::with_capacity(self.len);
                for chunk in &self.chunks {
                    buf.extend_from_slice(chunk);
                }
                buf.freeze()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes dropped from the head so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Drop all retained output and release its memory.
    pub fn clear(&mut self) {
        self.evicted += self.len as u64;
        self.chunks = VecDeque::new();
        self.len = 0;
    }
}
