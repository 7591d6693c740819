//! Bounded FIFO of the most recent audio chunks.
//!
//! Keeps the audio immediately preceding a trigger so the captured
//! utterance is not clipped at its onset. Owned exclusively by the
//! capturer; never shared across threads.

use std::collections::VecDeque;

use super::chunk::AudioChunk;

/// Ring buffer of the most recent `capacity` chunks, oldest evicted first.
#[derive(Debug)]
pub struct PreRollBuffer {
    chunks: VecDeque<AudioChunk>,
    capacity: usize,
}

impl PreRollBuffer {
    /// Create a buffer holding at most `capacity` chunks.
    /// `capacity = 0` is valid and disables pre-roll entirely.
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Capacity derived from the chunk geometry:
    /// `ceil(pre_buffer_seconds × sample_rate / chunk_size)`.
    pub fn with_geometry(pre_buffer_seconds: f64, sample_rate: u32, chunk_size: usize) -> Self {
        let capacity = if chunk_size == 0 {
            0
        } else {
            (pre_buffer_seconds * sample_rate as f64 / chunk_size as f64).ceil() as usize
        };
        Self::new(capacity)
    }

    /// Append a chunk, evicting the oldest when over capacity.
    pub fn push(&mut self, chunk: AudioChunk) {
        if self.capacity == 0 {
            return;
        }
        if self.chunks.len() == self.capacity {
            self.chunks.pop_front();
        }
        self.chunks.push_back(chunk);
    }

    /// Current contents oldest-first, without mutating state.
    pub fn snapshot(&self) -> Vec<AudioChunk> {
        self.chunks.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
