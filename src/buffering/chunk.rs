//! Typed audio chunk passed from the source to the trigger and capture stages.

/// A fixed-size block of consecutively sampled mono 16-bit PCM audio.
///
/// Tagged with a monotonically increasing sequence index assigned by the
/// producing source. Treated as immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Mono signed 16-bit samples.
    pub samples: Vec<i16>,
    /// Monotone sequence index within one source lifetime.
    pub seq: u64,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, seq: u64) -> Self {
        Self { samples, seq }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration of this chunk at the given sample rate, in seconds.
    pub fn duration_secs(&self, sample_rate: u32) -> f64 {
        self.samples.len() as f64 / sample_rate as f64
    }
}
