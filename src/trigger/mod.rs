//! Energy-based capture trigger.
//!
//! ## Algorithm
//!
//! 1. Compute the mean absolute sample value of the incoming chunk
//!    (linear amplitude on the signed 16-bit scale, not dB).
//! 2. A chunk triggers capture when the score is strictly above the
//!    configured threshold.
//!
//! The decision is a pure function of the chunk — no hangover counters,
//! no hidden state — so the same chunk always scores the same.

use crate::buffering::chunk::AudioChunk;

/// Threshold comparator over the mean-absolute loudness of a chunk.
#[derive(Debug, Clone, Copy)]
pub struct EnergyTrigger {
    /// Mean-absolute amplitude above which a chunk triggers capture.
    /// On the i16 scale; 1000 is a reasonable default for a close mic.
    threshold: f32,
}

impl EnergyTrigger {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Mean absolute value of the chunk's samples. Empty chunks score 0.
    pub fn score(chunk: &AudioChunk) -> f32 {
        if chunk.samples.is_empty() {
            return 0.0;
        }
        let sum: u64 = chunk
            .samples
            .iter()
            .map(|&s| (s as i32).unsigned_abs() as u64)
            .sum();
        (sum as f64 / chunk.samples.len() as f64) as f32
    }

    /// Strict comparison: a score exactly at the threshold does not trigger.
    pub fn is_triggered(&self, chunk: &AudioChunk) -> bool {
        Self::score(chunk) > self.threshold
    }
}

impl Default for EnergyTrigger {
    fn default() -> Self {
        Self::new(1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_of(value: i16, len: usize) -> AudioChunk {
        AudioChunk::new(vec![value; len], 0)
    }

    #[test]
    fn silence_never_triggers() {
        let trigger = EnergyTrigger::default();
        assert_eq!(EnergyTrigger::score(&chunk_of(0, 1024)), 0.0);
        assert!(!trigger.is_triggered(&chunk_of(0, 1024)));
    }

    #[test]
    fn max_amplitude_triggers_default_threshold() {
        let trigger = EnergyTrigger::new(1000.0);
        let chunk = chunk_of(i16::MAX, 1024);
        assert!(trigger.is_triggered(&chunk));
        assert!((EnergyTrigger::score(&chunk) - 32767.0).abs() < 1e-3);
    }

    #[test]
    fn score_at_threshold_does_not_trigger() {
        let trigger = EnergyTrigger::new(500.0);
        assert!(!trigger.is_triggered(&chunk_of(500, 256)));
        assert!(trigger.is_triggered(&chunk_of(501, 256)));
    }

    #[test]
    fn score_is_monotone_under_scaling() {
        let quiet: Vec<i16> = (0..256).map(|i| ((i % 7) as i16) - 3).collect();
        let loud: Vec<i16> = quiet.iter().map(|&s| s * 4).collect();
        let quiet_score = EnergyTrigger::score(&AudioChunk::new(quiet, 0));
        let loud_score = EnergyTrigger::score(&AudioChunk::new(loud, 1));
        assert!(loud_score >= quiet_score);
    }

    #[test]
    fn negative_extreme_does_not_overflow() {
        let chunk = chunk_of(i16::MIN, 64);
        assert!((EnergyTrigger::score(&chunk) - 32768.0).abs() < 1e-3);
    }

    #[test]
    fn empty_chunk_scores_zero() {
        assert_eq!(EnergyTrigger::score(&AudioChunk::new(vec![], 0)), 0.0);
    }
}
