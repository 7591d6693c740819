//! Fixed-length waveform normalization.
//!
//! The classifier consumes exactly `target_samples` samples. Longer
//! captures keep their first `target_samples` (front truncation — the
//! pre-roll already anchors the onset near the start); shorter captures
//! are zero-padded symmetrically with the odd sample going to the right
//! pad. Both policies must hold bit-for-bit since the spectrogram shape
//! depends on them.

/// Normalizes waveforms to an exact sample count.
#[derive(Debug, Clone, Copy)]
pub struct Framer {
    target_samples: usize,
}

impl Framer {
    /// `target_samples = round(sample_rate × target_duration_seconds)`.
    pub fn new(sample_rate: u32, target_duration_seconds: f64) -> Self {
        Self {
            target_samples: (sample_rate as f64 * target_duration_seconds).round() as usize,
        }
    }

    pub fn target_samples(&self) -> usize {
        self.target_samples
    }

    /// Produce exactly `target_samples` f32 samples on the raw i16 scale.
    pub fn frame(&self, waveform: &[i16]) -> Vec<f32> {
        let target = self.target_samples;
        if waveform.len() >= target {
            return waveform[..target].iter().map(|&s| s as f32).collect();
        }

        let pad_left = (target - waveform.len()) / 2;
        let mut framed = vec![0.0f32; target];
        for (dst, &src) in framed[pad_left..].iter_mut().zip(waveform) {
            *dst = src as f32;
        }
        framed
    }
}
