//! Sample-rate conversion between the capture device and the pipeline.
//!
//! `cpal` delivers audio at the device's native rate (48 kHz is common);
//! the spotting pipeline runs at a fixed configured rate (16 kHz by
//! default). `RateConverter` bridges that gap on the pipeline thread,
//! where allocation is allowed.
//!
//! When the two rates already match it is a zero-copy passthrough — no
//! rubato session is created at all. Otherwise input is accumulated until
//! a whole block is available, because `FastFixedIn` only accepts
//! fixed-size input frames.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{KeyspotError, Result};

/// Converts f32 mono audio from the device rate to the pipeline rate.
pub struct RateConverter {
    /// `None` when device rate == pipeline rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Carries partial input blocks between `process` calls.
    pending: Vec<f32>,
    /// Input frames rubato consumes per call.
    block_size: usize,
    /// Pre-allocated `[1][output_frames_max]` output buffer.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// Returns `KeyspotError::AudioDevice` if rubato fails to initialise.
    pub fn new(device_rate: u32, pipeline_rate: u32, block_size: usize) -> Result<Self> {
        if device_rate == pipeline_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                block_size,
                output_buf: Vec::new(),
            });
        }

        let ratio = pipeline_rate as f64 / device_rate as f64;
        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio, no dynamic adjustment
            PolynomialDegree::Cubic,
            block_size,
            1, // mono
        )
        .map_err(|e| KeyspotError::AudioDevice(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        tracing::debug!(device_rate, pipeline_rate, block_size, max_out, "resampler ready");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::new(),
            block_size,
            output_buf,
        })
    }

    /// Feed device-rate samples, get pipeline-rate samples out.
    ///
    /// May return an empty vec while input is still accumulating toward a
    /// whole block.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);

        let mut result = Vec::new();
        while self.pending.len() >= self.block_size {
            let block = &self.pending[..self.block_size];
            match resampler.process_into_buffer(&[block], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }
            self.pending.drain(..self.block_size);
        }

        result
    }

    /// `true` when no resampling occurs.
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 512).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..300).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
    }

    #[test]
    fn downsampling_48k_to_16k_thirds_the_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 512).unwrap();
        assert!(!rc.is_passthrough());
        let out = rc.process(&vec![0.0f32; 1536]);
        assert!(!out.is_empty());
        // 1536 device samples → ~512 pipeline samples
        assert!(
            (out.len() as isize - 512).unsigned_abs() <= 8,
            "len={}",
            out.len()
        );
    }

    #[test]
    fn partial_block_is_held_back() {
        let mut rc = RateConverter::new(48_000, 16_000, 512).unwrap();
        assert!(rc.process(&vec![0.0f32; 300]).is_empty());
        // 300 + 300 ≥ 512 → one block processed
        assert!(!rc.process(&vec![0.0f32; 300]).is_empty());
    }
}
