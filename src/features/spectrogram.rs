//! Log-magnitude spectrogram extraction.
//!
//! A Hann-windowed, non-detrended sliding FFT over the framed waveform:
//! `window_samples = round(window_ms × rate / 1000)`, advanced by
//! `step_samples = round(step_ms × rate / 1000)` per frame. The output is
//! time-major (`axis 0 = time, axis 1 = frequency`), single-precision,
//! with `log(magnitude + eps)` applied elementwise so silent input stays
//! finite.
//!
//! For a fixed input length the output shape is constant across calls —
//! 99×161 at the defaults (16 000 samples, 20 ms window, 10 ms step).
//! The classifier depends on that shape, so any drift is surfaced as
//! `ShapeMismatch` by the pipeline rather than fed downstream.

use std::sync::Arc;

use ndarray::Array2;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// Turns a fixed-length waveform into a `(time_frames, freq_bins)` matrix.
pub struct SpectrogramExtractor {
    window_samples: usize,
    step_samples: usize,
    eps: f32,
    hann: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl SpectrogramExtractor {
    pub fn new(sample_rate: u32, window_ms: f64, step_ms: f64, eps: f32) -> Self {
        let window_samples = (window_ms * sample_rate as f64 / 1e3).round() as usize;
        let step_samples = (step_ms * sample_rate as f64 / 1e3).round() as usize;
        let hann = build_hann_window(window_samples);
        let fft = Arc::from(FftPlanner::<f32>::new().plan_fft_forward(window_samples));

        Self {
            window_samples,
            step_samples,
            eps,
            hann,
            fft,
        }
    }

    pub fn window_samples(&self) -> usize {
        self.window_samples
    }

    pub fn step_samples(&self) -> usize {
        self.step_samples
    }

    /// Output shape for a waveform of `len` samples: fully determined by
    /// the window/step geometry, never by sample values.
    pub fn shape_for(&self, len: usize) -> (usize, usize) {
        let time_frames = if len < self.window_samples {
            0
        } else {
            (len - self.window_samples) / self.step_samples + 1
        };
        (time_frames, self.window_samples / 2 + 1)
    }

    /// Pure function: identical input yields bit-identical output.
    pub fn extract(&self, waveform: &[f32]) -> Array2<f32> {
        let (time_frames, freq_bins) = self.shape_for(waveform.len());
        let mut spec = Array2::<f32>::zeros((time_frames, freq_bins));
        let mut fft_buf = vec![Complex::new(0.0f32, 0.0); self.window_samples];

        for frame in 0..time_frames {
            let start = frame * self.step_samples;
            for (i, v) in fft_buf.iter_mut().enumerate() {
                *v = Complex::new(waveform[start + i] * self.hann[i], 0.0);
            }
            self.fft.process(&mut fft_buf);

            for k in 0..freq_bins {
                spec[[frame, k]] = (fft_buf[k].norm() + self.eps).ln();
            }
        }

        spec
    }
}

/// Periodic Hann window, matching standard spectral-analysis tooling.
fn build_hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}
