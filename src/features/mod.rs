//! Feature extraction: fixed-length framing + log-magnitude spectrogram.
//!
//! Both stages are deterministic, CPU-bound, and bounded by the configured
//! target sample count — the only blocking call in the pipeline remains
//! the audio read.

pub mod framer;
pub mod spectrogram;

pub use framer::Framer;
pub use spectrogram::SpectrogramExtractor;
