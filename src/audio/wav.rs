//! WAV persistence for captured utterances.
//!
//! Every finalized capture is written as mono 16-bit PCM at the pipeline
//! sample rate, overwriting the previous artifact. The file is the
//! contract boundary to external tooling: the presentation layer can
//! inspect or replay the last capture independently of the engine.

use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::debug;

use crate::error::{KeyspotError, Result};

/// Write `samples` as a mono 16-bit PCM WAV file, overwriting any prior file.
pub fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;

    debug!(path = %path.display(), samples = samples.len(), sample_rate, "wrote capture");
    Ok(())
}

/// Read a mono 16-bit PCM WAV file back into samples + sample rate.
///
/// # Errors
/// Rejects multi-channel or non-16-bit-int files rather than converting.
pub fn read_wav(path: &Path) -> Result<(Vec<i16>, u32)> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();

    if spec.channels != 1 || spec.bits_per_sample != 16 || spec.sample_format != SampleFormat::Int
    {
        return Err(KeyspotError::AudioDevice(format!(
            "unsupported WAV format: {} ch / {} bit {:?}",
            spec.channels, spec.bits_per_sample, spec.sample_format
        )));
    }

    let samples = reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok((samples, spec.sample_rate))
}
