//! Audio input via the cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not**:
//! - Allocate heap memory
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! The callback therefore only writes into an SPSC ring buffer producer
//! whose `push_slice` is lock-free and allocation-free. All chunk assembly,
//! resampling, and i16 conversion happen on the pipeline thread inside
//! [`AudioSource::read_chunk`].
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio
//! on macOS). [`CpalSource`] must be created and dropped on the same
//! thread; the engine does this by opening it inside `spawn_blocking`.

pub mod resample;
pub mod wav;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, Stream, StreamConfig,
};

use crate::{
    buffering::chunk::AudioChunk,
    error::{KeyspotError, Result},
};
#[cfg(feature = "audio-cpal")]
use crate::{
    audio::resample::RateConverter,
    buffering::{create_sample_ring, Consumer, SampleConsumer},
};
#[cfg(feature = "audio-cpal")]
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// A live PCM input yielding fixed-size chunks on demand.
///
/// `read_chunk` blocks the calling thread until a full chunk is available;
/// it never returns a short read. `close` is idempotent.
pub trait AudioSource {
    /// Pipeline sample rate of the produced chunks (Hz).
    fn sample_rate(&self) -> u32;

    /// Samples per chunk.
    fn chunk_size(&self) -> usize;

    /// Block until exactly `chunk_size` samples are available.
    ///
    /// On device buffer overflow, samples are dropped upstream and the
    /// next full-size chunk is still returned — the length contract holds.
    ///
    /// # Errors
    /// `SourceClosed` after `close`, `AudioStream` if the device stream died.
    fn read_chunk(&mut self) -> Result<AudioChunk>;

    /// Release the device. Safe to call multiple times.
    fn close(&mut self);
}

/// How many device-rate samples to drain from the ring per iteration,
/// and the rubato input block size.
#[cfg(feature = "audio-cpal")]
const DRAIN_BLOCK: usize = 512;

/// Sleep while the ring is empty (avoids busy-wait burning a core).
#[cfg(feature = "audio-cpal")]
const EMPTY_SLEEP_MS: u64 = 2;

/// Microphone-backed [`AudioSource`].
///
/// **Not `Send`** — holds a `cpal::Stream` bound to its creation thread.
#[cfg(feature = "audio-cpal")]
pub struct CpalSource {
    /// Kept alive so the stream is not dropped prematurely.
    stream: Option<Stream>,
    /// Gate for the callback — set to `false` to make it a no-op.
    running: Arc<AtomicBool>,
    /// Set by the cpal error callback when the stream dies.
    failed: Arc<AtomicBool>,
    consumer: SampleConsumer,
    converter: RateConverter,
    /// Pipeline-rate i16 samples awaiting chunk assembly.
    pending: Vec<i16>,
    scratch: Vec<f32>,
    sample_rate: u32,
    chunk_size: usize,
    next_seq: u64,
    closed: bool,
}

#[cfg(feature = "audio-cpal")]
impl CpalSource {
    /// Open an input stream: preferred device by name, otherwise the
    /// default input device, otherwise the first available one.
    ///
    /// # Errors
    /// `NoDefaultInputDevice` when no microphone exists, `AudioDevice` /
    /// `AudioStream` when the device rejects the configuration.
    pub fn open(
        sample_rate: u32,
        chunk_size: usize,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let mut selected_device = None;

        if let Some(preferred) = preferred_device_name {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected_device = devices
                        .find(|d| d.name().map(|n| n == preferred).unwrap_or(false));
                    if selected_device.is_none() {
                        warn!("preferred input device '{preferred}' not found, falling back");
                    }
                }
                Err(e) => {
                    warn!("failed to list input devices while resolving preference: {e}");
                }
            }
        }

        let device = if let Some(device) = selected_device {
            device
        } else if let Some(default) = host.default_input_device() {
            default
        } else {
            let mut devices = host
                .input_devices()
                .map_err(|e| KeyspotError::AudioDevice(e.to_string()))?;
            let fallback = devices.next().ok_or(KeyspotError::NoDefaultInputDevice)?;
            warn!("no default input device, falling back to first available input");
            fallback
        };

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| KeyspotError::AudioDevice(e.to_string()))?;

        let device_rate = supported.sample_rate().0;
        let channels = supported.channels();

        info!(device_rate, channels, sample_rate, "audio config selected");

        let config = StreamConfig {
            channels,
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let (mut producer, consumer) = create_sample_ring();
        let running = Arc::new(AtomicBool::new(true));
        let failed = Arc::new(AtomicBool::new(false));

        let running_cb = Arc::clone(&running);
        let err_failed = Arc::clone(&failed);
        let err_fn = move |err| {
            error!("audio stream error: {err}");
            err_failed.store(true, Ordering::Release);
        };

        let ch = channels as usize;
        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let mut mix_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if !running_cb.load(Ordering::Relaxed) {
                            return;
                        }
                        if ch == 1 {
                            push_frames(&mut producer, data);
                        } else {
                            downmix(&mut mix_buf, data, ch, |s| s);
                            push_frames(&mut producer, &mix_buf);
                        }
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::I16 => {
                let mut mix_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !running_cb.load(Ordering::Relaxed) {
                            return;
                        }
                        downmix(&mut mix_buf, data, ch, |s| s as f32 / 32768.0);
                        push_frames(&mut producer, &mix_buf);
                    },
                    err_fn,
                    None,
                )
            }
            fmt => {
                return Err(KeyspotError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| KeyspotError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| KeyspotError::AudioStream(e.to_string()))?;

        let converter = RateConverter::new(device_rate, sample_rate, DRAIN_BLOCK)?;

        Ok(Self {
            stream: Some(stream),
            running,
            failed,
            consumer,
            converter,
            pending: Vec::with_capacity(chunk_size * 2),
            scratch: vec![0f32; DRAIN_BLOCK],
            sample_rate,
            chunk_size,
            next_seq: 0,
            closed: false,
        })
    }
}

/// Average interleaved frames down to mono into `out`.
#[cfg(feature = "audio-cpal")]
fn downmix<T: Copy>(out: &mut Vec<f32>, data: &[T], channels: usize, to_f32: impl Fn(T) -> f32) {
    let frames = data.len() / channels;
    out.resize(frames, 0.0);
    for f in 0..frames {
        let base = f * channels;
        let mut sum = 0f32;
        for c in 0..channels {
            sum += to_f32(data[base + c]);
        }
        out[f] = sum / channels as f32;
    }
}

/// Push into the ring; on overflow drop the remainder and log. Returns
/// `false` when frames were dropped.
#[cfg(feature = "audio-cpal")]
fn push_frames(producer: &mut crate::buffering::SampleProducer, frames: &[f32]) -> bool {
    use crate::buffering::Producer;

    let written = producer.push_slice(frames);
    if written < frames.len() {
        warn!("ring buffer full: dropped {} frames", frames.len() - written);
        return false;
    }
    true
}

#[cfg(feature = "audio-cpal")]
impl AudioSource for CpalSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn read_chunk(&mut self) -> Result<AudioChunk> {
        if self.closed {
            return Err(KeyspotError::SourceClosed);
        }

        loop {
            if self.pending.len() >= self.chunk_size {
                let samples: Vec<i16> = self.pending.drain(..self.chunk_size).collect();
                let chunk = AudioChunk::new(samples, self.next_seq);
                self.next_seq += 1;
                return Ok(chunk);
            }

            if self.failed.load(Ordering::Acquire) {
                return Err(KeyspotError::AudioStream(
                    "input stream reported an error".into(),
                ));
            }

            let drained = self.consumer.pop_slice(&mut self.scratch);
            if drained == 0 {
                std::thread::sleep(std::time::Duration::from_millis(EMPTY_SLEEP_MS));
                continue;
            }

            let converted = self.converter.process(&self.scratch[..drained]);
            self.pending.extend(
                converted
                    .iter()
                    .map(|&s| (s * 32768.0).clamp(-32768.0, 32767.0) as i16),
            );
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.running.store(false, Ordering::Release);
        // Dropping the stream releases the device on this thread.
        self.stream.take();
        self.closed = true;
    }
}

#[cfg(feature = "audio-cpal")]
impl Drop for CpalSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
pub struct CpalSource;

#[cfg(not(feature = "audio-cpal"))]
impl CpalSource {
    pub fn open(
        _sample_rate: u32,
        _chunk_size: usize,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(KeyspotError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl AudioSource for CpalSource {
    fn sample_rate(&self) -> u32 {
        0
    }

    fn chunk_size(&self) -> usize {
        0
    }

    fn read_chunk(&mut self) -> Result<AudioChunk> {
        Err(KeyspotError::SourceClosed)
    }

    fn close(&mut self) {}
}
