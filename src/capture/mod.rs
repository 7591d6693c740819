//! Utterance capture state machine.
//!
//! ## States
//!
//! ```text
//! Idle ──start──► Listening ──trigger──► Capturing ──N chunks──► Finalizing ──► Idle
//!                     │                      │                        │
//!                   cancel                 cancel                  cancel
//!                     └──────────────────────┴───────► Finalizing ──► Stopped
//! ```
//!
//! Listening reads one chunk at a time, feeds the pre-roll buffer, and
//! evaluates the energy trigger. On trigger the output sequence starts
//! from the pre-roll snapshot (which includes the triggering chunk) and
//! exactly `post_trigger_chunks` more chunks are appended. Finalizing
//! closes the source, concatenates everything into an [`Utterance`], and
//! persists it as a WAV file at the configured path.
//!
//! Cancellation is the shared should-run flag, polled at the top of every
//! chunk-read iteration — it takes effect at chunk boundaries only and a
//! partially built capture is still finalized rather than discarded.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::audio::{wav, AudioSource};
use crate::buffering::{chunk::AudioChunk, preroll::PreRollBuffer};
use crate::error::Result;
use crate::trigger::EnergyTrigger;

/// Where the capturer currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Listening,
    Capturing,
    Finalizing,
    Stopped,
}

/// One captured span of audio intended to contain a single spoken command.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl Utterance {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// How a capture cycle ended.
#[derive(Debug)]
pub enum CaptureOutcome {
    /// Trigger fired and the full post-trigger span was recorded.
    Complete(Utterance),
    /// Stop was requested; carries whatever was captured before the stop
    /// (pre-roll only, or a shortened recording), if anything.
    Cancelled(Option<Utterance>),
    /// The optional listen timeout elapsed without a trigger.
    TimedOut,
}

/// Progress notifications, reported through a callback so the capturer
/// stays ignorant of channels and event types.
#[derive(Debug, Clone, Copy)]
pub enum CaptureProgress {
    /// A chunk was scored while listening.
    Scored { seq: u64, level: f32, triggered: bool },
    /// The trigger fired; recording has begun.
    Triggered { level: f32 },
}

/// `ceil(record_seconds × sample_rate / chunk_size)` — the fixed number of
/// chunks read after a trigger.
pub fn post_trigger_chunks(record_seconds: f64, sample_rate: u32, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    (record_seconds * sample_rate as f64 / chunk_size as f64).ceil() as usize
}

/// Drives one source through listen → trigger → record → finalize.
pub struct UtteranceCapturer {
    preroll: PreRollBuffer,
    trigger: EnergyTrigger,
    post_trigger_chunks: usize,
    /// `None` preserves the unbounded reference wait; `Some` bounds the
    /// listen phase as a robustness option.
    listen_timeout: Option<Duration>,
    capture_path: PathBuf,
    state: CaptureState,
}

impl UtteranceCapturer {
    pub fn new(
        trigger: EnergyTrigger,
        preroll: PreRollBuffer,
        post_trigger_chunks: usize,
        listen_timeout: Option<Duration>,
        capture_path: PathBuf,
    ) -> Self {
        Self {
            preroll,
            trigger,
            post_trigger_chunks,
            listen_timeout,
            capture_path,
            state: CaptureState::Idle,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn capture_path(&self) -> &Path {
        &self.capture_path
    }

    /// Run one full capture cycle on an already-open source.
    ///
    /// Blocks until a trigger completes the cycle, `running` goes false,
    /// or the listen timeout elapses. The source is closed on every exit
    /// path, including errors.
    pub fn capture<S>(
        &mut self,
        source: &mut S,
        running: &AtomicBool,
        mut progress: impl FnMut(CaptureProgress),
    ) -> Result<CaptureOutcome>
    where
        S: AudioSource + ?Sized,
    {
        self.preroll.clear();
        self.state = CaptureState::Listening;
        let listen_started = Instant::now();
        let mut cancelled = false;

        // ── LISTENING ────────────────────────────────────────────────────
        loop {
            if !running.load(Ordering::Acquire) {
                cancelled = true;
                break;
            }
            if let Some(limit) = self.listen_timeout {
                if listen_started.elapsed() >= limit {
                    debug!(?limit, "listen timeout elapsed without trigger");
                    self.state = CaptureState::Finalizing;
                    source.close();
                    self.state = CaptureState::Idle;
                    return Ok(CaptureOutcome::TimedOut);
                }
            }

            let chunk = match source.read_chunk() {
                Ok(c) => c,
                Err(e) => {
                    source.close();
                    return Err(e);
                }
            };
            let level = EnergyTrigger::score(&chunk);
            let triggered = level > self.trigger.threshold();
            progress(CaptureProgress::Scored {
                seq: chunk.seq,
                level,
                triggered,
            });
            self.preroll.push(chunk);

            if triggered {
                progress(CaptureProgress::Triggered { level });
                break;
            }
        }

        // ── CAPTURING ────────────────────────────────────────────────────
        // Output starts from the pre-roll snapshot, triggering chunk included.
        let mut chunks = self.preroll.snapshot();
        if !cancelled {
            self.state = CaptureState::Capturing;
            for _ in 0..self.post_trigger_chunks {
                if !running.load(Ordering::Acquire) {
                    cancelled = true;
                    break;
                }
                match source.read_chunk() {
                    Ok(c) => chunks.push(c),
                    Err(e) => {
                        source.close();
                        return Err(e);
                    }
                }
            }
        }

        self.finalize(source, chunks, cancelled)
    }

    /// Close the source, concatenate, persist the WAV artifact.
    fn finalize<S>(
        &mut self,
        source: &mut S,
        chunks: Vec<AudioChunk>,
        cancelled: bool,
    ) -> Result<CaptureOutcome>
    where
        S: AudioSource + ?Sized,
    {
        self.state = CaptureState::Finalizing;
        let sample_rate = source.sample_rate();
        source.close();

        let final_state = if cancelled {
            CaptureState::Stopped
        } else {
            CaptureState::Idle
        };

        let total: usize = chunks.iter().map(AudioChunk::len).sum();
        let mut samples = Vec::with_capacity(total);
        for chunk in &chunks {
            samples.extend_from_slice(&chunk.samples);
        }

        if samples.is_empty() {
            debug!("stop requested before any audio was buffered");
            self.state = final_state;
            return Ok(CaptureOutcome::Cancelled(None));
        }

        let utterance = Utterance {
            samples,
            sample_rate,
        };
        let write_result = wav::write_wav(&self.capture_path, &utterance.samples, sample_rate);
        self.state = final_state;
        write_result?;

        info!(
            chunks = chunks.len(),
            samples = utterance.samples.len(),
            duration_secs = format_args!("{:.2}", utterance.duration_secs()),
            cancelled,
            path = %self.capture_path.display(),
            "capture finalized"
        );

        Ok(if cancelled {
            CaptureOutcome::Cancelled(Some(utterance))
        } else {
            CaptureOutcome::Complete(utterance)
        })
    }
}
