//! Blocking detection loop.
//!
//! ## Cycle stages (per iteration)
//!
//! ```text
//! 1. Open a fresh AudioSource (factory runs on this thread)
//! 2. Listen: score chunks against the energy trigger, feed pre-roll
//! 3. On trigger: record the fixed post-trigger span, persist WAV
//! 4. Frame to target_samples, extract the log spectrogram
//! 5. Shape-check against the classifier, predict, argmax over vocabulary
//! 6. Broadcast PredictionEvent; back to 1
//! ```
//!
//! The whole loop runs in `spawn_blocking`, keeping the async executor
//! free for event forwarding. Per-cycle failures (WAV I/O, shape,
//! classifier) emit a status detail and the loop keeps listening; only
//! device-level failures stop it.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    audio::AudioSource,
    buffering::preroll::PreRollBuffer,
    capture::{self, CaptureOutcome, CaptureProgress, Utterance, UtteranceCapturer},
    classify::{ClassifierHandle, PredictionResult, Vocabulary},
    engine::EngineConfig,
    error::{KeyspotError, Result},
    features::{Framer, SpectrogramExtractor},
    ipc::events::{AudioActivityEvent, EngineStatus, EngineStatusEvent, PredictionEvent},
    trigger::EnergyTrigger,
};

/// Opens a fresh source at the start of every cycle.
///
/// The factory itself must be `Send` (it is created on the caller's
/// thread and moved into the pipeline), but the sources it produces are
/// only ever used on the pipeline thread and may be `!Send` — cpal
/// streams are.
pub type SourceFactory = Box<dyn FnMut() -> Result<Box<dyn AudioSource>> + Send>;

pub struct PipelineDiagnostics {
    pub chunks_scored: AtomicUsize,
    pub triggers: AtomicUsize,
    pub cycles_completed: AtomicUsize,
    pub cycles_cancelled: AtomicUsize,
    pub inference_calls: AtomicUsize,
    pub inference_errors: AtomicUsize,
    pub predictions_emitted: AtomicUsize,
}

impl Default for PipelineDiagnostics {
    fn default() -> Self {
        Self {
            chunks_scored: AtomicUsize::new(0),
            triggers: AtomicUsize::new(0),
            cycles_completed: AtomicUsize::new(0),
            cycles_cancelled: AtomicUsize::new(0),
            inference_calls: AtomicUsize::new(0),
            inference_errors: AtomicUsize::new(0),
            predictions_emitted: AtomicUsize::new(0),
        }
    }
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.chunks_scored.store(0, Ordering::Relaxed);
        self.triggers.store(0, Ordering::Relaxed);
        self.cycles_completed.store(0, Ordering::Relaxed);
        self.cycles_cancelled.store(0, Ordering::Relaxed);
        self.inference_calls.store(0, Ordering::Relaxed);
        self.inference_errors.store(0, Ordering::Relaxed);
        self.predictions_emitted.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_scored: self.chunks_scored.load(Ordering::Relaxed),
            triggers: self.triggers.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_cancelled: self.cycles_cancelled.load(Ordering::Relaxed),
            inference_calls: self.inference_calls.load(Ordering::Relaxed),
            inference_errors: self.inference_errors.load(Ordering::Relaxed),
            predictions_emitted: self.predictions_emitted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub chunks_scored: usize,
    pub triggers: usize,
    pub cycles_completed: usize,
    pub cycles_cancelled: usize,
    pub inference_calls: usize,
    pub inference_errors: usize,
    pub predictions_emitted: usize,
}

/// All context the pipeline needs, passed as one struct so the closure
/// handed to `spawn_blocking` stays tidy.
pub struct PipelineContext {
    pub config: EngineConfig,
    pub vocabulary: Vocabulary,
    pub classifier: ClassifierHandle,
    pub open_source: SourceFactory,
    pub running: Arc<AtomicBool>,
    pub prediction_tx: broadcast::Sender<PredictionEvent>,
    pub status_tx: broadcast::Sender<EngineStatusEvent>,
    pub activity_tx: broadcast::Sender<AudioActivityEvent>,
    pub status: Arc<Mutex<EngineStatus>>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Run the blocking loop until `ctx.running` becomes false or the device
/// fails.
pub fn run(mut ctx: PipelineContext) {
    info!("pipeline started");

    let framer = Framer::new(ctx.config.sample_rate, ctx.config.target_duration_seconds);
    let extractor = SpectrogramExtractor::new(
        ctx.config.sample_rate,
        ctx.config.window_ms,
        ctx.config.step_ms,
        ctx.config.log_eps,
    );
    let mut capturer = UtteranceCapturer::new(
        EnergyTrigger::new(ctx.config.trigger_threshold),
        PreRollBuffer::with_geometry(
            ctx.config.pre_buffer_seconds,
            ctx.config.sample_rate,
            ctx.config.chunk_size,
        ),
        capture::post_trigger_chunks(
            ctx.config.record_seconds,
            ctx.config.sample_rate,
            ctx.config.chunk_size,
        ),
        ctx.config.listen_timeout,
        ctx.config.capture_path.clone(),
    );

    loop {
        if !ctx.running.load(Ordering::SeqCst) {
            break;
        }

        let mut source = match (ctx.open_source)() {
            Ok(s) => s,
            Err(e) => {
                error!("failed to open audio source: {e}");
                fail_pipeline(&ctx, &e);
                return;
            }
        };

        set_status(
            &ctx,
            EngineStatus::Listening,
            Some("Waiting for sound...".into()),
        );

        let running = Arc::clone(&ctx.running);
        let activity_tx = ctx.activity_tx.clone();
        let status_tx = ctx.status_tx.clone();
        let status_slot = Arc::clone(&ctx.status);
        let diagnostics = Arc::clone(&ctx.diagnostics);

        let outcome = capturer.capture(source.as_mut(), &running, |progress| match progress {
            CaptureProgress::Scored {
                seq,
                level,
                triggered,
            } => {
                diagnostics.chunks_scored.fetch_add(1, Ordering::Relaxed);
                let _ = activity_tx.send(AudioActivityEvent {
                    seq,
                    level,
                    triggered,
                });
            }
            CaptureProgress::Triggered { level } => {
                diagnostics.triggers.fetch_add(1, Ordering::Relaxed);
                debug!(level, "trigger fired");
                *status_slot.lock() = EngineStatus::Capturing;
                let _ = status_tx.send(EngineStatusEvent {
                    status: EngineStatus::Capturing,
                    detail: Some("Sound detected! Recording...".into()),
                });
            }
        });

        match outcome {
            Err(e) if e.is_fatal() => {
                error!("capture failed: {e}");
                fail_pipeline(&ctx, &e);
                return;
            }
            Err(e) => {
                warn!("capture cycle failed: {e}");
                set_status(
                    &ctx,
                    EngineStatus::Listening,
                    Some(format!("capture error: {e}")),
                );
            }
            Ok(CaptureOutcome::TimedOut) => {
                debug!("listen timeout elapsed — restarting cycle");
            }
            Ok(CaptureOutcome::Cancelled(None)) => break,
            Ok(CaptureOutcome::Cancelled(Some(utterance))) => {
                // Classify what made it in before the stop, then exit —
                // the stop request still wins over a fresh cycle.
                ctx.diagnostics
                    .cycles_cancelled
                    .fetch_add(1, Ordering::Relaxed);
                classify_cycle(&mut ctx, &framer, &extractor, &utterance);
                break;
            }
            Ok(CaptureOutcome::Complete(utterance)) => {
                ctx.diagnostics
                    .cycles_completed
                    .fetch_add(1, Ordering::Relaxed);
                classify_cycle(&mut ctx, &framer, &extractor, &utterance);
            }
        }
    }

    set_status(&ctx, EngineStatus::Stopped, None);

    let snap = ctx.diagnostics.snapshot();
    info!(
        chunks_scored = snap.chunks_scored,
        triggers = snap.triggers,
        cycles_completed = snap.cycles_completed,
        cycles_cancelled = snap.cycles_cancelled,
        inference_calls = snap.inference_calls,
        inference_errors = snap.inference_errors,
        predictions_emitted = snap.predictions_emitted,
        "pipeline stopped — diagnostics"
    );
}

/// Device-level failure: status `Error`, flag cleared, loop over.
fn fail_pipeline(ctx: &PipelineContext, e: &KeyspotError) {
    ctx.running.store(false, Ordering::SeqCst);
    set_status(ctx, EngineStatus::Error, Some(e.to_string()));
}

fn set_status(ctx: &PipelineContext, status: EngineStatus, detail: Option<String>) {
    *ctx.status.lock() = status;
    let _ = ctx.status_tx.send(EngineStatusEvent { status, detail });
}

/// Featurize + classify one utterance and broadcast the result.
/// Failures here spoil only this cycle.
fn classify_cycle(
    ctx: &mut PipelineContext,
    framer: &Framer,
    extractor: &SpectrogramExtractor,
    utterance: &Utterance,
) {
    match run_inference(ctx, framer, extractor, utterance) {
        Ok(result) => {
            ctx.diagnostics
                .predictions_emitted
                .fetch_add(1, Ordering::Relaxed);
            let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
            info!(
                seq,
                label = %result.label,
                class_index = result.class_index,
                "prediction emitted"
            );
            let _ = ctx.prediction_tx.send(PredictionEvent {
                seq,
                label: result.label.clone(),
                class_index: result.class_index,
                probabilities: result.probabilities,
            });
            set_status(
                ctx,
                EngineStatus::Listening,
                Some(format!("Predicted command: {}", result.label)),
            );
        }
        Err(e) => {
            ctx.diagnostics
                .inference_errors
                .fetch_add(1, Ordering::Relaxed);
            warn!("inference cycle failed: {e}");
            set_status(
                ctx,
                EngineStatus::Listening,
                Some(format!("inference error: {e}")),
            );
        }
    }
}

fn run_inference(
    ctx: &mut PipelineContext,
    framer: &Framer,
    extractor: &SpectrogramExtractor,
    utterance: &Utterance,
) -> Result<PredictionResult> {
    ctx.diagnostics
        .inference_calls
        .fetch_add(1, Ordering::Relaxed);

    let framed = framer.frame(&utterance.samples);
    let spectrogram = extractor.extract(&framed);

    let probabilities = {
        let mut classifier = ctx.classifier.0.lock();

        if let Some((expected_frames, expected_bins)) = classifier.expected_shape() {
            let (actual_frames, actual_bins) = spectrogram.dim();
            if (actual_frames, actual_bins) != (expected_frames, expected_bins) {
                return Err(KeyspotError::ShapeMismatch {
                    expected_frames,
                    expected_bins,
                    actual_frames,
                    actual_bins,
                });
            }
        }

        classifier.predict(&spectrogram)?
    };

    PredictionResult::from_probabilities(&ctx.vocabulary, probabilities)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::thread;
    use std::time::{Duration, Instant};

    use ndarray::Array2;
    use tokio::sync::broadcast::error::TryRecvError;

    use crate::buffering::chunk::AudioChunk;
    use crate::classify::{stub::StubClassifier, Classifier};

    const CHUNK: usize = 64;

    struct ScriptedSource {
        script: VecDeque<Vec<i16>>,
        reads: u64,
        closed: bool,
        cancel_after: Option<(u64, Arc<AtomicBool>)>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Vec<i16>>) -> Self {
            Self {
                script: script.into(),
                reads: 0,
                closed: false,
                cancel_after: None,
            }
        }

        fn cancel_after(mut self, reads: u64, flag: Arc<AtomicBool>) -> Self {
            self.cancel_after = Some((reads, flag));
            self
        }
    }

    impl AudioSource for ScriptedSource {
        fn sample_rate(&self) -> u32 {
            16_000
        }

        fn chunk_size(&self) -> usize {
            CHUNK
        }

        fn read_chunk(&mut self) -> Result<AudioChunk> {
            assert!(!self.closed, "read after close");
            let samples = self.script.pop_front().unwrap_or_else(|| vec![0; CHUNK]);
            let chunk = AudioChunk::new(samples, self.reads);
            self.reads += 1;
            if let Some((after, flag)) = &self.cancel_after {
                if self.reads >= *after {
                    flag.store(false, Ordering::Release);
                }
            }
            Ok(chunk)
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    struct FailingClassifier;

    impl Classifier for FailingClassifier {
        fn warm_up(&mut self) -> Result<()> {
            Ok(())
        }

        fn predict(&mut self, _spectrogram: &Array2<f32>) -> Result<Vec<f32>> {
            Err(KeyspotError::Classifier("intentional test failure".into()))
        }
    }

    struct WrongShapeClassifier;

    impl Classifier for WrongShapeClassifier {
        fn warm_up(&mut self) -> Result<()> {
            Ok(())
        }

        fn expected_shape(&self) -> Option<(usize, usize)> {
            Some((98, 161))
        }

        fn predict(&mut self, _spectrogram: &Array2<f32>) -> Result<Vec<f32>> {
            panic!("predict must not be reached on shape mismatch");
        }
    }

    fn test_config(name: &str) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.chunk_size = CHUNK;
        // 4 post-trigger chunks, 1-chunk pre-roll
        cfg.record_seconds = 4.0 * CHUNK as f64 / 16_000.0;
        cfg.pre_buffer_seconds = CHUNK as f64 / 16_000.0;
        cfg.capture_path = std::env::temp_dir().join(format!(
            "keyspot-pipeline-test-{}-{}.wav",
            std::process::id(),
            name
        ));
        cfg
    }

    fn make_ctx(
        config: EngineConfig,
        classifier: ClassifierHandle,
        open_source: SourceFactory,
        running: Arc<AtomicBool>,
    ) -> (
        PipelineContext,
        broadcast::Receiver<PredictionEvent>,
        broadcast::Receiver<EngineStatusEvent>,
        broadcast::Sender<PredictionEvent>,
    ) {
        let (prediction_tx, prediction_rx) = broadcast::channel(32);
        let (status_tx, status_rx) = broadcast::channel(64);
        let (activity_tx, _) = broadcast::channel(256);

        let ctx = PipelineContext {
            config,
            vocabulary: Vocabulary::default_commands(),
            classifier,
            open_source,
            running,
            prediction_tx: prediction_tx.clone(),
            status_tx,
            activity_tx,
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(PipelineDiagnostics::default()),
        };
        // Mirror the engine wiring: the caller retains a live sender so the
        // channel stays open after the pipeline context is dropped.
        (ctx, prediction_rx, status_rx, prediction_tx)
    }

    fn recv_prediction_with_timeout(
        rx: &mut broadcast::Receiver<PredictionEvent>,
        timeout: Duration,
    ) -> PredictionEvent {
        let start = Instant::now();
        loop {
            match rx.try_recv() {
                Ok(ev) => return ev,
                Err(TryRecvError::Empty) => {
                    if start.elapsed() >= timeout {
                        panic!("timed out waiting for prediction event");
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => panic!("prediction channel closed unexpectedly"),
            }
        }
    }

    /// Factory producing one scripted source, then endless silent ones.
    fn scripted_factory(first: ScriptedSource) -> SourceFactory {
        let mut first = Some(first);
        Box::new(move || {
            let source = first
                .take()
                .unwrap_or_else(|| ScriptedSource::new(vec![]));
            Ok(Box::new(source) as Box<dyn AudioSource>)
        })
    }

    #[test]
    fn full_cycle_emits_prediction_with_vocabulary_sized_vector() {
        let running = Arc::new(AtomicBool::new(true));
        let source = ScriptedSource::new(vec![vec![i16::MAX; CHUNK]]);
        let config = test_config("full-cycle");
        let capture_path = config.capture_path.clone();

        let (ctx, mut prediction_rx, _status_rx, _prediction_tx) = make_ctx(
            config,
            ClassifierHandle::new(StubClassifier::new(8)),
            scripted_factory(source),
            Arc::clone(&running),
        );
        let diagnostics = Arc::clone(&ctx.diagnostics);

        let handle = thread::spawn(move || run(ctx));
        let event = recv_prediction_with_timeout(&mut prediction_rx, Duration::from_secs(2));
        running.store(false, Ordering::SeqCst);
        handle.join().expect("pipeline thread panicked");

        assert_eq!(event.seq, 0);
        assert_eq!(event.probabilities.len(), 8);
        assert!(event.class_index < 8);
        assert!(capture_path.exists(), "WAV artifact must be produced");
        assert!(diagnostics.snapshot().triggers >= 1);
        std::fs::remove_file(&capture_path).ok();
    }

    #[test]
    fn open_failure_sets_error_status_and_stops() {
        let running = Arc::new(AtomicBool::new(true));
        let factory: SourceFactory =
            Box::new(|| Err(KeyspotError::NoDefaultInputDevice));

        let (ctx, _prediction_rx, _status_rx, _prediction_tx) = make_ctx(
            test_config("open-failure"),
            ClassifierHandle::new(StubClassifier::new(8)),
            factory,
            Arc::clone(&running),
        );
        let status = Arc::clone(&ctx.status);

        run(ctx);

        assert_eq!(*status.lock(), EngineStatus::Error);
        assert!(!running.load(Ordering::SeqCst));
    }

    #[test]
    fn shape_mismatch_skips_cycle_without_crashing() {
        let running = Arc::new(AtomicBool::new(true));
        // Trigger, record 4 chunks, then the flag flips at the 5th read.
        let source = ScriptedSource::new(vec![vec![i16::MAX; CHUNK]])
            .cancel_after(5, Arc::clone(&running));

        let config = test_config("shape-mismatch");
        let capture_path = config.capture_path.clone();
        let (ctx, mut prediction_rx, _status_rx, _prediction_tx) = make_ctx(
            config,
            ClassifierHandle::new(WrongShapeClassifier),
            scripted_factory(source),
            Arc::clone(&running),
        );
        let diagnostics = Arc::clone(&ctx.diagnostics);
        let status = Arc::clone(&ctx.status);

        run(ctx);

        let snap = diagnostics.snapshot();
        assert_eq!(snap.inference_errors, 1);
        assert_eq!(snap.predictions_emitted, 0);
        assert!(matches!(prediction_rx.try_recv(), Err(TryRecvError::Empty)));
        // Recoverable error: the loop ended through Stopped, not Error.
        assert_eq!(*status.lock(), EngineStatus::Stopped);
        std::fs::remove_file(&capture_path).ok();
    }

    #[test]
    fn classifier_error_is_recoverable() {
        let running = Arc::new(AtomicBool::new(true));
        let source = ScriptedSource::new(vec![vec![i16::MAX; CHUNK]])
            .cancel_after(5, Arc::clone(&running));

        let config = test_config("classifier-error");
        let capture_path = config.capture_path.clone();
        let (ctx, _prediction_rx, _status_rx, _prediction_tx) = make_ctx(
            config,
            ClassifierHandle::new(FailingClassifier),
            scripted_factory(source),
            Arc::clone(&running),
        );
        let diagnostics = Arc::clone(&ctx.diagnostics);
        let status = Arc::clone(&ctx.status);

        run(ctx);

        assert_eq!(diagnostics.snapshot().inference_errors, 1);
        assert_eq!(*status.lock(), EngineStatus::Stopped);
        std::fs::remove_file(&capture_path).ok();
    }

    #[test]
    fn cancelled_capture_still_classifies_partial_audio() {
        let running = Arc::new(AtomicBool::new(true));
        // Stop after the trigger chunk + 2 of 4 post-trigger chunks.
        let source = ScriptedSource::new(vec![vec![i16::MAX; CHUNK]])
            .cancel_after(3, Arc::clone(&running));

        let config = test_config("cancel-classify");
        let capture_path = config.capture_path.clone();
        let (ctx, mut prediction_rx, _status_rx, _prediction_tx) = make_ctx(
            config,
            ClassifierHandle::new(StubClassifier::new(8)),
            scripted_factory(source),
            Arc::clone(&running),
        );
        let diagnostics = Arc::clone(&ctx.diagnostics);

        run(ctx);

        let event = prediction_rx
            .try_recv()
            .expect("partial capture should still be classified");
        assert_eq!(event.probabilities.len(), 8);
        assert_eq!(diagnostics.snapshot().cycles_cancelled, 1);
        std::fs::remove_file(&capture_path).ok();
    }
}
