//! `KeyspotEngine` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! KeyspotEngine::new()
//!     └─► warm_up()          → classifier loaded, status = WarmingUp → Idle
//!         └─► start()        → pipeline spawned, status = Listening
//!             └─► stop()     → running=false, sources closed, status = Stopped
//! ```
//!
//! `start()`/`stop()` are guarded: calling them in the wrong state returns
//! an error rather than panicking.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread
//! affinity). The pipeline therefore opens its own sources *inside* the
//! `spawn_blocking` closure via a `Send` factory, so no stream ever
//! crosses a thread boundary. A bounded sync channel propagates the
//! first open-device error back to the `start()` caller.

pub mod pipeline;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    audio::{AudioSource, CpalSource},
    capture,
    classify::{ClassifierHandle, Vocabulary},
    error::{KeyspotError, Result},
    ipc::events::{AudioActivityEvent, EngineStatus, EngineStatusEvent, PredictionEvent},
};

use pipeline::{DiagnosticsSnapshot, PipelineContext, PipelineDiagnostics, SourceFactory};

/// Broadcast channel capacity: events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// How long `start()` waits for the pipeline thread to open its first
/// audio source.
const OPEN_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for [`KeyspotEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capture and analysis sample rate (Hz). Devices running at other
    /// rates are resampled. Default: 16000.
    pub sample_rate: u32,
    /// Samples per chunk, the unit of triggering and buffering.
    /// Default: 1024.
    pub chunk_size: usize,
    /// Mean-absolute loudness (i16 scale) a chunk must exceed to start a
    /// recording. Default: 1000.
    pub trigger_threshold: f32,
    /// Seconds of audio recorded after the trigger fires. Default: 1.0.
    pub record_seconds: f64,
    /// Seconds of audio retained before the trigger fires. Default: 0.2.
    pub pre_buffer_seconds: f64,
    /// Duration every utterance is normalized to before feature
    /// extraction. Default: 1.0.
    pub target_duration_seconds: f64,
    /// Spectrogram analysis window length (ms). Default: 20.
    pub window_ms: f64,
    /// Spectrogram hop between windows (ms). Default: 10.
    pub step_ms: f64,
    /// Additive floor before the log, keeping silent bins finite.
    /// Default: 1e-10.
    pub log_eps: f32,
    /// Optional bound on the listen phase. `None` waits for a trigger
    /// indefinitely. Default: `None`.
    pub listen_timeout: Option<Duration>,
    /// Where each finalized capture is written as 16-bit mono WAV.
    /// Default: `output.wav`.
    pub capture_path: std::path::PathBuf,
    /// Input device to prefer by name; `None` takes the system default.
    pub preferred_input_device: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            chunk_size: 1024,
            trigger_threshold: 1000.0,
            record_seconds: 1.0,
            pre_buffer_seconds: 0.2,
            target_duration_seconds: 1.0,
            window_ms: 20.0,
            step_ms: 10.0,
            log_eps: 1e-10,
            listen_timeout: None,
            capture_path: std::path::PathBuf::from("output.wav"),
            preferred_input_device: None,
        }
    }
}

impl EngineConfig {
    /// Chunks retained before the trigger:
    /// `ceil(pre_buffer_seconds × sample_rate / chunk_size)`.
    pub fn preroll_capacity(&self) -> usize {
        if self.chunk_size == 0 {
            return 0;
        }
        (self.pre_buffer_seconds * self.sample_rate as f64 / self.chunk_size as f64).ceil()
            as usize
    }

    /// Chunks read after the trigger:
    /// `ceil(record_seconds × sample_rate / chunk_size)`.
    pub fn post_trigger_chunk_count(&self) -> usize {
        capture::post_trigger_chunks(self.record_seconds, self.sample_rate, self.chunk_size)
    }

    /// Sample count every utterance is framed to.
    pub fn target_samples(&self) -> usize {
        (self.target_duration_seconds * self.sample_rate as f64).round() as usize
    }
}

pub struct KeyspotEngine {
    config: EngineConfig,
    vocabulary: Vocabulary,
    classifier: ClassifierHandle,
    running: Arc<AtomicBool>,
    status: Arc<Mutex<EngineStatus>>,
    seq: Arc<AtomicU64>,
    diagnostics: Arc<PipelineDiagnostics>,
    prediction_tx: broadcast::Sender<PredictionEvent>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    activity_tx: broadcast::Sender<AudioActivityEvent>,
    pipeline: Option<tokio::task::JoinHandle<()>>,
}

impl KeyspotEngine {
    pub fn new(config: EngineConfig, vocabulary: Vocabulary, classifier: ClassifierHandle) -> Self {
        let (prediction_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);

        Self {
            config,
            vocabulary,
            classifier,
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(PipelineDiagnostics::default()),
            prediction_tx,
            status_tx,
            activity_tx,
            pipeline: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn subscribe_predictions(&self) -> broadcast::Receiver<PredictionEvent> {
        self.prediction_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<AudioActivityEvent> {
        self.activity_tx.subscribe()
    }

    /// Load the classifier backend ahead of the first capture so the
    /// first prediction is not delayed by model initialization.
    pub fn warm_up(&self) -> Result<()> {
        self.set_status(EngineStatus::WarmingUp, Some("Loading classifier...".into()));
        let result = self.classifier.0.lock().warm_up();
        match result {
            Ok(()) => {
                info!("classifier warm-up complete");
                self.set_status(EngineStatus::Idle, None);
                Ok(())
            }
            Err(e) => {
                self.set_status(EngineStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Start the detection loop against the configured input device.
    pub async fn start(&mut self) -> Result<()> {
        let cfg = self.config.clone();
        self.start_with_source_factory(Box::new(move || {
            let source = CpalSource::open(
                cfg.sample_rate,
                cfg.chunk_size,
                cfg.preferred_input_device.as_deref(),
            )?;
            Ok(Box::new(source) as Box<dyn AudioSource>)
        }))
        .await
    }

    /// Start the detection loop with a caller-supplied source factory.
    /// The factory runs on the pipeline thread, once per capture cycle.
    pub async fn start_with_source_factory(&mut self, factory: SourceFactory) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(KeyspotError::AlreadyRunning);
        }
        self.diagnostics.reset();

        // First-open handshake: the factory result for cycle one is
        // mirrored back so start() can fail fast on a dead device.
        let (open_tx, open_rx) = crossbeam_channel::bounded::<std::result::Result<(), String>>(1);
        let mut handshake = Some(open_tx);
        let mut inner = factory;
        let open_source: SourceFactory = Box::new(move || {
            let result = inner();
            if let Some(tx) = handshake.take() {
                let _ = tx.send(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
            }
            result
        });

        let ctx = PipelineContext {
            config: self.config.clone(),
            vocabulary: self.vocabulary.clone(),
            classifier: self.classifier.clone(),
            open_source,
            running: Arc::clone(&self.running),
            prediction_tx: self.prediction_tx.clone(),
            status_tx: self.status_tx.clone(),
            activity_tx: self.activity_tx.clone(),
            status: Arc::clone(&self.status),
            seq: Arc::clone(&self.seq),
            diagnostics: Arc::clone(&self.diagnostics),
        };

        let handle = tokio::task::spawn_blocking(move || pipeline::run(ctx));

        match open_rx.recv_timeout(OPEN_HANDSHAKE_TIMEOUT) {
            Ok(Ok(())) => {
                self.pipeline = Some(handle);
                info!("engine started");
                Ok(())
            }
            Ok(Err(msg)) => {
                // The pipeline has already flagged itself down and set
                // status = Error; surface the cause to the caller.
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.await;
                Err(KeyspotError::AudioDevice(msg))
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.await;
                Err(KeyspotError::AudioStream(
                    "pipeline failed to open an audio source in time".into(),
                ))
            }
        }
    }

    /// Request a stop and wait for the pipeline thread to finish its
    /// current chunk and finalize any in-flight capture.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(KeyspotError::NotRunning);
        }

        if let Some(handle) = self.pipeline.take() {
            let _ = handle.await;
        }
        info!("engine stopped");
        Ok(())
    }

    fn set_status(&self, status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = status;
        let _ = self.status_tx.send(EngineStatusEvent { status, detail });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::buffering::chunk::AudioChunk;
    use crate::classify::stub::StubClassifier;

    const CHUNK: usize = 64;

    /// Endless silence at 16 kHz; never triggers.
    struct SilentSource {
        seq: u64,
    }

    impl AudioSource for SilentSource {
        fn sample_rate(&self) -> u32 {
            16_000
        }

        fn chunk_size(&self) -> usize {
            CHUNK
        }

        fn read_chunk(&mut self) -> crate::error::Result<AudioChunk> {
            let chunk = AudioChunk::new(vec![0; CHUNK], self.seq);
            self.seq += 1;
            // Keep the spin loop from starving the test scheduler.
            std::thread::sleep(Duration::from_micros(200));
            Ok(chunk)
        }

        fn close(&mut self) {}
    }

    fn silent_factory() -> SourceFactory {
        Box::new(|| Ok(Box::new(SilentSource { seq: 0 }) as Box<dyn AudioSource>))
    }

    fn test_engine(name: &str) -> KeyspotEngine {
        let mut config = EngineConfig::default();
        config.chunk_size = CHUNK;
        config.capture_path = std::env::temp_dir().join(format!(
            "keyspot-engine-test-{}-{}.wav",
            std::process::id(),
            name
        ));
        KeyspotEngine::new(
            config,
            Vocabulary::default_commands(),
            ClassifierHandle::new(StubClassifier::new(8)),
        )
    }

    #[test]
    fn config_defaults_derive_reference_geometry() {
        let config = EngineConfig::default();
        assert_eq!(config.preroll_capacity(), 4);
        assert_eq!(config.post_trigger_chunk_count(), 16);
        assert_eq!(config.target_samples(), 16_000);
    }

    #[test]
    fn warm_up_moves_idle_and_emits_status() {
        let engine = test_engine("warm-up");
        let mut status_rx = engine.subscribe_status();

        engine.warm_up().unwrap();

        assert_eq!(engine.status(), EngineStatus::Idle);
        let first = status_rx.try_recv().unwrap();
        assert_eq!(first.status, EngineStatus::WarmingUp);
        let second = status_rx.try_recv().unwrap();
        assert_eq!(second.status, EngineStatus::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_stop_lifecycle() {
        let mut engine = test_engine("lifecycle");

        engine
            .start_with_source_factory(silent_factory())
            .await
            .unwrap();
        assert!(engine.is_running());

        // The pipeline flips to Listening just after the open handshake.
        let started = std::time::Instant::now();
        while engine.status() != EngineStatus::Listening {
            assert!(started.elapsed() < Duration::from_secs(2), "never reached Listening");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        engine.stop().await.unwrap();
        assert!(!engine.is_running());
        assert_eq!(engine.status(), EngineStatus::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_start_is_rejected_while_running() {
        let mut engine = test_engine("double-start");

        engine
            .start_with_source_factory(silent_factory())
            .await
            .unwrap();
        let err = engine
            .start_with_source_factory(silent_factory())
            .await
            .unwrap_err();
        assert!(matches!(err, KeyspotError::AlreadyRunning));

        engine.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_without_start_is_rejected() {
        let mut engine = test_engine("stop-idle");
        let err = engine.stop().await.unwrap_err();
        assert!(matches!(err, KeyspotError::NotRunning));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn open_failure_surfaces_from_start() {
        let mut engine = test_engine("open-failure");
        let factory: SourceFactory =
            Box::new(|| Err(KeyspotError::NoDefaultInputDevice));

        let err = engine
            .start_with_source_factory(factory)
            .await
            .unwrap_err();
        assert!(matches!(err, KeyspotError::AudioDevice(_)));
        assert!(!engine.is_running());
        assert_eq!(engine.status(), EngineStatus::Error);
    }
}
