//! # keyspot
//!
//! Real-time spoken-command spotting engine.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → CpalSource → SPSC RingBuffer → Pipeline(spawn_blocking)
//!                                                  │
//!                                     EnergyTrigger + PreRollBuffer
//!                                                  │
//!                                     UtteranceCapturer (1 s + pre-roll)
//!                                                  │
//!                                     Framer → SpectrogramExtractor
//!                                                  │
//!                                         Classifier::predict
//!                                                  │
//!                                   broadcast::Sender<PredictionEvent>
//! ```
//!
//! The audio callback is zero-alloc. All heap work happens in the pipeline thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod classify;
pub mod engine;
pub mod error;
pub mod features;
pub mod ipc;
pub mod trigger;

// Convenience re-exports for downstream crates
pub use capture::{CaptureOutcome, CaptureState, Utterance, UtteranceCapturer};
pub use classify::{Classifier, ClassifierHandle, PredictionResult, Vocabulary};
pub use engine::{EngineConfig, KeyspotEngine};
pub use error::KeyspotError;
pub use features::{Framer, SpectrogramExtractor};
pub use ipc::events::{
    AudioActivityEvent, EngineStatus, EngineStatusEvent, PredictionEvent,
};
pub use trigger::EnergyTrigger;

#[cfg(feature = "onnx")]
pub use classify::{OnnxClassifier, OnnxClassifierConfig};
