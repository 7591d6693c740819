//! Events broadcast by the engine.
//!
//! Three streams, all non-blocking for the pipeline (slow or absent
//! subscribers never stall a capture cycle):
//!
//! | Event | Emitted |
//! |-------|---------|
//! | `PredictionEvent` | once per classified utterance |
//! | `EngineStatusEvent` | on every lifecycle/status transition |
//! | `AudioActivityEvent` | per scored chunk while listening |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Prediction events
// ---------------------------------------------------------------------------

/// One classified utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Winning vocabulary label.
    pub label: String,
    /// Index of the winning label (position in the vocabulary).
    pub class_index: usize,
    /// Full probability vector, index-aligned with the vocabulary.
    pub probabilities: Vec<f32>,
}

// ---------------------------------------------------------------------------
// Audio activity events
// ---------------------------------------------------------------------------

/// Emitted for each chunk scored during the listen phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioActivityEvent {
    /// Chunk sequence index within the current source.
    pub seq: u64,
    /// Mean-absolute loudness on the i16 scale.
    pub level: f32,
    /// Whether this chunk crossed the trigger threshold.
    pub triggered: bool,
}

// ---------------------------------------------------------------------------
// Engine status events
// ---------------------------------------------------------------------------

/// Emitted when the engine state changes or a cycle reports progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. "Waiting for sound...").
    pub detail: Option<String>,
}

/// Current state of the keyspot engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Engine created but `start()` not yet called.
    Idle,
    /// Warming up the classifier.
    WarmingUp,
    /// Waiting for a loud-enough chunk.
    Listening,
    /// Trigger fired; recording the post-trigger span.
    Capturing,
    /// Capture stopped; engine may be restarted.
    Stopped,
    /// Unrecoverable device error — restart required.
    Error,
}
