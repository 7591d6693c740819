//! Command classification boundary.
//!
//! The `Classifier` trait decouples the pipeline from any specific model
//! format — the trained network is an opaque scoring function: matrix in,
//! probability vector out. `&mut self` on `predict` expresses that
//! backends may be stateful (session caches, scratch tensors); all
//! mutation is serialised through `ClassifierHandle`'s
//! `parking_lot::Mutex`.

pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxClassifier, OnnxClassifierConfig};

use std::sync::Arc;

use ndarray::Array2;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{KeyspotError, Result};

/// The fixed, ordered, closed set of recognizable command labels.
///
/// Insertion order is significant: the index into the probability vector
/// identifies the class. Immutable after construction so label/index
/// alignment cannot drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary(Vec<String>);

impl Vocabulary {
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(labels.into_iter().map(Into::into).collect())
    }

    /// The eight-command vocabulary of the reference model.
    pub fn default_commands() -> Self {
        Self::from_labels([
            "_background_noise_",
            "go",
            "max",
            "no",
            "off",
            "on",
            "stop",
            "wow",
        ])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn label(&self, class_index: usize) -> Option<&str> {
        self.0.get(class_index).map(String::as_str)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// The winning label plus the full probability vector, index-aligned with
/// the vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    pub label: String,
    pub class_index: usize,
    pub probabilities: Vec<f32>,
}

impl PredictionResult {
    /// Argmax over a probability vector, validated against the vocabulary.
    ///
    /// # Errors
    /// `VocabularyMismatch` when the vector length differs from the
    /// vocabulary size.
    pub fn from_probabilities(vocabulary: &Vocabulary, probabilities: Vec<f32>) -> Result<Self> {
        if probabilities.len() != vocabulary.len() {
            return Err(KeyspotError::VocabularyMismatch {
                expected: vocabulary.len(),
                got: probabilities.len(),
            });
        }

        let class_index = probabilities
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .ok_or_else(|| KeyspotError::Classifier("empty probability vector".into()))?;

        // label() cannot fail: class_index < probabilities.len() == vocab.len()
        let label = vocabulary
            .label(class_index)
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            label,
            class_index,
            probabilities,
        })
    }
}

/// Contract for classification backends.
pub trait Classifier: Send + 'static {
    /// One-time warm-up: load weights, run a dummy inference. Called once
    /// at engine startup, before any capture cycle.
    fn warm_up(&mut self) -> Result<()>;

    /// The `(time_frames, freq_bins)` input shape this backend requires,
    /// if it has a fixed one. The pipeline rejects mismatching
    /// spectrograms with `ShapeMismatch` before calling `predict`.
    fn expected_shape(&self) -> Option<(usize, usize)> {
        None
    }

    /// Score a spectrogram. Returns one probability per vocabulary entry,
    /// in vocabulary order.
    fn predict(&mut self, spectrogram: &Array2<f32>) -> Result<Vec<f32>>;
}

/// Thread-safe reference-counted handle to any `Classifier` implementor.
///
/// `parking_lot::Mutex` for non-poisoning on panic and a faster
/// uncontended path than `std::sync::Mutex`.
#[derive(Clone)]
pub struct ClassifierHandle(pub Arc<Mutex<dyn Classifier>>);

impl ClassifierHandle {
    pub fn new<C: Classifier>(classifier: C) -> Self {
        Self(Arc::new(Mutex::new(classifier)))
    }
}

impl std::fmt::Debug for ClassifierHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierHandle").finish_non_exhaustive()
    }
}
