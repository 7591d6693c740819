//! ONNX classification backend via `ort`.
//!
//! Loads the trained command network as an opaque ONNX session. The
//! spectrogram is reshaped to `(1, time_frames, freq_bins)` — batch of
//! one — and the flattened output is taken as the probability vector
//! (the exported network ends in softmax).

use std::path::PathBuf;

use ndarray::{Array2, Array3};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use tracing::{debug, info};

use crate::classify::Classifier;
use crate::error::{KeyspotError, Result};

#[derive(Debug, Clone)]
pub struct OnnxClassifierConfig {
    /// Path to the exported .onnx model.
    pub model_path: PathBuf,
    /// `(time_frames, freq_bins)` the network was trained on, e.g. (99, 161).
    pub input_shape: (usize, usize),
    /// Output vector length; must equal the vocabulary size.
    pub n_classes: usize,
}

pub struct OnnxClassifier {
    config: OnnxClassifierConfig,
    session: Option<Session>,
}

impl OnnxClassifier {
    pub fn new(config: OnnxClassifierConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    fn ensure_session(&mut self) -> Result<&mut Session> {
        if self.session.is_none() {
            if !self.config.model_path.exists() {
                return Err(KeyspotError::Classifier(format!(
                    "model file not found: {}",
                    self.config.model_path.display()
                )));
            }

            let session = Session::builder()
                .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
                .and_then(|b| b.with_intra_threads(1))
                .and_then(|b| b.commit_from_file(&self.config.model_path))
                .map_err(|e| KeyspotError::Classifier(format!("session init: {e}")))?;

            info!(path = %self.config.model_path.display(), "ONNX classifier loaded");
            self.session = Some(session);
        }

        // Just populated above.
        self.session
            .as_mut()
            .ok_or_else(|| KeyspotError::Classifier("session unavailable".into()))
    }

    fn run(&mut self, spectrogram: &Array2<f32>) -> Result<Vec<f32>> {
        let (frames, bins) = spectrogram.dim();
        let batched: Array3<f32> = spectrogram
            .to_owned()
            .into_shape_with_order((1, frames, bins))
            .map_err(|e| KeyspotError::Classifier(format!("batch reshape: {e}")))?;

        let session = self.ensure_session()?;
        let tensor = Tensor::from_array(batched)
            .map_err(|e| KeyspotError::Classifier(format!("input tensor: {e}")))?;

        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| KeyspotError::Classifier(format!("inference: {e}")))?;

        let output: ndarray::ArrayViewD<f32> = outputs[0]
            .try_extract_array()
            .map_err(|e| KeyspotError::Classifier(format!("output extract: {e}")))?;

        let probabilities: Vec<f32> = output.iter().copied().collect();
        debug!(len = probabilities.len(), "classifier output");
        Ok(probabilities)
    }
}

impl Classifier for OnnxClassifier {
    fn warm_up(&mut self) -> Result<()> {
        let (frames, bins) = self.config.input_shape;
        let dummy = Array2::<f32>::zeros((frames, bins));
        let out = self.run(&dummy)?;

        if out.len() != self.config.n_classes {
            return Err(KeyspotError::Classifier(format!(
                "model emits {} classes, configured for {}",
                out.len(),
                self.config.n_classes
            )));
        }
        Ok(())
    }

    fn expected_shape(&self) -> Option<(usize, usize)> {
        Some(self.config.input_shape)
    }

    fn predict(&mut self, spectrogram: &Array2<f32>) -> Result<Vec<f32>> {
        self.run(spectrogram)
    }
}
