use thiserror::Error;

/// All errors produced by keyspot.
#[derive(Debug, Error)]
pub enum KeyspotError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("audio source is closed")]
    SourceClosed,

    #[error(
        "spectrogram shape mismatch: expected {expected_frames}x{expected_bins}, \
         got {actual_frames}x{actual_bins}"
    )]
    ShapeMismatch {
        expected_frames: usize,
        expected_bins: usize,
        actual_frames: usize,
        actual_bins: usize,
    },

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("probability vector length {got} does not match vocabulary size {expected}")]
    VocabularyMismatch { expected: usize, got: usize },

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("WAV codec error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KeyspotError {
    /// Whether this error ends the listen loop (device-level failure) as
    /// opposed to spoiling only the current detect→classify cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KeyspotError::AudioDevice(_)
                | KeyspotError::AudioStream(_)
                | KeyspotError::NoDefaultInputDevice
                | KeyspotError::SourceClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, KeyspotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_are_fatal() {
        assert!(KeyspotError::NoDefaultInputDevice.is_fatal());
        assert!(KeyspotError::AudioDevice("gone".into()).is_fatal());
    }

    #[test]
    fn cycle_errors_are_recoverable() {
        let shape = KeyspotError::ShapeMismatch {
            expected_frames: 99,
            expected_bins: 161,
            actual_frames: 98,
            actual_bins: 161,
        };
        assert!(!shape.is_fatal());
        assert!(!KeyspotError::Classifier("nan".into()).is_fatal());
        assert!(!KeyspotError::VocabularyMismatch {
            expected: 8,
            got: 7
        }
        .is_fatal());
    }
}
