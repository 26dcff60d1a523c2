use std::fmt;
use std::path::PathBuf;

/// Errors surfaced by the corpus pipeline.
///
/// Per-sample problems never show up here; they are [`SampleRejection`]s and
/// stay inside the worker that hit them.
#[derive(thiserror::Error, Debug)]
pub enum CorpusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Transcript file error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Cache encoding error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Corrupt cache at {}: {reason}", path.display())]
    CorruptCache { path: PathBuf, reason: String },
    #[error("Index {index} out of range for dataset of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Worker {worker} terminated abnormally")]
    WorkerCrashed { worker: usize },
    #[error("worker_count must be at least 1")]
    NoWorkers,
    #[error("Corpus already built. Call reset() to rebuild.")]
    AlreadyBuilt,
    #[error("Model error: {0}")]
    Model(String),
    #[error("Text frontend error: {0}")]
    Frontend(String),
    #[error(
        "espeak-ng not found. Install: Linux: `sudo apt-get install espeak-ng`, \
         macOS: `brew install espeak-ng`, Windows: https://espeak-ng.org/download"
    )]
    EspeakNotFound,
    #[error("Audio error: {0}")]
    Audio(String),
    #[cfg(feature = "onnx")]
    #[error("ONNX runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[cfg(feature = "onnx")]
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl CorpusError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::CorruptCache {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Why a single sample was left out of the corpus.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleRejection {
    EmptyTranscript,
    DurationOutOfRange {
        seconds: f64,
        min: f64,
        max: f64,
        stage: DurationStage,
    },
    AudioUnreadable(String),
    NormalizationFailed(String),
    SampleRateMismatch { expected: u32, found: u32 },
    TokenShape { width: usize, rows: usize, expected: usize },
    DegenerateAlignment { zero_durations: usize, max: usize },
    ModelFailure(String),
    Inconsistent(String),
}

/// Whether a duration check ran on the raw or the normalized waveform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationStage {
    Raw,
    Normalized,
}

/// Coarse rejection category, used as the key of dropped-sample counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RejectionReason {
    EmptyTranscript,
    DurationOutOfRange,
    AudioUnreadable,
    NormalizationFailed,
    SampleRateMismatch,
    TokenShape,
    DegenerateAlignment,
    ModelFailure,
    Inconsistent,
}

impl SampleRejection {
    pub fn reason(&self) -> RejectionReason {
        match self {
            Self::EmptyTranscript => RejectionReason::EmptyTranscript,
            Self::DurationOutOfRange { .. } => RejectionReason::DurationOutOfRange,
            Self::AudioUnreadable(_) => RejectionReason::AudioUnreadable,
            Self::NormalizationFailed(_) => RejectionReason::NormalizationFailed,
            Self::SampleRateMismatch { .. } => RejectionReason::SampleRateMismatch,
            Self::TokenShape { .. } => RejectionReason::TokenShape,
            Self::DegenerateAlignment { .. } => RejectionReason::DegenerateAlignment,
            Self::ModelFailure(_) => RejectionReason::ModelFailure,
            Self::Inconsistent(_) => RejectionReason::Inconsistent,
        }
    }
}

impl fmt::Display for SampleRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyTranscript => write!(f, "transcript is empty"),
            Self::DurationOutOfRange {
                seconds,
                min,
                max,
                stage,
            } => write!(
                f,
                "{} duration of {seconds:.2}s is outside [{min}, {max}]",
                match stage {
                    DurationStage::Raw => "raw",
                    DurationStage::Normalized => "normalized",
                }
            ),
            Self::AudioUnreadable(msg) => write!(f, "audio could not be read: {msg}"),
            Self::NormalizationFailed(msg) => write!(f, "normalization failed: {msg}"),
            Self::SampleRateMismatch { expected, found } => {
                write!(f, "inconsistent sample rate {found} (expected {expected})")
            }
            Self::TokenShape {
                width,
                rows,
                expected,
            } => write!(
                f,
                "token features have shape [{rows} x {width}], expected width {expected}"
            ),
            Self::DegenerateAlignment {
                zero_durations,
                max,
            } => write!(
                f,
                "alignment left {zero_durations} tokens without frames (max {max})"
            ),
            Self::ModelFailure(msg) => write!(f, "model inference failed: {msg}"),
            Self::Inconsistent(msg) => write!(f, "inconsistent features: {msg}"),
        }
    }
}

impl From<CorpusError> for SampleRejection {
    fn from(err: CorpusError) -> Self {
        match err {
            CorpusError::Wav(e) => Self::AudioUnreadable(e.to_string()),
            CorpusError::Io(e) => Self::AudioUnreadable(e.to_string()),
            CorpusError::Audio(msg) => Self::NormalizationFailed(msg),
            other => Self::ModelFailure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_reason_groups_variants() {
        let r = SampleRejection::DurationOutOfRange {
            seconds: 0.5,
            min: 1.0,
            max: 20.0,
            stage: DurationStage::Raw,
        };
        assert_eq!(r.reason(), RejectionReason::DurationOutOfRange);
        assert!(r.to_string().contains("0.50s"));
    }

    #[test]
    fn audio_errors_map_to_normalization_failures() {
        let r: SampleRejection = CorpusError::Audio("silent".into()).into();
        assert_eq!(r.reason(), RejectionReason::NormalizationFailed);
    }
}
