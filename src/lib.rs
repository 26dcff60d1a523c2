//! # tts-corpus
//!
//! Builds and caches supervised training corpora for duration-based
//! text-to-speech models.
//!
//! Each `(audio, transcript)` pair is normalized, force-aligned with a
//! pretrained acoustic model and reduced to a [`FeatureTuple`]: token
//! features, mel-spectrogram, per-token durations, pitch and energy, and
//! optionally a speaker embedding. The corpus is built once by a pool of
//! workers and persisted, so training runs never repeat the signal
//! processing.
//!
//! ## Features
//!
//! - **Parallel cache building**: one worker per share of the transcript map,
//!   each with its own model instances
//! - **Fault tolerant**: bad audio, empty transcripts and degenerate
//!   alignments drop a single sample, never the build
//! - **Aligner corpora**: tokens, mel and waveform only, built without an
//!   acoustic model for training the aligner itself
//! - **Crash-safe cache**: atomic writes, a settings fingerprint and an
//!   integrity re-check on load
//! - **ONNX backends** (feature `onnx`): acoustic aligner and speaker encoder
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::path::Path;
//! use tts_corpus::{config::PipelineConfig, models::ModelSet, pipeline::CorpusPipeline, transcripts};
//!
//! let transcripts = transcripts::load(Path::new("corpus/metadata.csv"))?;
//! let models = ModelSet::new(my_frontend_factory, my_aligner_factory);
//! let pipeline = CorpusPipeline::new(PipelineConfig::default(), models, "cache", "ljspeech")?;
//!
//! let dataset = pipeline.open(&transcripts)?;
//! let sample = dataset.get(0)?;
//! println!("{} tokens, {} mel frames", sample.token_len, sample.mel_len);
//! # Ok::<(), tts_corpus::CorpusError>(())
//! ```

pub mod audio;
pub mod builder;
pub mod cache;
pub mod config;
pub mod dataset;
pub mod error;
pub mod features;
pub mod frontend;
pub mod models;
pub mod pipeline;
pub mod transcripts;
pub mod validator;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

pub use dataset::{AlignerCorpus, Corpus, FeatureDataset};
pub use error::{CorpusError, SampleRejection};

/// Width of every token feature row the text frontend emits.
pub const TOKEN_FEATURE_WIDTH: usize = 66;

/// Dimension of the speaker embeddings stored with each sample.
pub const SPEAKER_EMBEDDING_DIM: usize = 192;

/// Sample rate the speaker encoder was trained on.
pub const SPEAKER_ENCODER_SAMPLE_RATE: u32 = 16_000;

/// One training sample.
///
/// `duration`, `energy` and `pitch` have one entry per token. Durations are
/// in decoder steps, so `sum(duration) * reduction_factor` equals `mel_len`
/// up to rounding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTuple {
    /// Token feature rows, `[token_len x TOKEN_FEATURE_WIDTH]`
    pub tokens: Array2<f32>,
    pub token_len: usize,
    /// Log-mel spectrogram, `[mel_len x mel_bins]`
    pub mel: Array2<f32>,
    pub mel_len: usize,
    pub duration: Vec<u32>,
    pub energy: Vec<f32>,
    pub pitch: Vec<f32>,
    pub speaker_embedding: Option<Vec<f32>>,
}

/// One sample of an aligner training corpus.
///
/// The aligner is trained before any durations exist, so these carry no
/// duration, pitch, energy or speaker features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignerSample {
    /// Token feature rows, `[token_len x TOKEN_FEATURE_WIDTH]`
    pub tokens: Array2<f32>,
    pub token_len: usize,
    /// Log-mel spectrogram, `[mel_len x mel_bins]`
    pub mel: Array2<f32>,
    pub mel_len: usize,
    /// The normalized waveform the mel was computed from.
    pub waveform: Vec<f32>,
}
