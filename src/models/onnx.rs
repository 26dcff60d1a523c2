//! ONNX Runtime backends for the acoustic aligner and the speaker encoder.
//!
//! The aligner graph takes `tokens` `[1, T, 66]`, `mel` `[1, F, mel_bins]`
//! and optionally `speaker_embedding` `[1, 192]`, and returns the attention
//! matrix `[1, T, F]` as its first output. The speaker encoder takes a 16 kHz
//! `waveform` `[1, N]` and returns `[1, 192]`.

use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayViewD, Axis};
use ort::execution_providers::CPUExecutionProvider;
use ort::inputs;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;

use super::{AcousticModel, ModelFactory, SpeakerEncoder};
use crate::error::CorpusError;

/// How a session is created.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Intra- and inter-op threads per session. Leave unset when running
    /// many workers, or set to 1.
    pub num_threads: Option<usize>,
    /// Where to keep the Level3-optimized graph between runs.
    pub optimized_cache_path: Option<PathBuf>,
}

/// Teacher-forced aligner exported to ONNX.
pub struct OnnxAcousticModel {
    session: Session,
    tokens_input: String,
    mel_input: String,
    speaker_input: Option<String>,
}

impl OnnxAcousticModel {
    pub fn load(onnx_path: &Path, options: &SessionOptions) -> Result<Self, CorpusError> {
        log::info!("Loading acoustic model from {}", onnx_path.display());
        let session = init_session(onnx_path, options)?;

        let tokens_input = find_input(&session, &["tokens", "text", "input_ids"])
            .unwrap_or_else(|| "tokens".to_string());
        let mel_input = find_input(&session, &["mel", "speech", "feats"])
            .unwrap_or_else(|| "mel".to_string());
        let speaker_input = find_input(&session, &["speaker_embedding", "spembs", "utterance_embedding"]);
        log::debug!(
            "aligner inputs: tokens={tokens_input} mel={mel_input} speaker={speaker_input:?}"
        );

        Ok(Self {
            session,
            tokens_input,
            mel_input,
            speaker_input,
        })
    }

    /// Factory that loads a fresh session for every worker.
    pub fn factory(
        onnx_path: impl Into<PathBuf>,
        options: SessionOptions,
    ) -> impl ModelFactory<dyn AcousticModel> {
        let onnx_path = onnx_path.into();
        move || -> Result<Box<dyn AcousticModel>, CorpusError> {
            Ok(Box::new(Self::load(&onnx_path, &options)?))
        }
    }
}

impl AcousticModel for OnnxAcousticModel {
    fn align(
        &mut self,
        tokens: &Array2<f32>,
        mel: &Array2<f32>,
        speaker_embedding: Option<&[f32]>,
    ) -> Result<Array2<f32>, CorpusError> {
        let tokens = tokens.as_standard_layout();
        let mel = mel.as_standard_layout();
        let tokens_view = tokens.view().insert_axis(Axis(0));
        let mel_view = mel.view().insert_axis(Axis(0));

        let outputs = match (&self.speaker_input, speaker_embedding) {
            (Some(name), Some(embedding)) => {
                let embedding = ndarray::ArrayView2::from_shape((1, embedding.len()), embedding)?;
                let inputs = inputs![
                    self.tokens_input.as_str() => TensorRef::from_array_view(tokens_view)?,
                    self.mel_input.as_str() => TensorRef::from_array_view(mel_view)?,
                    name.as_str() => TensorRef::from_array_view(embedding)?,
                ];
                self.session.run(inputs)?
            }
            _ => {
                let inputs = inputs![
                    self.tokens_input.as_str() => TensorRef::from_array_view(tokens_view)?,
                    self.mel_input.as_str() => TensorRef::from_array_view(mel_view)?,
                ];
                self.session.run(inputs)?
            }
        };

        let (_, value) = outputs.iter().next().ok_or_else(no_output)?;
        let attention = to_matrix(value.try_extract_array::<f32>()?)?;
        if attention.nrows() != tokens.nrows() {
            return Err(CorpusError::Model(format!(
                "alignment has {} rows for {} tokens",
                attention.nrows(),
                tokens.nrows()
            )));
        }
        Ok(attention)
    }
}

/// Speaker encoder exported to ONNX.
pub struct OnnxSpeakerEncoder {
    session: Session,
    waveform_input: String,
}

impl OnnxSpeakerEncoder {
    pub fn load(onnx_path: &Path, options: &SessionOptions) -> Result<Self, CorpusError> {
        log::info!("Loading speaker encoder from {}", onnx_path.display());
        let session = init_session(onnx_path, options)?;
        let waveform_input = find_input(&session, &["waveform", "wav", "input_values"])
            .unwrap_or_else(|| "waveform".to_string());
        Ok(Self {
            session,
            waveform_input,
        })
    }

    pub fn factory(
        onnx_path: impl Into<PathBuf>,
        options: SessionOptions,
    ) -> impl ModelFactory<dyn SpeakerEncoder> {
        let onnx_path = onnx_path.into();
        move || -> Result<Box<dyn SpeakerEncoder>, CorpusError> {
            Ok(Box::new(Self::load(&onnx_path, &options)?))
        }
    }
}

impl SpeakerEncoder for OnnxSpeakerEncoder {
    fn embed(&mut self, waveform: &[f32]) -> Result<Vec<f32>, CorpusError> {
        let wave = ndarray::ArrayView2::from_shape((1, waveform.len()), waveform)?;
        let inputs = inputs![
            self.waveform_input.as_str() => TensorRef::from_array_view(wave)?,
        ];
        let outputs = self.session.run(inputs)?;
        let (_, value) = outputs.iter().next().ok_or_else(no_output)?;
        Ok(value.try_extract_array::<f32>()?.iter().copied().collect())
    }
}

fn no_output() -> CorpusError {
    CorpusError::Model("model produced no output".into())
}

/// Collapse leading unit axes, e.g. a batch of one, into a matrix.
fn to_matrix(view: ArrayViewD<'_, f32>) -> Result<Array2<f32>, CorpusError> {
    let shape = view.shape();
    if shape.len() < 2 || shape[..shape.len() - 2].iter().any(|&d| d != 1) {
        return Err(CorpusError::Model(format!(
            "expected an attention matrix, got shape {shape:?}"
        )));
    }
    let (rows, cols) = (shape[shape.len() - 2], shape[shape.len() - 1]);
    Ok(Array2::from_shape_vec((rows, cols), view.iter().copied().collect())?)
}

fn find_input(session: &Session, candidates: &[&str]) -> Option<String> {
    session
        .inputs()
        .iter()
        .map(|input| input.name())
        .find(|name| candidates.contains(name))
        .map(str::to_string)
}

/// Create a session, caching the optimized graph at
/// `options.optimized_cache_path` after the first load.
fn init_session(onnx_path: &Path, options: &SessionOptions) -> Result<Session, CorpusError> {
    let providers = vec![CPUExecutionProvider::default().build()];

    let (load_path, opt_level, write_cache) = match options.optimized_cache_path.as_deref() {
        Some(cache) if cache.exists() => {
            log::info!("Loading pre-optimized graph from {}", cache.display());
            (cache, GraphOptimizationLevel::Disable, None)
        }
        Some(cache) => {
            log::info!("Optimizing graph; saving it to {}", cache.display());
            (onnx_path, GraphOptimizationLevel::Level3, Some(cache))
        }
        None => (onnx_path, GraphOptimizationLevel::Level3, None),
    };

    let mut builder = Session::builder()?
        .with_optimization_level(opt_level)?
        .with_execution_providers(providers)?
        .with_parallel_execution(true)?;

    if let Some(cache) = write_cache {
        builder = builder.with_optimized_model_path(cache)?;
    }

    if let Some(threads) = options.num_threads {
        builder = builder
            .with_intra_threads(threads)?
            .with_inter_threads(threads)?;
    }

    Ok(builder.commit_from_file(load_path)?)
}
