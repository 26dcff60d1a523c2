//! Pretrained models the pipeline consumes as black boxes.
//!
//! Models are not assumed to be reentrant, so workers never share an
//! instance by default: every worker asks a [`ModelFactory`] for its own. Wrap
//! a model in [`SharedModel`] to trade that isolation for a single load.
//!
//! # Available Backends
//!
//! Enable backends via Cargo features:
//! - `onnx` - ONNX Runtime aligner and speaker encoder

#[cfg(feature = "onnx")]
pub mod onnx;

use std::sync::{Arc, Mutex};

use ndarray::Array2;

use crate::audio::SignalProcessor;
use crate::error::CorpusError;
use crate::frontend::TextFrontend;

/// Acoustic model run in teacher-forcing mode to obtain an alignment.
pub trait AcousticModel {
    /// Returns the attention matrix `[token positions x mel frames]`.
    fn align(
        &mut self,
        tokens: &Array2<f32>,
        mel: &Array2<f32>,
        speaker_embedding: Option<&[f32]>,
    ) -> Result<Array2<f32>, CorpusError>;
}

/// Fixed-size speaker embedding from 16 kHz audio.
pub trait SpeakerEncoder {
    fn embed(&mut self, waveform: &[f32]) -> Result<Vec<f32>, CorpusError>;
}

/// Creates one model instance per worker.
///
/// Any `Fn() -> Result<Box<T>, CorpusError>` closure is a factory.
pub trait ModelFactory<T: ?Sized>: Send + Sync {
    fn load(&self) -> Result<Box<T>, CorpusError>;
}

impl<T: ?Sized, F> ModelFactory<T> for F
where
    F: Fn() -> Result<Box<T>, CorpusError> + Send + Sync,
{
    fn load(&self) -> Result<Box<T>, CorpusError> {
        self()
    }
}

/// A single model instance shared by all workers behind a mutex.
///
/// Workers serialize on the lock during inference. Useful when a model is
/// too large or too slow to load once per worker.
pub struct SharedModel<M> {
    inner: Arc<Mutex<M>>,
}

impl<M> SharedModel<M> {
    pub fn new(model: M) -> Self {
        Self {
            inner: Arc::new(Mutex::new(model)),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut M) -> Result<R, CorpusError>) -> Result<R, CorpusError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| CorpusError::Model("shared model lock poisoned".into()))?;
        f(&mut guard)
    }
}

impl<M> Clone for SharedModel<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: AcousticModel> AcousticModel for SharedModel<M> {
    fn align(
        &mut self,
        tokens: &Array2<f32>,
        mel: &Array2<f32>,
        speaker_embedding: Option<&[f32]>,
    ) -> Result<Array2<f32>, CorpusError> {
        self.with(|m| m.align(tokens, mel, speaker_embedding))
    }
}

impl<M: SpeakerEncoder> SpeakerEncoder for SharedModel<M> {
    fn embed(&mut self, waveform: &[f32]) -> Result<Vec<f32>, CorpusError> {
        self.with(|m| m.embed(waveform))
    }
}

impl<M: AcousticModel + Send + 'static> ModelFactory<dyn AcousticModel> for SharedModel<M> {
    fn load(&self) -> Result<Box<dyn AcousticModel>, CorpusError> {
        Ok(Box::new(self.clone()))
    }
}

impl<M: SpeakerEncoder + Send + 'static> ModelFactory<dyn SpeakerEncoder> for SharedModel<M> {
    fn load(&self) -> Result<Box<dyn SpeakerEncoder>, CorpusError> {
        Ok(Box::new(self.clone()))
    }
}

/// Everything a worker needs to instantiate for itself.
#[derive(Clone)]
pub struct ModelSet {
    pub frontend: Arc<dyn ModelFactory<dyn TextFrontend>>,
    /// Required for feature corpora; aligner corpora are built without it.
    pub acoustic: Option<Arc<dyn ModelFactory<dyn AcousticModel>>>,
    pub speaker: Option<Arc<dyn ModelFactory<dyn SpeakerEncoder>>>,
    /// `None` builds a [`StftProcessor`](crate::audio::StftProcessor) from
    /// the pipeline config.
    pub signal_processor: Option<Arc<dyn SignalProcessor>>,
}

impl ModelSet {
    pub fn new(
        frontend: impl ModelFactory<dyn TextFrontend> + 'static,
        acoustic: impl ModelFactory<dyn AcousticModel> + 'static,
    ) -> Self {
        Self {
            acoustic: Some(Arc::new(acoustic)),
            ..Self::frontend_only(frontend)
        }
    }

    /// Models for an aligner corpus, which only needs token features.
    pub fn frontend_only(frontend: impl ModelFactory<dyn TextFrontend> + 'static) -> Self {
        Self {
            frontend: Arc::new(frontend),
            acoustic: None,
            speaker: None,
            signal_processor: None,
        }
    }

    pub fn with_speaker_encoder(
        mut self,
        speaker: impl ModelFactory<dyn SpeakerEncoder> + 'static,
    ) -> Self {
        self.speaker = Some(Arc::new(speaker));
        self
    }

    pub fn with_signal_processor(mut self, dsp: Arc<dyn SignalProcessor>) -> Self {
        self.signal_processor = Some(dsp);
        self
    }
}
