use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CorpusError;
use crate::{AlignerSample, FeatureTuple};

/// The finished, immutable sequence of training samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Corpus {
    samples: Vec<FeatureTuple>,
}

impl Corpus {
    pub fn new(samples: Vec<FeatureTuple>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[FeatureTuple] {
        &self.samples
    }
}

impl FromIterator<FeatureTuple> for Corpus {
    fn from_iter<I: IntoIterator<Item = FeatureTuple>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Samples for training the aligner: tokens, mel and waveform only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlignerCorpus {
    samples: Vec<AlignerSample>,
}

impl AlignerCorpus {
    pub fn new(samples: Vec<AlignerSample>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&AlignerSample, CorpusError> {
        self.samples.get(index).ok_or(CorpusError::IndexOutOfRange {
            index,
            len: self.len(),
        })
    }

    pub fn samples(&self) -> &[AlignerSample] {
        &self.samples
    }
}

/// Random-access, read-only view handed to training code.
///
/// Cloning is cheap and clones can be read from any thread.
#[derive(Debug, Clone)]
pub struct FeatureDataset {
    corpus: Arc<Corpus>,
    waveforms: Option<Arc<Vec<Vec<f32>>>>,
}

impl FeatureDataset {
    pub fn new(corpus: Corpus) -> Self {
        Self {
            corpus: Arc::new(corpus),
            waveforms: None,
        }
    }

    /// Attach the normalized waveforms retained alongside the corpus.
    /// They must be index-aligned with the samples.
    pub fn with_waveforms(corpus: Corpus, waveforms: Vec<Vec<f32>>) -> Result<Self, CorpusError> {
        if waveforms.len() != corpus.len() {
            return Err(CorpusError::Config(format!(
                "{} waveforms for {} samples",
                waveforms.len(),
                corpus.len()
            )));
        }
        Ok(Self {
            corpus: Arc::new(corpus),
            waveforms: Some(Arc::new(waveforms)),
        })
    }

    pub fn len(&self) -> usize {
        self.corpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.corpus.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&FeatureTuple, CorpusError> {
        self.corpus
            .samples()
            .get(index)
            .ok_or(CorpusError::IndexOutOfRange {
                index,
                len: self.len(),
            })
    }

    /// Normalized waveform of sample `index`, if waveforms were retained.
    pub fn waveform(&self, index: usize) -> Result<Option<&[f32]>, CorpusError> {
        if index >= self.len() {
            return Err(CorpusError::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }
        Ok(self
            .waveforms
            .as_ref()
            .and_then(|w| w.get(index))
            .map(Vec::as_slice))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureTuple> {
        self.corpus.samples().iter()
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }
}
