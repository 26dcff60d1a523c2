//! Per-sample gating applied before a sample may enter the corpus.

use ndarray::Array2;

use crate::audio::Waveform;
use crate::config::PipelineConfig;
use crate::error::{DurationStage, SampleRejection};
use crate::{AlignerSample, FeatureTuple, SPEAKER_EMBEDDING_DIM, TOKEN_FEATURE_WIDTH};

/// Most tokens an alignment may leave without any frame.
pub const MAX_ZERO_DURATIONS: usize = 4;

/// Reject duration vectors with more than [`MAX_ZERO_DURATIONS`] zeros.
pub fn check_zero_durations(duration: &[u32]) -> Result<(), SampleRejection> {
    let zero_durations = duration.iter().filter(|&&d| d == 0).count();
    if zero_durations > MAX_ZERO_DURATIONS {
        return Err(SampleRejection::DegenerateAlignment {
            zero_durations,
            max: MAX_ZERO_DURATIONS,
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct CorpusValidator {
    min_len_secs: f64,
    max_len_secs: f64,
    reduction_factor: usize,
    token_width: usize,
}

impl CorpusValidator {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            min_len_secs: config.min_len_secs,
            max_len_secs: config.max_len_secs,
            reduction_factor: config.reduction_factor.max(1),
            token_width: TOKEN_FEATURE_WIDTH,
        }
    }

    pub fn check_transcript(&self, transcript: &str) -> Result<(), SampleRejection> {
        if transcript.trim().is_empty() {
            return Err(SampleRejection::EmptyTranscript);
        }
        Ok(())
    }

    /// Accept waveforms whose length lies in `[min_len, max_len]` seconds.
    pub fn check_duration(
        &self,
        wave: &Waveform,
        stage: DurationStage,
    ) -> Result<(), SampleRejection> {
        let seconds = wave.duration_secs();
        if !(self.min_len_secs..=self.max_len_secs).contains(&seconds) {
            return Err(SampleRejection::DurationOutOfRange {
                seconds,
                min: self.min_len_secs,
                max: self.max_len_secs,
                stage,
            });
        }
        Ok(())
    }

    /// A frontend that emits rows of the wrong width is misconfigured, not
    /// merely fed a bad transcript, so this is logged at error level.
    pub fn check_token_shape(&self, tokens: &Array2<f32>) -> Result<(), SampleRejection> {
        let (rows, width) = tokens.dim();
        if rows == 0 || width != self.token_width {
            log::error!(
                "Text frontend produced token features of shape [{rows} x {width}], expected width {}",
                self.token_width
            );
            return Err(SampleRejection::TokenShape {
                width,
                rows,
                expected: self.token_width,
            });
        }
        Ok(())
    }

    pub fn check_durations(&self, duration: &[u32]) -> Result<(), SampleRejection> {
        check_zero_durations(duration)
    }

    /// Final consistency check over a fully assembled sample.
    pub fn check_tuple(&self, tuple: &FeatureTuple) -> Result<(), SampleRejection> {
        self.check_token_shape(&tuple.tokens)?;
        let inconsistent = |msg: String| Err(SampleRejection::Inconsistent(msg));

        if tuple.tokens.nrows() != tuple.token_len {
            return inconsistent(format!(
                "token_len {} but {} token rows",
                tuple.token_len,
                tuple.tokens.nrows()
            ));
        }
        if tuple.mel.nrows() != tuple.mel_len {
            return inconsistent(format!(
                "mel_len {} but {} mel frames",
                tuple.mel_len,
                tuple.mel.nrows()
            ));
        }
        if tuple.duration.len() != tuple.token_len {
            return inconsistent(format!(
                "{} durations for {} tokens",
                tuple.duration.len(),
                tuple.token_len
            ));
        }
        if tuple.energy.len() != tuple.duration.len() || tuple.pitch.len() != tuple.duration.len()
        {
            return inconsistent(format!(
                "energy/pitch lengths {}/{} differ from {} durations",
                tuple.energy.len(),
                tuple.pitch.len(),
                tuple.duration.len()
            ));
        }
        self.check_durations(&tuple.duration)?;

        let covered = tuple.duration.iter().map(|&d| d as usize).sum::<usize>() * self.reduction_factor;
        let tolerance = duration_tolerance(self.reduction_factor, tuple.token_len);
        if covered.abs_diff(tuple.mel_len) > tolerance {
            return inconsistent(format!(
                "durations cover {covered} frames, mel has {} (tolerance {tolerance})",
                tuple.mel_len
            ));
        }

        if tuple
            .energy
            .iter()
            .chain(&tuple.pitch)
            .any(|v| !v.is_finite())
        {
            return inconsistent("non-finite energy or pitch value".to_string());
        }
        if let Some(embedding) = &tuple.speaker_embedding {
            if embedding.len() != SPEAKER_EMBEDDING_DIM {
                return inconsistent(format!(
                    "speaker embedding has {} dimensions, expected {SPEAKER_EMBEDDING_DIM}",
                    embedding.len()
                ));
            }
        }
        Ok(())
    }

    /// Consistency check for an aligner sample. Only the token width and the
    /// stored lengths are checked; there are no per-token features.
    pub fn check_aligner_sample(&self, sample: &AlignerSample) -> Result<(), SampleRejection> {
        self.check_token_shape(&sample.tokens)?;
        if sample.tokens.nrows() != sample.token_len {
            return Err(SampleRejection::Inconsistent(format!(
                "token_len {} but {} token rows",
                sample.token_len,
                sample.tokens.nrows()
            )));
        }
        if sample.mel.nrows() != sample.mel_len || sample.mel_len == 0 {
            return Err(SampleRejection::Inconsistent(format!(
                "mel_len {} but {} mel frames",
                sample.mel_len,
                sample.mel.nrows()
            )));
        }
        if sample.waveform.is_empty() {
            return Err(SampleRejection::Inconsistent("empty waveform".into()));
        }
        Ok(())
    }
}

/// Frames by which `sum(duration) * r` may miss the mel length.
///
/// Each duration is rounded to whole decoder steps, so it can be off by half
/// a step; without a reduction factor the counts are exact.
pub fn duration_tolerance(reduction_factor: usize, token_len: usize) -> usize {
    if reduction_factor <= 1 {
        0
    } else {
        (reduction_factor * token_len).div_ceil(2)
    }
}
