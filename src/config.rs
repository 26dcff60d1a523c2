use std::path::Path;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CorpusError;

/// What the builder does when a worker thread dies mid-share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerCrashPolicy {
    /// Log the crash, keep whatever the worker delivered before dying and
    /// finish the build with a truncated corpus.
    #[default]
    Tolerate,
    /// Abort the build with [`CorpusError::WorkerCrashed`].
    Fail,
}

/// Parameters for building a feature corpus.
///
/// Every field has a default, so a JSON config only needs the keys it wants
/// to override:
///
/// ```rust
/// use tts_corpus::config::PipelineConfig;
///
/// let config: PipelineConfig =
///     serde_json::from_str(r#"{ "language": "de", "worker_count": 2 }"#).unwrap();
/// assert_eq!(config.reduction_factor, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(default, setter(into))]
#[serde(default)]
pub struct PipelineConfig {
    /// Language code handed to the text frontend.
    pub language: String,
    /// Shortest accepted utterance, in seconds.
    pub min_len_secs: f64,
    /// Longest accepted utterance, in seconds.
    pub max_len_secs: f64,
    /// Sample rate every waveform is resampled to.
    pub target_sample_rate: u32,
    /// Peak amplitude after normalization.
    pub peak_level: f32,
    /// Compress long intra-utterance silences.
    pub cut_silence: bool,
    /// Frame RMS below this level (dBFS) counts as silence.
    pub silence_threshold_db: f32,
    /// Silent spans shorter than this are left untouched.
    pub min_silence_secs: f32,
    /// Context kept at full speed on each side of a compressed silence.
    pub silence_padding_secs: f32,
    /// Speed-up applied to the interior of a silent span.
    pub silent_speed: usize,
    /// Gain applied to the compressed silence.
    pub silent_volume: f32,
    /// Write normalized audio to `normalized_audios/` and reuse it on reruns.
    pub persist_intermediates: bool,
    pub n_fft: usize,
    pub hop_length: usize,
    pub mel_bins: usize,
    /// Number of mel frames the acoustic decoder consumes per step.
    pub reduction_factor: usize,
    pub f0_min: f32,
    pub f0_max: f32,
    /// Normalized autocorrelation peak needed to call a frame voiced.
    pub voicing_threshold: f32,
    /// Extract a speaker embedding for every sample.
    pub speaker_embedding: bool,
    pub worker_count: usize,
    /// Seed for the key shuffle that precedes partitioning.
    pub seed: u64,
    /// Ignore any existing cache and build from scratch.
    pub rebuild: bool,
    /// Rebuild instead of failing when the cache cannot be loaded.
    pub rebuild_on_corrupt_cache: bool,
    /// Store normalized waveforms next to the corpus in the cache file.
    pub retain_waveforms: bool,
    pub crash_policy: WorkerCrashPolicy,
    /// Log worker progress every this many samples.
    pub progress_interval: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            min_len_secs: 1.0,
            max_len_secs: 20.0,
            target_sample_rate: 16_000,
            peak_level: 0.95,
            cut_silence: false,
            silence_threshold_db: -40.0,
            min_silence_secs: 0.1,
            silence_padding_secs: 0.025,
            silent_speed: 12,
            silent_volume: 0.0,
            persist_intermediates: true,
            n_fft: 1024,
            hop_length: 256,
            mel_bins: 80,
            reduction_factor: 1,
            f0_min: 80.0,
            f0_max: 400.0,
            voicing_threshold: 0.3,
            speaker_embedding: false,
            worker_count: 6,
            seed: 13,
            rebuild: false,
            rebuild_on_corrupt_cache: false,
            retain_waveforms: false,
            crash_policy: WorkerCrashPolicy::Tolerate,
            progress_interval: 50,
        }
    }
}

impl PipelineConfig {
    /// Load a config from a JSON file, filling missing keys with defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, CorpusError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// SHA-256 over every setting that changes the stored samples.
    ///
    /// Scheduling knobs such as `worker_count`, `seed` or the crash policy
    /// are left out, so changing them keeps an existing cache valid.
    pub fn fingerprint(&self) -> [u8; 32] {
        let settings = (
            (&self.language, self.min_len_secs, self.max_len_secs),
            (self.target_sample_rate, self.peak_level, self.cut_silence),
            (
                self.silence_threshold_db,
                self.min_silence_secs,
                self.silence_padding_secs,
                self.silent_speed,
                self.silent_volume,
            ),
            (self.n_fft, self.hop_length, self.mel_bins, self.reduction_factor),
            (self.f0_min, self.f0_max, self.voicing_threshold),
            (self.speaker_embedding, self.retain_waveforms),
        );
        let mut hasher = Sha256::new();
        hasher.update(format!("{settings:?}").as_bytes());
        hasher.finalize().into()
    }

    /// Reject parameter combinations the extractors cannot work with.
    pub fn validate(&self) -> Result<(), CorpusError> {
        if self.min_len_secs > self.max_len_secs {
            return Err(CorpusError::Config(format!(
                "min_len_secs ({}) exceeds max_len_secs ({})",
                self.min_len_secs, self.max_len_secs
            )));
        }
        if self.reduction_factor == 0 {
            return Err(CorpusError::Config("reduction_factor must be >= 1".into()));
        }
        if self.hop_length == 0 || self.n_fft < self.hop_length {
            return Err(CorpusError::Config(format!(
                "need 0 < hop_length ({}) <= n_fft ({})",
                self.hop_length, self.n_fft
            )));
        }
        if self.mel_bins == 0 || self.target_sample_rate == 0 {
            return Err(CorpusError::Config(
                "mel_bins and target_sample_rate must be non-zero".into(),
            ));
        }
        if !(self.f0_min > 0.0 && self.f0_min < self.f0_max) {
            return Err(CorpusError::Config(format!(
                "invalid pitch range [{}, {}]",
                self.f0_min, self.f0_max
            )));
        }
        if 2.0 * self.f0_max >= self.target_sample_rate as f32 {
            return Err(CorpusError::Config(format!(
                "f0_max ({}) must be below the Nyquist frequency of {} Hz",
                self.f0_max, self.target_sample_rate
            )));
        }
        if self.silent_speed == 0 {
            return Err(CorpusError::Config("silent_speed must be >= 1".into()));
        }
        Ok(())
    }
}
