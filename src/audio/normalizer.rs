use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::dsp::SignalProcessor;
use super::Waveform;
use crate::config::PipelineConfig;
use crate::error::{CorpusError, DurationStage, SampleRejection};
use crate::validator::CorpusValidator;

/// Directory (below the cache directory) holding peak-normalized audio.
pub const NORMALIZED_DIR: &str = "normalized_audios";
/// Directory holding normalized audio with compressed silences.
pub const UNSILENCED_DIR: &str = "normalized_unsilenced_audios";

/// Length of the frames used for silence detection.
const SILENCE_FRAME_SECS: f32 = 0.01;

/// Settings for silence compression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SilenceParams {
    pub threshold_db: f32,
    pub min_silence_secs: f32,
    pub padding_secs: f32,
    pub speed: usize,
    pub volume: f32,
}

impl SilenceParams {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            threshold_db: config.silence_threshold_db,
            min_silence_secs: config.min_silence_secs,
            padding_secs: config.silence_padding_secs,
            speed: config.silent_speed.max(1),
            volume: config.silent_volume,
        }
    }
}

/// Brings raw recordings to a common rate and level, optionally squeezing
/// long pauses.
pub struct AudioNormalizer {
    dsp: Arc<dyn SignalProcessor>,
    target_rate: u32,
    peak_level: f32,
    silence: Option<SilenceParams>,
    persist: bool,
}

impl AudioNormalizer {
    pub fn new(config: &PipelineConfig, dsp: Arc<dyn SignalProcessor>) -> Self {
        Self {
            dsp,
            target_rate: config.target_sample_rate,
            peak_level: config.peak_level,
            silence: config
                .cut_silence
                .then(|| SilenceParams::from_config(config)),
            persist: config.persist_intermediates,
        }
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Resample, peak-normalize, compress silences (if enabled) and trim
    /// leading and trailing zeros.
    pub fn normalize(&self, samples: &[f32], source_rate: u32) -> Result<Waveform, CorpusError> {
        let wave = self.level(samples, source_rate)?;
        Ok(self.unsilence(wave))
    }

    /// Resample and peak-normalize only.
    fn level(&self, samples: &[f32], source_rate: u32) -> Result<Waveform, CorpusError> {
        if samples.is_empty() || source_rate == 0 {
            return Err(CorpusError::Audio("empty waveform".into()));
        }
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(CorpusError::Audio("waveform contains NaN or inf".into()));
        }

        let mut resampled = self.dsp.resample(samples, source_rate, self.target_rate)?;
        let peak = resampled.iter().fold(0f32, |acc, s| acc.max(s.abs()));
        if peak == 0.0 {
            return Err(CorpusError::Audio("waveform is completely silent".into()));
        }
        let gain = self.peak_level / peak;
        resampled.iter_mut().for_each(|s| *s *= gain);

        Ok(Waveform::new(trim_zeros(resampled), self.target_rate))
    }

    fn unsilence(&self, wave: Waveform) -> Waveform {
        match self.silence {
            Some(params) => {
                let squeezed = compress_silences(&wave.samples, wave.sample_rate, &params);
                Waveform::new(trim_zeros(squeezed), wave.sample_rate)
            }
            None => wave,
        }
    }

    /// Load `audio_path` and normalize it, reusing intermediate files under
    /// `work_dir` when an earlier run already produced them.
    ///
    /// Durations are checked on the raw recording and again on the result,
    /// since silence compression can push a sample out of the window.
    pub fn prepare(
        &self,
        audio_path: &Path,
        work_dir: Option<&Path>,
        validator: &CorpusValidator,
    ) -> Result<Waveform, SampleRejection> {
        let paths = work_dir
            .filter(|_| self.persist)
            .map(|dir| IntermediatePaths::new(dir, audio_path));

        if let Some(paths) = &paths {
            let reusable = if self.silence.is_some() {
                &paths.unsilenced
            } else {
                &paths.normalized
            };
            if reusable.exists() {
                log::debug!("Reusing {}", reusable.display());
                let wave = Waveform::read_wav(reusable)?;
                if wave.sample_rate != self.target_rate {
                    return Err(SampleRejection::SampleRateMismatch {
                        expected: self.target_rate,
                        found: wave.sample_rate,
                    });
                }
                validator.check_duration(&wave, DurationStage::Normalized)?;
                return Ok(wave);
            }
        }

        let raw = Waveform::read_wav(audio_path)?;
        validator.check_duration(&raw, DurationStage::Raw)?;

        let levelled = self
            .level(&raw.samples, raw.sample_rate)
            .map_err(|e| SampleRejection::NormalizationFailed(e.to_string()))?;
        validator.check_duration(&levelled, DurationStage::Normalized)?;
        if let Some(paths) = &paths {
            persist(&levelled, &paths.normalized);
        }

        if self.silence.is_none() {
            return Ok(levelled);
        }
        let squeezed = self.unsilence(levelled);
        if squeezed.samples.is_empty() {
            return Err(SampleRejection::NormalizationFailed(
                "nothing left after silence removal".into(),
            ));
        }
        validator.check_duration(&squeezed, DurationStage::Normalized)?;
        if let Some(paths) = &paths {
            persist(&squeezed, &paths.unsilenced);
        }
        Ok(squeezed)
    }
}

struct IntermediatePaths {
    normalized: PathBuf,
    unsilenced: PathBuf,
}

impl IntermediatePaths {
    /// Intermediates are named `<stem>-<dir hash>`, where the hash covers
    /// the source's parent directory, so same-named files from different
    /// directories never share an intermediate.
    fn new(work_dir: &Path, audio_path: &Path) -> Self {
        let stem = audio_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        let parent = audio_path.parent().unwrap_or_else(|| Path::new(""));
        let digest = Sha256::digest(parent.to_string_lossy().as_bytes());
        let tag: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
        let stem = format!("{stem}-{tag}");
        Self {
            normalized: work_dir.join(NORMALIZED_DIR).join(format!("{stem}.wav")),
            unsilenced: work_dir
                .join(UNSILENCED_DIR)
                .join(format!("{stem}_unsilenced.wav")),
        }
    }
}

/// Write an intermediate file via temp-file + rename. Failure only costs the
/// reuse on the next run, so it is logged and ignored.
fn persist(wave: &Waveform, path: &Path) {
    let tmp = path.with_extension("wav.tmp");
    let result = path
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .map_err(CorpusError::from)
        .and_then(|_| wave.write_wav(&tmp))
        .and_then(|_| fs::rename(&tmp, path).map_err(CorpusError::from));
    if let Err(e) = result {
        log::warn!("Could not persist {}: {e}", path.display());
        let _ = fs::remove_file(&tmp);
    }
}

/// Drop exact zeros from both ends.
pub fn trim_zeros(mut samples: Vec<f32>) -> Vec<f32> {
    let end = samples
        .iter()
        .rposition(|&s| s != 0.0)
        .map_or(0, |i| i + 1);
    samples.truncate(end);
    let start = samples.iter().position(|&s| s != 0.0).unwrap_or(samples.len());
    samples.drain(..start);
    samples
}

/// Speed up silent stretches instead of cutting them out.
///
/// A span counts as silent when every 10 ms frame in it sits below
/// `threshold_db` and it lasts at least `min_silence_secs`. The outer
/// `padding_secs` on each side are kept untouched; the interior is decimated
/// by `speed` and scaled by `volume`.
pub fn compress_silences(samples: &[f32], sample_rate: u32, params: &SilenceParams) -> Vec<f32> {
    let frame = ((sample_rate as f32 * SILENCE_FRAME_SECS) as usize).max(1);
    let threshold = 10f32.powf(params.threshold_db / 20.0);
    let min_frames = ((params.min_silence_secs / SILENCE_FRAME_SECS).ceil() as usize).max(1);
    let pad = (params.padding_secs * sample_rate as f32) as usize;

    let silent: Vec<bool> = samples
        .chunks(frame)
        .map(|chunk| {
            let rms = (chunk.iter().map(|s| s * s).sum::<f32>() / chunk.len() as f32).sqrt();
            rms < threshold
        })
        .collect();

    let mut out = Vec::with_capacity(samples.len());
    let mut cursor = 0usize;
    let mut i = 0usize;
    while i < silent.len() {
        if !silent[i] {
            i += 1;
            continue;
        }
        let run_start = i;
        while i < silent.len() && silent[i] {
            i += 1;
        }
        if i - run_start < min_frames {
            continue;
        }

        let span_start = run_start * frame;
        let span_end = (i * frame).min(samples.len());
        let inner_start = span_start + pad;
        let inner_end = span_end.saturating_sub(pad);
        if inner_start >= inner_end {
            continue;
        }

        out.extend_from_slice(&samples[cursor..inner_start]);
        out.extend(
            samples[inner_start..inner_end]
                .iter()
                .step_by(params.speed)
                .map(|s| s * params.volume),
        );
        cursor = inner_end;
    }
    out.extend_from_slice(&samples[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::dsp::StftProcessor;

    fn normalizer(config: &PipelineConfig) -> AudioNormalizer {
        let dsp = Arc::new(StftProcessor::new(
            config.target_sample_rate,
            config.n_fft,
            config.hop_length,
            config.mel_bins,
        ));
        AudioNormalizer::new(config, dsp)
    }

    fn tone(sr: u32, secs: f32) -> Vec<f32> {
        let n = (sr as f32 * secs) as usize;
        (0..n)
            .map(|i| 0.3 * (2.0 * std::f32::consts::PI * 220.0 * i as f32 / sr as f32).sin())
            .collect()
    }

    #[test]
    fn normalize_resamples_and_sets_peak() {
        let config = PipelineConfig::default();
        let wave = normalizer(&config)
            .normalize(&tone(32_000, 1.0), 32_000)
            .expect("normalize");
        assert_eq!(wave.sample_rate, 16_000);
        let peak = wave.samples.iter().fold(0f32, |a, s| a.max(s.abs()));
        assert!((peak - 0.95).abs() < 1e-3);
        assert!((wave.duration_secs() - 1.0).abs() < 0.01);
    }

    #[test]
    fn silent_input_is_an_error() {
        let config = PipelineConfig::default();
        let err = normalizer(&config).normalize(&[0.0; 1000], 16_000);
        assert!(matches!(err, Err(CorpusError::Audio(_))));
    }

    #[test]
    fn trim_zeros_strips_both_ends() {
        assert_eq!(trim_zeros(vec![0.0, 0.0, 1.0, 0.0, 2.0, 0.0]), vec![1.0, 0.0, 2.0]);
        assert!(trim_zeros(vec![0.0; 4]).is_empty());
    }

    #[test]
    fn long_pause_is_compressed_not_removed() {
        let sr = 16_000;
        let mut samples = tone(sr, 0.5);
        samples.extend(std::iter::repeat(0.0).take(sr as usize));
        samples.extend(tone(sr, 0.5));

        let params = SilenceParams::from_config(&PipelineConfig::default());
        let out = compress_silences(&samples, sr, &params);

        // 1 s pause: 2 x 25 ms padding kept, the other 950 ms sped up 12x
        let expected = samples.len() - 15_200 + 15_200 / 12 + 1;
        assert!(
            (out.len() as isize - expected as isize).abs() <= 160,
            "got {} expected about {}",
            out.len(),
            expected
        );
        assert!(out.len() > 16_000);
    }

    #[test]
    fn short_pause_is_kept() {
        let sr = 16_000;
        let mut samples = tone(sr, 0.5);
        samples.extend(std::iter::repeat(0.0).take(800));
        samples.extend(tone(sr, 0.5));

        let params = SilenceParams::from_config(&PipelineConfig::default());
        assert_eq!(compress_silences(&samples, sr, &params).len(), samples.len());
    }

    #[test]
    fn prepare_reuses_persisted_audio() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("utt1.wav");
        Waveform::new(tone(22_050, 1.5), 22_050)
            .write_wav(&src)
            .expect("write source");

        let config = PipelineConfig::default();
        let validator = CorpusValidator::new(&config);
        let norm = normalizer(&config);
        let first = norm
            .prepare(&src, Some(dir.path()), &validator)
            .expect("first prepare");
        let cached = IntermediatePaths::new(dir.path(), &src).normalized;
        assert!(cached.starts_with(dir.path().join(NORMALIZED_DIR)));
        assert!(cached.exists());

        fs::remove_file(&src).expect("remove source");
        let second = norm
            .prepare(&src, Some(dir.path()), &validator)
            .expect("second prepare reads the intermediate");
        assert_eq!(first, second);
    }

    #[test]
    fn prepare_rejects_short_raw_audio() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("short.wav");
        Waveform::new(tone(16_000, 0.5), 16_000)
            .write_wav(&src)
            .expect("write source");

        let config = PipelineConfig::default();
        let validator = CorpusValidator::new(&config);
        let err = normalizer(&config)
            .prepare(&src, None, &validator)
            .expect_err("0.5 s is below min_len");
        assert!(matches!(
            err,
            SampleRejection::DurationOutOfRange {
                stage: DurationStage::Raw,
                ..
            }
        ));
    }

    /// Tone, a pause of `pause` seconds, tone.
    fn paused(sr: u32, speech: f32, pause: f32) -> Vec<f32> {
        let mut samples = tone(sr, speech);
        samples.extend(std::iter::repeat(0.0).take((sr as f32 * pause) as usize));
        samples.extend(tone(sr, speech));
        samples
    }

    #[test]
    fn prepare_rejects_audio_squeezed_below_min_len() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("paused.wav");
        Waveform::new(paused(16_000, 0.4, 0.5), 16_000)
            .write_wav(&src)
            .expect("write source");

        let config = PipelineConfig {
            cut_silence: true,
            ..Default::default()
        };
        let validator = CorpusValidator::new(&config);
        // 1.3 s raw passes; about 0.9 s remain once the pause is compressed.
        let err = normalizer(&config)
            .prepare(&src, None, &validator)
            .expect_err("compressed audio is below min_len");
        match err {
            SampleRejection::DurationOutOfRange { seconds, stage, .. } => {
                assert_eq!(stage, DurationStage::Normalized);
                assert!(seconds < 1.0, "{seconds}");
            }
            other => panic!("unexpected rejection {other}"),
        }
    }

    #[test]
    fn prepare_reuses_unsilenced_audio() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("paused.wav");
        let raw = paused(16_000, 0.8, 0.6);
        Waveform::new(raw.clone(), 16_000)
            .write_wav(&src)
            .expect("write source");

        let config = PipelineConfig {
            cut_silence: true,
            ..Default::default()
        };
        let validator = CorpusValidator::new(&config);
        let norm = normalizer(&config);
        let first = norm
            .prepare(&src, Some(dir.path()), &validator)
            .expect("first prepare");
        assert!(first.samples.len() < raw.len() - 6_000);

        let paths = IntermediatePaths::new(dir.path(), &src);
        assert!(paths.normalized.exists());
        assert!(paths.unsilenced.exists());

        fs::remove_file(&src).expect("remove source");
        let second = norm
            .prepare(&src, Some(dir.path()), &validator)
            .expect("second prepare reads the unsilenced intermediate");
        assert_eq!(first, second);
    }

    #[test]
    fn same_stem_in_different_directories_keeps_separate_intermediates() {
        let data = tempfile::tempdir().expect("tempdir");
        let work = tempfile::tempdir().expect("tempdir");
        let a = data.path().join("a").join("0001.wav");
        let b = data.path().join("b").join("0001.wav");
        for (path, secs) in [(&a, 1.2), (&b, 1.8)] {
            fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            Waveform::new(tone(16_000, secs), 16_000)
                .write_wav(path)
                .expect("write source");
        }

        let config = PipelineConfig::default();
        let validator = CorpusValidator::new(&config);
        let norm = normalizer(&config);
        let first_a = norm.prepare(&a, Some(work.path()), &validator).expect("a");
        let first_b = norm.prepare(&b, Some(work.path()), &validator).expect("b");
        let normalized = work.path().join(NORMALIZED_DIR);
        assert_eq!(fs::read_dir(&normalized).expect("intermediates").count(), 2);

        fs::remove_file(&a).expect("remove a");
        fs::remove_file(&b).expect("remove b");
        let second_a = norm.prepare(&a, Some(work.path()), &validator).expect("a again");
        let second_b = norm.prepare(&b, Some(work.path()), &validator).expect("b again");
        assert_eq!(first_a, second_a);
        assert_eq!(first_b, second_b);
        assert_ne!(second_a.samples.len(), second_b.samples.len());
    }
}
