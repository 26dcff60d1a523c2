//! Audio loading, normalization and the DSP primitives behind them.

pub mod dsp;
pub mod normalizer;

use std::path::Path;

use crate::error::CorpusError;

pub use dsp::{SignalProcessor, StftProcessor};
pub use normalizer::AudioNormalizer;

/// A mono waveform together with its sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    /// Raw audio samples as f32 values in [-1, 1]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration of the audio in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Read a WAV file, downmixing multi-channel audio to mono.
    pub fn read_wav(path: &Path) -> Result<Self, CorpusError> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()?
            }
        };

        let samples = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                .collect()
        };

        Ok(Self::new(samples, spec.sample_rate))
    }

    /// Write the audio to a 32-bit float WAV file.
    pub fn write_wav(&self, path: &Path) -> Result<(), CorpusError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in &self.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Waveform;

    #[test]
    fn wav_round_trip_preserves_samples() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tone.wav");
        let wave = Waveform::new(vec![0.0, 0.25, -0.5, 0.75], 16_000);
        wave.write_wav(&path).expect("write");
        let back = Waveform::read_wav(&path).expect("read");
        assert_eq!(back, wave);
    }

    #[test]
    fn stereo_int_wav_is_downmixed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).expect("create");
        for _ in 0..4 {
            writer.write_sample(16_384i16).expect("left");
            writer.write_sample(0i16).expect("right");
        }
        writer.finalize().expect("finalize");

        let wave = Waveform::read_wav(&path).expect("read");
        assert_eq!(wave.sample_rate, 8_000);
        assert_eq!(wave.samples.len(), 4);
        assert!((wave.samples[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn duration_is_samples_over_rate() {
        let wave = Waveform::new(vec![0.0; 8_000], 16_000);
        assert_eq!(wave.duration_secs(), 0.5);
    }
}
