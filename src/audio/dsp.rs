use std::sync::Arc;

use ndarray::Array2;
use rubato::{FftFixedIn, Resampler};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::error::CorpusError;

/// Input block size of the FFT resampler.
const RESAMPLE_CHUNK: usize = 1024;
const RESAMPLE_SUB_CHUNKS: usize = 2;

/// Low-level signal processing the pipeline is built on.
///
/// Frame-based methods use centered framing: frame `i` is centred on sample
/// `i * hop_length`, so a waveform of `n` samples always yields
/// `n / hop_length + 1` frames. Mel, pitch and energy sequences computed from
/// the same waveform therefore have identical lengths.
pub trait SignalProcessor: Send + Sync {
    /// Resample `samples` from `from_rate` to `to_rate`.
    fn resample(&self, samples: &[f32], from_rate: u32, to_rate: u32)
        -> Result<Vec<f32>, CorpusError>;

    /// Log-mel spectrogram shaped `[frames x mel_bins]`.
    fn mel_spectrogram(&self, samples: &[f32]) -> Array2<f32>;

    /// Root-mean-square energy of every frame.
    fn frame_rms(&self, samples: &[f32]) -> Vec<f32>;

    /// Samples between consecutive frame centres.
    fn hop_length(&self) -> usize;

    /// Window length used for every frame.
    fn window_length(&self) -> usize;

    /// Number of frames produced for `n_samples` samples.
    fn frame_count(&self, n_samples: usize) -> usize {
        n_samples / self.hop_length() + 1
    }
}

/// Default [`SignalProcessor`]: Hann-windowed STFT with a Slaney mel
/// filterbank and band-limited FFT resampling.
pub struct StftProcessor {
    n_fft: usize,
    hop_length: usize,
    mel_bins: usize,
    window: Vec<f32>,
    /// Row-major `[mel_bins x (n_fft / 2 + 1)]`
    filterbank: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl StftProcessor {
    pub fn new(sample_rate: u32, n_fft: usize, hop_length: usize, mel_bins: usize) -> Self {
        let window = (0..n_fft)
            .map(|i| {
                0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / n_fft as f64).cos()) as f32
            })
            .collect();
        let filterbank = mel_filterbank(
            sample_rate as f64,
            n_fft,
            mel_bins,
            0.0,
            sample_rate as f64 / 2.0,
        );
        let fft = FftPlanner::<f32>::new().plan_fft_forward(n_fft);

        Self {
            n_fft,
            hop_length,
            mel_bins,
            window,
            filterbank,
            fft,
        }
    }

    pub fn mel_bins(&self) -> usize {
        self.mel_bins
    }

    /// Copy the `n_fft` samples of frame `frame_idx` into `out`, reflecting at
    /// the signal edges.
    fn fill_frame(&self, samples: &[f32], frame_idx: usize, out: &mut [f32]) {
        let half = (self.n_fft / 2) as isize;
        let centre = (frame_idx * self.hop_length) as isize;
        for (i, slot) in out.iter_mut().enumerate() {
            let pos = centre - half + i as isize;
            *slot = reflect(samples, pos);
        }
    }
}

impl SignalProcessor for StftProcessor {
    fn resample(
        &self,
        samples: &[f32],
        from_rate: u32,
        to_rate: u32,
    ) -> Result<Vec<f32>, CorpusError> {
        resample(samples, from_rate, to_rate)
    }

    fn mel_spectrogram(&self, samples: &[f32]) -> Array2<f32> {
        let n_frames = self.frame_count(samples.len());
        let n_bins = self.n_fft / 2 + 1;
        let mut mel = Array2::<f32>::zeros((n_frames, self.mel_bins));

        let mut frame = vec![0f32; self.n_fft];
        let mut buffer = vec![Complex::new(0f32, 0f32); self.n_fft];
        let mut magnitude = vec![0f32; n_bins];

        for t in 0..n_frames {
            self.fill_frame(samples, t, &mut frame);
            for (slot, (&s, &w)) in buffer.iter_mut().zip(frame.iter().zip(&self.window)) {
                *slot = Complex::new(s * w, 0.0);
            }
            self.fft.process(&mut buffer);

            for (k, mag) in magnitude.iter_mut().enumerate() {
                let c = buffer[k];
                *mag = (c.re * c.re + c.im * c.im + 1e-9).sqrt();
            }

            for m in 0..self.mel_bins {
                let row = &self.filterbank[m * n_bins..(m + 1) * n_bins];
                let val: f32 = row.iter().zip(&magnitude).map(|(f, s)| f * s).sum();
                mel[[t, m]] = val.max(1e-5).ln();
            }
        }

        mel
    }

    fn frame_rms(&self, samples: &[f32]) -> Vec<f32> {
        let n_frames = self.frame_count(samples.len());
        let mut frame = vec![0f32; self.n_fft];
        (0..n_frames)
            .map(|t| {
                self.fill_frame(samples, t, &mut frame);
                (frame.iter().map(|s| s * s).sum::<f32>() / self.n_fft as f32).sqrt()
            })
            .collect()
    }

    fn hop_length(&self) -> usize {
        self.hop_length
    }

    fn window_length(&self) -> usize {
        self.n_fft
    }
}

/// Band-limited resampling with rubato's FFT resampler.
///
/// The resampler's output delay is dropped and the result is cut to
/// `round(len * to_rate / from_rate)` samples, so timing is preserved.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, CorpusError> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    if from_rate == 0 || to_rate == 0 {
        return Err(CorpusError::Audio("sample rate must be non-zero".into()));
    }

    let mut resampler = FftFixedIn::<f32>::new(
        from_rate as usize,
        to_rate as usize,
        RESAMPLE_CHUNK,
        RESAMPLE_SUB_CHUNKS,
        1,
    )
    .map_err(|e| CorpusError::Audio(format!("failed to create resampler: {e}")))?;

    let delay = resampler.output_delay();
    let expected = (samples.len() as f64 * to_rate as f64 / from_rate as f64)
        .round()
        .max(1.0) as usize;
    let mut out = Vec::with_capacity(delay + expected + RESAMPLE_CHUNK);

    for chunk in samples.chunks(RESAMPLE_CHUNK) {
        let input: [&[f32]; 1] = [chunk];
        let block = if chunk.len() == RESAMPLE_CHUNK {
            resampler.process(&input[..], None)
        } else {
            resampler.process_partial(Some(&input[..]), None)
        }
        .map_err(|e| CorpusError::Audio(format!("resampling failed: {e}")))?;
        out.extend_from_slice(&block[0]);
    }

    // Flush the filter tail until the delayed signal is complete.
    while out.len() < delay + expected {
        let block = resampler
            .process_partial(None::<&[&[f32]]>, None)
            .map_err(|e| CorpusError::Audio(format!("resampling failed: {e}")))?;
        if block[0].is_empty() {
            break;
        }
        out.extend_from_slice(&block[0]);
    }

    out.drain(..delay.min(out.len()));
    out.resize(expected, 0.0);
    Ok(out)
}

/// Sample at `pos`, mirrored at both edges (numpy "reflect" padding).
fn reflect(samples: &[f32], pos: isize) -> f32 {
    let n = samples.len() as isize;
    if n == 0 {
        return 0.0;
    }
    if n == 1 {
        return if pos == 0 { samples[0] } else { 0.0 };
    }
    let period = 2 * (n - 1);
    let mut p = pos.rem_euclid(period);
    if p >= n {
        p = period - p;
    }
    samples[p as usize]
}

/// Slaney-normalized mel filterbank (librosa `norm="slaney", htk=False`).
fn mel_filterbank(sr: f64, n_fft: usize, n_mels: usize, fmin: f64, fmax: f64) -> Vec<f32> {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;
    const LOG_STEP: f64 = 0.068_751_74;

    fn hz_to_mel(f: f64) -> f64 {
        if f < MIN_LOG_HZ {
            f / F_SP
        } else {
            MIN_LOG_MEL + (f / MIN_LOG_HZ).ln() / LOG_STEP
        }
    }
    fn mel_to_hz(m: f64) -> f64 {
        if m < MIN_LOG_MEL {
            m * F_SP
        } else {
            MIN_LOG_HZ * ((m - MIN_LOG_MEL) * LOG_STEP).exp()
        }
    }

    let n_bins = n_fft / 2 + 1;
    let mel_min = hz_to_mel(fmin);
    let mel_max = hz_to_mel(fmax);
    let hz_points: Vec<f64> = (0..=n_mels + 1)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0f32; n_mels * n_bins];
    for m in 0..n_mels {
        let (left, centre, right) = (hz_points[m], hz_points[m + 1], hz_points[m + 2]);
        let enorm = if right > left { 2.0 / (right - left) } else { 0.0 };
        for k in 0..n_bins {
            let f = k as f64 * sr / n_fft as f64;
            let val = if f >= left && f <= centre && centre > left {
                (f - left) / (centre - left)
            } else if f > centre && f <= right && right > centre {
                (right - f) / (right - centre)
            } else {
                0.0
            };
            filters[m * n_bins + k] = (val * enorm) as f32;
        }
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sr: u32, secs: f32) -> Vec<f32> {
        let n = (sr as f32 * secs) as usize;
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sr as f32).sin())
            .collect()
    }

    #[test]
    fn frame_counts_agree_between_mel_and_rms() {
        let dsp = StftProcessor::new(16_000, 1024, 256, 80);
        let wave = sine(220.0, 16_000, 0.37);
        let mel = dsp.mel_spectrogram(&wave);
        let rms = dsp.frame_rms(&wave);
        assert_eq!(mel.nrows(), dsp.frame_count(wave.len()));
        assert_eq!(mel.ncols(), 80);
        assert_eq!(rms.len(), mel.nrows());
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len().max(1) as f32).sqrt()
    }

    #[test]
    fn resample_halves_length() {
        let dsp = StftProcessor::new(16_000, 512, 128, 40);
        let wave = sine(100.0, 32_000, 1.0);
        let out = dsp.resample(&wave, 32_000, 16_000).expect("resample");
        assert_eq!(out.len(), 16_000);
    }

    #[test]
    fn resample_keeps_in_band_tones() {
        let wave = sine(1_000.0, 44_100, 1.0);
        let out = resample(&wave, 44_100, 16_000).expect("resample");
        assert_eq!(out.len(), 16_000);
        let level = rms(&out[2_000..14_000]);
        assert!((level - std::f32::consts::FRAC_1_SQRT_2).abs() < 0.05, "rms {level}");
    }

    #[test]
    fn resample_removes_content_above_nyquist() {
        // 12 kHz cannot be represented at 16 kHz and must not fold to 4 kHz.
        let wave = sine(12_000.0, 48_000, 1.0);
        let out = resample(&wave, 48_000, 16_000).expect("resample");
        assert_eq!(out.len(), 16_000);
        let level = rms(&out[2_000..14_000]);
        assert!(level < 0.05, "aliased rms {level}");
    }

    #[test]
    fn resample_is_a_no_op_at_equal_rates() {
        let wave = sine(300.0, 16_000, 0.1);
        assert_eq!(resample(&wave, 16_000, 16_000).expect("resample"), wave);
    }

    #[test]
    fn sine_energy_is_peak_over_sqrt2() {
        let dsp = StftProcessor::new(16_000, 1024, 256, 80);
        let wave = sine(500.0, 16_000, 1.0);
        let rms = dsp.frame_rms(&wave);
        let mid = rms[rms.len() / 2];
        assert!((mid - std::f32::consts::FRAC_1_SQRT_2).abs() < 0.02, "rms {mid}");
    }

    #[test]
    fn mel_energy_peaks_near_tone_frequency() {
        let dsp = StftProcessor::new(16_000, 1024, 256, 80);
        let low = dsp.mel_spectrogram(&sine(200.0, 16_000, 0.5));
        let high = dsp.mel_spectrogram(&sine(4_000.0, 16_000, 0.5));
        let argmax = |row: ndarray::ArrayView1<f32>| {
            row.iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0)
        };
        assert!(argmax(low.row(10)) < argmax(high.row(10)));
    }

    #[test]
    fn reflect_mirrors_edges() {
        let s = [1.0, 2.0, 3.0];
        assert_eq!(reflect(&s, -1), 2.0);
        assert_eq!(reflect(&s, 3), 2.0);
        assert_eq!(reflect(&s, 1), 2.0);
    }
}
