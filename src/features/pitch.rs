use super::{average_spans, token_spans};
use crate::config::PipelineConfig;

/// Autocorrelation F0 tracker, averaged per token.
#[derive(Debug, Clone)]
pub struct PitchExtractor {
    sample_rate: u32,
    hop_length: usize,
    window_length: usize,
    min_lag: usize,
    max_lag: usize,
    voicing_threshold: f32,
    reduction_factor: usize,
}

impl PitchExtractor {
    /// The analysis window is `n_fft` samples, widened when needed so that
    /// the period of `f0_min` fits twice.
    pub fn new(config: &PipelineConfig) -> Self {
        let sample_rate = config.target_sample_rate as f32;
        let min_lag = ((sample_rate / config.f0_max).floor() as usize).max(1);
        let max_lag = (sample_rate / config.f0_min).ceil() as usize;
        Self {
            sample_rate: config.target_sample_rate,
            hop_length: config.hop_length,
            window_length: config.n_fft.max(2 * (max_lag + 1)),
            min_lag,
            max_lag,
            voicing_threshold: config.voicing_threshold,
            reduction_factor: config.reduction_factor.max(1),
        }
    }

    /// One pitch value per token: the mean F0 of the voiced frames inside
    /// the token's span. Tokens with no voiced frame get `0.0`, which is
    /// passed through as-is.
    pub fn extract(&self, samples: &[f32], duration: &[u32], mel_len: usize) -> Vec<f32> {
        let f0 = self.frame_f0(samples, mel_len);
        let spans = token_spans(duration, self.reduction_factor, mel_len);
        average_spans(&f0, &spans, |v| v > 0.0)
    }

    /// F0 in Hz for each of the first `n_frames` centered frames, `0.0`
    /// where the frame is unvoiced.
    pub fn frame_f0(&self, samples: &[f32], n_frames: usize) -> Vec<f32> {
        let (min_lag, max_lag) = (self.min_lag, self.max_lag);
        let half = self.window_length / 2;
        let mut frame = vec![0f32; self.window_length];

        (0..n_frames)
            .map(|t| {
                let centre = t * self.hop_length;
                for (i, slot) in frame.iter_mut().enumerate() {
                    *slot = (centre + i)
                        .checked_sub(half)
                        .and_then(|pos| samples.get(pos))
                        .copied()
                        .unwrap_or(0.0);
                }
                self.estimate(&mut frame, min_lag, max_lag)
            })
            .collect()
    }

    fn estimate(&self, frame: &mut [f32], min_lag: usize, max_lag: usize) -> f32 {
        let n = frame.len();
        if max_lag >= n / 2 || min_lag >= max_lag {
            return 0.0;
        }
        let mean = frame.iter().sum::<f32>() / n as f32;
        frame.iter_mut().for_each(|s| *s -= mean);
        let energy: f32 = frame.iter().map(|s| s * s).sum();
        if energy < 1e-6 {
            return 0.0;
        }

        let correlation = |lag: usize| {
            let (head, tail) = (&frame[..n - lag], &frame[lag..]);
            let cross: f32 = head.iter().zip(tail).map(|(a, b)| a * b).sum();
            let e_head: f32 = head.iter().map(|s| s * s).sum();
            let e_tail: f32 = tail.iter().map(|s| s * s).sum();
            let norm = (e_head * e_tail).sqrt();
            if norm > 0.0 {
                cross / norm
            } else {
                0.0
            }
        };

        let scores: Vec<f32> = (min_lag..=max_lag).map(correlation).collect();
        let Some(global) = scores.iter().copied().max_by(|a, b| a.total_cmp(b)) else {
            return 0.0;
        };
        if global < self.voicing_threshold {
            return 0.0;
        }
        // Multiples of the period correlate almost as well as the period
        // itself; take the shortest lag that comes close to the global peak.
        let is_local_max = |i: usize| {
            (i == 0 || scores[i] >= scores[i - 1])
                && (i + 1 == scores.len() || scores[i] >= scores[i + 1])
        };
        let Some(best) = (0..scores.len()).find(|&i| scores[i] >= 0.95 * global && is_local_max(i))
        else {
            return 0.0;
        };
        let peak = scores[best];

        // Parabolic interpolation around the peak for sub-sample lag accuracy.
        let mut lag = (best + min_lag) as f32;
        if best > 0 && best + 1 < scores.len() {
            let (l, c, r) = (scores[best - 1], peak, scores[best + 1]);
            let denom = l - 2.0 * c + r;
            if denom.abs() > f32::EPSILON {
                lag += 0.5 * (l - r) / denom;
            }
        }
        self.sample_rate as f32 / lag
    }
}
