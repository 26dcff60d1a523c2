use std::sync::Arc;

use super::{average_spans, token_spans};
use crate::audio::SignalProcessor;

/// Frame RMS averaged over each token's span.
#[derive(Clone)]
pub struct EnergyExtractor {
    dsp: Arc<dyn SignalProcessor>,
    reduction_factor: usize,
}

impl EnergyExtractor {
    pub fn new(dsp: Arc<dyn SignalProcessor>, reduction_factor: usize) -> Self {
        Self {
            dsp,
            reduction_factor: reduction_factor.max(1),
        }
    }

    pub fn extract(&self, samples: &[f32], duration: &[u32], mel_len: usize) -> Vec<f32> {
        let mut rms = self.dsp.frame_rms(samples);
        rms.resize(mel_len, 0.0);
        let spans = token_spans(duration, self.reduction_factor, mel_len);
        average_spans(&rms, &spans, |_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::StftProcessor;

    #[test]
    fn louder_token_has_more_energy() {
        let dsp = Arc::new(StftProcessor::new(16_000, 1024, 256, 80));
        let mut wave: Vec<f32> = (0..8_000)
            .map(|i| 0.1 * (i as f32 * 0.2).sin())
            .collect();
        wave.extend((0..16_000).map(|i| 0.8 * (i as f32 * 0.2).sin()));
        let mel_len = dsp.frame_count(wave.len());

        let energy = EnergyExtractor::new(dsp, 1).extract(&wave, &[20, 0, 40], mel_len);
        assert_eq!(energy.len(), 3);
        assert_eq!(energy[1], 0.0);
        assert!(energy[2] > 4.0 * energy[0]);
    }

    #[test]
    fn reduction_factor_widens_spans() {
        let dsp = Arc::new(StftProcessor::new(16_000, 512, 128, 40));
        let wave = vec![0.5f32; 4_000];
        let mel_len = dsp.frame_count(wave.len());
        let energy = EnergyExtractor::new(dsp, 3).extract(&wave, &[2, 2], mel_len);
        assert_eq!(energy.len(), 2);
        assert!(energy.iter().all(|&e| (e - 0.5).abs() < 1e-3));
    }
}
