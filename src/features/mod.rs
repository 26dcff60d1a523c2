//! Per-token prosody features derived from a forced alignment.
//!
//! The duration extractor turns an attention matrix into frame counts; pitch
//! and energy are computed per mel frame and averaged over the frames each
//! token owns. All three use [`token_spans`] so their outputs stay
//! index-aligned with the token sequence.

pub mod duration;
pub mod energy;
pub mod pitch;

use std::ops::Range;

pub use duration::DurationExtractor;
pub use energy::EnergyExtractor;
pub use pitch::PitchExtractor;

/// Mel-frame range owned by each token.
///
/// Durations are in decoder steps, so every step covers `reduction_factor`
/// mel frames. Spans are clipped to `n_frames`; frames past the last span
/// belong to no token.
pub fn token_spans(duration: &[u32], reduction_factor: usize, n_frames: usize) -> Vec<Range<usize>> {
    let mut start = 0usize;
    duration
        .iter()
        .map(|&d| {
            let end = start + d as usize * reduction_factor;
            let span = start.min(n_frames)..end.min(n_frames);
            start = end;
            span
        })
        .collect()
}

/// Mean of the frame values in each span, counting only values accepted by
/// `keep`. Spans with nothing to average yield `0.0`.
pub(crate) fn average_spans<F>(frames: &[f32], spans: &[Range<usize>], keep: F) -> Vec<f32>
where
    F: Fn(f32) -> bool,
{
    spans
        .iter()
        .map(|span| {
            let end = span.end.min(frames.len());
            let start = span.start.min(end);
            let (sum, count) = frames[start..end]
                .iter()
                .filter(|&&v| keep(v))
                .fold((0f32, 0usize), |(s, c), &v| (s + v, c + 1));
            if count == 0 {
                0.0
            } else {
                sum / count as f32
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_scale_by_reduction_factor() {
        let spans = token_spans(&[1, 0, 2], 2, 100);
        assert_eq!(spans, vec![0..2, 2..2, 2..6]);
    }

    #[test]
    fn spans_are_clipped_to_frame_count() {
        let spans = token_spans(&[3, 3, 3], 1, 7);
        assert_eq!(spans, vec![0..3, 3..6, 6..7]);
    }

    #[test]
    fn average_skips_filtered_values() {
        let frames = [0.0, 2.0, 4.0, 0.0, 0.0];
        let spans = vec![0..3, 3..5, 5..5];
        assert_eq!(average_spans(&frames, &spans, |v| v > 0.0), vec![3.0, 0.0, 0.0]);
    }
}
