use ndarray::ArrayView2;

use crate::error::SampleRejection;
use crate::validator::check_zero_durations;

/// Converts a teacher-forced attention map into per-token durations.
#[derive(Debug, Clone, Copy)]
pub struct DurationExtractor {
    reduction_factor: usize,
}

impl DurationExtractor {
    pub fn new(reduction_factor: usize) -> Self {
        Self {
            reduction_factor: reduction_factor.max(1),
        }
    }

    /// `alignment` is shaped `[text positions x time frames]`.
    ///
    /// Every frame goes to the position with the largest attention weight;
    /// the per-position frame counts are divided by the reduction factor and
    /// rounded. Alignments that leave more than
    /// [`MAX_ZERO_DURATIONS`](crate::validator::MAX_ZERO_DURATIONS) tokens
    /// without frames are rejected as degenerate.
    pub fn extract(&self, alignment: ArrayView2<'_, f32>) -> Result<Vec<u32>, SampleRejection> {
        let (positions, frames) = alignment.dim();
        if positions == 0 || frames == 0 {
            return Err(SampleRejection::Inconsistent(format!(
                "empty alignment matrix [{positions} x {frames}]"
            )));
        }

        let mut counts = vec![0usize; positions];
        for column in alignment.columns() {
            let best = column
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0);
            counts[best] += 1;
        }

        let r = self.reduction_factor as f64;
        let durations: Vec<u32> = counts
            .into_iter()
            .map(|c| (c as f64 / r).round() as u32)
            .collect();

        check_zero_durations(&durations)?;
        Ok(durations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// Diagonal-ish alignment: position `i` wins the frames listed in `owners`.
    fn alignment(positions: usize, owners: &[usize]) -> Array2<f32> {
        let mut att = Array2::<f32>::from_elem((positions, owners.len()), 0.01);
        for (frame, &pos) in owners.iter().enumerate() {
            att[[pos, frame]] = 0.9;
        }
        att
    }

    #[test]
    fn counts_frames_per_position() {
        let att = alignment(3, &[0, 0, 1, 2, 2, 2]);
        let d = DurationExtractor::new(1).extract(att.view()).expect("valid");
        assert_eq!(d, vec![2, 1, 3]);
        assert_eq!(d.iter().sum::<u32>() as usize, att.ncols());
    }

    #[test]
    fn divides_by_reduction_factor_with_rounding() {
        let att = alignment(3, &[0, 0, 0, 0, 1, 1, 1, 2, 2, 2, 2, 2, 2]);
        let d = DurationExtractor::new(2).extract(att.view()).expect("valid");
        // 4/2 = 2, 3/2 = 1.5 -> 2, 6/2 = 3
        assert_eq!(d, vec![2, 2, 3]);
    }

    #[test]
    fn four_zero_durations_are_tolerated() {
        let att = alignment(6, &[0, 0, 1, 1]);
        let d = DurationExtractor::new(1).extract(att.view()).expect("4 zeros allowed");
        assert_eq!(d.iter().filter(|&&x| x == 0).count(), 4);
    }

    #[test]
    fn five_zero_durations_are_degenerate() {
        let att = alignment(7, &[0, 0, 1, 1]);
        let err = DurationExtractor::new(1)
            .extract(att.view())
            .expect_err("5 zeros rejected");
        assert_eq!(
            err,
            SampleRejection::DegenerateAlignment {
                zero_durations: 5,
                max: 4
            }
        );
    }

    #[test]
    fn empty_alignment_is_rejected() {
        let att = Array2::<f32>::zeros((0, 5));
        assert!(DurationExtractor::new(1).extract(att.view()).is_err());
    }
}
