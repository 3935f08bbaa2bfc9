//! Thresholded classification metrics for pair predictions

use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Confusion counts of binary pair predictions at one threshold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionCounts {
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
}

impl ConfusionCounts {
    /// Count predictions `p >= threshold` against targets `t > 0.5`
    ///
    /// Extra entries in the longer slice are ignored.
    pub fn from_scores(probabilities: &[f32], targets: &[f32], threshold: f32) -> Self {
        let mut counts = Self::default();
        for (&p, &t) in probabilities.iter().zip(targets) {
            match (p >= threshold, t > 0.5) {
                (true, true) => counts.true_positives += 1,
                (true, false) => counts.false_positives += 1,
                (false, false) => counts.true_negatives += 1,
                (false, true) => counts.false_negatives += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.true_positives + self.false_positives + self.true_negatives + self.false_negatives
    }

    /// 0 when nothing was predicted positive
    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    /// 0 when there are no positive targets
    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positives + self.true_negatives, self.total())
    }
}

impl AddAssign for ConfusionCounts {
    fn add_assign(&mut self, other: Self) {
        self.true_positives += other.true_positives;
        self.false_positives += other.false_positives;
        self.true_negatives += other.true_negatives;
        self.false_negatives += other.false_negatives;
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_scores() {
        let probabilities = [0.9, 0.8, 0.2, 0.4, 0.6];
        let targets = [1.0, 0.0, 0.0, 1.0, 1.0];
        let counts = ConfusionCounts::from_scores(&probabilities, &targets, 0.5);
        assert_eq!(
            counts,
            ConfusionCounts {
                true_positives: 2,
                false_positives: 1,
                true_negatives: 1,
                false_negatives: 1,
            }
        );
        assert!((counts.precision() - 2.0 / 3.0).abs() < 1e-12);
        assert!((counts.recall() - 2.0 / 3.0).abs() < 1e-12);
        assert!((counts.f1() - 2.0 / 3.0).abs() < 1e-12);
        assert!((counts.accuracy() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let counts = ConfusionCounts::from_scores(&[0.5], &[1.0], 0.5);
        assert_eq!(counts.true_positives, 1);
    }

    #[test]
    fn test_empty_is_zero() {
        let counts = ConfusionCounts::default();
        assert_eq!(counts.total(), 0);
        assert_eq!(counts.f1(), 0.0);
        assert_eq!(counts.accuracy(), 0.0);
    }

    #[test]
    fn test_add_assign() {
        let mut a = ConfusionCounts::from_scores(&[0.9], &[1.0], 0.5);
        a += ConfusionCounts::from_scores(&[0.1, 0.9], &[1.0, 0.0], 0.5);
        assert_eq!(a.total(), 3);
        assert_eq!(a.true_positives, 1);
        assert_eq!(a.false_negatives, 1);
        assert_eq!(a.false_positives, 1);
    }
}
