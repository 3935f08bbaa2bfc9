//! Balanced edge sampling over one relation's adjacency matrix
//!
//! For every real word (the *anchor*) the sampler accepts up to
//! `max_positive_per_anchor` positive pairs (words sharing the relation) and
//! then the same number of negative pairs, so each example yields an
//! approximately class-balanced set of supervised pairs without materialising
//! all `N²` candidates.
//!
//! Pairs are undirected and stored canonically as `(min, max)`. Duplicates are
//! removed within a positive or negative set across all anchors; a pair
//! landing in both sets means the matrix contradicts itself and is reported
//! as [`TableGraphError::SamplingInvariant`].
//!
//! ## Random source
//!
//! The caller passes the random source, so a seeded `StdRng` gives a
//! reproducible sample:
//!
//! ```
//! use ndarray::array;
//! use rand::{rngs::StdRng, SeedableRng};
//! use tablegraph_ml::{EdgeSampler, IsolatedAnchorPolicy, Relation};
//!
//! let matrix = array![[0u8, 1, 0], [1, 0, 0], [0, 0, 0]];
//! let sampler = EdgeSampler::new(5, IsolatedAnchorPolicy::Skip);
//! let mut rng = StdRng::seed_from_u64(7);
//! let sample = sampler.sample(Relation::Cells, 3, matrix.view(), &mut rng)?;
//! assert_eq!(sample.positives().len(), 1);
//! assert_eq!(sample.negatives().len(), 1);
//! # Ok::<(), tablegraph_ml::TableGraphError>(())
//! ```

use crate::config::ModelConfig;
use crate::data::{check_matrix_capacity, Relation};
use crate::error::{Result, TableGraphError};
use ndarray::ArrayView2;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Undirected word-index pair stored as `(min, max)`
pub type WordPair = (usize, usize);

/// What an anchor with no neighbours contributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolatedAnchorPolicy {
    /// No draw and no pair; isolated words only appear as other anchors' negatives
    #[default]
    Skip,
    /// Draw one non-neighbour and accept it as a negative pair if it is new
    PhantomNegative,
}

/// Accepted pair counts for one anchor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorTally {
    pub anchor: usize,
    /// Neighbours found in the anchor's row (self excluded)
    pub neighbours: usize,
    pub positives: usize,
    pub negatives: usize,
}

/// Result of sampling one relation of one example
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampledPairs {
    positives: BTreeSet<WordPair>,
    negatives: BTreeSet<WordPair>,
    tallies: Vec<AnchorTally>,
}

impl SampledPairs {
    pub fn positives(&self) -> &BTreeSet<WordPair> {
        &self.positives
    }

    pub fn negatives(&self) -> &BTreeSet<WordPair> {
        &self.negatives
    }

    /// Per-anchor accepted counts, in anchor order
    pub fn tallies(&self) -> &[AnchorTally] {
        &self.tallies
    }

    pub fn len(&self) -> usize {
        self.positives.len() + self.negatives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Union of positive and negative pairs in ascending order
    pub fn pairs(&self) -> Vec<WordPair> {
        let mut pairs: Vec<WordPair> = self
            .positives
            .iter()
            .chain(self.negatives.iter())
            .copied()
            .collect();
        pairs.sort_unstable();
        pairs
    }
}

/// Stratified positive/negative pair sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeSampler {
    max_positive_per_anchor: usize,
    isolated_anchor_policy: IsolatedAnchorPolicy,
}

impl EdgeSampler {
    pub fn new(max_positive_per_anchor: usize, isolated_anchor_policy: IsolatedAnchorPolicy) -> Self {
        Self {
            max_positive_per_anchor,
            isolated_anchor_policy,
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(config.max_positive_per_anchor, config.isolated_anchor_policy)
    }

    pub fn max_positive_per_anchor(&self) -> usize {
        self.max_positive_per_anchor
    }

    /// Sample supervised pairs from the top-left `num_words × num_words` block
    ///
    /// Fails with a configuration error if the matrix is smaller than
    /// `num_words`, and with a sampling-invariant error if any pair was
    /// accepted as both positive and negative.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        relation: Relation,
        num_words: usize,
        matrix: ArrayView2<'_, u8>,
        rng: &mut R,
    ) -> Result<SampledPairs> {
        check_matrix_capacity(relation, matrix, num_words)?;

        let mut sample = SampledPairs::default();

        for anchor in 0..num_words {
            let row = matrix.row(anchor);
            let mut neighbours: Vec<usize> = (0..num_words)
                .filter(|&j| j != anchor && row[j] == 1)
                .collect();
            let mut non_neighbours: Vec<usize> = (0..num_words)
                .filter(|&j| j != anchor && row[j] == 0)
                .collect();

            // Nothing to balance against: keep a single positive.
            let budget = if non_neighbours.is_empty() {
                1
            } else {
                self.max_positive_per_anchor
            };

            let mut tally = AnchorTally {
                anchor,
                neighbours: neighbours.len(),
                positives: 0,
                negatives: 0,
            };

            let (wanted_negatives, negative_candidates) = if neighbours.is_empty() {
                match self.isolated_anchor_policy {
                    IsolatedAnchorPolicy::Skip => (0, Vec::new()),
                    IsolatedAnchorPolicy::PhantomNegative => {
                        (1, non_neighbours.choose(rng).copied().into_iter().collect())
                    }
                }
            } else {
                neighbours.shuffle(rng);
                non_neighbours.shuffle(rng);

                for &candidate in &neighbours {
                    if tally.positives == budget {
                        break;
                    }
                    if sample.positives.insert(canonical(anchor, candidate)) {
                        tally.positives += 1;
                    }
                }
                (tally.positives, non_neighbours)
            };

            for &candidate in &negative_candidates {
                if tally.negatives >= wanted_negatives {
                    break;
                }
                if sample.negatives.insert(canonical(anchor, candidate)) {
                    tally.negatives += 1;
                }
            }

            sample.tallies.push(tally);
        }

        if let Some(pair) = sample.positives.intersection(&sample.negatives).next() {
            return Err(TableGraphError::SamplingInvariant {
                relation,
                reason: format!(
                    "pair {pair:?} sampled as both positive and negative ({} positives, {} negatives)",
                    sample.positives.len(),
                    sample.negatives.len()
                ),
            });
        }

        log::trace!(
            "{relation}: sampled {} positive / {} negative pairs over {num_words} words",
            sample.positives.len(),
            sample.negatives.len()
        );

        Ok(sample)
    }
}

#[inline]
fn canonical(a: usize, b: usize) -> WordPair {
    (a.min(b), a.max(b))
}

/// Ground-truth value of each pair, read from entry `(i, j)` of the matrix
pub fn pair_targets(pairs: &[WordPair], matrix: ArrayView2<'_, u8>) -> Vec<f32> {
    pairs
        .iter()
        .map(|&(i, j)| f32::from(matrix[[i, j]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sampler() -> EdgeSampler {
        EdgeSampler::new(5, IsolatedAnchorPolicy::Skip)
    }

    #[test]
    fn test_isolated_word_round_trip() {
        let matrix = array![[0u8, 1, 0], [1, 0, 0], [0, 0, 0]];
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let sample = sampler()
                .sample(Relation::Cells, 3, matrix.view(), &mut rng)
                .unwrap();
            assert_eq!(sample.positives().iter().copied().collect::<Vec<_>>(), vec![(0, 1)]);
            assert_eq!(sample.negatives().len(), 1);
            let negative = *sample.negatives().iter().next().unwrap();
            assert!(negative == (0, 2) || negative == (1, 2));
        }
    }

    #[test]
    fn test_phantom_negative_policy_draws_for_isolated_anchor() {
        let matrix = array![[0u8, 0, 0], [0, 0, 0], [0, 0, 0]];
        let sampler = EdgeSampler::new(5, IsolatedAnchorPolicy::PhantomNegative);
        let mut rng = StdRng::seed_from_u64(3);
        let sample = sampler
            .sample(Relation::Rows, 3, matrix.view(), &mut rng)
            .unwrap();
        assert!(sample.positives().is_empty());
        // Each anchor adds at most one negative; duplicates collapse.
        assert!(!sample.negatives().is_empty());
        assert!(sample.negatives().len() <= 3);
        assert!(sample.tallies().iter().all(|t| t.negatives <= 1));
    }

    #[test]
    fn test_skip_policy_ignores_fully_isolated_example() {
        let matrix = Array2::<u8>::zeros((4, 4));
        let mut rng = StdRng::seed_from_u64(0);
        let sample = sampler()
            .sample(Relation::Cols, 4, matrix.view(), &mut rng)
            .unwrap();
        assert!(sample.is_empty());
        assert_eq!(sample.tallies().len(), 4);
    }

    #[test]
    fn test_budget_caps_positives_per_anchor() {
        // Word 0 relates to everyone, nobody else relates to each other.
        let n = 12;
        let mut matrix = Array2::<u8>::zeros((n, n));
        for j in 1..n {
            matrix[[0, j]] = 1;
            matrix[[j, 0]] = 1;
        }
        // Row 0 has no non-neighbours, so its budget drops to one.
        let sampler = EdgeSampler::new(3, IsolatedAnchorPolicy::Skip);
        let mut rng = StdRng::seed_from_u64(11);
        let sample = sampler
            .sample(Relation::Cells, n, matrix.view(), &mut rng)
            .unwrap();
        assert_eq!(sample.tallies()[0].positives, 1);
        assert_eq!(sample.tallies()[0].negatives, 0);
        for tally in sample.tallies() {
            assert!(tally.positives <= 3);
            assert!(tally.negatives <= tally.positives);
        }
    }

    #[test]
    fn test_padding_is_never_sampled() {
        let mut matrix = Array2::<u8>::zeros((6, 6));
        matrix[[0, 1]] = 1;
        matrix[[1, 0]] = 1;
        // Padding rows claim relations that must be ignored.
        matrix[[0, 5]] = 1;
        matrix[[4, 5]] = 1;
        let mut rng = StdRng::seed_from_u64(5);
        let sample = sampler()
            .sample(Relation::Cells, 3, matrix.view(), &mut rng)
            .unwrap();
        assert!(sample.pairs().iter().all(|&(i, j)| i < 3 && j < 3));
    }

    #[test]
    fn test_contradictory_matrix_is_fatal() {
        // 0→1 positive, but row 1 says 1→0 is unrelated.
        let matrix = array![[0u8, 1, 0], [0, 0, 1], [0, 1, 0]];
        let mut rng = StdRng::seed_from_u64(0);
        let err = sampler()
            .sample(Relation::Rows, 3, matrix.view(), &mut rng)
            .unwrap_err();
        assert!(err.is_sampling_invariant());
    }

    #[test]
    fn test_undersized_matrix_fails_before_sampling() {
        let matrix = Array2::<u8>::zeros((2, 2));
        let mut rng = StdRng::seed_from_u64(0);
        let err = sampler()
            .sample(Relation::Cells, 3, matrix.view(), &mut rng)
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_zero_words() {
        let matrix = Array2::<u8>::zeros((4, 4));
        let mut rng = StdRng::seed_from_u64(0);
        let sample = sampler()
            .sample(Relation::Cells, 0, matrix.view(), &mut rng)
            .unwrap();
        assert!(sample.is_empty());
        assert!(sample.tallies().is_empty());
    }

    #[test]
    fn test_same_seed_same_sample() {
        let mut matrix = Array2::<u8>::zeros((10, 10));
        for i in 0..10 {
            for j in 0..10 {
                if i / 3 == j / 3 {
                    matrix[[i, j]] = 1;
                }
            }
        }
        let a = sampler()
            .sample(Relation::Cells, 10, matrix.view(), &mut StdRng::seed_from_u64(42))
            .unwrap();
        let b = sampler()
            .sample(Relation::Cells, 10, matrix.view(), &mut StdRng::seed_from_u64(42))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_pair_targets_reads_upper_entry() {
        let matrix = array![[1u8, 1, 0], [1, 1, 0], [0, 0, 1]];
        assert_eq!(pair_targets(&[(0, 1), (0, 2), (1, 2)], matrix.view()), vec![1.0, 0.0, 0.0]);
    }
}
