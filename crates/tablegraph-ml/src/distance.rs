//! Pairwise relation features between word embeddings

use serde::{Deserialize, Serialize};
use tch::Tensor;

/// How two word embeddings are combined into one relation feature vector
///
/// Training canonicalises pairs to `(min, max)` but inference scores both
/// `(i, j)` and `(j, i)`, so only symmetric policies give orientation-free
/// probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceFn {
    /// `|a - b|`, symmetric
    #[default]
    AbsoluteDifference,
    /// `a - b`, order-sensitive
    Difference,
}

impl DistanceFn {
    /// Apply row-wise to aligned `[M, D]` tensors, returning `[M, D]`
    pub fn relate(self, a: &Tensor, b: &Tensor) -> Tensor {
        match self {
            DistanceFn::AbsoluteDifference => (a - b).abs(),
            DistanceFn::Difference => a - b,
        }
    }

    /// Whether `relate(a, b) == relate(b, a)`
    pub const fn is_symmetric(self) -> bool {
        matches!(self, DistanceFn::AbsoluteDifference)
    }
}
