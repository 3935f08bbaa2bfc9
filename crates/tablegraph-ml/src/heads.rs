//! Per-relation binary classification heads
//!
//! Three structurally identical MLPs, one per relation, each mapping a
//! relation feature vector (the distance between two word embeddings) to a
//! raw logit. Parameters are independent: the heads only share their input.

use crate::data::{Relation, RelationMap};
use crate::error::{Result, TableGraphError};
use tch::{nn, Tensor};

/// Multi-layer perceptron ending in a single logit
///
/// Architecture: Linear → ReLU → ... → Linear(→ 1), no final activation.
pub struct RelationHead {
    layers: Vec<nn::Linear>,
    in_dim: i64,
}

impl std::fmt::Debug for RelationHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationHead")
            .field("in_dim", &self.in_dim)
            .field("num_layers", &self.layers.len())
            .finish()
    }
}

impl RelationHead {
    /// Create a head `in_dim → hidden_dims... → 1`
    ///
    /// Variables are named `layers/0`, `layers/1`, ... under `vs`.
    pub fn new(vs: &nn::Path, in_dim: i64, hidden_dims: &[i64]) -> Self {
        let dims: Vec<i64> = std::iter::once(in_dim)
            .chain(hidden_dims.iter().copied())
            .chain(std::iter::once(1))
            .collect();

        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(i, w)| nn::linear(vs / "layers" / (i as i64), w[0], w[1], Default::default()))
            .collect();

        Self { layers, in_dim }
    }

    pub fn in_dim(&self) -> i64 {
        self.in_dim
    }

    /// `[M, in_dim]` relation features → `[M]` logits
    pub fn classify(&self, features: &Tensor) -> Result<Tensor> {
        let size = features.size();
        if size.len() != 2 || size[1] != self.in_dim {
            return Err(TableGraphError::invalid_input(format!(
                "relation features must be [M, {}], got {size:?}",
                self.in_dim
            )));
        }

        let last = self.layers.len() - 1;
        let mut out = features.shallow_clone();
        for (i, layer) in self.layers.iter().enumerate() {
            out = out.apply(layer);
            if i < last {
                out = out.relu();
            }
        }
        Ok(out.squeeze_dim(1))
    }
}

/// One independently parameterised head per relation
#[derive(Debug)]
pub struct RelationHeads {
    heads: RelationMap<RelationHead>,
}

impl RelationHeads {
    /// Heads live under `vs/cells`, `vs/rows` and `vs/cols`
    pub fn new(vs: &nn::Path, in_dim: i64, hidden_dims: &[i64]) -> Self {
        let heads = RelationMap::from_fn(|relation| {
            RelationHead::new(&(vs / relation.name()), in_dim, hidden_dims)
        });
        Self { heads }
    }

    pub fn head(&self, relation: Relation) -> &RelationHead {
        self.heads.get(relation)
    }

    pub fn classify(&self, relation: Relation, features: &Tensor) -> Result<Tensor> {
        self.heads.get(relation).classify(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn test_head_layer_count() {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = RelationHead::new(&vs.root(), 12, &[8, 4]);
        // 12→8, 8→4, 4→1
        assert_eq!(head.layers.len(), 3);

        let direct = RelationHead::new(&(vs.root() / "direct"), 12, &[]);
        assert_eq!(direct.layers.len(), 1);
    }

    #[test]
    fn test_classify_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = RelationHead::new(&vs.root(), 6, &[4]);
        let logits = head
            .classify(&Tensor::randn([7, 6], (Kind::Float, Device::Cpu)))
            .unwrap();
        assert_eq!(logits.size(), vec![7]);

        let empty = head
            .classify(&Tensor::zeros([0, 6], (Kind::Float, Device::Cpu)))
            .unwrap();
        assert_eq!(empty.size(), vec![0]);
    }

    #[test]
    fn test_classify_rejects_wrong_width() {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = RelationHead::new(&vs.root(), 6, &[4]);
        let err = head
            .classify(&Tensor::zeros([3, 5], (Kind::Float, Device::Cpu)))
            .unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[test]
    fn test_heads_are_independent() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _heads = RelationHeads::new(&vs.root(), 6, &[4]);
        let names = vs.variables();
        for relation in Relation::ALL {
            let key = format!("{}.layers.0.weight", relation.name());
            assert!(names.contains_key(&key), "missing {key}");
        }
        // 3 heads × 2 layers × (weight, bias)
        assert_eq!(names.len(), 12);
    }
}
