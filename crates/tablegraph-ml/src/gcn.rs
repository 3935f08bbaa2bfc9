//! Graph convolutional network over the visibility graph
//!
//! Two GCN layers (Kipf & Welling) with ReLU in between refine each word's
//! gathered features using its visible neighbours:
//!
//! ```text
//! H' = D^-1/2 (A + I) D^-1/2 · H · W + b
//! ```
//!
//! Edges are treated as undirected. This is the only stage before the heads
//! that receives gradients.

use crate::error::{Result, TableGraphError};
use tch::{nn, Device, Kind, Tensor};

/// Symmetrically normalised adjacency with self-loops, `[N, N]`
pub fn normalized_adjacency(num_nodes: i64, edges: &[(i64, i64)], device: Device) -> Tensor {
    let mut adj = Tensor::eye(num_nodes, (Kind::Float, device));
    if !edges.is_empty() {
        let (src, dst): (Vec<i64>, Vec<i64>) = edges
            .iter()
            .flat_map(|&(a, b)| [(a, b), (b, a)])
            .unzip();
        let ones = Tensor::ones([src.len() as i64], (Kind::Float, device));
        let src = Tensor::from_slice(&src).to_device(device);
        let dst = Tensor::from_slice(&dst).to_device(device);
        let _ = adj.index_put_(&[Some(src), Some(dst)], &ones, false);
    }

    // Self-loops keep every degree >= 1.
    let d_inv_sqrt = adj
        .sum_dim_intlist(&[1i64][..], false, Kind::Float)
        .pow_tensor_scalar(-0.5);
    adj * d_inv_sqrt.unsqueeze(1) * d_inv_sqrt.unsqueeze(0)
}

/// One graph convolution: linear projection, neighbourhood mix, bias
pub struct GcnLayer {
    linear: nn::Linear,
    bias: Tensor,
}

impl std::fmt::Debug for GcnLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcnLayer")
            .field("weight", &self.linear.ws.size())
            .finish()
    }
}

impl GcnLayer {
    pub fn new(vs: &nn::Path, in_dim: i64, out_dim: i64) -> Self {
        let linear = nn::linear(
            vs / "lin",
            in_dim,
            out_dim,
            nn::LinearConfig {
                bias: false,
                ..Default::default()
            },
        );
        let bias = vs.zeros("bias", &[out_dim]);
        Self { linear, bias }
    }

    /// `x`: `[N, in]`, `norm_adj`: `[N, N]` → `[N, out]`
    pub fn forward(&self, x: &Tensor, norm_adj: &Tensor) -> Tensor {
        norm_adj.matmul(&x.apply(&self.linear)) + &self.bias
    }
}

/// Trainable message-passing network producing one embedding per word
#[derive(Debug)]
pub struct GraphNetwork {
    layers: Vec<GcnLayer>,
    out_dim: i64,
}

impl GraphNetwork {
    pub fn new(vs: &nn::Path, in_dim: i64, hidden_dim: i64, out_dim: i64) -> Self {
        let layers = vec![
            GcnLayer::new(&(vs / "conv1"), in_dim, hidden_dim),
            GcnLayer::new(&(vs / "conv2"), hidden_dim, out_dim),
        ];
        Self { layers, out_dim }
    }

    pub fn out_dim(&self) -> i64 {
        self.out_dim
    }

    /// Embed `[N, in]` word features using the given undirected edges
    ///
    /// Every edge endpoint must be below `N`. Zero words yield `[0, out_dim]`.
    pub fn embed(&self, features: &Tensor, edges: &[(i64, i64)]) -> Result<Tensor> {
        let size = features.size();
        if size.len() != 2 {
            return Err(TableGraphError::invalid_input(format!(
                "graph features must be [N, D], got {size:?}"
            )));
        }
        let num_nodes = size[0];
        let device = features.device();
        if num_nodes == 0 {
            return Ok(Tensor::zeros([0, self.out_dim], (Kind::Float, device)));
        }
        if let Some(&(a, b)) = edges
            .iter()
            .find(|&&(a, b)| a < 0 || b < 0 || a >= num_nodes || b >= num_nodes)
        {
            return Err(TableGraphError::invalid_input(format!(
                "edge ({a}, {b}) references a word outside 0..{num_nodes}"
            )));
        }

        let adj = normalized_adjacency(num_nodes, edges, device);
        let last = self.layers.len() - 1;
        let mut h = features.shallow_clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h, &adj);
            if i < last {
                h = h.relu();
            }
        }
        Ok(h)
    }
}
