//! Frozen visual feature extractor
//!
//! The extractor is a fixed feature producer: it owns its own VarStore,
//! which is frozen on construction, and it never exposes parameters to the
//! optimiser. Every forward pass runs in eval mode under `tch::no_grad`.
//!
//! ## Architecture
//!
//! ResNet-style:
//! - **Stem:** 7×7 conv (stride 2) → BatchNorm → ReLU → 3×3 max pool (stride 2)
//! - **Stages:** one [`BasicBlock`] per entry of `extractor_channels`; the
//!   first keeps the stem resolution, every later stage halves it
//!
//! Input `[B, 3, H, W]` → output `[B, C_last, H/4/2^(k-1), W/4/2^(k-1)]`.

use crate::error::Result;
use crate::weights::{self, LoadMode};
use std::path::Path;
use tch::{nn, Device, Tensor};

/// A frozen image → feature-map function
///
/// Implementations hold no trainable parameters; outputs are constants with
/// respect to the optimisation.
pub trait FeatureProducer: std::fmt::Debug {
    /// Channels of the produced feature map
    fn out_channels(&self) -> i64;

    /// `[B, 3, H, W]` images → `[B, C, h, w]` feature maps, untracked by autograd
    fn feature_map(&self, images: &Tensor) -> Result<Tensor>;
}

/// ResNet BasicBlock with optional projection shortcut
///
/// - conv1 (3x3, stride) → bn1 → relu
/// - conv2 (3x3) → bn2
/// - add residual (projected when shape changes) → relu
pub struct BasicBlock {
    conv1: nn::Conv2D,
    bn1: nn::BatchNorm,
    conv2: nn::Conv2D,
    bn2: nn::BatchNorm,
    downsample: Option<(nn::Conv2D, nn::BatchNorm)>,
}

impl std::fmt::Debug for BasicBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicBlock")
            .field("has_downsample", &self.downsample.is_some())
            .finish()
    }
}

impl BasicBlock {
    pub fn new(vs: &nn::Path, in_channels: i64, out_channels: i64, stride: i64) -> Self {
        let conv1 = nn::conv2d(
            vs / "conv1",
            in_channels,
            out_channels,
            3,
            nn::ConvConfig {
                stride,
                padding: 1,
                bias: false,
                ..Default::default()
            },
        );
        let bn1 = nn::batch_norm2d(vs / "bn1", out_channels, Default::default());
        let conv2 = nn::conv2d(
            vs / "conv2",
            out_channels,
            out_channels,
            3,
            nn::ConvConfig {
                stride: 1,
                padding: 1,
                bias: false,
                ..Default::default()
            },
        );
        let bn2 = nn::batch_norm2d(vs / "bn2", out_channels, Default::default());

        let downsample = (stride != 1 || in_channels != out_channels).then(|| {
            let path = vs / "downsample";
            let conv = nn::conv2d(
                &path / "0",
                in_channels,
                out_channels,
                1,
                nn::ConvConfig {
                    stride,
                    bias: false,
                    ..Default::default()
                },
            );
            let bn = nn::batch_norm2d(&path / "1", out_channels, Default::default());
            (conv, bn)
        });

        BasicBlock {
            conv1,
            bn1,
            conv2,
            bn2,
            downsample,
        }
    }

    /// Inference-mode forward (batch norm uses running statistics)
    pub fn forward(&self, x: &Tensor) -> Tensor {
        let out = x
            .apply(&self.conv1)
            .apply_t(&self.bn1, false)
            .relu()
            .apply(&self.conv2)
            .apply_t(&self.bn2, false);

        let identity = match &self.downsample {
            Some((conv, bn)) => x.apply(conv).apply_t(bn, false),
            None => x.shallow_clone(),
        };

        (out + identity).relu()
    }
}

/// Convolutional feature extractor with frozen weights
pub struct ConvFeatureNet {
    vs: nn::VarStore,
    stem_conv: nn::Conv2D,
    stem_bn: nn::BatchNorm,
    stages: Vec<BasicBlock>,
    out_channels: i64,
}

impl std::fmt::Debug for ConvFeatureNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvFeatureNet")
            .field("stages", &self.stages.len())
            .field("out_channels", &self.out_channels)
            .field("device", &self.vs.device())
            .finish()
    }
}

impl ConvFeatureNet {
    /// Build with randomly initialised (but frozen) weights
    ///
    /// `channels` must be non-empty; [`crate::ModelConfig::validate`] checks this.
    pub fn new(channels: &[i64], device: Device) -> Self {
        let mut vs = nn::VarStore::new(device);
        let root = vs.root();

        let stem_channels = channels.first().copied().unwrap_or(64);
        let stem_conv = nn::conv2d(
            &root / "stem" / "conv",
            3,
            stem_channels,
            7,
            nn::ConvConfig {
                stride: 2,
                padding: 3,
                bias: false,
                ..Default::default()
            },
        );
        let stem_bn = nn::batch_norm2d(&root / "stem" / "bn", stem_channels, Default::default());

        let mut stages = Vec::with_capacity(channels.len());
        let mut in_channels = stem_channels;
        for (i, &out) in channels.iter().enumerate() {
            let stride = if i == 0 { 1 } else { 2 };
            stages.push(BasicBlock::new(&(&root / "stages" / i as i64), in_channels, out, stride));
            in_channels = out;
        }

        vs.freeze();

        Self {
            vs,
            stem_conv,
            stem_bn,
            stages,
            out_channels: in_channels,
        }
    }

    /// Build and load weights from a safetensors file
    ///
    /// Every variable must be present with a matching shape.
    pub fn load(channels: &[i64], weights_path: &Path, device: Device) -> Result<Self> {
        let mut net = Self::new(channels, device);
        let report = weights::load_safetensors(&mut net.vs, weights_path, LoadMode::Strict)?;
        log::info!(
            "Loaded feature extractor: {} tensors from {}",
            report.loaded,
            weights_path.display()
        );
        net.vs.freeze();
        Ok(net)
    }

    /// Number of variables held (all frozen)
    pub fn num_variables(&self) -> usize {
        self.vs.variables().len()
    }

    fn forward(&self, images: &Tensor) -> Tensor {
        let mut x = images
            .apply(&self.stem_conv)
            .apply_t(&self.stem_bn, false)
            .relu()
            .max_pool2d([3, 3], [2, 2], [1, 1], [1, 1], false);
        for stage in &self.stages {
            x = stage.forward(&x);
        }
        x
    }
}

impl FeatureProducer for ConvFeatureNet {
    fn out_channels(&self) -> i64 {
        self.out_channels
    }

    fn feature_map(&self, images: &Tensor) -> Result<Tensor> {
        let images = images.to_device(self.vs.device());
        Ok(tch::no_grad(|| self.forward(&images)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    #[test]
    fn test_output_shape() {
        let net = ConvFeatureNet::new(&[8, 16], Device::Cpu);
        let images = Tensor::randn([2, 3, 64, 96], (Kind::Float, Device::Cpu));
        let features = net.feature_map(&images).unwrap();
        // Stem: /4, second stage: /2
        assert_eq!(features.size(), vec![2, 16, 8, 12]);
        assert_eq!(net.out_channels(), 16);
    }

    #[test]
    fn test_weights_are_frozen() {
        let net = ConvFeatureNet::new(&[8, 16], Device::Cpu);
        assert!(net.num_variables() > 0);
        assert!(net.vs.variables().values().all(|t| !t.requires_grad()));

        let images = Tensor::randn([1, 3, 32, 32], (Kind::Float, Device::Cpu));
        let features = net.feature_map(&images).unwrap();
        assert!(!features.requires_grad());
    }

    #[test]
    fn test_basic_block_projection() {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = BasicBlock::new(&vs.root(), 4, 8, 2);
        assert!(block.downsample.is_some());
        let x = Tensor::randn([1, 4, 10, 10], (Kind::Float, Device::Cpu));
        assert_eq!(block.forward(&x).size(), vec![1, 8, 5, 5]);

        let same = BasicBlock::new(&(vs.root() / "same"), 8, 8, 1);
        assert!(same.downsample.is_none());
    }
}
