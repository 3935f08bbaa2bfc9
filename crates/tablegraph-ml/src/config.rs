//! Model and training configuration
//!
//! [`ModelConfig`] fixes the architecture and sampling hyperparameters;
//! [`TrainingConfig`] holds optimiser and loop settings. Both deserialize
//! from TOML/JSON with every field optional (missing fields take defaults).

use crate::distance::DistanceFn;
use crate::error::{Result, TableGraphError};
use crate::sampler::IsolatedAnchorPolicy;
use serde::{Deserialize, Serialize};
use tch::Device;

/// Architecture and sampling hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Image height the word boxes are expressed in
    pub img_h: i64,
    /// Image width the word boxes are expressed in
    pub img_w: i64,
    /// Output channels of each extractor stage (stages after the first halve resolution)
    pub extractor_channels: Vec<i64>,
    pub gcnn_hidden_dim: i64,
    /// Embedding size shared by all three relation heads
    pub gcnn_out_dim: i64,
    /// Hidden layer sizes of each relation head
    pub head_hidden_dims: Vec<i64>,
    /// Upper bound on positive pairs accepted per anchor word
    pub max_positive_per_anchor: usize,
    /// Anchor rows scored per chunk during all-pairs inference
    pub inference_chunk_size: usize,
    pub distance: DistanceFn,
    pub isolated_anchor_policy: IsolatedAnchorPolicy,
}

impl Default for ModelConfig {
    #[inline]
    fn default() -> Self {
        Self {
            img_h: 768,
            img_w: 1366,
            extractor_channels: vec![32, 64],
            gcnn_hidden_dim: 100,
            gcnn_out_dim: 100,
            head_hidden_dims: vec![64],
            max_positive_per_anchor: 5,
            inference_chunk_size: 256,
            distance: DistanceFn::default(),
            isolated_anchor_policy: IsolatedAnchorPolicy::default(),
        }
    }
}

impl ModelConfig {
    /// Reject values the model cannot be built with
    pub fn validate(&self) -> Result<()> {
        if self.img_h <= 0 || self.img_w <= 0 {
            return Err(TableGraphError::config(format!(
                "image size must be positive, got {}x{}",
                self.img_h, self.img_w
            )));
        }
        if self.extractor_channels.is_empty() || self.extractor_channels.iter().any(|&c| c <= 0) {
            return Err(TableGraphError::config(
                "extractor_channels must be a non-empty list of positive sizes",
            ));
        }
        if self.gcnn_hidden_dim <= 0 || self.gcnn_out_dim <= 0 {
            return Err(TableGraphError::config(
                "gcnn_hidden_dim and gcnn_out_dim must be positive",
            ));
        }
        if self.head_hidden_dims.iter().any(|&d| d <= 0) {
            return Err(TableGraphError::config("head_hidden_dims must be positive"));
        }
        if self.max_positive_per_anchor == 0 {
            return Err(TableGraphError::config(
                "max_positive_per_anchor must be at least 1",
            ));
        }
        if self.inference_chunk_size == 0 {
            return Err(TableGraphError::config(
                "inference_chunk_size must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Builder for [`ModelConfig`]
///
/// # Examples
///
/// ```
/// use tablegraph_ml::{DistanceFn, ModelConfigBuilder};
///
/// let config = ModelConfigBuilder::new()
///     .gcnn_out_dim(64)
///     .max_positive_per_anchor(3)
///     .distance(DistanceFn::AbsoluteDifference)
///     .build()?;
/// assert_eq!(config.gcnn_out_dim, 64);
/// # Ok::<(), tablegraph_ml::TableGraphError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelConfigBuilder {
    config: ModelConfig,
}

impl ModelConfigBuilder {
    #[inline]
    #[must_use = "returns a new builder with default settings"]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration (e.g. one read from TOML)
    #[must_use = "returns a builder seeded with the given config"]
    pub fn from_config(config: ModelConfig) -> Self {
        Self { config }
    }

    /// Small architecture for tests and smoke runs
    #[must_use = "returns a builder with a tiny architecture"]
    pub fn tiny() -> Self {
        Self::new()
            .image_size(64, 96)
            .extractor_channels(vec![8, 16])
            .gcnn_hidden_dim(16)
            .gcnn_out_dim(12)
            .head_hidden_dims(vec![8])
    }

    #[must_use = "returns the updated builder"]
    pub fn image_size(mut self, img_h: i64, img_w: i64) -> Self {
        self.config.img_h = img_h;
        self.config.img_w = img_w;
        self
    }

    #[must_use = "returns the updated builder"]
    pub fn extractor_channels(mut self, channels: Vec<i64>) -> Self {
        self.config.extractor_channels = channels;
        self
    }

    #[must_use = "returns the updated builder"]
    pub fn gcnn_hidden_dim(mut self, dim: i64) -> Self {
        self.config.gcnn_hidden_dim = dim;
        self
    }

    #[must_use = "returns the updated builder"]
    pub fn gcnn_out_dim(mut self, dim: i64) -> Self {
        self.config.gcnn_out_dim = dim;
        self
    }

    #[must_use = "returns the updated builder"]
    pub fn head_hidden_dims(mut self, dims: Vec<i64>) -> Self {
        self.config.head_hidden_dims = dims;
        self
    }

    #[must_use = "returns the updated builder"]
    pub fn max_positive_per_anchor(mut self, max: usize) -> Self {
        self.config.max_positive_per_anchor = max;
        self
    }

    #[must_use = "returns the updated builder"]
    pub fn inference_chunk_size(mut self, rows: usize) -> Self {
        self.config.inference_chunk_size = rows;
        self
    }

    #[must_use = "returns the updated builder"]
    pub fn distance(mut self, distance: DistanceFn) -> Self {
        self.config.distance = distance;
        self
    }

    #[must_use = "returns the updated builder"]
    pub fn isolated_anchor_policy(mut self, policy: IsolatedAnchorPolicy) -> Self {
        self.config.isolated_anchor_policy = policy;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<ModelConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Optimiser and loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Validation runs all-pairs inference, so it uses smaller batches
    pub validation_batch_size: usize,
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    /// Probability above which a pair counts as related
    pub prediction_threshold: f64,
    /// Seed for the edge-sampling random source
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            batch_size: 16,
            validation_batch_size: 4,
            learning_rate: 0.001,
            momentum: 0.9,
            weight_decay: 0.01,
            prediction_threshold: 0.5,
            seed: 0,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.validation_batch_size == 0 {
            return Err(TableGraphError::config("batch sizes must be at least 1"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(TableGraphError::config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.prediction_threshold) {
            return Err(TableGraphError::config(format!(
                "prediction_threshold must be in [0, 1], got {}",
                self.prediction_threshold
            )));
        }
        Ok(())
    }
}

/// Detect the best available device
///
/// Priority: CUDA > MPS (macOS) > CPU
#[must_use = "returns the detected device"]
pub fn detect_best_device() -> Device {
    if tch::Cuda::is_available() {
        log::info!(
            "Auto-detected {} CUDA device(s) - using GPU 0",
            tch::Cuda::device_count()
        );
        return Device::Cuda(0);
    }

    #[cfg(target_os = "macos")]
    {
        if tch::utils::has_mps() {
            log::info!("Auto-detected MPS (Metal GPU)");
            return Device::Mps;
        }
    }

    log::info!("No GPU detected - using CPU");
    Device::Cpu
}

/// Parse `cpu`, `mps`, `cuda` or `cuda:N`
pub fn parse_device(name: &str) -> Result<Device> {
    match name.trim().to_ascii_lowercase().as_str() {
        "cpu" => Ok(Device::Cpu),
        "mps" => Ok(Device::Mps),
        "cuda" => Ok(Device::Cuda(0)),
        "auto" => Ok(detect_best_device()),
        other => other
            .strip_prefix("cuda:")
            .and_then(|n| n.parse::<usize>().ok())
            .map(Device::Cuda)
            .ok_or_else(|| {
                TableGraphError::config(format!(
                    "unknown device '{name}' (expected cpu|mps|cuda|cuda:N|auto)"
                ))
            }),
    }
}
