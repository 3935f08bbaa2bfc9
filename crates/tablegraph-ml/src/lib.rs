//! # tablegraph - Table structure recognition with graph neural networks
//!
//! Given a document image and the word boxes detected on it, predicts for
//! every pair of words whether they share a table **cell**, **row** or
//! **column**.
//!
//! ## Pipeline
//!
//! ```text
//! image ─► frozen feature extractor ─► per-word gathering ─► GCN ─► word embeddings
//!                                                                       │
//!            training:  edge sampler ─► pair distance ─► heads ─► BCE loss (×3, summed)
//!            inference: all N² pairs ─► pair distance ─► heads ─► sigmoid
//! ```
//!
//! The extractor and gatherer run under `tch::no_grad` and own no trainable
//! parameters; only the graph network and the three heads are optimised.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tablegraph_ml::{Dataset, ModelConfig, TableRelationModel, Trainer, TrainingConfig, Result};
//! use std::path::Path;
//!
//! # fn main() -> Result<()> {
//! let device = tablegraph_ml::detect_best_device();
//! let model = TableRelationModel::with_extractor_weights(
//!     ModelConfig::default(),
//!     Path::new("featurenet.safetensors"),
//!     device,
//! )?;
//!
//! let train = Dataset::open(Path::new("data/train"))?;
//! let mut trainer = Trainer::new(model, TrainingConfig::default())?;
//! let stats = trainer.run_epoch(train.batches(16), |step| {
//!     log::debug!("loss {:.4}", step.total_loss);
//! })?;
//! println!("epoch loss {:.4}", stats.mean_total_loss);
//!
//! trainer.model().save_checkpoint(Path::new("model.safetensors"))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Inference
//!
//! ```no_run
//! use tablegraph_ml::{Batch, Relation, TableRelationModel};
//!
//! # fn example(model: &TableRelationModel, batch: &Batch) -> tablegraph_ml::Result<()> {
//! for probabilities in model.infer(batch)? {
//!     // N × N, entry (i, j) scores words i and j
//!     let cells = probabilities.get(Relation::Cells);
//!     println!("{} words", cells.nrows());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Edge sampling
//!
//! Training never scores all `N²` pairs. [`EdgeSampler`] draws, per anchor
//! word, up to `max_positive_per_anchor` positive pairs and the same number
//! of negatives. Pass a seeded `StdRng` for reproducible samples; see the
//! [`sampler`] module docs.

// Error types (public API)
pub mod error;

pub mod config;
pub mod data;
pub mod dataset;
pub mod distance;
pub mod extractor;
pub mod gather;
pub mod gcn;
pub mod heads;
pub mod metrics;
pub mod model;
pub mod sampler;
pub mod training;
pub mod weights;

pub use config::{detect_best_device, parse_device, ModelConfig, ModelConfigBuilder, TrainingConfig};
pub use data::{Batch, DocumentExample, Relation, RelationMap, WordGraph, GEOMETRY_DIM};
pub use dataset::{read_record, write_record, Dataset};
pub use distance::DistanceFn;
pub use error::{Result, TableGraphError};
pub use extractor::{ConvFeatureNet, FeatureProducer};
pub use gather::RoiMeanGatherer;
pub use metrics::ConfusionCounts;
pub use model::{RelationOutput, RelationProbabilities, TableRelationModel, TrainOutput};
pub use sampler::{EdgeSampler, IsolatedAnchorPolicy, SampledPairs, WordPair};
pub use training::{EpochStats, StepStats, Trainer, TrainingHistory};

pub use tch::Device; // Device selection (CPU, CUDA, MPS)
