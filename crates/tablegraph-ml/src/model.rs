//! Table relationship model
//!
//! Composes the two halves of the network:
//!
//! - a frozen [`FeatureProducer`] plus the [`RoiMeanGatherer`], run under
//!   `tch::no_grad`, producing constant per-word features
//! - a [`RelationNetwork`] (graph network + three heads) owning the only
//!   trainable [`nn::VarStore`]
//!
//! ## Training forward
//!
//! For every example and relation the [`EdgeSampler`] draws a balanced set of
//! word pairs; their distance features are concatenated across the batch and
//! scored by the relation's head. The three BCE-with-logits losses are summed
//! into one scalar, so a single backward pass reaches all heads and the graph
//! network.
//!
//! ## Inference forward
//!
//! Every ordered pair `(i, j)` of real words is scored, including `i == j`,
//! giving an `N × N` probability matrix per relation. Anchors are processed
//! `inference_chunk_size` rows at a time to bound memory.

use crate::config::ModelConfig;
use crate::data::{Batch, Relation, RelationMap, WordGraph};
use crate::distance::DistanceFn;
use crate::error::{Result, TableGraphError};
use crate::extractor::{ConvFeatureNet, FeatureProducer};
use crate::gather::RoiMeanGatherer;
use crate::gcn::GraphNetwork;
use crate::heads::RelationHeads;
use crate::sampler::{pair_targets, EdgeSampler, WordPair};
use crate::weights::{self, LoadMode};
use ndarray::Array2;
use rand::Rng;
use std::path::Path;
use tch::{nn, Device, Kind, Reduction, Tensor};

/// The trainable half: graph network and relation heads
///
/// Variables are named `gcn.*` and `heads.{cells,rows,cols}.*`.
pub struct RelationNetwork {
    vs: nn::VarStore,
    gcn: GraphNetwork,
    heads: RelationHeads,
}

impl std::fmt::Debug for RelationNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationNetwork")
            .field("gcn", &self.gcn)
            .field("heads", &self.heads)
            .field("device", &self.vs.device())
            .finish()
    }
}

impl RelationNetwork {
    pub fn new(in_dim: i64, config: &ModelConfig, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let gcn = GraphNetwork::new(
            &(&root / "gcn"),
            in_dim,
            config.gcnn_hidden_dim,
            config.gcnn_out_dim,
        );
        let heads = RelationHeads::new(&(&root / "heads"), config.gcnn_out_dim, &config.head_hidden_dims);
        Self { vs, gcn, heads }
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn embed(&self, features: &Tensor, edges: &[(i64, i64)]) -> Result<Tensor> {
        self.gcn.embed(features, edges)
    }

    pub fn classify(&self, relation: Relation, features: &Tensor) -> Result<Tensor> {
        self.heads.classify(relation, features)
    }
}

/// Per-relation result of a training forward pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationOutput {
    /// Mean BCE over the sampled pairs (0 when nothing was sampled)
    pub loss: f64,
    pub num_pairs: usize,
    pub num_positive: usize,
    /// Sigmoid of each sampled pair's logit, detached
    pub probabilities: Vec<f32>,
    pub targets: Vec<f32>,
}

/// Result of [`TableRelationModel::forward_train`]
#[derive(Debug)]
pub struct TrainOutput {
    /// Scalar sum of the three relation losses; carries gradients when any
    /// relation sampled at least one pair
    pub loss: Tensor,
    pub relations: RelationMap<RelationOutput>,
}

impl TrainOutput {
    /// Total sampled pairs across relations
    pub fn num_pairs(&self) -> usize {
        self.relations.iter().map(|(_, r)| r.num_pairs).sum()
    }

    /// Whether backpropagating `loss` would reach any parameter
    pub fn has_gradient(&self) -> bool {
        self.loss.requires_grad()
    }
}

/// Per-example inference output: one `N × N` probability matrix per relation
pub type RelationProbabilities = RelationMap<Array2<f32>>;

/// Table cell/row/column relationship predictor
#[derive(Debug)]
pub struct TableRelationModel {
    config: ModelConfig,
    extractor: Box<dyn FeatureProducer>,
    gatherer: RoiMeanGatherer,
    network: RelationNetwork,
    distance: DistanceFn,
    sampler: EdgeSampler,
}

impl TableRelationModel {
    /// Build with a randomly initialised frozen [`ConvFeatureNet`]
    pub fn new(config: ModelConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let extractor = ConvFeatureNet::new(&config.extractor_channels, device);
        Self::with_extractor(config, Box::new(extractor), device)
    }

    /// Build with a [`ConvFeatureNet`] whose weights come from a safetensors file
    pub fn with_extractor_weights(config: ModelConfig, weights_path: &Path, device: Device) -> Result<Self> {
        config.validate()?;
        let extractor = ConvFeatureNet::load(&config.extractor_channels, weights_path, device)?;
        Self::with_extractor(config, Box::new(extractor), device)
    }

    /// Build around any frozen feature producer
    ///
    /// The gatherer and graph network are sized from the producer's channel
    /// count.
    pub fn with_extractor(
        config: ModelConfig,
        extractor: Box<dyn FeatureProducer>,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        let channels = extractor.out_channels();
        if channels <= 0 {
            return Err(TableGraphError::config(format!(
                "feature producer reports {channels} output channels"
            )));
        }
        let gatherer = RoiMeanGatherer::new(config.img_h, config.img_w, channels);
        let network = RelationNetwork::new(gatherer.out_dim(), &config, device);
        log::debug!(
            "Built table relation model: {} feature channels, {} trainable tensors, device {:?}",
            channels,
            network.var_store().trainable_variables().len(),
            device
        );

        Ok(Self {
            distance: config.distance,
            sampler: EdgeSampler::from_config(&config),
            config,
            extractor,
            gatherer,
            network,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.network.device()
    }

    pub fn sampler(&self) -> &EdgeSampler {
        &self.sampler
    }

    /// The only parameters the optimiser may update
    pub fn trainable_vs(&self) -> &nn::VarStore {
        self.network.var_store()
    }

    /// Write graph network and head weights to a safetensors file
    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        weights::save_safetensors(self.network.var_store(), path)
    }

    /// Restore graph network and head weights written by [`Self::save_checkpoint`]
    pub fn load_checkpoint(&mut self, path: &Path) -> Result<()> {
        let report = weights::load_safetensors(self.network.var_store_mut(), path, LoadMode::Strict)?;
        log::info!("Restored {} trainable tensors from {}", report.loaded, path.display());
        Ok(())
    }

    /// Sample pairs, score them and return the summed loss
    pub fn forward_train<R: Rng + ?Sized>(&self, batch: &Batch, rng: &mut R) -> Result<TrainOutput> {
        let word_features = self.word_features(batch)?;
        let device = self.device();

        let mut features: RelationMap<Vec<Tensor>> = RelationMap::from_fn(|_| Vec::new());
        let mut targets: RelationMap<Vec<f32>> = RelationMap::default();

        for (graph, word_features) in batch.graphs().iter().zip(&word_features) {
            if graph.num_words == 0 {
                log::debug!("Skipping example with no words");
                continue;
            }
            let embeddings = self.network.embed(word_features, &graph.real_edges())?;

            for relation in Relation::ALL {
                let matrix = graph.adjacency(relation);
                let sample = self.sampler.sample(relation, graph.num_words, matrix, rng)?;
                if sample.is_empty() {
                    continue;
                }
                let pairs = sample.pairs();
                targets.get_mut(relation).extend(pair_targets(&pairs, matrix));
                features
                    .get_mut(relation)
                    .push(self.relate_pairs(&embeddings, &pairs));
            }
        }

        let mut total = Tensor::from(0f32).to_device(device);
        let mut relations = RelationMap::<RelationOutput>::default();
        for relation in Relation::ALL {
            let parts = features.get(relation);
            let relation_targets = std::mem::take(targets.get_mut(relation));
            if parts.is_empty() {
                continue;
            }

            let logits = self.network.classify(relation, &Tensor::cat(parts, 0))?;
            let target = Tensor::from_slice(&relation_targets).to_device(device);
            let loss = logits.binary_cross_entropy_with_logits::<Tensor>(
                &target,
                None,
                None,
                Reduction::Mean,
            );

            let probabilities: Vec<f32> =
                Vec::try_from(&logits.detach().sigmoid().to_device(Device::Cpu).to_kind(Kind::Float))?;
            let output = relations.get_mut(relation);
            output.loss = loss.double_value(&[]);
            output.num_pairs = relation_targets.len();
            output.num_positive = relation_targets.iter().filter(|&&t| t > 0.5).count();
            output.probabilities = probabilities;
            output.targets = relation_targets;

            total = total + loss;
        }

        if relations.iter().all(|(_, r)| r.num_pairs == 0) {
            log::warn!(
                "No pairs sampled in a batch of {} examples (word counts {:?})",
                batch.batch_size(),
                batch.num_words()
            );
        }

        Ok(TrainOutput { loss: total, relations })
    }

    /// Score every ordered word pair of every example
    ///
    /// Examples with no words produce `0 × 0` matrices.
    pub fn infer(&self, batch: &Batch) -> Result<Vec<RelationProbabilities>> {
        let word_features = self.word_features(batch)?;
        tch::no_grad(|| -> Result<Vec<RelationProbabilities>> {
            batch
                .graphs()
                .iter()
                .zip(&word_features)
                .map(|(graph, features)| self.infer_example(graph, features))
                .collect()
        })
    }

    fn infer_example(&self, graph: &WordGraph, features: &Tensor) -> Result<RelationProbabilities> {
        let n = graph.num_words;
        if n == 0 {
            return Ok(RelationMap::from_fn(|_| Array2::zeros((0, 0))));
        }

        let embeddings = self.network.embed(features, &graph.real_edges())?;
        let dim = embeddings.size()[1];
        let words = n as i64;
        let chunk = self.config.inference_chunk_size.max(1);

        let mut scores: RelationMap<Vec<f32>> =
            RelationMap::from_fn(|_| Vec::with_capacity(n * n));
        for start in (0..n).step_by(chunk) {
            let rows = chunk.min(n - start) as i64;
            let left = embeddings
                .narrow(0, start as i64, rows)
                .unsqueeze(1)
                .expand([rows, words, dim], false)
                .reshape([rows * words, dim]);
            let right = embeddings
                .unsqueeze(0)
                .expand([rows, words, dim], false)
                .reshape([rows * words, dim]);
            let relation_features = self.distance.relate(&left, &right);

            for relation in Relation::ALL {
                let probabilities = self
                    .network
                    .classify(relation, &relation_features)?
                    .sigmoid()
                    .to_device(Device::Cpu)
                    .to_kind(Kind::Float);
                scores
                    .get_mut(relation)
                    .extend(Vec::<f32>::try_from(&probabilities)?);
            }
        }

        RelationMap::try_from_fn(|relation| {
            let values = std::mem::take(scores.get_mut(relation));
            Array2::from_shape_vec((n, n), values).map_err(|e| {
                TableGraphError::invalid_input(format!("{relation} probabilities: {e}"))
            })
        })
    }

    /// Distance features for canonical pairs, `[M, gcnn_out_dim]`
    fn relate_pairs(&self, embeddings: &Tensor, pairs: &[WordPair]) -> Tensor {
        let device = embeddings.device();
        let (left, right): (Vec<i64>, Vec<i64>) = pairs
            .iter()
            .map(|&(i, j)| (i as i64, j as i64))
            .unzip();
        let left = Tensor::from_slice(&left).to_device(device);
        let right = Tensor::from_slice(&right).to_device(device);
        self.distance.relate(
            &embeddings.index_select(0, &left),
            &embeddings.index_select(0, &right),
        )
    }

    /// Frozen front end: feature maps and per-word gathering, untracked
    fn word_features(&self, batch: &Batch) -> Result<Vec<Tensor>> {
        self.check_images(batch.images())?;
        let device = self.device();
        tch::no_grad(|| -> Result<Vec<Tensor>> {
            let maps = self.extractor.feature_map(batch.images())?;
            batch
                .graphs()
                .iter()
                .enumerate()
                .map(|(b, graph)| {
                    let features = self.gatherer.gather(graph.real_geometry(), &maps.get(b as i64))?;
                    Ok(features.to_device(device))
                })
                .collect()
        })
    }

    fn check_images(&self, images: &Tensor) -> Result<()> {
        let size = images.size();
        let expected = [3, self.config.img_h, self.config.img_w];
        if size.len() != 4 || size[1..] != expected {
            return Err(TableGraphError::invalid_input(format!(
                "images must be [B, 3, {}, {}], got {size:?}",
                self.config.img_h, self.config.img_w
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfigBuilder;
    use ndarray::{array, Array2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_model() -> TableRelationModel {
        TableRelationModel::new(ModelConfigBuilder::tiny().build().unwrap(), Device::Cpu).unwrap()
    }

    fn graph(num_words: usize, capacity: usize, cells: Array2<u8>) -> WordGraph {
        let mut geometry = Array2::<f32>::zeros((capacity, 5));
        for i in 0..num_words {
            let x = 10.0 * i as f32;
            geometry.row_mut(i).assign(&array![x, 4.0, x + 8.0, 12.0, 3.0]);
        }
        WordGraph {
            num_words,
            word_geometry: geometry,
            edge_index: array![[0i64], [1]],
            adjacency: RelationMap {
                rows: cells.clone(),
                cols: cells.clone(),
                cells,
            },
        }
    }

    fn batch(graphs: Vec<WordGraph>) -> Batch {
        let b = graphs.len() as i64;
        let images = Tensor::rand([b, 3, 64, 96], (Kind::Float, Device::Cpu));
        Batch::new(images, graphs).unwrap()
    }

    #[test]
    fn test_trainable_variables_exclude_extractor() {
        let model = tiny_model();
        let names: Vec<String> = model.trainable_vs().variables().into_keys().collect();
        assert!(!names.is_empty());
        assert!(names
            .iter()
            .all(|n| n.starts_with("gcn.") || n.starts_with("heads.")));
    }

    #[test]
    fn test_forward_train_counts() {
        let model = tiny_model();
        let cells = array![[0u8, 1, 0], [1, 0, 0], [0, 0, 0]];
        let batch = batch(vec![graph(3, 3, cells)]);
        let mut rng = StdRng::seed_from_u64(3);

        let out = model.forward_train(&batch, &mut rng).unwrap();
        for (_, relation) in out.relations.iter() {
            assert_eq!(relation.num_pairs, 2);
            assert_eq!(relation.num_positive, 1);
            assert_eq!(relation.probabilities.len(), 2);
        }
        assert!(out.has_gradient());
        assert!(out.loss.double_value(&[]).is_finite());
    }

    #[test]
    fn test_forward_train_without_pairs_is_zero() {
        let model = tiny_model();
        let batch = batch(vec![graph(0, 3, Array2::zeros((3, 3)))]);
        let mut rng = StdRng::seed_from_u64(0);

        let out = model.forward_train(&batch, &mut rng).unwrap();
        assert_eq!(out.num_pairs(), 0);
        assert_eq!(out.loss.double_value(&[]), 0.0);
        assert!(!out.has_gradient());
    }

    #[test]
    fn test_infer_shapes() {
        let model = tiny_model();
        let cells = array![[0u8, 1, 0], [1, 0, 0], [0, 0, 0]];
        let batch = batch(vec![graph(3, 4, Array2::zeros((4, 4))), graph(0, 3, cells)]);

        let out = model.infer(&batch).unwrap();
        assert_eq!(out.len(), 2);
        for (_, probabilities) in out[0].iter() {
            assert_eq!(probabilities.dim(), (3, 3));
            assert!(probabilities.iter().all(|p| (0.0..=1.0).contains(p)));
        }
        assert_eq!(out[1].cells.dim(), (0, 0));
    }

    #[test]
    fn test_infer_chunking_matches_single_pass() {
        let config = ModelConfigBuilder::tiny().inference_chunk_size(2).build().unwrap();
        let mut chunked = TableRelationModel::new(config, Device::Cpu).unwrap();
        let whole = tiny_model();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.safetensors");
        whole.save_checkpoint(&path).unwrap();
        chunked.load_checkpoint(&path).unwrap();

        // Both models see the same gathered features; only the trainable half differs.
        let b = batch(vec![graph(5, 5, Array2::zeros((5, 5)))]);
        let features = whole.word_features(&b).unwrap();
        let expected = tch::no_grad(|| whole.infer_example(&b.graphs()[0], &features[0])).unwrap();
        let actual = tch::no_grad(|| chunked.infer_example(&b.graphs()[0], &features[0])).unwrap();
        for relation in Relation::ALL {
            let diff = (expected.get(relation) - actual.get(relation))
                .iter()
                .fold(0f32, |m, d| m.max(d.abs()));
            assert!(diff < 1e-5, "{relation}: max diff {diff}");
        }
    }

    #[test]
    fn test_rejects_wrong_image_size() {
        let model = tiny_model();
        let images = Tensor::rand([1, 3, 32, 32], (Kind::Float, Device::Cpu));
        let batch = Batch::new(images, vec![graph(2, 2, Array2::zeros((2, 2)))]).unwrap();
        assert!(model.infer(&batch).unwrap_err().is_invalid_input());
    }
}
