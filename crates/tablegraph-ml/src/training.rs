//! Optimisation loop pieces: one training or validation step at a time
//!
//! [`Trainer`] owns the model, an SGD optimiser over the trainable VarStore
//! and a seeded random source for the edge sampler. Each step returns a
//! [`StepStats`]; [`EpochStats`] aggregates them. Nothing accumulates across
//! calls except the optimiser state and the random source.

use crate::config::TrainingConfig;
use crate::data::{Batch, Relation, RelationMap};
use crate::error::Result;
use crate::metrics::ConfusionCounts;
use crate::model::{TableRelationModel, TrainOutput};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tch::nn::{self, OptimizerConfig};
use tch::{Reduction, Tensor};

/// Losses and pair statistics of a single batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepStats {
    pub total_loss: f64,
    pub losses: RelationMap<f64>,
    /// Pairs scored per relation (sampled in training, all ordered pairs in validation)
    pub pairs: RelationMap<usize>,
    pub confusion: RelationMap<ConfusionCounts>,
}

impl StepStats {
    fn from_train_output(output: &TrainOutput, threshold: f32) -> Self {
        let losses = output.relations.map(|_, r| r.loss);
        Self {
            total_loss: losses.iter().map(|(_, l)| l).sum(),
            losses,
            pairs: output.relations.map(|_, r| r.num_pairs),
            confusion: output
                .relations
                .map(|_, r| ConfusionCounts::from_scores(&r.probabilities, &r.targets, threshold)),
        }
    }

    pub fn f1(&self, relation: Relation) -> f64 {
        self.confusion.get(relation).f1()
    }
}

/// Aggregate of the steps of one pass over a dataset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub steps: usize,
    pub mean_total_loss: f64,
    pub mean_losses: RelationMap<f64>,
    pub pairs: RelationMap<usize>,
    /// Summed over all steps
    pub confusion: RelationMap<ConfusionCounts>,
}

impl EpochStats {
    pub fn aggregate(steps: &[StepStats]) -> Self {
        let mut stats = Self::default();
        for step in steps {
            stats.add(step);
        }
        stats.finish()
    }

    fn add(&mut self, step: &StepStats) {
        self.steps += 1;
        self.mean_total_loss += step.total_loss;
        for relation in Relation::ALL {
            *self.mean_losses.get_mut(relation) += step.losses.get(relation);
            *self.pairs.get_mut(relation) += step.pairs.get(relation);
            *self.confusion.get_mut(relation) += *step.confusion.get(relation);
        }
    }

    /// Turn running sums into means
    fn finish(mut self) -> Self {
        if self.steps > 0 {
            let n = self.steps as f64;
            self.mean_total_loss /= n;
            self.mean_losses = self.mean_losses.map(|_, l| l / n);
        }
        self
    }

    pub fn f1(&self, relation: Relation) -> f64 {
        self.confusion.get(relation).f1()
    }
}

/// Per-epoch statistics of a whole run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub train: Vec<EpochStats>,
    pub validation: Vec<EpochStats>,
}

/// SGD training driver for a [`TableRelationModel`]
pub struct Trainer {
    model: TableRelationModel,
    optimizer: nn::Optimizer,
    config: TrainingConfig,
    rng: StdRng,
    steps: usize,
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("model", &self.model)
            .field("config", &self.config)
            .field("steps", &self.steps)
            .finish()
    }
}

impl Trainer {
    /// Optimise only the model's trainable VarStore
    pub fn new(model: TableRelationModel, config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let optimizer = nn::Sgd {
            momentum: config.momentum,
            dampening: 0.0,
            wd: config.weight_decay,
            nesterov: false,
        }
        .build(model.trainable_vs(), config.learning_rate)?;
        log::info!(
            "SGD over {} trainable tensors (lr {}, momentum {}, weight decay {}, seed {})",
            model.trainable_vs().trainable_variables().len(),
            config.learning_rate,
            config.momentum,
            config.weight_decay,
            config.seed
        );

        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            model,
            optimizer,
            config,
            steps: 0,
        })
    }

    pub fn model(&self) -> &TableRelationModel {
        &self.model
    }

    pub fn into_model(self) -> TableRelationModel {
        self.model
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Optimiser steps taken so far
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Forward, backward and one optimiser update
    ///
    /// A batch that yields no sampled pairs returns zero losses and leaves
    /// the parameters untouched.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepStats> {
        let output = self.model.forward_train(batch, &mut self.rng)?;
        if output.has_gradient() {
            self.optimizer.zero_grad();
            output.loss.backward();
            self.optimizer.step();
            self.steps += 1;
        } else {
            log::warn!("Batch produced no sampled pairs; skipping optimiser update");
        }

        let stats = StepStats::from_train_output(&output, self.config.prediction_threshold as f32);
        log::debug!(
            "step {}: loss {:.4} (cells {:.4}, cols {:.4}, rows {:.4})",
            self.steps,
            stats.total_loss,
            stats.losses.cells,
            stats.losses.cols,
            stats.losses.rows
        );
        Ok(stats)
    }

    /// Score all ordered pairs and compare against the full adjacency matrices
    ///
    /// Losses are binary cross entropy of the predicted probabilities.
    pub fn validate_step(&self, batch: &Batch) -> Result<StepStats> {
        let predictions = self.model.infer(batch)?;
        let threshold = self.config.prediction_threshold as f32;

        let mut stats = StepStats::default();
        for relation in Relation::ALL {
            let mut probabilities = Vec::new();
            let mut targets = Vec::new();
            for (graph, prediction) in batch.graphs().iter().zip(&predictions) {
                probabilities.extend(prediction.get(relation).iter().copied());
                targets.extend(graph.real_adjacency(relation)?.iter().map(|&v| f32::from(v)));
            }

            let loss = if probabilities.is_empty() {
                0.0
            } else {
                tch::no_grad(|| {
                    Tensor::from_slice(&probabilities)
                        .binary_cross_entropy::<Tensor>(
                            &Tensor::from_slice(&targets),
                            None,
                            Reduction::Mean,
                        )
                        .double_value(&[])
                })
            };

            *stats.losses.get_mut(relation) = loss;
            *stats.pairs.get_mut(relation) = probabilities.len();
            *stats.confusion.get_mut(relation) =
                ConfusionCounts::from_scores(&probabilities, &targets, threshold);
        }
        stats.total_loss = stats.losses.iter().map(|(_, l)| l).sum();
        Ok(stats)
    }

    /// Train on every batch, reporting each step to `on_step`
    pub fn run_epoch<I, F>(&mut self, batches: I, mut on_step: F) -> Result<EpochStats>
    where
        I: IntoIterator<Item = Result<Batch>>,
        F: FnMut(&StepStats),
    {
        let mut steps = Vec::new();
        for batch in batches {
            let stats = self.train_step(&batch?)?;
            on_step(&stats);
            steps.push(stats);
        }
        Ok(EpochStats::aggregate(&steps))
    }

    /// Validate on every batch, reporting each step to `on_step`
    pub fn validate_epoch<I, F>(&self, batches: I, mut on_step: F) -> Result<EpochStats>
    where
        I: IntoIterator<Item = Result<Batch>>,
        F: FnMut(&StepStats),
    {
        let mut steps = Vec::new();
        for batch in batches {
            let stats = self.validate_step(&batch?)?;
            on_step(&stats);
            steps.push(stats);
        }
        Ok(EpochStats::aggregate(&steps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(total: f64, f1_hits: usize) -> StepStats {
        StepStats {
            total_loss: total,
            losses: RelationMap {
                cells: total / 2.0,
                rows: total / 4.0,
                cols: total / 4.0,
            },
            pairs: RelationMap::from_fn(|_| 4),
            confusion: RelationMap::from_fn(|_| ConfusionCounts {
                true_positives: f1_hits,
                false_negatives: 2 - f1_hits,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_epoch_aggregate_means_and_sums() {
        let epoch = EpochStats::aggregate(&[step(2.0, 2), step(4.0, 0)]);
        assert_eq!(epoch.steps, 2);
        assert!((epoch.mean_total_loss - 3.0).abs() < 1e-12);
        assert!((epoch.mean_losses.cells - 1.5).abs() < 1e-12);
        assert_eq!(epoch.pairs.rows, 8);
        assert_eq!(epoch.confusion.cols.true_positives, 2);
        assert_eq!(epoch.confusion.cols.false_negatives, 2);
        assert!((epoch.f1(Relation::Cols) - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_epoch() {
        let epoch = EpochStats::aggregate(&[]);
        assert_eq!(epoch, EpochStats::default());
    }

    #[test]
    fn test_history_serializes() {
        let history = TrainingHistory {
            train: vec![EpochStats::aggregate(&[step(1.0, 1)])],
            validation: Vec::new(),
        };
        let json = serde_json::to_string(&history).unwrap();
        assert!(json.contains("\"mean_total_loss\":1.0"));
        let back: TrainingHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, history);
    }
}
