//! End-to-end training and inference on synthetic tables
mod common;

use common::fixtures::{batch, empty_graph, images, table_graph, tiny_config};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rstest::rstest;
use tablegraph_ml::{
    write_record, Batch, Dataset, DocumentExample, FeatureProducer, ModelConfigBuilder, Relation,
    TableRelationModel, Trainer, TrainingConfig,
};
use tch::{Device, Kind, Tensor};

fn tiny_model() -> TableRelationModel {
    TableRelationModel::new(tiny_config(), Device::Cpu).unwrap()
}

/// Passes images through a scale that would receive gradients if the model
/// ever tracked the front end.
#[derive(Debug)]
struct ScaledImages {
    scale: Tensor,
}

impl FeatureProducer for ScaledImages {
    fn out_channels(&self) -> i64 {
        3
    }

    fn feature_map(&self, images: &Tensor) -> tablegraph_ml::Result<Tensor> {
        Ok(images * &self.scale)
    }
}

#[test]
fn test_empty_example_adds_nothing_to_the_loss() {
    let model = tiny_model();
    let images = images(2);
    let pair = Batch::new(images.shallow_clone(), vec![table_graph(3, 4, 3), empty_graph(4)]).unwrap();
    let single = Batch::new(images.narrow(0, 0, 1), vec![table_graph(3, 4, 3)]).unwrap();

    let with_empty = model
        .forward_train(&pair, &mut StdRng::seed_from_u64(11))
        .unwrap();
    let alone = model
        .forward_train(&single, &mut StdRng::seed_from_u64(11))
        .unwrap();

    assert_eq!(with_empty.num_pairs(), alone.num_pairs());
    let a = with_empty.loss.double_value(&[]);
    let b = alone.loss.double_value(&[]);
    assert!(a.is_finite());
    assert!((a - b).abs() < 1e-5, "{a} vs {b}");
}

#[test]
fn test_frozen_front_end_gets_no_gradient() {
    let scale = Tensor::ones([1], (Kind::Float, Device::Cpu)).set_requires_grad(true);
    let producer = ScaledImages {
        scale: scale.shallow_clone(),
    };
    let model = TableRelationModel::with_extractor(tiny_config(), Box::new(producer), Device::Cpu).unwrap();

    let output = model
        .forward_train(&batch(vec![table_graph(6, 6, 3)]), &mut StdRng::seed_from_u64(0))
        .unwrap();
    assert!(output.has_gradient());
    output.loss.backward();

    assert!(!scale.grad().defined());
    for (name, var) in model.trainable_vs().variables() {
        assert!(var.grad().defined(), "no gradient for {name}");
    }
}

#[rstest]
#[case(1, 256)]
#[case(4, 256)]
#[case(7, 3)]
#[case(9, 1)]
fn test_inference_scores_every_ordered_pair(#[case] num_words: usize, #[case] chunk: usize) {
    let config = ModelConfigBuilder::tiny().inference_chunk_size(chunk).build().unwrap();
    let model = TableRelationModel::new(config, Device::Cpu).unwrap();
    let graphs = vec![table_graph(num_words, num_words + 2, 3), empty_graph(3)];

    let predictions = model.infer(&batch(graphs)).unwrap();
    assert_eq!(predictions.len(), 2);
    for relation in Relation::ALL {
        let probabilities = predictions[0].get(relation);
        assert_eq!(probabilities.len(), num_words * num_words);
        assert!(probabilities.iter().all(|p| (0.0..=1.0).contains(p)));
        assert_eq!(predictions[1].get(relation).len(), 0);
    }
}

#[test]
fn test_absolute_difference_gives_symmetric_probabilities() {
    let model = tiny_model();
    let predictions = model.infer(&batch(vec![table_graph(5, 5, 2)])).unwrap();
    let cells = predictions[0].get(Relation::Cells);
    for i in 0..5 {
        for j in 0..5 {
            assert!((cells[[i, j]] - cells[[j, i]]).abs() < 1e-6);
        }
    }
}

#[test]
fn test_train_step_updates_only_trainable_weights() {
    let mut trainer = Trainer::new(tiny_model(), TrainingConfig::default()).unwrap();
    let before: Vec<(String, Tensor)> = trainer
        .model()
        .trainable_vs()
        .variables()
        .into_iter()
        .map(|(name, t)| (name, t.detach().copy()))
        .collect();

    let batch = batch(vec![table_graph(6, 8, 3), table_graph(4, 8, 2)]);
    let stats = trainer.train_step(&batch).unwrap();
    assert!(stats.total_loss.is_finite());
    assert!(stats.total_loss > 0.0);
    assert_eq!(trainer.steps(), 1);

    let after = trainer.model().trainable_vs().variables();
    let changed = before
        .iter()
        .filter(|(name, old)| !after[name].equal(old))
        .count();
    assert!(changed > 0);
}

#[test]
fn test_batch_without_words_skips_update() {
    let mut trainer = Trainer::new(tiny_model(), TrainingConfig::default()).unwrap();
    let stats = trainer.train_step(&batch(vec![empty_graph(3), empty_graph(3)])).unwrap();
    assert_eq!(stats.total_loss, 0.0);
    assert_eq!(trainer.steps(), 0);
}

#[test]
fn test_validation_counts_all_pairs() {
    let trainer = Trainer::new(tiny_model(), TrainingConfig::default()).unwrap();
    let stats = trainer
        .validate_step(&batch(vec![table_graph(4, 5, 2), table_graph(3, 5, 3)]))
        .unwrap();
    for relation in Relation::ALL {
        assert_eq!(*stats.pairs.get(relation), 16 + 9);
        assert_eq!(stats.confusion.get(relation).total(), 25);
        assert!(stats.losses.get(relation).is_finite());
    }
}

#[test]
fn test_epoch_over_dataset_and_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("train");
    for (i, n) in [5usize, 3, 0, 6, 4].into_iter().enumerate() {
        let graph = if n == 0 { empty_graph(6) } else { table_graph(n, 6, 3) };
        let example = DocumentExample {
            image: images(1).squeeze_dim(0),
            graph,
        };
        write_record(&data.join(format!("{i:03}.safetensors")), &example).unwrap();
    }
    let dataset = Dataset::open(&data).unwrap();

    let config = TrainingConfig {
        batch_size: 2,
        seed: 5,
        ..TrainingConfig::default()
    };
    let mut trainer = Trainer::new(tiny_model(), config).unwrap();
    let mut seen = 0;
    let train = trainer
        .run_epoch(dataset.batches(2), |_| seen += 1)
        .unwrap();
    assert_eq!(seen, 3);
    assert_eq!(train.steps, 3);
    assert!(train.mean_total_loss.is_finite());

    let validation = trainer.validate_epoch(dataset.batches(4), |_| {}).unwrap();
    assert_eq!(validation.steps, 2);
    assert_eq!(*validation.pairs.get(Relation::Rows), 25 + 9 + 36 + 16);

    // A restored checkpoint reproduces the trained network.
    let checkpoint = dir.path().join("model.safetensors");
    let model = trainer.into_model();
    model.save_checkpoint(&checkpoint).unwrap();
    let mut restored = TableRelationModel::new(tiny_config(), Device::Cpu).unwrap();
    restored.load_checkpoint(&checkpoint).unwrap();

    let trained = model.trainable_vs().variables();
    for (name, var) in restored.trainable_vs().variables() {
        assert!(var.equal(&trained[&name]), "{name} differs after reload");
    }
}
