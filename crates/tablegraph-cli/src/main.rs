// CLI tool has numeric conversions for progress display and statistics.
#![allow(
    clippy::cast_precision_loss,       // f64 sufficient for display purposes
    clippy::too_many_lines,            // command handlers are necessarily long
    clippy::needless_pass_by_value,    // clap requires owned values
)]

//! tablegraph CLI - train, evaluate and run the table relationship model
//!
//! ```text
//! tablegraph train data/train --val-dir data/val --extractor-weights featurenet.safetensors
//! tablegraph evaluate data/val --checkpoint model.safetensors
//! tablegraph predict page.safetensors --checkpoint model.safetensors --pairs
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tablegraph_ml::{
    parse_device, read_record, Batch, Dataset, Device, EpochStats, ModelConfig, Relation,
    RelationMap, TableRelationModel, Trainer, TrainingConfig, TrainingHistory,
};

#[derive(Parser, Debug)]
#[command(name = "tablegraph", version, about = "GNN table structure recognition")]
struct Args {
    /// TOML file with [model] and [training] tables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// cpu, mps, cuda, cuda:N or auto
    #[arg(long, global = true, default_value = "auto")]
    device: String,

    /// Hide progress bars
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train the graph network and relation heads
    Train {
        /// Directory of training records
        train_dir: PathBuf,

        /// Directory of validation records
        #[arg(long)]
        val_dir: Option<PathBuf>,

        /// Pretrained weights of the frozen feature extractor
        #[arg(long)]
        extractor_weights: Option<PathBuf>,

        /// Continue from a saved checkpoint
        #[arg(long)]
        resume: Option<PathBuf>,

        #[arg(long)]
        epochs: Option<usize>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        learning_rate: Option<f64>,

        #[arg(long)]
        seed: Option<u64>,

        /// Checkpoint written after training (always SafeTensors, whatever the extension)
        #[arg(short, long, default_value = "model.safetensors")]
        output: PathBuf,

        /// Per-epoch statistics as JSON
        #[arg(long)]
        stats: Option<PathBuf>,
    },

    /// Score a dataset against its adjacency matrices
    Evaluate {
        /// Directory of records
        data_dir: PathBuf,

        #[arg(long)]
        checkpoint: PathBuf,

        #[arg(long)]
        extractor_weights: Option<PathBuf>,

        #[arg(long)]
        batch_size: Option<usize>,

        /// Print statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Predict relations for one record
    Predict {
        /// Record file
        record: PathBuf,

        #[arg(long)]
        checkpoint: PathBuf,

        #[arg(long)]
        extractor_weights: Option<PathBuf>,

        /// Emit related word pairs instead of full probability matrices
        #[arg(long)]
        pairs: bool,

        /// Probability at which a pair counts as related
        #[arg(long)]
        threshold: Option<f64>,

        /// Write JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Contents of the `--config` file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct FileConfig {
    model: ModelConfig,
    training: TrainingConfig,
}

impl FileConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}

fn build_model(config: ModelConfig, extractor_weights: Option<&Path>, device: Device) -> Result<TableRelationModel> {
    match extractor_weights {
        Some(path) => TableRelationModel::with_extractor_weights(config, path, device)
            .with_context(|| format!("Failed to load extractor weights: {}", path.display())),
        None => {
            log::warn!("No --extractor-weights given; using a randomly initialised frozen extractor");
            Ok(TableRelationModel::new(config, device)?)
        }
    }
}

fn load_model(
    config: ModelConfig,
    extractor_weights: Option<&Path>,
    checkpoint: &Path,
    device: Device,
) -> Result<TableRelationModel> {
    let mut model = build_model(config, extractor_weights, device)?;
    model
        .load_checkpoint(checkpoint)
        .with_context(|| format!("Failed to load checkpoint: {}", checkpoint.display()))?;
    Ok(model)
}

fn progress_bar(len: usize, prefix: String, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("template is compile-time constant")
            .progress_chars("█▓▒░  "),
    );
    pb.set_prefix(prefix);
    pb
}

fn format_f1(confusion_f1: impl Fn(Relation) -> f64) -> String {
    format!(
        "F1 cells {:.3} cols {:.3} rows {:.3}",
        confusion_f1(Relation::Cells),
        confusion_f1(Relation::Cols),
        confusion_f1(Relation::Rows)
    )
}

fn print_summary(label: &str, stats: &EpochStats) {
    println!("{label}: {} batches, mean loss {:.4}", stats.steps, stats.mean_total_loss);
    for relation in Relation::ALL {
        let confusion = stats.confusion.get(relation);
        println!(
            "  {:<5}  loss {:.4}  precision {:.3}  recall {:.3}  F1 {:.3}  ({} pairs)",
            relation.name(),
            stats.mean_losses.get(relation),
            confusion.precision(),
            confusion.recall(),
            confusion.f1(),
            stats.pairs.get(relation)
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn run_train(
    mut config: FileConfig,
    device: Device,
    quiet: bool,
    train_dir: PathBuf,
    val_dir: Option<PathBuf>,
    extractor_weights: Option<PathBuf>,
    resume: Option<PathBuf>,
    output: PathBuf,
    stats_path: Option<PathBuf>,
) -> Result<()> {
    let train = Dataset::open(&train_dir)
        .with_context(|| format!("Failed to open training data: {}", train_dir.display()))?;
    let val = val_dir
        .map(|dir| {
            Dataset::open(&dir)
                .with_context(|| format!("Failed to open validation data: {}", dir.display()))
        })
        .transpose()?;

    let mut model = build_model(config.model.clone(), extractor_weights.as_deref(), device)?;
    if let Some(checkpoint) = &resume {
        model
            .load_checkpoint(checkpoint)
            .with_context(|| format!("Failed to resume from {}", checkpoint.display()))?;
    }

    let training = std::mem::take(&mut config.training);
    let epochs = training.epochs;
    let batch_size = training.batch_size;
    let val_batch_size = training.validation_batch_size;
    let mut trainer = Trainer::new(model, training)?;
    let mut history = TrainingHistory::default();

    for epoch in 1..=epochs {
        let pb = progress_bar(train.num_batches(batch_size), format!("epoch {epoch}/{epochs} train"), quiet);
        let train_stats = trainer.run_epoch(train.batches(batch_size), |step| {
            pb.set_message(format!("loss {:.4} | {}", step.total_loss, format_f1(|r| step.f1(r))));
            pb.inc(1);
        })?;
        pb.finish_and_clear();

        let mut line = format!(
            "Epoch [{epoch}/{epochs}] train loss {:.4}, {}",
            train_stats.mean_total_loss,
            format_f1(|r| train_stats.f1(r))
        );
        history.train.push(train_stats);

        if let Some(val) = &val {
            let pb = progress_bar(val.num_batches(val_batch_size), format!("epoch {epoch}/{epochs} val"), quiet);
            let val_stats = trainer.validate_epoch(val.batches(val_batch_size), |step| {
                pb.set_message(format!("loss {:.4}", step.total_loss));
                pb.inc(1);
            })?;
            pb.finish_and_clear();
            line.push_str(&format!(
                " | val loss {:.4}, {}",
                val_stats.mean_total_loss,
                format_f1(|r| val_stats.f1(r))
            ));
            history.validation.push(val_stats);
        }
        println!("{line}");
    }

    trainer
        .model()
        .save_checkpoint(&output)
        .with_context(|| format!("Failed to save checkpoint: {}", output.display()))?;
    println!("Saved checkpoint to {}", output.display());

    if let Some(path) = stats_path {
        let json = serde_json::to_string_pretty(&history).context("Failed to serialize statistics")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write statistics: {}", path.display()))?;
        println!("Saved statistics to {}", path.display());
    }
    Ok(())
}

fn run_evaluate(
    config: FileConfig,
    device: Device,
    quiet: bool,
    data_dir: PathBuf,
    checkpoint: PathBuf,
    extractor_weights: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let dataset = Dataset::open(&data_dir)
        .with_context(|| format!("Failed to open data: {}", data_dir.display()))?;
    let model = load_model(config.model, extractor_weights.as_deref(), &checkpoint, device)?;
    let batch_size = config.training.validation_batch_size;
    let trainer = Trainer::new(model, config.training)?;

    let pb = progress_bar(dataset.num_batches(batch_size), "evaluate".to_string(), quiet);
    let stats = trainer.validate_epoch(dataset.batches(batch_size), |_| pb.inc(1))?;
    pb.finish_and_clear();

    if json {
        println!("{}", serde_json::to_string_pretty(&stats).context("Failed to serialize statistics")?);
    } else {
        print_summary(&data_dir.display().to_string(), &stats);
    }
    Ok(())
}

/// Ordered word pairs `(i, j)`, `i != j`, scored at or above `threshold`
fn related_pairs(probabilities: &Array2<f32>, threshold: f32) -> Vec<(usize, usize)> {
    probabilities
        .indexed_iter()
        .filter(|&((i, j), &p)| i != j && p >= threshold)
        .map(|(ij, _)| ij)
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum PredictionOutput {
    Pairs {
        num_words: usize,
        threshold: f64,
        pairs: RelationMap<Vec<(usize, usize)>>,
    },
    Probabilities {
        num_words: usize,
        probabilities: RelationMap<Vec<Vec<f32>>>,
    },
}

#[allow(clippy::too_many_arguments)]
fn run_predict(
    config: FileConfig,
    device: Device,
    record: PathBuf,
    checkpoint: PathBuf,
    extractor_weights: Option<PathBuf>,
    pairs: bool,
    threshold: Option<f64>,
    output: Option<PathBuf>,
) -> Result<()> {
    let example = read_record(&record).with_context(|| format!("Failed to read record: {}", record.display()))?;
    let num_words = example.graph.num_words;
    let batch = Batch::from_examples(vec![example])?;
    let model = load_model(config.model, extractor_weights.as_deref(), &checkpoint, device)?;

    let predictions = model.infer(&batch)?;
    let Some(probabilities) = predictions.into_iter().next() else {
        anyhow::bail!("model returned no prediction for {}", record.display());
    };

    let result = if pairs {
        let threshold = threshold.unwrap_or(config.training.prediction_threshold);
        PredictionOutput::Pairs {
            num_words,
            threshold,
            pairs: probabilities.map(|_, m| related_pairs(m, threshold as f32)),
        }
    } else {
        PredictionOutput::Probabilities {
            num_words,
            probabilities: probabilities.map(|_, m| m.rows().into_iter().map(|row| row.to_vec()).collect()),
        }
    };

    let json = serde_json::to_string_pretty(&result).context("Failed to serialize prediction")?;
    match output {
        Some(path) => {
            fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote predictions for {num_words} words to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = FileConfig::load(args.config.as_deref())?;
    let device = parse_device(&args.device)?;
    log::info!("Using device {device:?}");

    match args.command {
        Commands::Train {
            train_dir,
            val_dir,
            extractor_weights,
            resume,
            epochs,
            batch_size,
            learning_rate,
            seed,
            output,
            stats,
        } => {
            if let Some(epochs) = epochs {
                config.training.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.training.batch_size = batch_size;
            }
            if let Some(learning_rate) = learning_rate {
                config.training.learning_rate = learning_rate;
            }
            if let Some(seed) = seed {
                config.training.seed = seed;
            }
            run_train(
                config,
                device,
                args.quiet,
                train_dir,
                val_dir,
                extractor_weights,
                resume,
                output,
                stats,
            )
        }
        Commands::Evaluate {
            data_dir,
            checkpoint,
            extractor_weights,
            batch_size,
            json,
        } => {
            if let Some(batch_size) = batch_size {
                config.training.validation_batch_size = batch_size;
            }
            run_evaluate(config, device, args.quiet, data_dir, checkpoint, extractor_weights, json)
        }
        Commands::Predict {
            record,
            checkpoint,
            extractor_weights,
            pairs,
            threshold,
            output,
        } => run_predict(config, device, record, checkpoint, extractor_weights, pairs, threshold, output),
    }
}
