//! On-disk dataset of per-example safetensors records
//!
//! A dataset is a directory of `*.safetensors` files, one document example
//! each, holding:
//!
//! | tensor | shape | dtype |
//! |---|---|---|
//! | `image` | `[3, H, W]` | float |
//! | `num_words` | `[1]` | integer |
//! | `word_geometry` | `[capacity, 5]` | float |
//! | `edge_index` | `[2, E]` | integer |
//! | `adjacency_cells`, `adjacency_rows`, `adjacency_cols` | `[capacity, capacity]` | integer/bool |
//!
//! Records are visited in file-name order.

use crate::data::{Batch, DocumentExample, Relation, RelationMap, WordGraph};
use crate::error::{Result, TableGraphError};
use crate::weights::tensor_from_view;
use ndarray::Array2;
use safetensors::SafeTensors;
use std::path::{Path, PathBuf};
use tch::kind::Element;
use tch::{Device, Kind, Tensor};

/// File extension of dataset records
pub const RECORD_EXTENSION: &str = "safetensors";

fn adjacency_key(relation: Relation) -> String {
    format!("adjacency_{}", relation.name())
}

fn record_error(path: &Path, reason: impl Into<String>) -> TableGraphError {
    TableGraphError::DatasetError {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Decode one record file
pub fn read_record(path: &Path) -> Result<DocumentExample> {
    let buffer = std::fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer).map_err(|e| record_error(path, e.to_string()))?;

    let field = |name: &str, kind: Kind| -> Result<Tensor> {
        let view = tensors
            .tensor(name)
            .map_err(|_| record_error(path, format!("missing tensor '{name}'")))?;
        let tensor = tensor_from_view(&view).map_err(|reason| record_error(path, format!("{name}: {reason}")))?;
        Ok(tensor.to_kind(kind))
    };

    let image = field("image", Kind::Float)?;
    if image.dim() != 3 {
        return Err(record_error(path, format!("image must be [3, H, W], got {:?}", image.size())));
    }

    let num_words = field("num_words", Kind::Int64)?;
    if num_words.numel() != 1 {
        return Err(record_error(path, format!("num_words must hold one value, got {:?}", num_words.size())));
    }
    let num_words = usize::try_from(num_words.view(-1).int64_value(&[0]))
        .map_err(|_| record_error(path, "num_words is negative"))?;

    let word_geometry = array2::<f32>(path, "word_geometry", &field("word_geometry", Kind::Float)?)?;
    let edge_index = array2::<i64>(path, "edge_index", &field("edge_index", Kind::Int64)?)?;
    let adjacency = RelationMap::try_from_fn(|relation| {
        let key = adjacency_key(relation);
        array2::<u8>(path, &key, &field(&key, Kind::Uint8)?)
    })?;

    let graph = WordGraph {
        num_words,
        word_geometry,
        edge_index,
        adjacency,
    };
    graph
        .validate()
        .map_err(|e| record_error(path, e.to_string()))?;

    log::trace!("Read {} ({} words)", path.display(), num_words);
    Ok(DocumentExample { image, graph })
}

/// Encode one example as a record file
pub fn write_record(path: &Path, example: &DocumentExample) -> Result<()> {
    let graph = &example.graph;
    let mut tensors: Vec<(String, Tensor)> = vec![
        ("image".to_string(), example.image.to_device(Device::Cpu).to_kind(Kind::Float)),
        ("num_words".to_string(), Tensor::from_slice(&[graph.num_words as i64])),
        ("word_geometry".to_string(), array_tensor(&graph.word_geometry)),
        ("edge_index".to_string(), array_tensor(&graph.edge_index)),
    ];
    for (relation, matrix) in graph.adjacency.iter() {
        tensors.push((adjacency_key(relation), array_tensor(matrix)));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Tensor::write_safetensors(&tensors[..], path)?;
    Ok(())
}

fn array2<T: Element + Copy>(path: &Path, name: &str, tensor: &Tensor) -> Result<Array2<T>> {
    let size = tensor.size();
    if size.len() != 2 {
        return Err(record_error(path, format!("{name} must be 2-D, got {size:?}")));
    }
    let values = Vec::<T>::try_from(&tensor.view(-1))?;
    Array2::from_shape_vec((size[0] as usize, size[1] as usize), values)
        .map_err(|e| record_error(path, format!("{name}: {e}")))
}

fn array_tensor<T: Element + Clone>(array: &Array2<T>) -> Tensor {
    let (rows, cols) = array.dim();
    let values: Vec<T> = array.iter().cloned().collect();
    Tensor::from_slice(&values).reshape([rows as i64, cols as i64])
}

/// Record files of one dataset directory
#[derive(Debug, Clone)]
pub struct Dataset {
    root: PathBuf,
    records: Vec<PathBuf>,
}

impl Dataset {
    /// List the records under `root`
    ///
    /// Fails if `root` is not a directory or holds no records.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(record_error(root, "not a directory"));
        }
        let mut records = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == RECORD_EXTENSION) {
                records.push(path);
            }
        }
        records.sort();
        if records.is_empty() {
            return Err(record_error(root, format!("no .{RECORD_EXTENSION} records")));
        }
        log::info!("Found {} records in {}", records.len(), root.display());
        Ok(Self {
            root: root.to_path_buf(),
            records,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.records
    }

    pub fn example(&self, index: usize) -> Result<DocumentExample> {
        let path = self
            .records
            .get(index)
            .ok_or_else(|| TableGraphError::invalid_input(format!("record {index} out of range 0..{}", self.len())))?;
        read_record(path)
    }

    /// Number of batches [`Self::batches`] yields
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.records.len().div_ceil(batch_size.max(1))
    }

    /// Consecutive batches of `batch_size` records; the last may be smaller
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Result<Batch>> + '_ {
        self.records.chunks(batch_size.max(1)).map(|chunk| {
            let examples = chunk
                .iter()
                .map(|path| read_record(path))
                .collect::<Result<Vec<_>>>()?;
            Batch::from_examples(examples)
        })
    }
}
