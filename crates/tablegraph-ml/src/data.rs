//! Batch and example types consumed by the model
//!
//! Word-level inputs (geometry, visibility edges, adjacency targets) are kept
//! host-side as `ndarray` arrays sized to a padding capacity; `num_words`
//! marks how many leading rows are real. Images stay as `tch` tensors.

use crate::error::{Result, TableGraphError};
use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use tch::Tensor;

/// Number of values per word in the geometry array: x1, y1, x2, y2, word length
pub const GEOMETRY_DIM: usize = 5;

/// Table-structure membership type between two words
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    /// Words share a table cell
    Cells,
    /// Words share a table row
    Rows,
    /// Words share a table column
    Cols,
}

impl Relation {
    /// All relations in the order they are sampled and scored
    pub const ALL: [Relation; 3] = [Relation::Cells, Relation::Cols, Relation::Rows];

    /// Lowercase name, also used as the dataset tensor suffix
    pub const fn name(self) -> &'static str {
        match self {
            Relation::Cells => "cells",
            Relation::Rows => "rows",
            Relation::Cols => "cols",
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One value per relation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationMap<T> {
    pub cells: T,
    pub rows: T,
    pub cols: T,
}

impl<T> RelationMap<T> {
    /// Build a map by evaluating `f` for each relation in [`Relation::ALL`] order
    pub fn from_fn(mut f: impl FnMut(Relation) -> T) -> Self {
        let cells = f(Relation::Cells);
        let cols = f(Relation::Cols);
        let rows = f(Relation::Rows);
        Self { cells, rows, cols }
    }

    /// Fallible variant of [`RelationMap::from_fn`]
    pub fn try_from_fn<E>(mut f: impl FnMut(Relation) -> std::result::Result<T, E>) -> std::result::Result<Self, E> {
        let cells = f(Relation::Cells)?;
        let cols = f(Relation::Cols)?;
        let rows = f(Relation::Rows)?;
        Ok(Self { cells, rows, cols })
    }

    pub fn get(&self, relation: Relation) -> &T {
        match relation {
            Relation::Cells => &self.cells,
            Relation::Rows => &self.rows,
            Relation::Cols => &self.cols,
        }
    }

    pub fn get_mut(&mut self, relation: Relation) -> &mut T {
        match relation {
            Relation::Cells => &mut self.cells,
            Relation::Rows => &mut self.rows,
            Relation::Cols => &mut self.cols,
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(Relation, &T) -> U) -> RelationMap<U> {
        RelationMap::from_fn(|relation| f(relation, self.get(relation)))
    }

    /// Iterate `(relation, value)` in [`Relation::ALL`] order
    pub fn iter(&self) -> impl Iterator<Item = (Relation, &T)> {
        Relation::ALL.into_iter().map(move |r| (r, self.get(r)))
    }
}

/// Word-level inputs and targets for one document image
#[derive(Debug, Clone, PartialEq)]
pub struct WordGraph {
    /// Number of real (non-padding) words
    pub num_words: usize,
    /// `[capacity, 5]` per-word `(x1, y1, x2, y2, word_length)` in image pixels
    pub word_geometry: Array2<f32>,
    /// `[2, E]` visibility-graph edges as word indices
    pub edge_index: Array2<i64>,
    /// `[capacity, capacity]` binary membership matrices
    pub adjacency: RelationMap<Array2<u8>>,
}

impl WordGraph {
    /// Check shapes against the declared word count
    ///
    /// An adjacency matrix smaller than `num_words` is a configuration error:
    /// sampling would otherwise index out of bounds or silently truncate.
    pub fn validate(&self) -> Result<()> {
        let (rows, cols) = self.word_geometry.dim();
        if cols != GEOMETRY_DIM {
            return Err(TableGraphError::invalid_input(format!(
                "word_geometry must have {GEOMETRY_DIM} columns, got {cols}"
            )));
        }
        if rows < self.num_words {
            return Err(TableGraphError::invalid_input(format!(
                "word_geometry has {rows} rows but num_words is {}",
                self.num_words
            )));
        }
        if self.edge_index.nrows() != 2 {
            return Err(TableGraphError::invalid_input(format!(
                "edge_index must be [2, E], got {:?}",
                self.edge_index.dim()
            )));
        }
        if self.edge_index.iter().any(|&i| i < 0) {
            return Err(TableGraphError::invalid_input(
                "edge_index contains negative word indices",
            ));
        }
        for (relation, matrix) in self.adjacency.iter() {
            check_matrix_capacity(relation, matrix.view(), self.num_words)?;
        }
        Ok(())
    }

    /// Geometry rows of the real words
    pub fn real_geometry(&self) -> ArrayView2<'_, f32> {
        self.word_geometry.slice(s![..self.num_words, ..])
    }

    /// Visibility edges whose endpoints are both real words
    ///
    /// Edges touching padding indices are dropped.
    pub fn real_edges(&self) -> Vec<(i64, i64)> {
        let n = self.num_words as i64;
        self.edge_index
            .columns()
            .into_iter()
            .map(|c| (c[0], c[1]))
            .filter(|&(a, b)| a < n && b < n)
            .collect()
    }

    /// Full (padded) adjacency matrix for a relation
    pub fn adjacency(&self, relation: Relation) -> ArrayView2<'_, u8> {
        self.adjacency.get(relation).view()
    }

    /// Top-left `num_words × num_words` block of a relation matrix
    pub fn real_adjacency(&self, relation: Relation) -> Result<ArrayView2<'_, u8>> {
        let matrix = self.adjacency.get(relation);
        check_matrix_capacity(relation, matrix.view(), self.num_words)?;
        Ok(matrix.slice(s![..self.num_words, ..self.num_words]))
    }
}

/// Fail fast when a matrix cannot hold `num_words` rows and columns
pub(crate) fn check_matrix_capacity(
    relation: Relation,
    matrix: ArrayView2<'_, u8>,
    num_words: usize,
) -> Result<()> {
    let (rows, cols) = matrix.dim();
    if rows < num_words || cols < num_words {
        return Err(TableGraphError::config(format!(
            "{relation} adjacency matrix is {rows}x{cols} but declares {num_words} real words"
        )));
    }
    Ok(())
}

/// One document image with its word graph
#[derive(Debug)]
pub struct DocumentExample {
    /// `[3, H, W]` float image
    pub image: Tensor,
    pub graph: WordGraph,
}

/// A collated set of examples sharing one image tensor
///
/// The batch size is whatever the loader produced; nothing here assumes a
/// constant size across training and validation.
#[derive(Debug)]
pub struct Batch {
    images: Tensor,
    graphs: Vec<WordGraph>,
}

impl Batch {
    /// Wrap pre-stacked `[B, 3, H, W]` images and their word graphs
    pub fn new(images: Tensor, graphs: Vec<WordGraph>) -> Result<Self> {
        let size = images.size();
        if size.len() != 4 {
            return Err(TableGraphError::invalid_input(format!(
                "images must be [B, C, H, W], got {size:?}"
            )));
        }
        if size[0] as usize != graphs.len() {
            return Err(TableGraphError::invalid_input(format!(
                "{} images but {} word graphs",
                size[0],
                graphs.len()
            )));
        }
        for graph in &graphs {
            graph.validate()?;
        }
        Ok(Self { images, graphs })
    }

    /// Stack example images into one batch
    pub fn from_examples(examples: Vec<DocumentExample>) -> Result<Self> {
        if examples.is_empty() {
            return Err(TableGraphError::invalid_input("cannot collate an empty batch"));
        }
        let (images, graphs): (Vec<Tensor>, Vec<WordGraph>) =
            examples.into_iter().map(|e| (e.image, e.graph)).unzip();
        let first = images[0].size();
        if let Some(other) = images.iter().map(Tensor::size).find(|s| *s != first) {
            return Err(TableGraphError::invalid_input(format!(
                "image sizes differ within batch: {first:?} vs {other:?}"
            )));
        }
        Self::new(Tensor::stack(&images, 0), graphs)
    }

    pub fn batch_size(&self) -> usize {
        self.graphs.len()
    }

    pub fn images(&self) -> &Tensor {
        &self.images
    }

    pub fn graphs(&self) -> &[WordGraph] {
        &self.graphs
    }

    /// Real word count per example
    pub fn num_words(&self) -> Vec<usize> {
        self.graphs.iter().map(|g| g.num_words).collect()
    }
}
