/// Common test fixtures: tiny models and synthetic word graphs.
///
/// These are not part of the production library.
#[allow(dead_code)]
pub mod fixtures {
    use ndarray::{Array2, Array1};
    use tablegraph_ml::{Batch, ModelConfig, ModelConfigBuilder, RelationMap, WordGraph};
    use tch::{Device, Kind, Tensor};

    /// Image size of [`tiny_config`]
    pub const IMG_H: i64 = 64;
    pub const IMG_W: i64 = 96;

    pub fn tiny_config() -> ModelConfig {
        ModelConfigBuilder::tiny()
            .build()
            .expect("tiny config is valid")
    }

    /// Symmetric membership matrix: words sharing a group id are related
    ///
    /// The diagonal of every grouped word is 1; padding rows stay 0.
    pub fn group_matrix(groups: &[usize], capacity: usize) -> Array2<u8> {
        let mut matrix = Array2::zeros((capacity, capacity));
        for (i, gi) in groups.iter().enumerate() {
            for (j, gj) in groups.iter().enumerate() {
                if gi == gj {
                    matrix[[i, j]] = 1;
                }
            }
        }
        matrix
    }

    /// Words laid out on a grid of `cols` columns, 12 px apart
    pub fn grid_geometry(num_words: usize, capacity: usize, cols: usize) -> Array2<f32> {
        let mut geometry = Array2::zeros((capacity, 5));
        for i in 0..num_words {
            let (r, c) = ((i / cols) as f32, (i % cols) as f32);
            geometry
                .row_mut(i)
                .assign(&Array1::from(vec![c * 12.0 + 2.0, r * 12.0 + 2.0, c * 12.0 + 10.0, r * 12.0 + 9.0, 4.0]));
        }
        geometry
    }

    /// Visibility edges between horizontally and vertically adjacent grid words
    pub fn grid_edges(num_words: usize, cols: usize) -> Array2<i64> {
        let mut edges: Vec<(i64, i64)> = Vec::new();
        for i in 0..num_words {
            if (i + 1) % cols != 0 && i + 1 < num_words {
                edges.push((i as i64, i as i64 + 1));
            }
            if i + cols < num_words {
                edges.push((i as i64, (i + cols) as i64));
            }
        }
        let mut array = Array2::zeros((2, edges.len()));
        for (k, (a, b)) in edges.into_iter().enumerate() {
            array[[0, k]] = a;
            array[[1, k]] = b;
        }
        array
    }

    /// A table of `num_words` words in `cols` columns, padded to `capacity`
    ///
    /// Rows and columns follow the grid; each word is its own cell except
    /// the first two, which share one.
    pub fn table_graph(num_words: usize, capacity: usize, cols: usize) -> WordGraph {
        let row_ids: Vec<usize> = (0..num_words).map(|i| i / cols).collect();
        let col_ids: Vec<usize> = (0..num_words).map(|i| i % cols).collect();
        let cell_ids: Vec<usize> = (0..num_words).map(|i| i.max(1)).collect();

        WordGraph {
            num_words,
            word_geometry: grid_geometry(num_words, capacity, cols),
            edge_index: grid_edges(num_words, cols),
            adjacency: RelationMap {
                cells: group_matrix(&cell_ids, capacity),
                rows: group_matrix(&row_ids, capacity),
                cols: group_matrix(&col_ids, capacity),
            },
        }
    }

    /// Word graph with no real words
    pub fn empty_graph(capacity: usize) -> WordGraph {
        WordGraph {
            num_words: 0,
            word_geometry: Array2::zeros((capacity, 5)),
            edge_index: Array2::zeros((2, 0)),
            adjacency: RelationMap::from_fn(|_| Array2::zeros((capacity, capacity))),
        }
    }

    pub fn images(batch_size: usize) -> Tensor {
        Tensor::rand([batch_size as i64, 3, IMG_H, IMG_W], (Kind::Float, Device::Cpu))
    }

    pub fn batch(graphs: Vec<WordGraph>) -> Batch {
        Batch::new(images(graphs.len()), graphs).expect("fixture batch is valid")
    }
}
