//! Per-word feature gathering from the extractor's spatial feature map
//!
//! Each word box is projected from image pixels onto feature-map cells and
//! the covered cells are averaged. The word's normalised geometry is appended,
//! giving `channels + 5` values per word.
//!
//! Gathering is part of the frozen front end: the model calls it under
//! `tch::no_grad`.

use crate::data::GEOMETRY_DIM;
use crate::error::{Result, TableGraphError};
use ndarray::ArrayView2;
use tch::{Kind, Tensor};

/// Region-of-interest mean pooling plus normalised box geometry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiMeanGatherer {
    img_h: f64,
    img_w: f64,
    channels: i64,
}

impl RoiMeanGatherer {
    pub fn new(img_h: i64, img_w: i64, channels: i64) -> Self {
        Self {
            img_h: img_h as f64,
            img_w: img_w as f64,
            channels,
        }
    }

    /// Size of each gathered word vector
    pub fn out_dim(&self) -> i64 {
        self.channels + GEOMETRY_DIM as i64
    }

    /// Gather `[N, out_dim]` features for the given word rows
    ///
    /// `feature_map` is one image's `[C, h, w]` map. Zero words yield a
    /// `[0, out_dim]` tensor.
    pub fn gather(&self, geometry: ArrayView2<'_, f32>, feature_map: &Tensor) -> Result<Tensor> {
        let size = feature_map.size();
        if size.len() != 3 || size[0] != self.channels {
            return Err(TableGraphError::invalid_input(format!(
                "feature map must be [{}, h, w], got {size:?}",
                self.channels
            )));
        }
        if geometry.ncols() != GEOMETRY_DIM {
            return Err(TableGraphError::invalid_input(format!(
                "word geometry must have {GEOMETRY_DIM} columns, got {}",
                geometry.ncols()
            )));
        }

        let device = feature_map.device();
        let num_words = geometry.nrows();
        if num_words == 0 {
            return Ok(Tensor::zeros([0, self.out_dim()], (Kind::Float, device)));
        }

        let (map_h, map_w) = (size[1], size[2]);
        let scale_y = map_h as f64 / self.img_h;
        let scale_x = map_w as f64 / self.img_w;

        let mut pooled = Vec::with_capacity(num_words);
        let mut boxes = Vec::with_capacity(num_words * GEOMETRY_DIM);
        for word in geometry.rows() {
            let (x1, y1, x2, y2, length) = (
                f64::from(word[0]),
                f64::from(word[1]),
                f64::from(word[2]),
                f64::from(word[3]),
                word[4],
            );
            let (c0, c1) = cell_range(x1.min(x2) * scale_x, x1.max(x2) * scale_x, map_w);
            let (r0, r1) = cell_range(y1.min(y2) * scale_y, y1.max(y2) * scale_y, map_h);

            let region = feature_map.narrow(1, r0, r1 - r0).narrow(2, c0, c1 - c0);
            pooled.push(region.mean_dim(&[1i64, 2][..], false, Kind::Float));

            boxes.extend_from_slice(&[
                (x1 / self.img_w) as f32,
                (y1 / self.img_h) as f32,
                (x2 / self.img_w) as f32,
                (y2 / self.img_h) as f32,
                length,
            ]);
        }

        let pooled = Tensor::stack(&pooled, 0);
        let boxes = Tensor::from_slice(&boxes)
            .reshape([num_words as i64, GEOMETRY_DIM as i64])
            .to_device(device);
        Ok(Tensor::cat(&[pooled, boxes], 1))
    }
}

/// Half-open cell range covering `[lo, hi]`, at least one cell wide
fn cell_range(lo: f64, hi: f64, cells: i64) -> (i64, i64) {
    let start = (lo.floor() as i64).clamp(0, cells - 1);
    let end = (hi.ceil() as i64).clamp(start + 1, cells);
    (start, end)
}
