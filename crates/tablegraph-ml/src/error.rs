//! Error types for table relationship training and inference
//!
//! All public APIs use the [`Result<T>`] alias which wraps [`TableGraphError`].
//!
//! # Examples
//!
//! ```no_run
//! use tablegraph_ml::{TableGraphError, TableRelationModel, ModelConfig};
//!
//! # fn example(model: &TableRelationModel, batch: &tablegraph_ml::Batch) {
//! match model.infer(batch) {
//!     Ok(predictions) => log::debug!("scored {} examples", predictions.len()),
//!     Err(TableGraphError::InvalidInput { reason }) => {
//!         log::warn!("rejected batch: {}", reason);
//!     }
//!     Err(e) => log::warn!("Other error: {}", e),
//! }
//! # }
//! ```

use crate::data::Relation;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while building, training or running the model
///
/// # Error Categories
///
/// - **Configuration** ([`ConfigError`]): invalid hyperparameters or
///   adjacency matrices smaller than their declared word count
/// - **Input** ([`InvalidInput`]): malformed batch contents
/// - **Sampling** ([`SamplingInvariant`]): a positive pair was also drawn as
///   negative; the step must be aborted
/// - **Weights / Dataset** ([`WeightLoadError`], [`DatasetError`]): on-disk
///   artifacts that could not be read
/// - **Tensor / I/O** ([`Tensor`], [`Io`]): wrapped lower-level errors
///
/// [`ConfigError`]: TableGraphError::ConfigError
/// [`InvalidInput`]: TableGraphError::InvalidInput
/// [`SamplingInvariant`]: TableGraphError::SamplingInvariant
/// [`WeightLoadError`]: TableGraphError::WeightLoadError
/// [`DatasetError`]: TableGraphError::DatasetError
/// [`Tensor`]: TableGraphError::Tensor
/// [`Io`]: TableGraphError::Io
#[derive(Error, Debug)]
pub enum TableGraphError {
    /// Invalid configuration (user error, fixable)
    #[error("Invalid configuration: {reason}")]
    ConfigError {
        /// Description of what is invalid
        reason: String,
    },

    /// Batch or example contents do not match what the model expects
    #[error("Invalid input: {reason}")]
    InvalidInput {
        /// Description of the malformed input
        reason: String,
    },

    /// Positive and negative pair sets overlapped for one relation
    #[error("Sampling invariant violated for {relation}: {reason}")]
    SamplingInvariant {
        /// Relation whose sample was corrupted
        relation: Relation,
        /// What overlapped
        reason: String,
    },

    /// Weights could not be copied into a VarStore
    #[error("Failed to load weights from {}: {reason}", path.display())]
    WeightLoadError {
        /// Weights file
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// A dataset record could not be decoded
    #[error("Invalid dataset record {}: {reason}", path.display())]
    DatasetError {
        /// Record file
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Error raised by libtorch
    #[error("Tensor error: {0}")]
    Tensor(#[from] tch::TchError),

    /// IO error (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TableGraphError {
    /// Shorthand for [`TableGraphError::ConfigError`]
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`TableGraphError::InvalidInput`]
    pub(crate) fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Returns true if this error is a configuration error (user-fixable)
    #[inline]
    #[must_use = "this method returns a boolean, not modifying the error"]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError { .. })
    }

    /// Returns true if the batch itself was malformed
    #[inline]
    #[must_use = "this method returns a boolean, not modifying the error"]
    pub const fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidInput { .. })
    }

    /// Returns true if edge sampling produced overlapping supervision
    ///
    /// The external training loop should abort or skip the step; the sample
    /// must never be used.
    #[inline]
    #[must_use = "this method returns a boolean, not modifying the error"]
    pub const fn is_sampling_invariant(&self) -> bool {
        matches!(self, Self::SamplingInvariant { .. })
    }

    /// Returns true if this is an I/O error
    #[inline]
    #[must_use = "this method returns a boolean, not modifying the error"]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Type alias for Result with [`TableGraphError`]
pub type Result<T> = std::result::Result<T, TableGraphError>;
