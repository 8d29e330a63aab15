//! Error types for the feature engine.
//!
//! Chain construction and evaluation report [`ChainError`], image decoding reports
//! [`ImageDecodeError`] and batch evaluation reports [`PipelineError`]. Job-level
//! outcomes (trainer failure, cancellation) are never errors; they surface as a
//! [`JobState`](crate::classifier_job::JobState).

use crate::core_modules::feature_map::feature_map::{Reduction, Size};
use crate::core_modules::image_repository::ImageId;
use thiserror::Error;

/// Failures building or applying a transform chain.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    /// An operator would drive the chain's output below 1x1. Recoverable: try
    /// different operator choices.
    #[error("chain too small: base {base} cannot absorb reduction {reduction:?} at operator {step}")]
    ChainTooSmall {
        /// The chain's declared base size.
        base: Size,
        /// Index of the operator that broke the size invariant.
        step: usize,
        /// Cumulative reduction including that operator.
        reduction: Reduction,
    },

    /// Extraction found no usable patch. Recoverable, but no chain is produced.
    #[error("no usable patch after {attempts} extraction attempt(s)")]
    DegenerateExtract {
        /// How many attempts were made before giving up.
        attempts: usize,
    },

    /// A feature map of the wrong size was handed to a chain. This is a caller bug.
    #[error("size mismatch: chain expects {expected}, got {actual}")]
    SizeMismatch { expected: Size, actual: Size },
}

/// Failure to turn an image reference into a feature map.
#[derive(Error, Debug)]
pub enum ImageDecodeError {
    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported source: {message}")]
    Unsupported { message: String },
}

/// Failures that abort a whole evaluation batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// The image needed by this batch has no decoded base map at the given size.
    #[error("image {image_id} has no decoded base map at {size}")]
    ImageDecode { image_id: ImageId, size: Size },

    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Another unit of the same batch failed first.
    #[error("batch aborted")]
    BatchAborted,

    #[error("worker pool unavailable")]
    WorkerUnavailable,

    #[error("worker task failed: {0}")]
    TaskFailed(String),
}
