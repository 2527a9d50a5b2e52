use thiserror::Error;

use crate::model::ModelError;
use crate::payload::PayloadError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("compressed tokens have hidden size {actual}, model expects {expected}")]
    HiddenSizeMismatch { expected: usize, actual: usize },

    #[error("invalid submission: {reason}")]
    InvalidSubmission { reason: String },

    #[error("invalid labels: {reason}")]
    InvalidLabels { reason: String },

    #[error("no scoring criteria were provided")]
    NoCriteria,

    #[error("no target tokens to score")]
    NoTargetTokens,

    #[error("loss is not finite: {value}")]
    NonFiniteLoss { value: f64 },
}
