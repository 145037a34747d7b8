//! Error types shared by calibration, decision and the evaluation pipelines.

use crate::config::ConfigError;
use crate::dataset::DatasetError;
use crate::model::ModelError;
use thiserror::Error;

/// Result type for evaluation operations
pub type EvalResult<T> = Result<T, EvalError>;

/// Errors that abort an evaluation run
#[derive(Debug, Error)]
pub enum EvalError {
    /// Unknown problem or classifier, or an invalid setting
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A score or threshold vector has the wrong length
    #[error("shape mismatch in {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("dataset error: {0}")]
    Dataset(#[from] DatasetError),

    /// The attack oracle failed or broke its output contract
    #[error("attack {attack} failed: {reason}")]
    Attack { attack: String, reason: String },

    /// Stopped between batches by a cancellation request
    #[error("evaluation cancelled")]
    Cancelled,
}

impl EvalError {
    pub(crate) const fn shape(what: &'static str, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            what,
            expected,
            actual,
        }
    }
}

/// Check every score vector has one entry per class and the batch is complete
///
/// # Errors
///
/// Returns `EvalError::ShapeMismatch` on the first violation.
pub fn check_scores(scores: &[Vec<f32>], batch_len: usize, n_classes: usize) -> EvalResult<()> {
    if scores.len() != batch_len {
        return Err(EvalError::shape("score batch", batch_len, scores.len()));
    }
    if let Some(bad) = scores.iter().find(|s| s.len() != n_classes) {
        return Err(EvalError::shape("score vector", n_classes, bad.len()));
    }
    Ok(())
}
