//! Per-class rejection thresholds from clean in-distribution data.
//!
//! For each class the calibrator keeps only the clean samples the model
//! classifies correctly, collects the score it assigned to that class, and
//! picks a low percentile of those scores as the acceptance threshold.
//! Several percentiles can be read from the same collection without
//! re-running the model.

use crate::cancel::CancellationToken;
use crate::config::{validate_percentile, ConfigError};
use crate::dataset::Dataset;
use crate::error::{check_scores, EvalError, EvalResult};
use crate::model::{argmax, ScoreModel};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One acceptance threshold per class, computed at a single percentile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    percentile: f64,
    values: Vec<f32>,
}

impl Thresholds {
    #[must_use]
    pub const fn new(percentile: f64, values: Vec<f32>) -> Self {
        Self { percentile, values }
    }

    /// Percentile the thresholds were drawn at
    #[must_use]
    pub const fn percentile(&self) -> f64 {
        self.percentile
    }

    #[must_use]
    pub fn get(&self, class: usize) -> Option<f32> {
        self.values.get(class).copied()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fail unless there is exactly one threshold per class
    ///
    /// # Errors
    ///
    /// Returns `EvalError::ShapeMismatch` on a length mismatch.
    pub fn expect_classes(&self, n_classes: usize) -> EvalResult<()> {
        if self.values.len() == n_classes {
            Ok(())
        } else {
            Err(EvalError::shape("threshold vector", n_classes, self.values.len()))
        }
    }
}

/// Scores a model assigned to the correctly classified clean samples of one
/// class, sorted ascending
#[derive(Debug, Clone, PartialEq)]
pub struct ClassScores {
    label: usize,
    sorted: Vec<f32>,
}

impl ClassScores {
    #[must_use]
    pub fn new(label: usize, mut scores: Vec<f32>) -> Self {
        scores.sort_by(f32::total_cmp);
        Self {
            label,
            sorted: scores,
        }
    }

    #[must_use]
    pub const fn label(&self) -> usize {
        self.label
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// `floor(percentile * len)` clamped to the last index, `None` when empty
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn percentile_index(&self, percentile: f64) -> Option<usize> {
        let last = self.sorted.len().checked_sub(1)?;
        let k = (percentile.max(0.0) * self.sorted.len() as f64).floor() as usize;
        Some(k.min(last))
    }

    /// Score at the percentile index.
    ///
    /// An empty collection yields negative infinity, which accepts every
    /// prediction of the class.
    #[must_use]
    pub fn threshold(&self, percentile: f64) -> f32 {
        self.percentile_index(percentile)
            .map_or(f32::NEG_INFINITY, |k| self.sorted[k])
    }
}

/// Computes threshold vectors from clean labeled data
#[derive(Debug, Clone)]
pub struct ThresholdCalibrator {
    percentiles: Vec<f64>,
    batch_size: usize,
}

impl ThresholdCalibrator {
    /// Create a calibrator drawing one threshold vector per percentile
    ///
    /// # Errors
    ///
    /// Returns an error if no percentile is given, any lies outside (0, 1),
    /// or the batch size is zero.
    pub fn new(percentiles: &[f64], batch_size: usize) -> Result<Self, ConfigError> {
        if percentiles.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "percentiles",
                reason: "at least one percentile is required".into(),
            });
        }
        for &p in percentiles {
            validate_percentile(p)?;
        }
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_size",
                reason: "must be at least 1".into(),
            });
        }
        Ok(Self {
            percentiles: percentiles.to_vec(),
            batch_size,
        })
    }

    #[must_use]
    pub fn percentiles(&self) -> &[f64] {
        &self.percentiles
    }

    /// Run the model over the clean samples of `label` and keep the score at
    /// `label` for every sample it classifies correctly
    ///
    /// # Errors
    ///
    /// Returns an error if scoring fails, a score vector has the wrong
    /// length, or cancellation is requested between batches.
    pub fn collect_class_scores<M: ScoreModel + ?Sized>(
        &self,
        model: &M,
        clean: &Dataset,
        label: usize,
        cancel: &CancellationToken,
    ) -> EvalResult<ClassScores> {
        let n_classes = model.n_classes();
        let class_data = clean.filter_label(label);
        let mut scores = Vec::with_capacity(class_data.len());

        for batch in class_data.batches(self.batch_size) {
            cancel.check()?;
            let batch_scores = model.score(batch.inputs)?;
            check_scores(&batch_scores, batch.len(), n_classes)?;

            scores.extend(
                batch_scores
                    .iter()
                    .filter(|s| argmax(s) == Some(label))
                    .map(|s| s[label]),
            );
        }

        debug!(
            label,
            samples = class_data.len(),
            correct = scores.len(),
            "Collected clean scores"
        );
        Ok(ClassScores::new(label, scores))
    }

    /// Compute one threshold vector per configured percentile
    ///
    /// # Errors
    ///
    /// Returns an error if any class fails to score.
    pub fn calibrate<M: ScoreModel + ?Sized>(
        &self,
        model: &M,
        clean: &Dataset,
        cancel: &CancellationToken,
    ) -> EvalResult<Vec<Thresholds>> {
        let class_scores = (0..model.n_classes())
            .map(|label| self.collect_class_scores(model, clean, label, cancel))
            .collect::<EvalResult<Vec<_>>>()?;
        Ok(self.thresholds_from_scores(&class_scores))
    }

    /// Draw every configured percentile from already collected class scores
    #[must_use]
    pub fn thresholds_from_scores(&self, class_scores: &[ClassScores]) -> Vec<Thresholds> {
        for scores in class_scores {
            if scores.is_empty() {
                warn!(
                    label = scores.label(),
                    "No correctly classified clean samples, class threshold is -inf"
                );
            }
            let picked: Vec<String> = self
                .percentiles
                .iter()
                .map(|&p| format!("{:.3}", scores.threshold(p)))
                .collect();
            info!(
                label = scores.label(),
                index = ?scores.percentile_index(self.percentiles[0]),
                total = scores.len(),
                thresholds = %picked.join(", "),
                "Class thresholds"
            );
        }

        self.percentiles
            .iter()
            .map(|&p| Thresholds::new(p, class_scores.iter().map(|s| s.threshold(p)).collect()))
            .collect()
    }
}
