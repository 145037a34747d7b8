//! Corruption rejection evaluation.
//!
//! Pre-corrupted inputs are scored and passed through the same threshold
//! vector calibrated once on clean data. Each corruption contributes one
//! result per severity slice.

use crate::calibrate::Thresholds;
use crate::cancel::CancellationToken;
use crate::config::ConfigError;
use crate::dataset::{Corruption, Dataset, DatasetError};
use crate::decision::decide;
use crate::error::{check_scores, EvalError, EvalResult};
use crate::metrics::RejectionCounts;
use crate::model::ScoreModel;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorruptionOptions {
    pub batch_size: usize,
    /// Samples per severity slice
    pub severity_size: usize,
    pub n_severities: usize,
    /// Stop after this many corruption types, `None` for all
    pub max_corruption_types: Option<usize>,
}

impl Default for CorruptionOptions {
    fn default() -> Self {
        Self {
            batch_size: 200,
            severity_size: 10_000,
            n_severities: 5,
            max_corruption_types: None,
        }
    }
}

/// Counts for one corruption at one severity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeverityResult {
    pub corruption: String,
    /// 1-based severity level
    pub severity: usize,
    pub counts: RejectionCounts,
}

/// Threshold-based rejection over corrupted test sets
pub struct CorruptionPipeline<'a, M: ScoreModel + ?Sized> {
    model: &'a M,
    thresholds: &'a Thresholds,
    options: CorruptionOptions,
}

impl<'a, M: ScoreModel + ?Sized> CorruptionPipeline<'a, M> {
    /// # Errors
    ///
    /// Returns an error if the threshold vector does not match the model's
    /// class count or the batch size is zero.
    pub fn new(
        model: &'a M,
        thresholds: &'a Thresholds,
        options: CorruptionOptions,
    ) -> EvalResult<Self> {
        thresholds.expect_classes(model.n_classes())?;
        if options.batch_size == 0 {
            return Err(EvalError::Config(ConfigError::InvalidValue {
                field: "batch_size",
                reason: "must be at least 1".into(),
            }));
        }
        Ok(Self {
            model,
            thresholds,
            options,
        })
    }

    /// Accumulate decisions over one slice, batch by batch
    ///
    /// # Errors
    ///
    /// Returns an error if scoring fails, shapes disagree, or cancellation is
    /// requested between batches.
    pub fn evaluate_slice(
        &self,
        data: &Dataset,
        cancel: &CancellationToken,
    ) -> EvalResult<RejectionCounts> {
        let n_classes = self.model.n_classes();
        data.batches(self.options.batch_size)
            .try_fold(RejectionCounts::new(), |counts, batch| -> EvalResult<RejectionCounts> {
                cancel.check()?;
                let scores = self.model.score(batch.inputs)?;
                check_scores(&scores, batch.len(), n_classes)?;
                let partition = decide(&scores, self.thresholds, batch.labels)?;
                Ok(counts.absorb(partition.counts()))
            })
    }

    /// Evaluate every severity of one corruption
    ///
    /// # Errors
    ///
    /// Returns the first slice error.
    pub fn evaluate_corruption(
        &self,
        corruption: &Corruption,
        cancel: &CancellationToken,
    ) -> EvalResult<Vec<SeverityResult>> {
        let mut results = Vec::with_capacity(self.options.n_severities);
        for severity in 0..self.options.n_severities {
            let slice = corruption.severity_slice(severity, self.options.severity_size);
            if slice.len() < self.options.severity_size {
                warn!(
                    corruption = %corruption.name,
                    severity = severity + 1,
                    available = slice.len(),
                    expected = self.options.severity_size,
                    "Short severity slice"
                );
            }
            let counts = self.evaluate_slice(&slice, cancel)?;
            info!(
                corruption = %corruption.name,
                severity = severity + 1,
                acc = %counts.accuracy(),
                false_rate = %counts.false_rate(),
                reject_rate = %counts.reject_rate(),
                acc_remain = %counts.accuracy_remaining(),
                "Severity evaluated"
            );
            results.push(SeverityResult {
                corruption: corruption.name.clone(),
                severity: severity + 1,
                counts,
            });
        }
        Ok(results)
    }

    /// Evaluate corruptions in order until exhausted or the type limit is hit
    ///
    /// # Errors
    ///
    /// Returns the first load or evaluation error, or `EvalError::Cancelled`.
    pub fn run<I>(
        &self,
        corruptions: I,
        cancel: &CancellationToken,
    ) -> EvalResult<Vec<SeverityResult>>
    where
        I: IntoIterator<Item = Result<Corruption, DatasetError>>,
    {
        let limit = self.options.max_corruption_types.unwrap_or(usize::MAX);
        let mut results = Vec::new();
        for corruption in corruptions.into_iter().take(limit) {
            cancel.check()?;
            let corruption = corruption?;
            results.extend(self.evaluate_corruption(&corruption, cancel)?);
        }
        Ok(results)
    }
}
