//! Adversarial rejection evaluation.
//!
//! Every batch moves through four stages: the clean model pass keeps the
//! samples it classifies correctly, the attack oracle perturbs only those,
//! the model scores the perturbed inputs, and the batch outcome is folded
//! into the run's counters. Rejections are counted among successful attacks
//! only, once per threshold vector.

use crate::attack::{check_attack_output, AttackOracle};
use crate::calibrate::Thresholds;
use crate::cancel::CancellationToken;
use crate::config::ConfigError;
use crate::dataset::{Batch, Dataset};
use crate::decision::{is_rejected, predict};
use crate::error::{check_scores, EvalError, EvalResult};
use crate::metrics::AdversarialCounts;
use crate::model::{argmax, GradientModel};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// Stage of one batch's evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CleanEval,
    AttackGenerate,
    AdvEval,
    Aggregate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CleanEval => "clean_eval",
            Self::AttackGenerate => "attack_generate",
            Self::AdvEval => "adv_eval",
            Self::Aggregate => "aggregate",
        };
        f.write_str(name)
    }
}

/// Batching options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdversarialOptions {
    pub batch_size: usize,
    /// Stop after this many batches, `None` for the whole test set
    pub max_batches: Option<usize>,
}

impl Default for AdversarialOptions {
    fn default() -> Self {
        Self {
            batch_size: 200,
            max_batches: None,
        }
    }
}

/// Final counts of one adversarial pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdversarialOutcome {
    pub attack: String,
    /// Percentile behind each threshold vector
    pub percentiles: [f64; 2],
    pub counts: AdversarialCounts,
    pub batches: usize,
}

/// Attack-then-reject evaluation over a test set
pub struct AdversarialPipeline<'a, M: GradientModel, A: AttackOracle> {
    model: &'a M,
    attack: A,
    thresholds: [Thresholds; 2],
    options: AdversarialOptions,
}

impl<'a, M: GradientModel, A: AttackOracle> AdversarialPipeline<'a, M, A> {
    /// # Errors
    ///
    /// Returns `EvalError::ShapeMismatch` if a threshold vector does not have
    /// one entry per model class.
    pub fn new(
        model: &'a M,
        attack: A,
        thresholds: [Thresholds; 2],
        options: AdversarialOptions,
    ) -> EvalResult<Self> {
        for t in &thresholds {
            t.expect_classes(model.n_classes())?;
        }
        Ok(Self {
            model,
            attack,
            thresholds,
            options,
        })
    }

    /// Evaluate one batch and return its counts
    ///
    /// # Errors
    ///
    /// Returns an error if the model or attack fails, or either breaks its
    /// shape contract.
    pub fn step(&mut self, batch: Batch<'_>) -> EvalResult<AdversarialCounts> {
        let n_classes = self.model.n_classes();

        debug!(stage = %Stage::CleanEval, size = batch.len());
        let clean_scores = self.model.score(batch.inputs)?;
        check_scores(&clean_scores, batch.len(), n_classes)?;
        let correct: Vec<usize> = clean_scores
            .iter()
            .zip(batch.labels)
            .enumerate()
            .filter(|(_, (s, y))| argmax(s) == Some(**y))
            .map(|(i, _)| i)
            .collect();
        if correct.is_empty() {
            return Ok(AdversarialCounts::new());
        }

        debug!(stage = %Stage::AttackGenerate, attacked = correct.len());
        let clean_inputs: Vec<Vec<f32>> =
            correct.iter().map(|&i| batch.inputs[i].clone()).collect();
        let adversarial = self.attack.generate(self.model, &clean_inputs)?;
        check_attack_output(self.attack.name(), &clean_inputs, &adversarial)?;

        debug!(stage = %Stage::AdvEval);
        let adv_scores = self.model.score(&adversarial)?;
        check_scores(&adv_scores, adversarial.len(), n_classes)?;

        debug!(stage = %Stage::Aggregate);
        let mut counts = AdversarialCounts {
            n_eval: correct.len(),
            ..AdversarialCounts::default()
        };
        for (scores, &i) in adv_scores.iter().zip(&correct) {
            let prediction = predict(scores);
            if prediction.map(|p| p.label) == Some(batch.labels[i]) {
                continue;
            }
            counts.n_successful += 1;
            for (k, thresholds) in self.thresholds.iter().enumerate() {
                if is_rejected(prediction, thresholds.as_slice()) {
                    counts.n_rejected[k] += 1;
                }
            }
        }
        Ok(counts)
    }

    /// Run over the test set, checking for cancellation before each batch
    ///
    /// # Errors
    ///
    /// Returns `EvalError::Cancelled` if cancelled, or the first batch error.
    pub fn run(
        &mut self,
        test: &Dataset,
        cancel: &CancellationToken,
    ) -> EvalResult<AdversarialOutcome> {
        if self.options.batch_size == 0 {
            return Err(EvalError::Config(ConfigError::InvalidValue {
                field: "batch_size",
                reason: "must be at least 1".into(),
            }));
        }
        let limit = self.options.max_batches.unwrap_or(usize::MAX);
        let mut counts = AdversarialCounts::new();
        let mut batches = 0;

        for batch in test.batches(self.options.batch_size).take(limit) {
            cancel.check()?;
            counts = counts.merge(self.step(batch)?);
            batches += 1;
            debug!(
                batch = batches,
                n_eval = counts.n_eval,
                n_successful = counts.n_successful,
                "Adversarial batch done"
            );
        }

        if counts.n_successful == 0 {
            warn!(
                n_eval = counts.n_eval,
                "No successful adversarial examples, rejection rates are undefined"
            );
        }
        let [reject_1, reject_2] = counts.reject_rates();
        info!(
            attack = self.attack.name(),
            batches,
            success_rate = %counts.success_rate(),
            reject_rate_1 = %reject_1,
            reject_rate_2 = %reject_2,
            "Adversarial evaluation finished"
        );
        Ok(AdversarialOutcome {
            attack: self.attack.name().to_string(),
            percentiles: [self.thresholds[0].percentile(), self.thresholds[1].percentile()],
            counts,
            batches,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{DenseLayer, LinearScorer, ModelError};

    /// Scores equal to the input, so a test can dictate the model output
    fn identity(n: usize) -> LinearScorer {
        let weights = (0..n)
            .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
            .collect();
        LinearScorer::new(DenseLayer::new(weights, vec![0.0; n]).unwrap())
    }

    /// Replaces every input with a fixed vector
    struct Replace(Vec<f32>);

    impl AttackOracle for Replace {
        fn name(&self) -> &str {
            "replace"
        }

        fn generate(
            &mut self,
            _model: &dyn GradientModel,
            inputs: &[Vec<f32>],
        ) -> EvalResult<Vec<Vec<f32>>> {
            Ok(vec![self.0.clone(); inputs.len()])
        }
    }

    /// Returns the inputs unchanged
    struct NoOp;

    impl AttackOracle for NoOp {
        fn name(&self) -> &str {
            "noop"
        }

        fn generate(
            &mut self,
            _model: &dyn GradientModel,
            inputs: &[Vec<f32>],
        ) -> EvalResult<Vec<Vec<f32>>> {
            Ok(inputs.to_vec())
        }
    }

    /// Drops one sample, breaking the oracle contract
    struct Lossy;

    impl AttackOracle for Lossy {
        fn name(&self) -> &str {
            "lossy"
        }

        fn generate(
            &mut self,
            _model: &dyn GradientModel,
            inputs: &[Vec<f32>],
        ) -> EvalResult<Vec<Vec<f32>>> {
            Ok(inputs.iter().skip(1).cloned().collect())
        }
    }

    fn thresholds(a: f32, b: f32) -> [Thresholds; 2] {
        [
            Thresholds::new(0.01, vec![a; 2]),
            Thresholds::new(0.02, vec![b; 2]),
        ]
    }

    fn dataset() -> Dataset {
        // the last sample is misclassified on clean data and never attacked
        Dataset::new(
            vec![
                vec![0.9, 0.1],
                vec![0.8, 0.2],
                vec![0.2, 0.7],
                vec![0.6, 0.4],
            ],
            vec![0, 0, 1, 1],
        )
        .unwrap()
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::CleanEval.to_string(), "clean_eval");
        assert_eq!(Stage::Aggregate.to_string(), "aggregate");
    }

    #[test]
    fn test_successful_attacks_rejected_per_threshold() {
        let model = identity(2);
        // every attacked sample lands on class 1 with a weak score
        let attack = Replace(vec![0.1, 0.4]);
        let mut pipeline = AdversarialPipeline::new(
            &model,
            attack,
            thresholds(0.3, 0.5),
            AdversarialOptions::default(),
        )
        .unwrap();
        let outcome = pipeline.run(&dataset(), &CancellationToken::new()).unwrap();

        // three clean-correct samples, two of them (label 0) flipped to 1
        assert_eq!(outcome.counts.n_eval, 3);
        assert_eq!(outcome.counts.n_successful, 2);
        assert_eq!(outcome.counts.n_rejected, [0, 2]);
        assert_eq!(outcome.percentiles, [0.01, 0.02]);
        assert_eq!(outcome.attack, "replace");
    }

    #[test]
    fn test_no_successful_attack_leaves_reject_rate_undefined() {
        let model = identity(2);
        let mut pipeline = AdversarialPipeline::new(
            &model,
            NoOp,
            thresholds(0.3, 0.5),
            AdversarialOptions::default(),
        )
        .unwrap();
        let outcome = pipeline.run(&dataset(), &CancellationToken::new()).unwrap();

        assert_eq!(outcome.counts.n_successful, 0);
        assert_eq!(outcome.counts.success_rate().value(), Some(0.0));
        assert!(outcome.counts.reject_rates().iter().all(|r| r.value().is_none()));
    }

    #[test]
    fn test_max_batches_truncates() {
        let model = identity(2);
        let mut pipeline = AdversarialPipeline::new(
            &model,
            Replace(vec![0.1, 0.4]),
            thresholds(0.3, 0.5),
            AdversarialOptions {
                batch_size: 2,
                max_batches: Some(1),
            },
        )
        .unwrap();
        let outcome = pipeline.run(&dataset(), &CancellationToken::new()).unwrap();
        assert_eq!(outcome.batches, 1);
        assert_eq!(outcome.counts.n_eval, 2);
    }

    #[test]
    fn test_attack_contract_violation_fails() {
        let model = identity(2);
        let mut pipeline = AdversarialPipeline::new(
            &model,
            Lossy,
            thresholds(0.3, 0.5),
            AdversarialOptions::default(),
        )
        .unwrap();
        let err = pipeline
            .run(&dataset(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, EvalError::Attack { .. }));
    }

    #[test]
    fn test_cancelled_before_first_batch() {
        let model = identity(2);
        let mut pipeline = AdversarialPipeline::new(
            &model,
            NoOp,
            thresholds(0.3, 0.5),
            AdversarialOptions::default(),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            pipeline.run(&dataset(), &cancel),
            Err(EvalError::Cancelled)
        ));
    }

    #[test]
    fn test_threshold_length_checked() {
        let model = identity(3);
        let result = AdversarialPipeline::new(
            &model,
            NoOp,
            thresholds(0.3, 0.5),
            AdversarialOptions::default(),
        );
        assert!(matches!(result, Err(EvalError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_model_error_propagates() {
        let model = identity(2);
        let mut pipeline = AdversarialPipeline::new(
            &model,
            NoOp,
            thresholds(0.3, 0.5),
            AdversarialOptions::default(),
        )
        .unwrap();
        let bad = Dataset::new(vec![vec![0.5, 0.5, 0.5]], vec![0]).unwrap();
        let err = pipeline.run(&bad, &CancellationToken::new()).unwrap_err();
        assert!(matches!(
            err,
            EvalError::Model(ModelError::InputShape { .. })
        ));
    }
}
