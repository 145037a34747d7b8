//! Evaluation session.
//!
//! A session validates the run configuration, loads the discriminator and the
//! clean training split, calibrates thresholds from that split, and then
//! drives one of the evaluation pipelines. Thresholds are recomputed for every
//! session and never written to disk.

use crate::adversarial::{AdversarialOptions, AdversarialPipeline};
use crate::attack::{Attack, ClipRange};
use crate::calibrate::{ThresholdCalibrator, Thresholds};
use crate::cancel::CancellationToken;
use crate::config::{Device, RunConfig};
use crate::corruption::{CorruptionOptions, CorruptionPipeline};
use crate::dataset::{CorruptionSource, Dataset, Split};
use crate::error::{EvalError, EvalResult};
use crate::model::{Classifier, ScoreModel};
use crate::report::{AdversarialReport, CorruptionReport, ReportMetadata, ThresholdReport};
use tracing::{info, warn};

/// Loaded model and calibration data for one run configuration
pub struct EvalSession {
    config: RunConfig,
    model: Classifier,
    train: Dataset,
    cancel: CancellationToken,
}

impl EvalSession {
    /// Load the checkpoint and training split named by the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the checkpoint or
    /// training data cannot be loaded.
    pub fn open(config: RunConfig, cancel: CancellationToken) -> EvalResult<Self> {
        config.validate()?;
        let checkpoint = config.checkpoint_path();
        info!(path = %checkpoint.display(), classifier = %config.classifier, "Loading checkpoint");
        let model = Classifier::load(config.classifier, &checkpoint)?;
        let train = Dataset::load_split(&config.data_dir, config.problem, Split::Train)?;
        Self::from_parts(config, model, train, cancel)
    }

    /// Assemble a session from an already loaded model and calibration set
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the model's class
    /// count differs from the configured one.
    pub fn from_parts(
        config: RunConfig,
        model: Classifier,
        train: Dataset,
        cancel: CancellationToken,
    ) -> EvalResult<Self> {
        config.validate()?;
        if model.n_classes() != config.n_classes {
            return Err(EvalError::ShapeMismatch {
                what: "classifier output",
                expected: config.n_classes,
                actual: model.n_classes(),
            });
        }
        if config.device == Device::Cuda {
            warn!("CUDA requested but scoring runs on the CPU");
        }
        info!(
            problem = %config.problem,
            classifier = %model.kind(),
            parameters = model.parameter_count(),
            train_samples = train.len(),
            "Session ready"
        );
        Ok(Self {
            config,
            model,
            train,
            cancel,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &RunConfig {
        &self.config
    }

    #[must_use]
    pub const fn model(&self) -> &Classifier {
        &self.model
    }

    /// Calibrate one threshold vector per percentile on the training split
    ///
    /// # Errors
    ///
    /// Returns an error if a percentile is invalid, scoring fails, or the run
    /// is cancelled.
    pub fn calibrate(&self, percentiles: &[f64]) -> EvalResult<Vec<Thresholds>> {
        let calibrator = ThresholdCalibrator::new(percentiles, self.config.batch_size)?;
        calibrator.calibrate(&self.model, &self.train, &self.cancel)
    }

    /// Thresholds at the corruption percentile and both adversarial percentiles
    ///
    /// # Errors
    ///
    /// Returns an error if calibration fails.
    pub fn thresholds(&self) -> EvalResult<ThresholdReport> {
        let mut percentiles = vec![self.config.percentile];
        for p in self.config.adversarial_percentiles {
            if !percentiles.contains(&p) {
                percentiles.push(p);
            }
        }
        let thresholds = self.calibrate(&percentiles)?;
        Ok(ThresholdReport::new(
            ReportMetadata::new("Rejection Thresholds", &self.config),
            thresholds,
        ))
    }

    /// Attack the configured test split and measure rejection
    ///
    /// # Errors
    ///
    /// Returns an error if the test split cannot be loaded or evaluation fails.
    pub fn adversarial(&self) -> EvalResult<AdversarialReport> {
        let test = Dataset::load_split(&self.config.data_dir, self.config.problem, Split::Test)?;
        self.adversarial_on(&test)
    }

    /// Attack the given test set and measure rejection
    ///
    /// # Errors
    ///
    /// Returns an error if calibration or the adversarial pipeline fails.
    pub fn adversarial_on(&self, test: &Dataset) -> EvalResult<AdversarialReport> {
        let calibrated = self.calibrate(&self.config.adversarial_percentiles)?;
        let n = calibrated.len();
        let thresholds: [Thresholds; 2] = calibrated
            .try_into()
            .map_err(|_| EvalError::ShapeMismatch {
                what: "adversarial threshold vectors",
                expected: 2,
                actual: n,
            })?;

        let (clip_min, clip_max) = self.config.clip_range;
        let attack = Attack::from_config(
            &self.config.attack,
            ClipRange::new(clip_min, clip_max),
            self.config.seed,
        );
        let options = AdversarialOptions {
            batch_size: self.config.batch_size,
            max_batches: self.config.max_batches,
        };
        let mut pipeline = AdversarialPipeline::new(&self.model, attack, thresholds, options)?;
        let outcome = pipeline.run(test, &self.cancel)?;

        Ok(AdversarialReport::from_outcome(
            ReportMetadata::new("Adversarial Rejection", &self.config),
            &outcome,
        ))
    }

    /// Evaluate every corruption found in the configured directory
    ///
    /// # Errors
    ///
    /// Returns an error if no corruptions are found or evaluation fails.
    pub fn corruption(&self) -> EvalResult<CorruptionReport> {
        let source = CorruptionSource::discover(&self.config.corruption_dir)?;
        self.corruption_on(&source)
    }

    /// Evaluate the corruptions of `source` with one globally calibrated
    /// threshold vector
    ///
    /// # Errors
    ///
    /// Returns an error if calibration or the corruption pipeline fails.
    pub fn corruption_on(&self, source: &CorruptionSource) -> EvalResult<CorruptionReport> {
        let calibrated = self.calibrate(&[self.config.percentile])?;
        let thresholds = calibrated.first().ok_or(EvalError::ShapeMismatch {
            what: "corruption threshold vectors",
            expected: 1,
            actual: 0,
        })?;
        info!(corruptions = source.len(), "Evaluating corruptions");

        let options = CorruptionOptions {
            batch_size: self.config.batch_size,
            severity_size: self.config.severity_size,
            n_severities: self.config.n_severities,
            max_corruption_types: self.config.max_corruption_types,
        };
        let pipeline = CorruptionPipeline::new(&self.model, thresholds, options)?;
        let results = pipeline.run(source.iter()?, &self.cancel)?;

        Ok(CorruptionReport::from_results(
            ReportMetadata::new("Corruption Rejection", &self.config),
            self.config.percentile,
            &results,
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::ClassifierKind;
    use crate::model::{Checkpoint, DenseLayer, LinearScorer};

    fn identity_classifier(n: usize) -> Classifier {
        let weights = (0..n)
            .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
            .collect();
        Classifier::Linear(LinearScorer::new(
            DenseLayer::new(weights, vec![0.0; n]).unwrap(),
        ))
    }

    /// One-hot style samples for every class with varying confidence
    fn train_set() -> Dataset {
        let mut inputs = Vec::new();
        let mut labels = Vec::new();
        for class in 0..10 {
            for step in 1..=10 {
                let mut x = vec![0.0; 10];
                x[class] = step as f32 / 10.0;
                inputs.push(x);
                labels.push(class);
            }
        }
        Dataset::new(inputs, labels).unwrap()
    }

    #[test]
    fn test_from_parts_checks_class_count() {
        let result = EvalSession::from_parts(
            RunConfig::default(),
            identity_classifier(3),
            train_set(),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(EvalError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_custom_class_count_drives_calibration() {
        let config = RunConfig {
            n_classes: 3,
            percentile: 0.1,
            ..RunConfig::default()
        };
        let train = Dataset::new(
            vec![
                vec![0.9, 0.0, 0.0],
                vec![0.5, 0.0, 0.0],
                vec![0.0, 0.8, 0.0],
                vec![0.0, 0.0, 0.7],
            ],
            vec![0, 0, 1, 2],
        )
        .unwrap();
        let session = EvalSession::from_parts(
            config,
            identity_classifier(3),
            train,
            CancellationToken::new(),
        )
        .unwrap();
        let thresholds = session.calibrate(&[0.1]).unwrap();
        assert_eq!(thresholds[0].len(), 3);
        assert!((thresholds[0].get(0).unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_from_parts_rejects_invalid_config() {
        let config = RunConfig {
            percentile: 1.5,
            ..RunConfig::default()
        };
        let result = EvalSession::from_parts(
            config,
            identity_classifier(10),
            train_set(),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(EvalError::Config(_))));
    }

    #[test]
    fn test_thresholds_report() {
        let config = RunConfig {
            percentile: 0.1,
            adversarial_percentiles: [0.1, 0.2],
            ..RunConfig::default()
        };
        let session = EvalSession::from_parts(
            config,
            identity_classifier(10),
            train_set(),
            CancellationToken::new(),
        )
        .unwrap();
        let report = session.thresholds().unwrap();
        // duplicate percentile calibrated once
        assert_eq!(report.thresholds.len(), 2);
        for t in &report.thresholds {
            assert_eq!(t.len(), 10);
        }
        // floor(0.1 * 10) = 1 -> second smallest, 0.2
        assert!((report.thresholds[0].get(0).unwrap() - 0.2).abs() < 1e-6);
        assert!((report.thresholds[1].get(0).unwrap() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_open_loads_checkpoint_and_split() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            log_dir: dir.path().join("logs"),
            data_dir: dir.path().join("data"),
            ..RunConfig::default()
        };
        std::fs::create_dir_all(&config.log_dir).unwrap();
        std::fs::create_dir_all(config.data_dir.join("cifar10")).unwrap();
        let weights = (0..10)
            .map(|i| (0..10).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
            .collect();
        Checkpoint {
            classifier: ClassifierKind::Linear,
            layers: vec![DenseLayer::new(weights, vec![0.0; 10]).unwrap()],
        }
        .save(config.checkpoint_path())
        .unwrap();
        train_set()
            .save(config.data_dir.join("cifar10").join("train.json"))
            .unwrap();

        let session = EvalSession::open(config, CancellationToken::new()).unwrap();
        assert_eq!(session.model().kind(), ClassifierKind::Linear);
        assert_eq!(session.model().n_classes(), 10);
    }

    #[test]
    fn test_open_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            log_dir: dir.path().to_path_buf(),
            ..RunConfig::default()
        };
        let result = EvalSession::open(config, CancellationToken::new());
        assert!(matches!(result, Err(EvalError::Model(_))));
    }

    #[test]
    fn test_cancelled_session_stops_calibration() {
        let cancel = CancellationToken::new();
        let session = EvalSession::from_parts(
            RunConfig::default(),
            identity_classifier(10),
            train_set(),
            cancel.clone(),
        )
        .unwrap();
        cancel.cancel();
        assert!(matches!(session.thresholds(), Err(EvalError::Cancelled)));
    }
}
