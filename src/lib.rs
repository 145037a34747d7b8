//! # SDIM Rejection Eval
//!
//! Threshold-based rejection evaluation for score-producing discriminators.
//!
//! Per-class acceptance thresholds are calibrated from the scores a model
//! assigns to the clean training samples it classifies correctly. Those
//! thresholds are then applied to adversarially perturbed and to corrupted
//! inputs, measuring how often the model's mistakes are caught by rejection.
//!
//! ## Architecture
//!
//! ```text
//! Clean train split ──► ThresholdCalibrator ──► Thresholds (per class)
//!                                                   │
//! Test split ──► clean pass ──► AttackOracle ──► decide ──► AdversarialCounts
//!                                                   │
//! Corruptions × severities ──────────────────► decide ──► RejectionCounts
//!                                                   │
//!                                              Report (text | JSON)
//! ```
//!
//! A sample is rejected when the score at its predicted class falls strictly
//! below that class's threshold. Rates with a zero denominator are reported
//! as undefined rather than zero.

pub mod adversarial;
pub mod attack;
pub mod calibrate;
pub mod cancel;
pub mod config;
pub mod corruption;
pub mod dataset;
pub mod decision;
pub mod error;
pub mod metrics;
pub mod model;
pub mod report;
pub mod runner;

pub use adversarial::{AdversarialOptions, AdversarialOutcome, AdversarialPipeline, Stage};
pub use attack::{Attack, AttackOracle, ClipRange, DeepFool, Fgsm, RandomNoise};
pub use calibrate::{ClassScores, ThresholdCalibrator, Thresholds};
pub use cancel::CancellationToken;
pub use config::{AttackConfig, ClassifierKind, ConfigError, Device, Problem, RunConfig};
pub use corruption::{CorruptionOptions, CorruptionPipeline, SeverityResult};
pub use dataset::{Corruption, CorruptionSource, Dataset, DatasetError, Split};
pub use decision::{decide, decide_sample, DecisionCounts, Outcome, Partition, Prediction};
pub use error::{EvalError, EvalResult};
pub use metrics::{AdversarialCounts, Rate, RateWithCI, RejectionCounts};
pub use model::{
    argmax, Checkpoint, Classifier, DenseLayer, GradientModel, LinearScorer, MlpScorer,
    ModelError, ScoreModel,
};
pub use report::{AdversarialReport, CorruptionReport, ReportMetadata, ThresholdReport};
pub use runner::EvalSession;
