//! Run configuration for rejection evaluation sessions.
//!
//! Handles YAML loading, closed enumerations for the problem and classifier
//! architecture, and validation of the calibration parameters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Unknown problem: {0} (expected cifar10 | svhn)")]
    UnknownProblem(String),

    #[error("Classifier {0} not available (expected linear | mlp)")]
    UnknownClassifier(String),

    #[error("Unknown device: {0} (expected cpu | cuda)")]
    UnknownDevice(String),

    #[error("Percentile must lie in (0, 1), got {0}")]
    InvalidPercentile(f64),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Dataset the classifier was trained on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Problem {
    Cifar10,
    Svhn,
}

impl Problem {
    /// Number of classes the dataset defines
    #[must_use]
    pub const fn n_classes(self) -> usize {
        match self {
            Self::Cifar10 | Self::Svhn => 10,
        }
    }

    /// Lowercase identifier used in file names
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cifar10 => "cifar10",
            Self::Svhn => "svhn",
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Problem {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cifar10" | "cifar-10" => Ok(Self::Cifar10),
            "svhn" => Ok(Self::Svhn),
            _ => Err(ConfigError::UnknownProblem(s.to_string())),
        }
    }
}

/// Classifier backbone wrapped by the discriminator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierKind {
    /// Single affine layer producing one score per class
    Linear,
    /// One hidden ReLU layer followed by an affine output layer
    Mlp,
}

impl ClassifierKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Mlp => "mlp",
        }
    }
}

impl fmt::Display for ClassifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClassifierKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "mlp" => Ok(Self::Mlp),
            _ => Err(ConfigError::UnknownClassifier(s.to_string())),
        }
    }
}

/// Where numeric batch operations should run
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda => f.write_str("cuda"),
        }
    }
}

impl std::str::FromStr for Device {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            _ => Err(ConfigError::UnknownDevice(s.to_string())),
        }
    }
}

/// Adversarial attack selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AttackConfig {
    /// Single signed-gradient step
    Fgsm {
        #[serde(default = "default_epsilon")]
        epsilon: f32,
    },
    /// Iterative minimal perturbation towards the nearest decision boundary
    DeepFool {
        #[serde(default = "default_max_iter")]
        max_iter: usize,
        #[serde(default = "default_overshoot")]
        overshoot: f32,
    },
    /// Seeded uniform sign noise, non-adaptive baseline
    RandomNoise {
        #[serde(default = "default_epsilon")]
        epsilon: f32,
    },
}

const fn default_epsilon() -> f32 {
    8.0 / 255.0
}
const fn default_max_iter() -> usize {
    100
}
const fn default_overshoot() -> f32 {
    0.02
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self::DeepFool {
            max_iter: default_max_iter(),
            overshoot: default_overshoot(),
        }
    }
}

impl AttackConfig {
    /// Short attack identifier for reports
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Fgsm { .. } => "fgsm",
            Self::DeepFool { .. } => "deepfool",
            Self::RandomNoise { .. } => "random_noise",
        }
    }
}

impl std::str::FromStr for AttackConfig {
    type Err = ConfigError;

    /// Parse an attack name with default hyperparameters
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fgsm" => Ok(Self::Fgsm {
                epsilon: default_epsilon(),
            }),
            "deepfool" | "deep_fool" => Ok(Self::default()),
            "random_noise" | "noise" => Ok(Self::RandomNoise {
                epsilon: default_epsilon(),
            }),
            _ => Err(ConfigError::InvalidValue {
                field: "attack",
                reason: format!("unknown attack {s} (expected fgsm | deepfool | random_noise)"),
            }),
        }
    }
}

/// Configuration of one evaluation session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Dataset the model was trained on
    pub problem: Problem,
    /// Number of classes scored by the model. Defaults to the problem's class
    /// count; the loaded model must produce exactly this many scores.
    pub n_classes: usize,
    /// Classifier backbone to load
    pub classifier: ClassifierKind,
    /// Percentile used for the corruption pipeline threshold
    pub percentile: f64,
    /// The two percentiles compared by the adversarial pipeline
    pub adversarial_percentiles: [f64; 2],
    /// Evaluation minibatch size
    pub batch_size: usize,
    /// Device selector
    pub device: Device,
    /// Random seed for reproducibility
    pub seed: u64,
    /// Directory holding model checkpoints
    pub log_dir: PathBuf,
    /// Directory holding clean train/test splits
    pub data_dir: PathBuf,
    /// Directory holding corruption datasets
    pub corruption_dir: PathBuf,
    /// Samples per severity slice
    pub severity_size: usize,
    /// Number of severity levels per corruption
    pub n_severities: usize,
    /// Stop the adversarial pipeline after this many batches
    pub max_batches: Option<usize>,
    /// Stop the corruption pipeline after this many corruption types
    pub max_corruption_types: Option<usize>,
    /// Attack used by the adversarial pipeline
    pub attack: AttackConfig,
    /// Valid input range, attacks clip to it
    pub clip_range: (f32, f32),
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            problem: Problem::Cifar10,
            n_classes: 10,
            classifier: ClassifierKind::Linear,
            percentile: 0.01,
            adversarial_percentiles: [0.01, 0.02],
            batch_size: 200,
            device: Device::Cpu,
            seed: 1234,
            log_dir: PathBuf::from("./logs"),
            data_dir: PathBuf::from("data"),
            corruption_dir: PathBuf::from("data/CIFAR-10-C"),
            severity_size: 10_000,
            n_severities: 5,
            max_batches: None,
            max_corruption_types: None,
            attack: AttackConfig::default(),
            clip_range: (0.0, 1.0),
        }
    }
}

impl RunConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load configuration from a YAML string
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Check every field is usable before any data is touched
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_percentile(self.percentile)?;
        for p in self.adversarial_percentiles {
            validate_percentile(p)?;
        }
        if self.n_classes == 0 {
            return Err(invalid("n_classes", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1"));
        }
        if self.severity_size == 0 {
            return Err(invalid("severity_size", "must be at least 1"));
        }
        if self.n_severities == 0 {
            return Err(invalid("n_severities", "must be at least 1"));
        }
        if self.max_batches == Some(0) {
            return Err(invalid("max_batches", "must be at least 1 when set"));
        }
        if self.max_corruption_types == Some(0) {
            return Err(invalid("max_corruption_types", "must be at least 1 when set"));
        }
        if self.clip_range.0.partial_cmp(&self.clip_range.1) != Some(std::cmp::Ordering::Less) {
            return Err(invalid(
                "clip_range",
                format!("lower bound must be below upper bound, got {:?}", self.clip_range),
            ));
        }
        Ok(())
    }

    /// File name of the discriminator checkpoint for this run
    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        self.log_dir
            .join(format!("SDIM_{}_{}.json", self.classifier, self.problem))
    }
}

/// Validate a percentile fraction lies strictly inside (0, 1)
///
/// # Errors
///
/// Returns `ConfigError::InvalidPercentile` otherwise.
pub fn validate_percentile(p: f64) -> Result<(), ConfigError> {
    if p > 0.0 && p < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidPercentile(p))
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}
