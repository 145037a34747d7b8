//! Score-producing discriminator models.
//!
//! The evaluation only needs a model that maps a batch of inputs to one
//! log-likelihood per class. Attacks additionally need the gradient of a
//! single class score with respect to the input. Checkpoints are plain JSON
//! weight files named `SDIM_{classifier}_{problem}.json`.

use crate::config::ClassifierKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while loading or running a model
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    #[error("Input has {actual} features, model expects {expected}")]
    InputShape { expected: usize, actual: usize },

    #[error("Class index {class} out of range for {n_classes} classes")]
    ClassOutOfRange { class: usize, n_classes: usize },

    #[error("Failed to parse checkpoint: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A model producing one score per class for each input
pub trait ScoreModel {
    /// Number of classes in every score vector
    fn n_classes(&self) -> usize;

    /// Score a batch of inputs
    ///
    /// # Errors
    ///
    /// Returns an error if any input has the wrong shape.
    fn score(&self, inputs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ModelError>;
}

/// A score model that exposes input gradients, used by gradient attacks
pub trait GradientModel: ScoreModel {
    /// Number of input features
    fn input_dim(&self) -> usize;

    /// Gradient of `score(input)[class]` with respect to `input`
    ///
    /// # Errors
    ///
    /// Returns an error on a shape mismatch or an out-of-range class.
    fn class_gradient(&self, input: &[f32], class: usize) -> Result<Vec<f32>, ModelError>;
}

/// Index of the largest score; ties resolve to the lowest index.
///
/// Returns `None` for an empty vector. NaN entries never win.
#[must_use]
pub fn argmax(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &s) in scores.iter().enumerate() {
        match best {
            Some((_, b)) if s <= b || s.is_nan() => {}
            None if s.is_nan() => {}
            _ => best = Some((i, s)),
        }
    }
    best.map(|(i, _)| i)
}

/// One affine layer `y = W x + b`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DenseLayer {
    /// Row-major weights, one row per output unit
    pub weights: Vec<Vec<f32>>,
    /// One bias per output unit
    pub bias: Vec<f32>,
}

impl DenseLayer {
    /// Create a layer, checking rows and bias agree
    ///
    /// # Errors
    ///
    /// Returns `ModelError::InvalidCheckpoint` if the shapes are inconsistent.
    pub fn new(weights: Vec<Vec<f32>>, bias: Vec<f32>) -> Result<Self, ModelError> {
        let layer = Self { weights, bias };
        layer.check()?;
        Ok(layer)
    }

    fn check(&self) -> Result<(), ModelError> {
        if self.weights.is_empty() {
            return Err(ModelError::InvalidCheckpoint("layer has no units".into()));
        }
        if self.weights.len() != self.bias.len() {
            return Err(ModelError::InvalidCheckpoint(format!(
                "{} weight rows but {} biases",
                self.weights.len(),
                self.bias.len()
            )));
        }
        let in_dim = self.weights[0].len();
        if in_dim == 0 || self.weights.iter().any(|row| row.len() != in_dim) {
            return Err(ModelError::InvalidCheckpoint(
                "weight rows must be non-empty and of equal length".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn in_dim(&self) -> usize {
        self.weights.first().map_or(0, Vec::len)
    }

    #[must_use]
    pub fn out_dim(&self) -> usize {
        self.weights.len()
    }

    fn forward(&self, input: &[f32]) -> Result<Vec<f32>, ModelError> {
        if input.len() != self.in_dim() {
            return Err(ModelError::InputShape {
                expected: self.in_dim(),
                actual: input.len(),
            });
        }
        Ok(self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>() + b)
            .collect())
    }
}

/// Linear discriminator head: scores are `W x + b`
#[derive(Debug, Clone, PartialEq)]
pub struct LinearScorer {
    layer: DenseLayer,
}

impl LinearScorer {
    #[must_use]
    pub const fn new(layer: DenseLayer) -> Self {
        Self { layer }
    }
}

impl ScoreModel for LinearScorer {
    fn n_classes(&self) -> usize {
        self.layer.out_dim()
    }

    fn score(&self, inputs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ModelError> {
        inputs.iter().map(|x| self.layer.forward(x)).collect()
    }
}

impl GradientModel for LinearScorer {
    fn input_dim(&self) -> usize {
        self.layer.in_dim()
    }

    fn class_gradient(&self, input: &[f32], class: usize) -> Result<Vec<f32>, ModelError> {
        if input.len() != self.input_dim() {
            return Err(ModelError::InputShape {
                expected: self.input_dim(),
                actual: input.len(),
            });
        }
        self.layer
            .weights
            .get(class)
            .cloned()
            .ok_or(ModelError::ClassOutOfRange {
                class,
                n_classes: self.n_classes(),
            })
    }
}

/// Two-layer perceptron: `W2 relu(W1 x + b1) + b2`
#[derive(Debug, Clone, PartialEq)]
pub struct MlpScorer {
    hidden: DenseLayer,
    output: DenseLayer,
}

impl MlpScorer {
    /// Create a perceptron, checking the layers connect
    ///
    /// # Errors
    ///
    /// Returns `ModelError::InvalidCheckpoint` if the hidden width differs
    /// from the output layer's input width.
    pub fn new(hidden: DenseLayer, output: DenseLayer) -> Result<Self, ModelError> {
        if hidden.out_dim() != output.in_dim() {
            return Err(ModelError::InvalidCheckpoint(format!(
                "hidden layer has {} units, output layer expects {}",
                hidden.out_dim(),
                output.in_dim()
            )));
        }
        Ok(Self { hidden, output })
    }

    fn activations(&self, input: &[f32]) -> Result<Vec<f32>, ModelError> {
        Ok(self
            .hidden
            .forward(input)?
            .into_iter()
            .map(|h| h.max(0.0))
            .collect())
    }
}

impl ScoreModel for MlpScorer {
    fn n_classes(&self) -> usize {
        self.output.out_dim()
    }

    fn score(&self, inputs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ModelError> {
        inputs
            .iter()
            .map(|x| self.output.forward(&self.activations(x)?))
            .collect()
    }
}

impl GradientModel for MlpScorer {
    fn input_dim(&self) -> usize {
        self.hidden.in_dim()
    }

    fn class_gradient(&self, input: &[f32], class: usize) -> Result<Vec<f32>, ModelError> {
        let out_row = self
            .output
            .weights
            .get(class)
            .ok_or(ModelError::ClassOutOfRange {
                class,
                n_classes: self.n_classes(),
            })?;
        let pre = self.hidden.forward(input)?;

        let mut grad = vec![0.0_f32; self.input_dim()];
        for ((h, w_out), w_in) in pre.iter().zip(out_row).zip(&self.hidden.weights) {
            // ReLU passes gradient only through active units
            if *h > 0.0 {
                for (g, w) in grad.iter_mut().zip(w_in) {
                    *g += w_out * w;
                }
            }
        }
        Ok(grad)
    }
}

/// Serialized discriminator weights
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// Backbone the weights belong to
    pub classifier: ClassifierKind,
    /// Layers from input to output
    pub layers: Vec<DenseLayer>,
}

impl Checkpoint {
    /// Read a checkpoint from a JSON file
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ModelError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ModelError::CheckpointNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the checkpoint as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ModelError> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}

/// Supported discriminator architectures behind one scoring contract
#[derive(Debug, Clone, PartialEq)]
pub enum Classifier {
    Linear(LinearScorer),
    Mlp(MlpScorer),
}

impl Classifier {
    /// Build the classifier a checkpoint describes, checking it is of the
    /// expected kind
    ///
    /// # Errors
    ///
    /// Returns `ModelError::InvalidCheckpoint` on a kind or layer mismatch.
    pub fn from_checkpoint(
        expected: ClassifierKind,
        checkpoint: Checkpoint,
    ) -> Result<Self, ModelError> {
        if checkpoint.classifier != expected {
            return Err(ModelError::InvalidCheckpoint(format!(
                "checkpoint holds a {} classifier, expected {expected}",
                checkpoint.classifier
            )));
        }
        for layer in &checkpoint.layers {
            layer.check()?;
        }
        let mut layers = checkpoint.layers.into_iter();
        let model = match (expected, layers.next(), layers.next(), layers.next()) {
            (ClassifierKind::Linear, Some(layer), None, None) => {
                Self::Linear(LinearScorer::new(layer))
            }
            (ClassifierKind::Mlp, Some(hidden), Some(output), None) => {
                Self::Mlp(MlpScorer::new(hidden, output)?)
            }
            _ => {
                return Err(ModelError::InvalidCheckpoint(format!(
                    "wrong number of layers for a {expected} classifier"
                )))
            }
        };
        Ok(model)
    }

    /// Load a classifier from a checkpoint file
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be read or does not match.
    pub fn load<P: AsRef<Path>>(kind: ClassifierKind, path: P) -> Result<Self, ModelError> {
        Self::from_checkpoint(kind, Checkpoint::load(path)?)
    }

    #[must_use]
    pub const fn kind(&self) -> ClassifierKind {
        match self {
            Self::Linear(_) => ClassifierKind::Linear,
            Self::Mlp(_) => ClassifierKind::Mlp,
        }
    }

    /// Number of trainable parameters
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        let count = |l: &DenseLayer| l.out_dim() * l.in_dim() + l.bias.len();
        match self {
            Self::Linear(m) => count(&m.layer),
            Self::Mlp(m) => count(&m.hidden) + count(&m.output),
        }
    }
}

impl ScoreModel for Classifier {
    fn n_classes(&self) -> usize {
        match self {
            Self::Linear(m) => m.n_classes(),
            Self::Mlp(m) => m.n_classes(),
        }
    }

    fn score(&self, inputs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ModelError> {
        match self {
            Self::Linear(m) => m.score(inputs),
            Self::Mlp(m) => m.score(inputs),
        }
    }
}

impl GradientModel for Classifier {
    fn input_dim(&self) -> usize {
        match self {
            Self::Linear(m) => m.input_dim(),
            Self::Mlp(m) => m.input_dim(),
        }
    }

    fn class_gradient(&self, input: &[f32], class: usize) -> Result<Vec<f32>, ModelError> {
        match self {
            Self::Linear(m) => m.class_gradient(input, class),
            Self::Mlp(m) => m.class_gradient(input, class),
        }
    }
}
