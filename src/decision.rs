//! Accept/reject decisions for one batch of score vectors.
//!
//! A prediction is rejected when the score at the predicted class falls
//! strictly below that class's threshold. Everything here is pure.

use crate::calibrate::Thresholds;
use crate::error::{check_scores, EvalError, EvalResult};
use crate::model::argmax;
use serde::{Deserialize, Serialize};

/// Predicted class and the score the model gave it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: usize,
    pub score: f32,
}

/// Argmax prediction, `None` for an empty or all-NaN score vector
#[must_use]
pub fn predict(scores: &[f32]) -> Option<Prediction> {
    argmax(scores).map(|label| Prediction {
        label,
        score: scores[label],
    })
}

/// Whether a prediction falls below its class threshold.
///
/// A missing prediction or a class without a threshold is rejected.
#[must_use]
pub fn is_rejected(prediction: Option<Prediction>, thresholds: &[f32]) -> bool {
    match prediction {
        Some(p) => thresholds.get(p.label).map_or(true, |&t| p.score < t),
        None => true,
    }
}

/// Where one sample lands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    AcceptCorrect,
    AcceptIncorrect,
    Reject,
}

/// Classify a single sample
#[must_use]
pub fn decide_sample(scores: &[f32], thresholds: &[f32], true_label: usize) -> Outcome {
    let prediction = predict(scores);
    if is_rejected(prediction, thresholds) {
        return Outcome::Reject;
    }
    match prediction {
        Some(p) if p.label == true_label => Outcome::AcceptCorrect,
        _ => Outcome::AcceptIncorrect,
    }
}

/// Disjoint sample indices covering a whole batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub accept_correct: Vec<usize>,
    pub accept_incorrect: Vec<usize>,
    pub reject: Vec<usize>,
}

impl Partition {
    #[must_use]
    pub fn counts(&self) -> DecisionCounts {
        DecisionCounts {
            accept_correct: self.accept_correct.len(),
            accept_incorrect: self.accept_incorrect.len(),
            reject: self.reject.len(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.accept_correct.len() + self.accept_incorrect.len() + self.reject.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-outcome counts of one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionCounts {
    pub accept_correct: usize,
    pub accept_incorrect: usize,
    pub reject: usize,
}

impl DecisionCounts {
    #[must_use]
    pub const fn total(&self) -> usize {
        self.accept_correct + self.accept_incorrect + self.reject
    }
}

/// Partition a batch into accepted-correct, accepted-incorrect and rejected
///
/// # Errors
///
/// Returns `EvalError::ShapeMismatch` if the label count differs from the
/// batch size, the threshold vector is empty, or any score vector's length
/// differs from the number of thresholds.
pub fn decide(
    scores: &[Vec<f32>],
    thresholds: &Thresholds,
    labels: &[usize],
) -> EvalResult<Partition> {
    if thresholds.is_empty() {
        return Err(EvalError::shape("threshold vector", 1, 0));
    }
    if labels.len() != scores.len() {
        return Err(EvalError::shape("label batch", scores.len(), labels.len()));
    }
    check_scores(scores, labels.len(), thresholds.len())?;

    let mut partition = Partition::default();
    for (i, (s, &y)) in scores.iter().zip(labels).enumerate() {
        match decide_sample(s, thresholds.as_slice(), y) {
            Outcome::AcceptCorrect => partition.accept_correct.push(i),
            Outcome::AcceptIncorrect => partition.accept_incorrect.push(i),
            Outcome::Reject => partition.reject.push(i),
        }
    }
    Ok(partition)
}
