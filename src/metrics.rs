//! Outcome counters and the rates derived from them.
//!
//! Counters are value objects: each batch produces a fresh count that is
//! folded into the running total with `absorb`/`merge`, so a run owns its
//! accumulator and nothing is shared between runs.
//!
//! A rate whose denominator is zero is undefined, which is distinct from a
//! valid rate of zero.

use crate::decision::DecisionCounts;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Beta, ContinuousCDF};
use std::fmt;

/// A count over a total, possibly with a zero total
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rate {
    pub count: usize,
    pub total: usize,
}

impl Rate {
    #[must_use]
    pub const fn new(count: usize, total: usize) -> Self {
        Self { count, total }
    }

    /// `count / total`, `None` when the total is zero
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn value(&self) -> Option<f64> {
        (self.total > 0).then(|| self.count as f64 / self.total as f64)
    }

    #[must_use]
    pub const fn is_defined(&self) -> bool {
        self.total > 0
    }

    /// Exact Clopper-Pearson interval at the given confidence level
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn confidence_interval(&self, confidence: f64) -> Option<(f64, f64)> {
        if self.total == 0 || self.count > self.total {
            return None;
        }
        let alpha = 1.0 - confidence;
        let x = self.count as f64;
        let n = self.total as f64;

        let lower = if self.count == 0 {
            0.0
        } else {
            Beta::new(x, n - x + 1.0).ok()?.inverse_cdf(alpha / 2.0)
        };
        let upper = if self.count == self.total {
            1.0
        } else {
            Beta::new(x + 1.0, n - x).ok()?.inverse_cdf(1.0 - alpha / 2.0)
        };
        Some((lower, upper))
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(v) => write!(f, "{}/{}={v:.4}", self.count, self.total),
            None => write!(f, "{}/{}=undefined", self.count, self.total),
        }
    }
}

/// Rate with its point estimate and confidence bounds, for reports
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateWithCI {
    pub count: usize,
    pub total: usize,
    /// `None` when undefined
    pub value: Option<f64>,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
}

impl RateWithCI {
    #[must_use]
    pub fn from_rate(rate: Rate, confidence: f64) -> Self {
        let ci = rate.confidence_interval(confidence);
        Self {
            count: rate.count,
            total: rate.total,
            value: rate.value(),
            ci_lower: ci.map(|c| c.0),
            ci_upper: ci.map(|c| c.1),
        }
    }

    /// Percentage with two decimals, or `undefined`
    #[must_use]
    pub fn percent(&self) -> String {
        self.value
            .map_or_else(|| "undefined".to_string(), |v| format!("{:.2}%", v * 100.0))
    }
}

/// Accumulated decisions over one corruption/severity slice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionCounts {
    /// Accepted and correct
    pub n_correct: usize,
    /// Accepted but wrong
    pub n_false: usize,
    /// Rejected
    pub n_reject: usize,
    /// Samples evaluated
    pub n_total: usize,
}

impl RejectionCounts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one batch's decisions into the running total
    #[must_use]
    pub const fn absorb(self, batch: DecisionCounts) -> Self {
        Self {
            n_correct: self.n_correct + batch.accept_correct,
            n_false: self.n_false + batch.accept_incorrect,
            n_reject: self.n_reject + batch.reject,
            n_total: self.n_total + batch.total(),
        }
    }

    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        Self {
            n_correct: self.n_correct + other.n_correct,
            n_false: self.n_false + other.n_false,
            n_reject: self.n_reject + other.n_reject,
            n_total: self.n_total + other.n_total,
        }
    }

    #[must_use]
    pub const fn accuracy(&self) -> Rate {
        Rate::new(self.n_correct, self.n_total)
    }

    #[must_use]
    pub const fn false_rate(&self) -> Rate {
        Rate::new(self.n_false, self.n_total)
    }

    #[must_use]
    pub const fn reject_rate(&self) -> Rate {
        Rate::new(self.n_reject, self.n_total)
    }

    /// Accuracy over the accepted samples only: `acc / (acc + false_rate)`
    #[must_use]
    pub const fn accuracy_remaining(&self) -> Rate {
        Rate::new(self.n_correct, self.n_correct + self.n_false)
    }
}

/// Accumulated adversarial outcomes over one test-set pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdversarialCounts {
    /// Clean samples the model classified correctly, i.e. attacked
    pub n_eval: usize,
    /// Attacks that changed the prediction away from the true label
    pub n_successful: usize,
    /// Successful attacks rejected, one entry per threshold vector
    pub n_rejected: [usize; 2],
}

impl AdversarialCounts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        Self {
            n_eval: self.n_eval + other.n_eval,
            n_successful: self.n_successful + other.n_successful,
            n_rejected: [
                self.n_rejected[0] + other.n_rejected[0],
                self.n_rejected[1] + other.n_rejected[1],
            ],
        }
    }

    /// `n_successful / n_eval`
    #[must_use]
    pub const fn success_rate(&self) -> Rate {
        Rate::new(self.n_successful, self.n_eval)
    }

    /// `n_rejected[k] / n_successful`; undefined when no attack succeeded.
    /// `None` if `k` is not a tracked percentile index.
    #[must_use]
    pub fn reject_rate(&self, k: usize) -> Option<Rate> {
        self.n_rejected
            .get(k)
            .map(|&n| Rate::new(n, self.n_successful))
    }

    /// Reject rates at both percentiles, in threshold order
    #[must_use]
    pub const fn reject_rates(&self) -> [Rate; 2] {
        [
            Rate::new(self.n_rejected[0], self.n_successful),
            Rate::new(self.n_rejected[1], self.n_successful),
        ]
    }
}

/// Mean of the defined values, `None` if none are defined
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean_defined(values: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    let (sum, n) = values
        .into_iter()
        .flatten()
        .fold((0.0, 0_usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_value() {
        assert_eq!(Rate::new(1, 4).value(), Some(0.25));
        assert_eq!(Rate::new(0, 4).value(), Some(0.0));
        assert_eq!(Rate::new(0, 0).value(), None);
        assert!(!Rate::new(0, 0).is_defined());
    }

    #[test]
    fn test_rate_display() {
        assert_eq!(Rate::new(1, 4).to_string(), "1/4=0.2500");
        assert_eq!(Rate::new(0, 0).to_string(), "0/0=undefined");
    }

    #[test]
    fn test_confidence_interval_contains_estimate() {
        let rate = Rate::new(30, 100);
        let (lo, hi) = rate.confidence_interval(0.95).unwrap();
        assert!(lo < 0.3 && 0.3 < hi, "({lo}, {hi})");
        // exact interval for 30/100 is roughly (0.212, 0.400)
        assert!((lo - 0.212).abs() < 0.01);
        assert!((hi - 0.400).abs() < 0.01);
    }

    #[test]
    fn test_confidence_interval_edges() {
        let (lo, hi) = Rate::new(0, 10).confidence_interval(0.95).unwrap();
        assert_eq!(lo, 0.0);
        assert!(hi > 0.0 && hi < 0.5);

        let (lo, hi) = Rate::new(10, 10).confidence_interval(0.95).unwrap();
        assert_eq!(hi, 1.0);
        assert!(lo > 0.5 && lo < 1.0);

        assert!(Rate::new(0, 0).confidence_interval(0.95).is_none());
    }

    #[test]
    fn test_rate_with_ci_undefined() {
        let r = RateWithCI::from_rate(Rate::new(0, 0), 0.95);
        assert!(r.value.is_none());
        assert!(r.ci_lower.is_none());
        assert_eq!(r.percent(), "undefined");

        let r = RateWithCI::from_rate(Rate::new(1, 2), 0.95);
        assert_eq!(r.percent(), "50.00%");
    }

    #[test]
    fn test_rejection_counts_absorb() {
        let counts = RejectionCounts::new()
            .absorb(DecisionCounts {
                accept_correct: 3,
                accept_incorrect: 1,
                reject: 1,
            })
            .absorb(DecisionCounts {
                accept_correct: 1,
                accept_incorrect: 1,
                reject: 3,
            });
        assert_eq!(counts.n_total, 10);
        assert_eq!(counts.accuracy().value(), Some(0.4));
        assert_eq!(counts.false_rate().value(), Some(0.2));
        assert_eq!(counts.reject_rate().value(), Some(0.4));
        assert_eq!(counts.accuracy_remaining(), Rate::new(4, 6));
    }

    #[test]
    fn test_rejection_counts_merge_is_absorb() {
        let a = RejectionCounts {
            n_correct: 1,
            n_false: 2,
            n_reject: 3,
            n_total: 6,
        };
        let b = RejectionCounts {
            n_correct: 4,
            n_false: 0,
            n_reject: 1,
            n_total: 5,
        };
        let merged = a.merge(b);
        assert_eq!(merged.n_total, 11);
        assert_eq!(merged, b.merge(a));
    }

    #[test]
    fn test_all_rejected_leaves_remaining_accuracy_undefined() {
        let counts = RejectionCounts::new().absorb(DecisionCounts {
            accept_correct: 0,
            accept_incorrect: 0,
            reject: 2,
        });
        assert_eq!(counts.accuracy().value(), Some(0.0));
        assert_eq!(counts.reject_rate().value(), Some(1.0));
        assert_eq!(counts.accuracy_remaining().value(), None);
    }

    #[test]
    fn test_adversarial_counts_rates() {
        let counts = AdversarialCounts {
            n_eval: 100,
            n_successful: 40,
            n_rejected: [10, 20],
        };
        assert_eq!(counts.success_rate().value(), Some(0.4));
        assert_eq!(counts.reject_rate(0).unwrap().value(), Some(0.25));
        assert_eq!(counts.reject_rate(1).unwrap().value(), Some(0.5));
        assert_eq!(counts.reject_rates(), [Rate::new(10, 40), Rate::new(20, 40)]);

        let none = AdversarialCounts {
            n_eval: 100,
            ..AdversarialCounts::default()
        };
        assert_eq!(none.success_rate().value(), Some(0.0));
        assert_eq!(none.reject_rate(0).unwrap().value(), None);
    }

    #[test]
    fn test_adversarial_reject_rate_out_of_range() {
        let counts = AdversarialCounts {
            n_eval: 10,
            n_successful: 4,
            n_rejected: [1, 2],
        };
        assert_eq!(counts.reject_rate(2), None);
        assert_eq!(AdversarialCounts::default().reject_rate(usize::MAX), None);
    }

    #[test]
    fn test_adversarial_counts_merge() {
        let a = AdversarialCounts {
            n_eval: 5,
            n_successful: 2,
            n_rejected: [1, 2],
        };
        let merged = a.merge(a);
        assert_eq!(merged.n_eval, 10);
        assert_eq!(merged.n_rejected, [2, 4]);
    }

    #[test]
    fn test_mean_defined() {
        let mean = mean_defined([Some(0.2), None, Some(0.4)]).unwrap();
        assert!((mean - 0.3).abs() < 1e-12);
        assert_eq!(mean_defined([None, None]), None);
        assert_eq!(mean_defined(Vec::<Option<f64>>::new()), None);
    }
}
