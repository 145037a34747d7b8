//! Adversarial attack oracles.
//!
//! An oracle takes a batch of inputs and returns perturbed inputs of the same
//! count and shape. Nothing guarantees a given perturbation flips the
//! prediction; the adversarial pipeline measures that.
//!
//! # References
//! - Goodfellow et al. (2015) "Explaining and Harnessing Adversarial Examples"
//! - Moosavi-Dezfooli et al. (2016) "DeepFool: a simple and accurate method
//!   to fool deep neural networks"

use crate::config::AttackConfig;
use crate::error::{EvalError, EvalResult};
use crate::model::{argmax, GradientModel};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::trace;

/// Produces perturbed counterparts of a batch of inputs
pub trait AttackOracle {
    /// Short identifier used in logs and reports
    fn name(&self) -> &str;

    /// Perturb every input in the batch
    ///
    /// # Errors
    ///
    /// Returns an error if the model fails on any input.
    fn generate(
        &mut self,
        model: &dyn GradientModel,
        inputs: &[Vec<f32>],
    ) -> EvalResult<Vec<Vec<f32>>>;
}

/// Valid input range; perturbed inputs are clipped back into it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipRange {
    pub min: f32,
    pub max: f32,
}

impl Default for ClipRange {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

impl ClipRange {
    #[must_use]
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    fn apply(self, x: &mut [f32]) {
        for v in x {
            *v = v.clamp(self.min, self.max);
        }
    }
}

fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn difference(a: &[f32], b: &[f32]) -> Vec<f32> {
    a.iter().zip(b).map(|(x, y)| x - y).collect()
}

fn attack_error(attack: &str, reason: impl Into<String>) -> EvalError {
    EvalError::Attack {
        attack: attack.to_string(),
        reason: reason.into(),
    }
}

/// Highest-scoring class other than `exclude`
fn runner_up(scores: &[f32], exclude: usize) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .filter(|(k, s)| *k != exclude && !s.is_nan())
        .fold(None, |best: Option<(usize, f32)>, (k, &s)| match best {
            Some((_, b)) if s <= b => best,
            _ => Some((k, s)),
        })
        .map(|(k, _)| k)
}

/// Fast Gradient Sign Method on the margin between the clean prediction and
/// its strongest competitor: `x_adv = x + epsilon * sign(grad(s_k - s_pred))`
#[derive(Debug, Clone)]
pub struct Fgsm {
    pub epsilon: f32,
    pub clip: ClipRange,
}

impl Fgsm {
    #[must_use]
    pub const fn new(epsilon: f32, clip: ClipRange) -> Self {
        Self { epsilon, clip }
    }
}

impl AttackOracle for Fgsm {
    fn name(&self) -> &str {
        "fgsm"
    }

    fn generate(
        &mut self,
        model: &dyn GradientModel,
        inputs: &[Vec<f32>],
    ) -> EvalResult<Vec<Vec<f32>>> {
        let scores = model.score(inputs)?;
        inputs
            .iter()
            .zip(&scores)
            .map(|(x, s)| -> EvalResult<Vec<f32>> {
                let mut adv = x.clone();
                let Some(pred) = argmax(s) else {
                    return Ok(adv);
                };
                let Some(rival) = runner_up(s, pred) else {
                    return Ok(adv);
                };
                let grad = difference(
                    &model.class_gradient(x, rival)?,
                    &model.class_gradient(x, pred)?,
                );
                for (v, g) in adv.iter_mut().zip(&grad) {
                    *v += self.epsilon * sign(*g);
                }
                self.clip.apply(&mut adv);
                Ok(adv)
            })
            .collect()
    }
}

/// DeepFool: repeatedly step to the nearest linearised decision boundary
/// until the prediction changes or the iteration budget runs out
#[derive(Debug, Clone)]
pub struct DeepFool {
    pub max_iter: usize,
    pub overshoot: f32,
    pub clip: ClipRange,
}

impl DeepFool {
    #[must_use]
    pub const fn new(max_iter: usize, overshoot: f32, clip: ClipRange) -> Self {
        Self {
            max_iter,
            overshoot,
            clip,
        }
    }

    fn perturb_one(&self, model: &dyn GradientModel, x: &[f32]) -> EvalResult<Vec<f32>> {
        let mut adv = x.to_vec();
        let first = model.score(std::slice::from_ref(&adv))?;
        let Some(orig) = first.first().and_then(|s| argmax(s)) else {
            return Ok(adv);
        };
        let mut r_tot = vec![0.0_f32; x.len()];

        for iter in 0..self.max_iter {
            let scores = model.score(std::slice::from_ref(&adv))?;
            let s = scores
                .first()
                .ok_or_else(|| attack_error("deepfool", "model returned no scores"))?;
            if argmax(s) != Some(orig) {
                trace!(iter, "DeepFool crossed the boundary");
                break;
            }

            let g_orig = model.class_gradient(&adv, orig)?;
            let mut nearest: Option<(f32, Vec<f32>, f32)> = None;
            for k in (0..s.len()).filter(|&k| k != orig) {
                let w = difference(&model.class_gradient(&adv, k)?, &g_orig);
                let w_norm = norm(&w);
                if w_norm <= f32::EPSILON {
                    continue;
                }
                let dist = (s[k] - s[orig]).abs() / w_norm;
                if nearest.as_ref().map_or(true, |(d, _, _)| dist < *d) {
                    nearest = Some((dist, w, w_norm));
                }
            }
            let Some((dist, w, w_norm)) = nearest else {
                break;
            };

            let step = (dist + 1e-4) / w_norm;
            for (r, wi) in r_tot.iter_mut().zip(&w) {
                *r += step * wi;
            }
            for ((a, xi), r) in adv.iter_mut().zip(x).zip(&r_tot) {
                *a = xi + (1.0 + self.overshoot) * r;
            }
            self.clip.apply(&mut adv);
        }
        Ok(adv)
    }
}

impl AttackOracle for DeepFool {
    fn name(&self) -> &str {
        "deepfool"
    }

    fn generate(
        &mut self,
        model: &dyn GradientModel,
        inputs: &[Vec<f32>],
    ) -> EvalResult<Vec<Vec<f32>>> {
        inputs.iter().map(|x| self.perturb_one(model, x)).collect()
    }
}

/// Uniform random sign noise of magnitude `epsilon`, ignoring the model
#[derive(Debug, Clone)]
pub struct RandomNoise {
    pub epsilon: f32,
    pub clip: ClipRange,
    rng: ChaCha8Rng,
}

impl RandomNoise {
    #[must_use]
    pub fn new(epsilon: f32, clip: ClipRange, seed: u64) -> Self {
        Self {
            epsilon,
            clip,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl AttackOracle for RandomNoise {
    fn name(&self) -> &str {
        "random_noise"
    }

    fn generate(
        &mut self,
        _model: &dyn GradientModel,
        inputs: &[Vec<f32>],
    ) -> EvalResult<Vec<Vec<f32>>> {
        Ok(inputs
            .iter()
            .map(|x| {
                let mut adv: Vec<f32> = x
                    .iter()
                    .map(|v| {
                        let s = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
                        v + self.epsilon * s
                    })
                    .collect();
                self.clip.apply(&mut adv);
                adv
            })
            .collect())
    }
}

/// Attack selected by configuration
#[derive(Debug, Clone)]
pub enum Attack {
    Fgsm(Fgsm),
    DeepFool(DeepFool),
    RandomNoise(RandomNoise),
}

impl Attack {
    #[must_use]
    pub fn from_config(config: &AttackConfig, clip: ClipRange, seed: u64) -> Self {
        match *config {
            AttackConfig::Fgsm { epsilon } => Self::Fgsm(Fgsm::new(epsilon, clip)),
            AttackConfig::DeepFool {
                max_iter,
                overshoot,
            } => Self::DeepFool(DeepFool::new(max_iter, overshoot, clip)),
            AttackConfig::RandomNoise { epsilon } => {
                Self::RandomNoise(RandomNoise::new(epsilon, clip, seed))
            }
        }
    }
}

impl AttackOracle for Attack {
    fn name(&self) -> &str {
        match self {
            Self::Fgsm(a) => a.name(),
            Self::DeepFool(a) => a.name(),
            Self::RandomNoise(a) => a.name(),
        }
    }

    fn generate(
        &mut self,
        model: &dyn GradientModel,
        inputs: &[Vec<f32>],
    ) -> EvalResult<Vec<Vec<f32>>> {
        match self {
            Self::Fgsm(a) => a.generate(model, inputs),
            Self::DeepFool(a) => a.generate(model, inputs),
            Self::RandomNoise(a) => a.generate(model, inputs),
        }
    }
}

/// Fail unless the oracle returned one input of the original shape per input
///
/// # Errors
///
/// Returns `EvalError::Attack` naming the broken part of the contract.
pub fn check_attack_output(
    attack: &str,
    inputs: &[Vec<f32>],
    adversarial: &[Vec<f32>],
) -> EvalResult<()> {
    if inputs.len() != adversarial.len() {
        return Err(attack_error(
            attack,
            format!(
                "returned {} inputs for a batch of {}",
                adversarial.len(),
                inputs.len()
            ),
        ));
    }
    if let Some((i, (x, a))) = inputs
        .iter()
        .zip(adversarial)
        .enumerate()
        .find(|(_, (x, a))| x.len() != a.len())
    {
        return Err(attack_error(
            attack,
            format!("sample {i} has {} features, expected {}", a.len(), x.len()),
        ));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::model::{DenseLayer, LinearScorer, ScoreModel};

    /// Two-class linear model scoring `x0` for class 0 and `x1` for class 1
    fn two_class() -> LinearScorer {
        LinearScorer::new(
            DenseLayer::new(vec![vec![1.0, 0.0], vec![0.0, 1.0]], vec![0.0, 0.0]).unwrap(),
        )
    }

    fn predicted(model: &LinearScorer, x: &[f32]) -> usize {
        argmax(&model.score(&[x.to_vec()]).unwrap()[0]).unwrap()
    }

    #[test]
    fn test_runner_up() {
        assert_eq!(runner_up(&[0.9, 0.3, 0.5], 0), Some(2));
        assert_eq!(runner_up(&[0.9], 0), None);
        assert_eq!(runner_up(&[0.2, f32::NAN, 0.1], 0), Some(2));
    }

    #[test]
    fn test_fgsm_moves_towards_rival() {
        let model = two_class();
        let mut fgsm = Fgsm::new(0.1, ClipRange::default());
        let adv = fgsm.generate(&model, &[vec![0.6, 0.5]]).unwrap();
        assert_eq!(adv.len(), 1);
        assert!((adv[0][0] - 0.5).abs() < 1e-6);
        assert!((adv[0][1] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_fgsm_clips() {
        let model = two_class();
        let mut fgsm = Fgsm::new(0.5, ClipRange::default());
        let adv = fgsm.generate(&model, &[vec![0.9, 0.8]]).unwrap();
        assert!((adv[0][0] - 0.4).abs() < 1e-6);
        assert_eq!(adv[0][1], 1.0);
    }

    #[test]
    fn test_deepfool_flips_linear_prediction() {
        let model = two_class();
        let mut attack = DeepFool::new(50, 0.02, ClipRange::default());
        let x = vec![0.7, 0.3];
        let adv = attack.generate(&model, &[x.clone()]).unwrap();
        assert_eq!(predicted(&model, &x), 0);
        assert_eq!(predicted(&model, &adv[0]), 1);
        // minimal perturbation stays close to the boundary
        let dist = norm(&difference(&adv[0], &x));
        assert!(dist < 0.4, "dist = {dist}");
    }

    #[test]
    fn test_deepfool_zero_iterations_is_identity() {
        let model = two_class();
        let mut attack = DeepFool::new(0, 0.02, ClipRange::default());
        let adv = attack.generate(&model, &[vec![0.7, 0.3]]).unwrap();
        assert_eq!(adv[0], vec![0.7, 0.3]);
    }

    #[test]
    fn test_random_noise_is_seeded() {
        let model = two_class();
        let inputs = vec![vec![0.5; 8]; 4];
        let a = RandomNoise::new(0.1, ClipRange::default(), 7)
            .generate(&model, &inputs)
            .unwrap();
        let b = RandomNoise::new(0.1, ClipRange::default(), 7)
            .generate(&model, &inputs)
            .unwrap();
        assert_eq!(a, b);
        for v in a.iter().flatten() {
            assert!((v - 0.4).abs() < 1e-6 || (v - 0.6).abs() < 1e-6);
        }
    }

    #[test]
    fn test_attack_from_config() {
        let clip = ClipRange::default();
        let attack = Attack::from_config(&AttackConfig::Fgsm { epsilon: 0.1 }, clip, 1);
        assert_eq!(attack.name(), "fgsm");
        let attack = Attack::from_config(&AttackConfig::default(), clip, 1);
        assert_eq!(attack.name(), "deepfool");
        let attack = Attack::from_config(&AttackConfig::RandomNoise { epsilon: 0.1 }, clip, 1);
        assert_eq!(attack.name(), "random_noise");
    }

    #[test]
    fn test_attack_preserves_count_and_shape() {
        let model = two_class();
        let inputs = vec![vec![0.7, 0.3], vec![0.2, 0.9], vec![0.5, 0.5]];
        let mut attack = Attack::from_config(&AttackConfig::default(), ClipRange::default(), 0);
        let adv = attack.generate(&model, &inputs).unwrap();
        assert!(check_attack_output(attack.name(), &inputs, &adv).is_ok());
    }

    #[test]
    fn test_check_attack_output_violations() {
        let inputs = vec![vec![0.1, 0.2]];
        let err = check_attack_output("mock", &inputs, &[]).unwrap_err();
        assert!(err.to_string().contains("mock"));
        let err = check_attack_output("mock", &inputs, &[vec![0.1]]).unwrap_err();
        assert!(err.to_string().contains("features"));
    }
}
