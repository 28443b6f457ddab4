//! Delayed-rejection cascade run after a rejected within-model move.
//!
//! Works on log-posteriors (`prob = -chi`, larger is better). Each stage
//! proposes around the best point found so far with a shrinking covariance
//! and accepts a candidate by its improvement over the cascade best relative
//! to the improvement of the current point over it.

use nalgebra::DMatrix;
use rand::Rng;

use crate::anneal::log_subtract_exp;
use crate::likelihood::LikelihoodModel;

/// Covariance shrink factor per stage and per out-of-support redraw.
pub const SCALE_SHRINK: f64 = 1.05;
/// Redraws allowed per stage for a candidate inside the prior support.
pub const SUPPORT_RETRIES: usize = 20;

/// Accepted cascade candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct DrAccept {
    /// Accepted parameter vector (blocks sorted by age).
    pub param: Vec<f64>,
    /// Its log-posterior.
    pub prob: f64,
    /// Zero-based stage that produced it.
    pub stage: usize,
}

/// Relative-improvement test: `exp((lse(z, best) - lse(x, best)) / T) > u`.
///
/// `false` when either log-difference is undefined.
pub fn relative_improvement_accept(z_prob: f64, x_prob: f64, best_prob: f64, temperature: f64, u: f64) -> bool {
    match (log_subtract_exp(z_prob, best_prob), log_subtract_exp(x_prob, best_prob)) {
        (Some(a), Some(b)) => ((a - b) / temperature).exp() > u,
        _ => false,
    }
}

/// Run up to `stages` cascade stages from the rejected candidate `y0`.
///
/// `x` is the chain's current point. Returns `None` when no stage accepted,
/// including when a stage could not find a point inside the prior support.
#[allow(clippy::too_many_arguments)]
pub fn delayed_rejection<M: LikelihoodModel + ?Sized>(
    model: &M,
    k: usize,
    x: &[f64],
    x_prob: f64,
    y0: &[f64],
    y0_prob: f64,
    cov: &DMatrix<f64>,
    temperature: f64,
    stages: usize,
    initial_scale: f64,
    rng: &mut impl Rng,
) -> Option<DrAccept> {
    let layout = model.layout();
    let floor = y0_prob;
    let (mut best, mut best_prob) =
        if y0_prob.is_finite() { (y0.to_vec(), y0_prob) } else { (x.to_vec(), x_prob) };
    let mut scale = initial_scale;

    for stage in 0..stages {
        let mut z = None;
        for _ in 0..SUPPORT_RETRIES {
            let scaled = cov * scale;
            if let Ok(mut cand) = model.propose(&best, &scaled, rng)
                && cand.iter().all(|v| v.is_finite())
            {
                layout.sort_blocks_by_age(&mut cand);
                if model.log_prior(&cand, k).is_finite() {
                    z = Some(cand);
                    break;
                }
            }
            scale /= SCALE_SHRINK;
        }
        let z = z?;
        scale /= SCALE_SHRINK;

        let z_prob = model.log_posterior(&z, k);
        if z_prob.is_nan() {
            continue;
        }
        if z_prob >= x_prob {
            return Some(DrAccept { param: z, prob: z_prob, stage });
        }
        if z_prob < floor {
            continue;
        }
        let u: f64 = rng.random();
        if relative_improvement_accept(z_prob, x_prob, best_prob, temperature, u) {
            return Some(DrAccept { param: z, prob: z_prob, stage });
        }
        if z_prob > best_prob {
            best = z;
            best_prob = z_prob;
        }
    }
    None
}
