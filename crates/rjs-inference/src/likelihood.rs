//! Contract between the sampler and a user-supplied posterior.
//!
//! The engine never looks inside a model: it asks for starting points,
//! evaluates log-posteriors, and delegates proposals and dimension changes
//! to overridable methods whose defaults implement the standard moves.

use nalgebra::DMatrix;
use rand::Rng;
use rjs_core::{BlockLayout, ModelBounds, Result};

use crate::adapt::{AdaptInput, adapt};
use crate::birth_death;
use crate::proposal;

/// Candidate produced by a birth or death move.
#[derive(Debug, Clone, PartialEq)]
pub struct JumpProposal {
    /// Model index of the candidate.
    pub to_k: usize,
    /// Candidate parameter vector, `layout.param_len(to_k)` long.
    pub param: Vec<f64>,
    /// Move multiplier applied to the likelihood ratio.
    pub criterion: f64,
}

/// Variable-dimension posterior sampled by the RJ engine.
///
/// Implementors must be `Send + Sync`: chains and delayed-rejection helpers
/// evaluate the same object from several threads.
pub trait LikelihoodModel: Send + Sync {
    /// Block structure of parameter vectors.
    fn layout(&self) -> BlockLayout;

    /// Support `(lo, hi)` of each slot in a block, `layout().block_len` entries.
    fn slot_ranges(&self) -> Vec<(f64, f64)>;

    /// Starting vector and proposal covariance for model index `k`.
    fn initialize_parameters(&self, k: usize, rng: &mut impl Rng) -> Result<(Vec<f64>, DMatrix<f64>)>;

    /// Log-likelihood plus log-prior. Non-finite marks an invalid point.
    fn log_posterior(&self, param: &[f64], k: usize) -> f64;

    /// Log-prior alone. Non-finite means outside the support.
    fn log_prior(&self, param: &[f64], k: usize) -> f64;

    /// Within-model proposal.
    fn propose(&self, current: &[f64], cov: &DMatrix<f64>, rng: &mut impl Rng) -> Result<Vec<f64>> {
        proposal::propose(current, cov, rng)
    }

    /// Updated proposal covariance after one iteration at model `k`.
    fn adapt_step(&self, input: &AdaptInput<'_>, cov: &DMatrix<f64>, _k: usize) -> DMatrix<f64> {
        adapt(input, cov)
    }

    /// Birth or death candidate from `current` at model `k`; `None` when no move is attempted.
    fn propose_birth_death(
        &self,
        birth_rate: f64,
        k: usize,
        bounds: ModelBounds,
        current: &[f64],
        rng: &mut impl Rng,
    ) -> Option<JumpProposal> {
        birth_death::propose_birth_death(self, birth_rate, k, bounds, current, rng)
    }
}

/// `-log_posterior`, with every non-finite value mapped to `+inf`.
#[inline]
pub fn chi_of(log_posterior: f64) -> f64 {
    if log_posterior.is_finite() { -log_posterior } else { f64::INFINITY }
}
