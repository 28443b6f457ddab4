//! Proposal covariance adaptation and stuck-chain recovery.
//!
//! Three mechanisms act on the per-model proposal covariance:
//! - multiplicative step scaling driven by the rolling acceptance rate,
//! - periodic re-estimation from recent draws (Welford covariance),
//! - inflation or reset of the covariance when the chain stops moving.

use std::collections::VecDeque;

use nalgebra::DMatrix;

/// Multiplicative factor applied by [`scale_step`].
pub const STEP_FACTOR: f64 = 1.05;
/// Accepted moves between covariance re-estimations; also the draw window used.
pub const RE_ESTIMATE_EVERY: usize = 2000;
/// Rolling acceptance rate below which adaptation stays on after burn-in.
pub const FORCED_ADAPT_RATE: f64 = 0.11;
/// Stuck detection runs on every call index divisible by this.
pub const STUCK_CHECK_EVERY: usize = 50;
/// Trailing window for the stuck-chain statistics.
pub const STUCK_WINDOW: usize = 2000;
/// Rolling acceptance window length.
pub const ROLLING_WINDOW: usize = 100;

/// Online Welford covariance estimator (dense).
///
/// Maintains a running mean and `M2` matrix such that `cov = M2 / (n-1)`.
pub struct WelfordCovariance {
    mean: Vec<f64>,
    m2: Vec<f64>, // row-major dim x dim
    dim: usize,
    count: usize,
}

impl WelfordCovariance {
    /// Create for `dim`-dimensional parameter vectors.
    pub fn new(dim: usize) -> Self {
        Self { mean: vec![0.0; dim], m2: vec![0.0; dim * dim], dim, count: 0 }
    }

    /// Number of samples seen.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Incorporate a new sample. Samples of the wrong length are ignored.
    pub fn update(&mut self, x: &[f64]) {
        if x.len() != self.dim {
            return;
        }
        self.count += 1;
        let n = self.count as f64;

        let delta: Vec<f64> = x.iter().zip(&self.mean).map(|(&xi, &mi)| xi - mi).collect();
        for (m, d) in self.mean.iter_mut().zip(&delta) {
            *m += d / n;
        }
        for i in 0..self.dim {
            let delta2 = x[i] - self.mean[i];
            for j in 0..self.dim {
                self.m2[j * self.dim + i] += delta[j] * delta2;
            }
        }
    }

    /// Sample covariance, `None` with fewer than two samples.
    pub fn covariance(&self) -> Option<DMatrix<f64>> {
        if self.count < 2 {
            return None;
        }
        let denom = (self.count as f64) - 1.0;
        Some(DMatrix::from_fn(self.dim, self.dim, |i, j| self.m2[i * self.dim + j] / denom))
    }

    /// Reset the estimator.
    pub fn reset(&mut self) {
        self.mean.fill(0.0);
        self.m2.fill(0.0);
        self.count = 0;
    }
}

/// Fixed-length window of accept/reject decisions.
#[derive(Debug, Clone)]
pub struct RollingAcceptance {
    window: VecDeque<bool>,
    accepted: usize,
    capacity: usize,
}

impl Default for RollingAcceptance {
    fn default() -> Self {
        Self::new(ROLLING_WINDOW)
    }
}

impl RollingAcceptance {
    /// Window holding the last `capacity` decisions.
    pub fn new(capacity: usize) -> Self {
        Self { window: VecDeque::with_capacity(capacity), accepted: 0, capacity: capacity.max(1) }
    }

    /// Record one decision and return the updated rate.
    pub fn push(&mut self, accepted: bool) -> f64 {
        if self.window.len() == self.capacity && self.window.pop_front() == Some(true) {
            self.accepted -= 1;
        }
        self.window.push_back(accepted);
        if accepted {
            self.accepted += 1;
        }
        self.rate()
    }

    /// Fraction of accepted decisions in the window (0 when empty).
    pub fn rate(&self) -> f64 {
        if self.window.is_empty() { 0.0 } else { self.accepted as f64 / self.window.len() as f64 }
    }
}

/// Scale the covariance towards a 0.2-0.6 acceptance band.
pub fn scale_step(acceptance_rate: f64, cov: &DMatrix<f64>) -> DMatrix<f64> {
    if acceptance_rate > 0.6 {
        cov * STEP_FACTOR
    } else if acceptance_rate < 0.2 {
        cov / STEP_FACTOR
    } else {
        cov.clone()
    }
}

/// Empirical covariance of `recent` draws.
///
/// `None` with fewer than two draws or when a diagonal entry is not finite and positive.
pub fn re_estimate(recent: &[Vec<f64>]) -> Option<DMatrix<f64>> {
    let dim = recent.first()?.len();
    let mut w = WelfordCovariance::new(dim);
    for x in recent {
        w.update(x);
    }
    let cov = w.covariance()?;
    if cov.diagonal().iter().all(|&d| d.is_finite() && d > 0.0) { Some(cov) } else { None }
}

/// Whether step adaptation runs at `iteration`.
pub fn adaptation_active(iteration: usize, burn_in_length: usize, rolling_rate: f64) -> bool {
    iteration < burn_in_length || rolling_rate < FORCED_ADAPT_RATE
}

/// Per-iteration inputs to [`adapt`].
#[derive(Debug, Clone, Copy)]
pub struct AdaptInput<'a> {
    /// Global iteration index of the chain.
    pub iteration: usize,
    /// Burn-in length.
    pub burn_in_length: usize,
    /// Rolling acceptance rate at the current model.
    pub acceptance_rate: f64,
    /// `true` if this iteration accepted a within-model move.
    pub just_accepted: bool,
    /// Accepted moves at the current model.
    pub n_accepted: usize,
    /// Draw history at the current model.
    pub draws: &'a [Vec<f64>],
}

/// Scale the step, then re-estimate from the trailing draws when due.
pub fn adapt(input: &AdaptInput<'_>, cov: &DMatrix<f64>) -> DMatrix<f64> {
    let scaled = scale_step(input.acceptance_rate, cov);
    let due = input.just_accepted
        && input.n_accepted > 0
        && input.n_accepted % RE_ESTIMATE_EVERY == 0
        && input.draws.len() >= RE_ESTIMATE_EVERY;
    if !due {
        return scaled;
    }
    let recent = &input.draws[input.draws.len() - RE_ESTIMATE_EVERY..];
    match re_estimate(recent) {
        Some(c) if c.nrows() == cov.nrows() => c,
        _ => {
            log::warn!(
                "covariance re-estimation failed after {} accepted moves; keeping scaled step",
                input.n_accepted
            );
            scaled
        }
    }
}

/// Outcome of [`detect_and_unstick`], carrying the covariance to use next.
#[derive(Debug, Clone, PartialEq)]
pub enum Unstick {
    /// Not stuck, or not checked on this call.
    Unchanged(DMatrix<f64>),
    /// Stuck: covariance multiplied by 10.
    Inflated(DMatrix<f64>),
    /// Stuck with a collapsed diagonal: covariance reset to `0.1 * I`.
    Reset(DMatrix<f64>),
}

impl Unstick {
    /// The covariance to continue with.
    pub fn into_matrix(self) -> DMatrix<f64> {
        match self {
            Unstick::Unchanged(m) | Unstick::Inflated(m) | Unstick::Reset(m) => m,
        }
    }

    /// `true` unless [`Unstick::Unchanged`].
    pub fn changed(&self) -> bool {
        !matches!(self, Unstick::Unchanged(_))
    }
}

fn median(values: &[f64]) -> f64 {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| !x.is_nan()).collect();
    if v.is_empty() {
        return f64::NAN;
    }
    v.sort_by(|a, b| a.total_cmp(b));
    let n = v.len();
    if n % 2 == 1 { v[n / 2] } else { 0.5 * (v[n / 2 - 1] + v[n / 2]) }
}

fn distinct_count(values: impl Iterator<Item = f64>) -> usize {
    let mut v: Vec<f64> = values.collect();
    v.sort_by(|a, b| a.total_cmp(b));
    v.dedup_by(|a, b| a.to_bits() == b.to_bits());
    v.len()
}

/// Detect a stuck chain and widen its proposal.
///
/// Evaluated only when `call_index % 50 == 0`. The chain is stuck when the
/// median of the last 2000 acceptance-rate entries is below 0.1, the tracked
/// `slot` took fewer than 200 distinct values over the last 2000 draws, and at
/// least 1000 draws exist.
pub fn detect_and_unstick(
    call_index: usize,
    acceptance_history: &[f64],
    recent_history: &[Vec<f64>],
    slot: usize,
    cov: &DMatrix<f64>,
) -> Unstick {
    if call_index % STUCK_CHECK_EVERY != 0 || recent_history.len() < 1000 {
        return Unstick::Unchanged(cov.clone());
    }
    let acc_tail = &acceptance_history[acceptance_history.len().saturating_sub(STUCK_WINDOW)..];
    let med = median(acc_tail);
    if !(med < 0.1) {
        return Unstick::Unchanged(cov.clone());
    }
    let draw_tail = &recent_history[recent_history.len().saturating_sub(STUCK_WINDOW)..];
    let distinct = distinct_count(draw_tail.iter().filter_map(|d| d.get(slot).copied()));
    if distinct >= 200 {
        return Unstick::Unchanged(cov.clone());
    }
    if cov.diagonal().iter().any(|&d| d < 1e-10) {
        Unstick::Reset(DMatrix::identity(cov.nrows(), cov.ncols()) * 0.1)
    } else {
        Unstick::Inflated(cov * 10.0)
    }
}
