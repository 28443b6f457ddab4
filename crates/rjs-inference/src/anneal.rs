//! Simulated-annealing schedule and acceptance arithmetic.

use std::f64::consts::PI;

/// Effective number of cosine half-waves for `modes`.
///
/// One mode is a single decay. Even counts gain one half-wave and odd counts
/// above one gain two, so the schedule always ends on a trough.
pub fn effective_modes(modes: usize) -> usize {
    match modes {
        0 | 1 => 1,
        m if m % 2 == 0 => m + 1,
        m => m + 2,
    }
}

/// Annealing temperature at `iteration`.
///
/// `(t_start - t_stop) * cos(i/L * m * pi/2)^2 + t_stop` during burn-in,
/// floored at `1.0`; exactly `1.0` once `iteration >= burn_in_length`.
pub fn temperature(
    iteration: usize,
    burn_in_length: usize,
    t_start: f64,
    t_stop: f64,
    modes: usize,
) -> f64 {
    if iteration >= burn_in_length {
        return 1.0;
    }
    let m = effective_modes(modes) as f64;
    let phase = iteration as f64 / burn_in_length as f64 * m * PI / 2.0;
    let t = (t_start - t_stop) * phase.cos().powi(2) + t_stop;
    if t.is_finite() { t.max(1.0) } else { 1.0 }
}

/// `ln(exp(log_a) - exp(log_b))`, or `None` when the difference is not positive.
pub fn log_subtract_exp(log_a: f64, log_b: f64) -> Option<f64> {
    if log_a.is_nan() || log_b.is_nan() {
        return None;
    }
    if log_b == f64::NEG_INFINITY {
        return Some(log_a);
    }
    if log_b >= log_a {
        return None;
    }
    Some(log_a + (-(log_b - log_a).exp()).ln_1p())
}

/// Annealed Metropolis test on chi values (smaller is better).
///
/// A finite candidate at least as good as the current point is always accepted.
pub fn metropolis_accept(chi_prev: f64, chi_cand: f64, temperature: f64, u: f64) -> bool {
    if chi_cand.is_nan() || chi_cand == f64::INFINITY {
        return false;
    }
    if chi_cand <= chi_prev {
        return true;
    }
    ((chi_prev - chi_cand) / temperature).exp() > u
}

/// Acceptance probability `min(1, exp((chi_prev - chi_cand)/T))`.
pub fn acceptance_probability(chi_prev: f64, chi_cand: f64, temperature: f64) -> f64 {
    if chi_cand.is_nan() || chi_cand == f64::INFINITY {
        return 0.0;
    }
    if chi_cand <= chi_prev {
        return 1.0;
    }
    ((chi_prev - chi_cand) / temperature).exp().min(1.0)
}

/// Start temperature derived from the best chi at the current model.
pub fn chi_scaled_start(min_chi: f64) -> Option<f64> {
    if min_chi.is_finite() { Some(min_chi.round() + 1.0) } else { None }
}
