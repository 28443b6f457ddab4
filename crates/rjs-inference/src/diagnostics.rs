//! Convergence diagnostics for RJ runs: split R-hat, bulk and tail ESS.
//!
//! Reported on the post-burn-in traces of the model index `k` (as `f64`) and
//! of chi, the two quantities every chain records regardless of which models
//! it visited. R-hat is rank-normalized and folded (Vehtari et al. 2021).

use std::fmt;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::chain::SamplerResult;

/// Diagnostics for a multi-chain RJ run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsResult {
    /// Rank-normalized folded split R-hat of the `k` trace (NaN when `k` never moves).
    pub k_r_hat: f64,
    /// Bulk ESS of the `k` trace.
    pub k_ess_bulk: f64,
    /// Rank-normalized folded split R-hat of the chi trace.
    pub chi_r_hat: f64,
    /// Bulk ESS of the chi trace.
    pub chi_ess_bulk: f64,
    /// Tail ESS of the chi trace.
    pub chi_ess_tail: f64,
    /// Accepted over attempted dimension changes, pooled over chains.
    pub jump_acceptance_rate: f64,
    /// Post-burn-in draws per chain.
    pub draws_per_chain: Vec<usize>,
}

/// High-level sampling quality status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityStatus {
    /// All gates passed.
    Ok,
    /// Some gates emitted warnings.
    Warn,
    /// One or more gates failed.
    Fail,
}

impl fmt::Display for QualityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityStatus::Ok => write!(f, "ok"),
            QualityStatus::Warn => write!(f, "warn"),
            QualityStatus::Fail => write!(f, "fail"),
        }
    }
}

/// Thresholds for the quality summary.
#[derive(Debug, Clone)]
pub struct QualityGates {
    /// Require at least this many chains before enabling R-hat/ESS gates.
    pub min_chains: usize,
    /// Require at least this many post-burn-in draws per chain.
    pub min_draws_per_chain: usize,
    /// Warn above this chi R-hat.
    pub max_rhat_warn: f64,
    /// Fail above this chi R-hat.
    pub max_rhat_fail: f64,
    /// Warn below this bulk ESS as a fraction of total draws.
    pub min_ess_bulk_frac_warn: f64,
    /// Fail below this bulk ESS fraction.
    pub min_ess_bulk_frac_fail: f64,
    /// Warn when fewer than this fraction of dimension changes are accepted.
    pub min_jump_acceptance_warn: f64,
}

impl Default for QualityGates {
    fn default() -> Self {
        Self {
            min_chains: 2,
            min_draws_per_chain: 50,
            max_rhat_warn: 1.20,
            max_rhat_fail: 1.50,
            min_ess_bulk_frac_warn: 0.05,
            min_ess_bulk_frac_fail: 0.01,
            min_jump_acceptance_warn: 0.01,
        }
    }
}

/// Summary of run quality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitySummary {
    /// Aggregated status.
    pub status: QualityStatus,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
    /// Hard failures.
    pub failures: Vec<String>,
    /// Whether R-hat/ESS gates were enabled.
    pub enabled: bool,
    /// Post-burn-in draws over all chains.
    pub total_draws: usize,
}

/// Apply `gates` to `diag`.
pub fn quality_summary(diag: &DiagnosticsResult, gates: &QualityGates) -> QualitySummary {
    let n_chains = diag.draws_per_chain.len();
    let min_draws = diag.draws_per_chain.iter().copied().min().unwrap_or(0);
    let total_draws: usize = diag.draws_per_chain.iter().sum();
    let enabled = n_chains >= gates.min_chains && min_draws >= gates.min_draws_per_chain;

    let mut warnings = Vec::new();
    let mut failures = Vec::new();

    if enabled {
        if diag.chi_r_hat.is_finite() {
            if diag.chi_r_hat > gates.max_rhat_fail {
                failures.push(format!("chi R-hat {:.3} > {:.2}", diag.chi_r_hat, gates.max_rhat_fail));
            } else if diag.chi_r_hat > gates.max_rhat_warn {
                warnings.push(format!("chi R-hat {:.3} > {:.2}", diag.chi_r_hat, gates.max_rhat_warn));
            }
        }
        let frac = diag.chi_ess_bulk / total_draws.max(1) as f64;
        if frac < gates.min_ess_bulk_frac_fail {
            failures.push(format!("chi bulk ESS fraction {frac:.4} < {:.2}", gates.min_ess_bulk_frac_fail));
        } else if frac < gates.min_ess_bulk_frac_warn {
            warnings.push(format!("chi bulk ESS fraction {frac:.4} < {:.2}", gates.min_ess_bulk_frac_warn));
        }
    }
    if diag.jump_acceptance_rate.is_finite() && diag.jump_acceptance_rate < gates.min_jump_acceptance_warn {
        warnings.push(format!(
            "only {:.2}% of dimension changes accepted",
            100.0 * diag.jump_acceptance_rate
        ));
    }

    let status = if !failures.is_empty() {
        QualityStatus::Fail
    } else if !warnings.is_empty() {
        QualityStatus::Warn
    } else {
        QualityStatus::Ok
    };
    QualitySummary { status, warnings, failures, enabled, total_draws }
}

/// Split every chain in half and trim the halves to a common length.
///
/// `None` when a chain is shorter than 4 or a half shorter than `min_half`.
fn split_halves<'a>(chains: &[&'a [f64]], min_half: usize) -> Option<Vec<&'a [f64]>> {
    if chains.is_empty() || chains.iter().any(|c| c.len() < 4) {
        return None;
    }
    let halves: Vec<&[f64]> = chains
        .iter()
        .flat_map(|c| {
            let (a, b) = c.split_at(c.len() / 2);
            [a, b]
        })
        .collect();
    let len = halves.iter().map(|h| h.len()).min()?;
    (len >= min_half).then(|| halves.into_iter().map(|h| &h[..len]).collect())
}

fn mean_and_var(chain: &[f64]) -> (f64, f64) {
    let n = chain.len() as f64;
    let mean = chain.iter().sum::<f64>() / n;
    let var = chain.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / (n.max(2.0) - 1.0);
    (mean, var)
}

/// `(var_hat_plus, W)` over equal-length chains.
fn pooled_variance(split: &[&[f64]]) -> (f64, f64) {
    let m = split.len() as f64;
    let n = split[0].len() as f64;
    let (means, vars): (Vec<f64>, Vec<f64>) = split.iter().map(|c| mean_and_var(c)).unzip();
    let grand = means.iter().sum::<f64>() / m;
    let b = means.iter().map(|mu| (mu - grand).powi(2)).sum::<f64>() * n / (m - 1.0);
    let w = vars.iter().sum::<f64>() / m;
    ((n - 1.0) / n * w + b / n, w)
}

/// Split R-hat of one quantity across chains.
///
/// Each chain is halved; `R-hat = sqrt(var_hat_plus / W)`. NaN for chains
/// shorter than 4 draws or with no within-chain variance.
pub fn r_hat(chains: &[&[f64]]) -> f64 {
    let Some(split) = split_halves(chains, 2) else {
        return f64::NAN;
    };
    let (var_hat_plus, w) = pooled_variance(&split);
    if w < 1e-30 { f64::NAN } else { (var_hat_plus / w).sqrt() }
}

fn sorted_draws(chains: &[&[f64]]) -> Vec<f64> {
    let mut all: Vec<f64> = chains.iter().flat_map(|c| c.iter().copied()).collect();
    all.sort_by(f64::total_cmp);
    all
}

fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let (lo, hi) = (pos.floor() as usize, pos.ceil() as usize);
    if lo == hi {
        return sorted[lo];
    }
    let f = pos - lo as f64;
    sorted[lo] * (1.0 - f) + sorted[hi] * f
}

/// Replace every draw by the normal quantile of its pooled average rank.
fn rank_normalize(chains: &[&[f64]]) -> Vec<Vec<f64>> {
    let normal = Normal::standard();
    let mut out: Vec<Vec<f64>> = chains.iter().map(|c| vec![0.0; c.len()]).collect();
    let mut flat: Vec<(f64, usize, usize)> = chains
        .iter()
        .enumerate()
        .flat_map(|(ci, c)| c.iter().enumerate().map(move |(ti, &x)| (x, ci, ti)))
        .collect();
    flat.sort_by(|a, b| a.0.total_cmp(&b.0));

    let n = flat.len() as f64;
    let mut first = 0usize;
    for ties in flat.chunk_by(|a, b| a.0 == b.0) {
        let rank = first as f64 + 0.5 * (ties.len() as f64 + 1.0);
        let z = normal.inverse_cdf(((rank - 0.5) / n).clamp(1e-12, 1.0 - 1e-12));
        for &(_, ci, ti) in ties {
            out[ci][ti] = z;
        }
        first += ties.len();
    }
    out
}

fn as_slices(chains: &[Vec<f64>]) -> Vec<&[f64]> {
    chains.iter().map(Vec::as_slice).collect()
}

/// Max of the rank-normalized and the folded rank-normalized split R-hat.
fn r_hat_rank_normalized_folded(chains: &[&[f64]]) -> f64 {
    if chains.is_empty() || chains.iter().any(|c| c.len() < 4) {
        return f64::NAN;
    }
    let all = sorted_draws(chains);
    let med = all[all.len() / 2];
    let folded: Vec<Vec<f64>> = chains.iter().map(|c| c.iter().map(|x| (x - med).abs()).collect()).collect();

    let r_rank = r_hat(&as_slices(&rank_normalize(chains)));
    let r_fold = r_hat(&as_slices(&rank_normalize(&as_slices(&folded))));
    r_rank.max(r_fold)
}

/// Effective sample size from variogram autocorrelations with Geyer's
/// initial monotone sequence, over split chains.
pub fn ess_bulk(chains: &[&[f64]]) -> f64 {
    let Some(split) = split_halves(chains, 4) else {
        return 0.0;
    };
    let n = split[0].len();
    let total_draws = (split.len() * n) as f64;
    let (var_hat_plus, _) = pooled_variance(&split);
    if !var_hat_plus.is_finite() || var_hat_plus < 1e-30 {
        return total_draws;
    }

    // rho_t = 1 - V_t / (2 var_hat_plus), V_t the mean squared lag-t difference.
    let mut rho: Vec<f64> = Vec::new();
    for lag in 1..n {
        let sum: f64 = split.iter().flat_map(|c| c.windows(lag + 1).map(|w| (w[0] - w[lag]).powi(2))).sum();
        let v = sum / (split.len() * (n - lag)) as f64;
        rho.push((1.0 - v / (2.0 * var_hat_plus)).clamp(-1.0, 1.0));
        if rho.len() % 2 == 0 && rho[rho.len() - 2] + rho[rho.len() - 1] < 0.0 {
            break;
        }
    }

    let mut tau = 1.0;
    let mut prev = f64::INFINITY;
    for pair in rho.chunks_exact(2) {
        let gamma = pair[0] + pair[1];
        if gamma < 0.0 {
            break;
        }
        prev = prev.min(gamma);
        tau += 2.0 * prev;
    }
    if !tau.is_finite() || tau <= 0.0 {
        return total_draws;
    }
    (total_draws / tau).clamp(1.0, total_draws)
}

/// Tail ESS: the smaller ESS of the indicator chains `x <= q05` and `x >= q95`.
pub fn ess_tail(chains: &[&[f64]]) -> f64 {
    if chains.is_empty() {
        return 0.0;
    }
    let all = sorted_draws(chains);
    let (q05, q95) = (quantile_sorted(&all, 0.05), quantile_sorted(&all, 0.95));
    let indicator = |pred: &dyn Fn(f64) -> bool| -> Vec<Vec<f64>> {
        chains.iter().map(|c| c.iter().map(|&x| if pred(x) { 1.0 } else { 0.0 }).collect()).collect()
    };
    let lower = indicator(&|x| x <= q05);
    let upper = indicator(&|x| x >= q95);
    ess_bulk(&as_slices(&lower)).min(ess_bulk(&as_slices(&upper)))
}

/// Diagnostics of the post-burn-in `k` and chi traces of `result`.
pub fn compute_diagnostics(result: &SamplerResult) -> DiagnosticsResult {
    let burn_in = result.config.burn_in_length;
    let k_chains: Vec<Vec<f64>> =
        result.chains.iter().map(|c| c.k_trace.iter().skip(burn_in).map(|&k| k as f64).collect()).collect();
    let chi_chains: Vec<Vec<f64>> = result
        .chains
        .iter()
        .map(|c| c.chi_trace.iter().skip(burn_in).copied().filter(|x| x.is_finite()).collect())
        .collect();

    let attempted: usize = result.chains.iter().map(|c| c.jumps_attempted).sum();
    let accepted: usize = result.chains.iter().map(|c| c.jumps_accepted).sum();

    let (k_refs, chi_refs) = (as_slices(&k_chains), as_slices(&chi_chains));

    DiagnosticsResult {
        k_r_hat: r_hat_rank_normalized_folded(&k_refs),
        k_ess_bulk: ess_bulk(&as_slices(&rank_normalize(&k_refs))),
        chi_r_hat: r_hat_rank_normalized_folded(&chi_refs),
        chi_ess_bulk: ess_bulk(&as_slices(&rank_normalize(&chi_refs))),
        chi_ess_tail: ess_tail(&chi_refs),
        jump_acceptance_rate: if attempted > 0 { accepted as f64 / attempted as f64 } else { f64::NAN },
        draws_per_chain: k_chains.iter().map(Vec::len).collect(),
    }
}
