//! Chain output and the multi-chain swarm runner.

use rjs_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::dr_pool::DrPool;
use crate::engine::RjChain;
use crate::likelihood::LikelihoodModel;
use crate::swarm::{SwarmCoordinator, SwarmHandle};

/// A parameter vector with its chi and model index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestFit {
    /// Parameter vector (unpadded).
    pub param: Vec<f64>,
    /// Chi (smaller is better).
    pub chi: f64,
    /// Model index.
    pub k: usize,
}

/// Traces recorded while a chain sat at one model index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTrace {
    /// Model index.
    pub k: usize,
    /// Recorded draws.
    pub draws: Vec<Vec<f64>>,
    /// Chain iteration of each draw.
    pub draw_iterations: Vec<usize>,
    /// Chi of each draw.
    pub chi: Vec<f64>,
    /// Rolling acceptance rate per iteration at this model.
    pub acceptance_rate: Vec<f64>,
    /// Bayes factors of dimension changes attempted from this model.
    pub bayes_factors: Vec<f64>,
    /// Diagonal of the final proposal covariance.
    pub cov_diagonal: Vec<f64>,
    /// Accepted within-model moves.
    pub n_accepted: usize,
    /// Rejected within-model moves.
    pub n_rejected: usize,
}

/// Everything one chain produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainOutput {
    /// Chain index.
    pub chain_id: usize,
    /// RNG seed (`seed + chain_id`).
    pub seed: u64,
    /// Completed iterations.
    pub iterations: usize,
    /// Model index per iteration.
    pub k_trace: Vec<usize>,
    /// Current chi per iteration.
    pub chi_trace: Vec<f64>,
    /// Visited models.
    pub models: Vec<ModelTrace>,
    /// Best point of the chain.
    pub best: BestFit,
    /// Final birth rate.
    pub birth_rate: f64,
    /// Dimension changes evaluated.
    pub jumps_attempted: usize,
    /// Dimension changes accepted.
    pub jumps_accepted: usize,
}

/// Result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerResult {
    /// Configuration the run used.
    pub config: RunConfig,
    /// Per-chain output, ordered by chain id.
    pub chains: Vec<ChainOutput>,
    /// Best point across the swarm.
    pub global_best: Option<BestFit>,
    /// Iterations summed over chains.
    pub total_iterations: u64,
}

impl SamplerResult {
    /// Total number of post-burn-in iterations across all chains.
    pub fn total_draws(&self) -> usize {
        self.chains.iter().map(|c| c.iterations.saturating_sub(self.config.burn_in_length)).sum()
    }

    /// Posterior over model indices, `(k, probability)` for every `k` in range.
    ///
    /// Built from the per-iteration `k` traces, optionally skipping burn-in.
    pub fn model_probabilities(&self, discard_burn_in: bool) -> Vec<(usize, f64)> {
        let skip = if discard_burn_in { self.config.burn_in_length } else { 0 };
        let (k_min, k_max) = (self.config.k_min, self.config.k_max);
        let mut counts = vec![0usize; k_max + 1 - k_min];
        for chain in &self.chains {
            for &k in chain.k_trace.iter().skip(skip) {
                if (k_min..=k_max).contains(&k) {
                    counts[k - k_min] += 1;
                }
            }
        }
        let total: usize = counts.iter().sum();
        counts
            .iter()
            .enumerate()
            .map(|(i, &c)| (k_min + i, if total == 0 { 0.0 } else { c as f64 / total as f64 }))
            .collect()
    }

    /// Mean of `slot` over post-burn-in draws at model `k`, across chains.
    pub fn param_mean(&self, k: usize, slot: usize) -> Option<f64> {
        let mut sum = 0.0;
        let mut n = 0usize;
        for m in self.chains.iter().flat_map(|c| c.models.iter()).filter(|m| m.k == k) {
            for (d, &it) in m.draws.iter().zip(&m.draw_iterations) {
                if it >= self.config.burn_in_length
                    && let Some(&v) = d.get(slot)
                {
                    sum += v;
                    n += 1;
                }
            }
        }
        (n > 0).then(|| sum / n as f64)
    }

    /// Post-burn-in trace of `slot` at model `k`, one vector per chain.
    pub fn param_draws(&self, k: usize, slot: usize) -> Vec<Vec<f64>> {
        self.chains
            .iter()
            .map(|c| {
                c.models
                    .iter()
                    .filter(|m| m.k == k)
                    .flat_map(|m| m.draws.iter().zip(&m.draw_iterations))
                    .filter(|&(_, &it)| it >= self.config.burn_in_length)
                    .filter_map(|(d, _)| d.get(slot).copied())
                    .collect()
            })
            .collect()
    }
}

/// Run one chain against the swarm until its budget or the stop flag.
pub fn run_chain<M: LikelihoodModel>(
    model: &M,
    config: &RunConfig,
    chain_id: usize,
    handle: &mut SwarmHandle<'_>,
) -> Result<ChainOutput> {
    let seed = config.seed.wrapping_add(chain_id as u64);
    let mut chain = RjChain::new(model, config, chain_id, seed)?;
    let total = config.total_iterations();
    let sync_interval = config.sync_interval;
    let helpers = config.delayed_rejection.as_ref().filter(|dr| dr.helper_workers > 0);

    std::thread::scope(|s| {
        let mut pool = helpers.map(|dr| DrPool::spawn(s, model, dr.helper_workers, seed, dr.initial_scale));
        for _ in 0..total {
            chain.step(Some(&*handle), pool.as_mut());
            handle.report(chain.param(), chain.chi(), chain.k());
            if chain.iteration() % sync_interval == 0 {
                handle.sync();
                if handle.should_stop() {
                    log::debug!("chain {chain_id}: stop observed after {} iterations", chain.iteration());
                    break;
                }
            }
        }
        drop(pool);
    });
    handle.sync();
    Ok(chain.into_output())
}

/// Run `config.n_chains` swarm-coupled chains, one thread per chain.
///
/// Chain `i` is seeded with `seed + i`.
pub fn sample_rjmcmc<M: LikelihoodModel>(model: &M, config: &RunConfig) -> Result<SamplerResult> {
    use rayon::prelude::*;

    config.validate()?;
    let layout = model.layout();
    let coordinator = SwarmCoordinator::new(
        config.topology()?,
        config.n_chains,
        layout,
        config.padded_len(&layout),
        config.clique_size,
        config.iteration_cap,
    )?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.n_chains)
        .build()
        .map_err(|e| Error::Computation(format!("failed to build chain thread pool: {e}")))?;

    let chains: Vec<Result<ChainOutput>> = pool.install(|| {
        (0..config.n_chains)
            .into_par_iter()
            .map(|chain_id| {
                let mut handle = coordinator.handle(chain_id);
                let out = run_chain(model, config, chain_id, &mut handle);
                if out.is_err() {
                    coordinator.request_stop();
                }
                out
            })
            .collect()
    });
    let chains: Vec<ChainOutput> = chains.into_iter().collect::<Result<Vec<_>>>()?;

    // Chain bests can predate the first report, so fold them into the swarm best.
    let g = coordinator.global_best();
    let swarm_best = g.chi.is_finite().then(|| {
        let len = layout.param_len(g.k).min(g.param.len());
        BestFit { param: g.param[..len].to_vec(), chi: g.chi, k: g.k }
    });
    let global_best = chains
        .iter()
        .map(|c| c.best.clone())
        .chain(swarm_best)
        .filter(|b| b.chi.is_finite())
        .min_by(|a, b| a.chi.total_cmp(&b.chi));

    Ok(SamplerResult {
        config: config.clone(),
        chains,
        global_best,
        total_iterations: coordinator.total_iterations(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toy::{GaussianTarget, SyntheticBursts};

    fn small_config() -> RunConfig {
        RunConfig {
            burn_in_length: 100,
            max_iterations: 200,
            k_min: 1,
            k_max: 1,
            t_start: 1.0,
            chi_scaled_temperature: false,
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_multichain_deterministic() {
        let model = GaussianTarget::new(0.5, 1.0);
        // A lone chain has no neighbours, so the swarm never perturbs it.
        let cfg = RunConfig { n_chains: 1, seed: 9, ..small_config() };
        let r1 = sample_rjmcmc(&model, &cfg).unwrap();
        let r2 = sample_rjmcmc(&model, &cfg).unwrap();
        assert_eq!(r1.chains[0].chi_trace, r2.chains[0].chi_trace, "single chain should be deterministic");
    }

    #[test]
    fn test_multichain_structure() {
        let model = GaussianTarget::new(0.5, 1.0);
        let cfg = RunConfig { n_chains: 4, topology: "ring".into(), ..small_config() };
        let r = sample_rjmcmc(&model, &cfg).unwrap();
        assert_eq!(r.chains.len(), 4);
        for (i, c) in r.chains.iter().enumerate() {
            assert_eq!(c.chain_id, i);
            assert_eq!(c.seed, i as u64);
            assert_eq!(c.iterations, 300);
            assert_eq!(c.k_trace.len(), 300);
        }
        assert_eq!(r.total_iterations, 4 * 300);
        assert_eq!(r.total_draws(), 4 * 200);
        let best = r.global_best.as_ref().unwrap();
        assert!(r.chains.iter().all(|c| best.chi <= c.best.chi));
        assert_eq!(best.param.len(), 1);
    }

    #[test]
    fn test_iteration_cap_stops_chains() {
        let model = GaussianTarget::new(0.0, 1.0);
        let cfg = RunConfig { n_chains: 2, iteration_cap: Some(100), ..small_config() };
        let r = sample_rjmcmc(&model, &cfg).unwrap();
        assert!(r.chains.iter().any(|c| c.iterations < 300), "cap should cut the run short");
    }

    #[test]
    fn test_model_probabilities_and_means() {
        let model = SyntheticBursts::demo(2, 3);
        let cfg = RunConfig {
            burn_in_length: 50,
            max_iterations: 150,
            k_min: 1,
            k_max: 3,
            n_chains: 2,
            ..RunConfig::default()
        };
        let r = sample_rjmcmc(&model, &cfg).unwrap();
        let probs = r.model_probabilities(true);
        assert_eq!(probs.iter().map(|p| p.0).collect::<Vec<_>>(), vec![1, 2, 3]);
        let total: f64 = probs.iter().map(|p| p.1).sum();
        assert!((total - 1.0).abs() < 1e-9, "probabilities sum to {}", total);

        let visited_k = r.chains[0].k_trace[cfg.burn_in_length];
        let layout = model.layout();
        assert!(r.param_mean(visited_k, layout.age_slot).is_some());
        assert!(r.param_mean(visited_k, 10_000).is_none());
    }

    #[test]
    fn test_unknown_topology_fails_before_running() {
        let model = GaussianTarget::new(0.0, 1.0);
        let cfg = RunConfig { topology: "square".into(), ..small_config() };
        assert!(matches!(sample_rjmcmc(&model, &cfg), Err(Error::UnknownTopology(_))));
    }

    #[test]
    fn test_result_serializes_to_json() {
        let model = GaussianTarget::new(0.0, 1.0);
        let r = sample_rjmcmc(&model, &small_config()).unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"k_trace\""));
        assert!(json.contains("\"global_best\""));
    }
}
