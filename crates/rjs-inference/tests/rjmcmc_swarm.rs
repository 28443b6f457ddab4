//! End-to-end behaviour of the reversible-jump engine and the swarm runner.
//!
//! - Metropolis and annealing guarantees
//! - Block ordering across within-model moves and dimension changes
//! - Birth/death reversibility
//! - Swarm pull, unstick and stop semantics
//! - 1-D Gaussian recovery and multi-chain runs over every topology

use approx::assert_relative_eq;
use nalgebra::DMatrix;
use rand::{Rng, SeedableRng};
use rjs_core::{BlockLayout, Error, ModelBounds};
use rjs_inference::adapt::{Unstick, detect_and_unstick};
use rjs_inference::anneal::{log_subtract_exp, metropolis_accept, temperature};
use rjs_inference::birth_death::{birth, death};
use rjs_inference::config::DelayedRejectionConfig;
use rjs_inference::toy::{GaussianTarget, SyntheticBursts};
use rjs_inference::{LikelihoodModel, RjChain, RunConfig, SwarmCoordinator, Topology, sample_rjmcmc};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn bursts_config(n_chains: usize, topology: &str) -> RunConfig {
    RunConfig {
        burn_in_length: 150,
        max_iterations: 250,
        k_min: 1,
        k_max: 4,
        n_chains,
        topology: topology.to_string(),
        jump_wait_initial: 10.0,
        jump_wait_mean: 20.0,
        ..RunConfig::default()
    }
}

/// Fraction of post-burn-in iterations whose draw differs from the previous one.
fn post_burn_in_acceptance(draws: &[Vec<f64>], iterations: &[usize], burn_in: usize) -> f64 {
    let mut moves = 0usize;
    let mut total = 0usize;
    for i in 1..draws.len() {
        if iterations[i] >= burn_in {
            total += 1;
            if draws[i] != draws[i - 1] {
                moves += 1;
            }
        }
    }
    moves as f64 / total.max(1) as f64
}

// ---------------------------------------------------------------------------
// Acceptance and annealing
// ---------------------------------------------------------------------------

#[test]
fn improving_candidates_always_accepted() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);
    for _ in 0..1000 {
        let chi_prev: f64 = rng.random_range(-50.0..50.0);
        let chi_cand = chi_prev - rng.random_range(0.0..10.0);
        let t: f64 = rng.random_range(1.0..1e6);
        let u: f64 = rng.random();
        assert!(metropolis_accept(chi_prev, chi_cand, t, u));
    }
    assert!(metropolis_accept(3.0, 3.0, 1.0, 0.999_999));
}

#[test]
fn temperature_floor_holds() {
    for modes in [1, 2, 3, 4] {
        for i in 0..2000 {
            let t = temperature(i, 1000, 3e5, 1.0, modes);
            assert!(t >= 1.0, "T({i}) = {t} for modes={modes}");
            if i >= 1000 {
                assert_eq!(t, 1.0);
            }
        }
    }
    assert_eq!(temperature(0, 1000, 0.5, 0.1, 1), 1.0);
}

#[test]
fn log_subtract_exp_cases() {
    assert_relative_eq!(log_subtract_exp(5f64.ln(), 3f64.ln()).unwrap(), 2f64.ln(), epsilon = 1e-12);
    assert!(log_subtract_exp(3f64.ln(), 5f64.ln()).is_none());
    assert!(log_subtract_exp(1.0, 1.0).is_none());
}

// ---------------------------------------------------------------------------
// Block ordering and birth/death
// ---------------------------------------------------------------------------

#[test]
fn blocks_stay_sorted_over_1000_accepted_transitions() {
    let model = SyntheticBursts::demo(3, 21);
    let layout = model.layout();
    let cfg = RunConfig { k_min: 1, k_max: 5, burn_in_length: 5000, max_iterations: 5000, ..RunConfig::default() };
    let mut chain = RjChain::new(&model, &cfg, 0, 13).unwrap();

    let mut transitions = 0usize;
    let mut jumps = 0usize;
    for _ in 0..20_000 {
        if chain.step(None, None) {
            transitions += 1;
        }
        if chain.attempt_jump() {
            transitions += 1;
            jumps += 1;
        }
        assert!(layout.is_age_sorted(chain.param()), "unsorted blocks: {:?}", chain.param());
        assert_eq!(chain.param().len(), layout.param_len(chain.k()));
        if transitions >= 1000 {
            break;
        }
    }
    assert!(transitions >= 1000, "only {transitions} accepted transitions");
    assert!(jumps > 0, "expected at least one dimension change");
}

#[test]
fn birth_then_death_restores_k() {
    let model = SyntheticBursts::demo(2, 5);
    let layout = model.layout();
    let mut rng = rand::rngs::StdRng::seed_from_u64(8);
    let mut checked = 0;
    for _ in 0..50 {
        let (mut start, _) = model.initialize_parameters(2, &mut rng).unwrap();
        layout.sort_blocks_by_age(&mut start);
        let Some(born) = birth(&model, &layout, 0.5, 2, &start, &mut rng) else {
            continue;
        };
        assert_eq!(born.to_k, 3);
        assert!(layout.is_age_sorted(&born.param));
        let died = death(&layout, 0.5, 3, 2, &born.param, &mut rng).expect("death from k=3 with k_min=2");
        assert_eq!(died.to_k, 2);
        assert_eq!(died.param.len(), layout.param_len(2));
        assert!(layout.is_age_sorted(&died.param));
        checked += 1;
    }
    assert!(checked > 10);
}

#[test]
fn forced_birth_at_k_min() {
    let model = SyntheticBursts::demo(2, 5);
    let bounds = ModelBounds::new(1, 3).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(2);
    let (start, _) = model.initialize_parameters(1, &mut rng).unwrap();
    for _ in 0..20 {
        if let Some(p) = model.propose_birth_death(0.2, 1, bounds, &start, &mut rng) {
            assert_eq!(p.to_k, 2);
        }
    }
}

// ---------------------------------------------------------------------------
// Swarm and stuck-chain recovery
// ---------------------------------------------------------------------------

#[test]
fn swarm_pull_zero_when_others_infinite() {
    let c = SwarmCoordinator::new(Topology::Ring, 3, BlockLayout::scalar(), 2, None, None).unwrap();
    let mut h0 = c.handle(0);
    let mut h1 = c.handle(1);
    let mut h2 = c.handle(2);
    h1.report(&[1.0, 2.0], f64::INFINITY, 2);
    h2.report(&[3.0], f64::INFINITY, 1);
    h0.report(&[0.0, 0.0], 1.0, 2);
    h0.sync();
    let mut rng = rand::rngs::StdRng::seed_from_u64(1);
    assert_eq!(h0.pull_vector(&[0.0, 0.0], &mut rng), vec![0.0, 0.0]);
}

#[test]
fn unstick_scales_by_exactly_ten() {
    let acc = vec![0.0; 2000];
    let history = vec![vec![0.3, 0.5, 1.0]; 1500];
    let cov = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![0.2, 0.3, 0.4]));
    match detect_and_unstick(100, &acc, &history, 1, &cov) {
        Unstick::Inflated(m) => assert_eq!(m, &cov * 10.0),
        other => panic!("expected inflation, got {other:?}"),
    }
    let tiny = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![1e-12, 0.3, 0.4]));
    match detect_and_unstick(100, &acc, &history, 1, &tiny) {
        Unstick::Reset(m) => assert_eq!(m, DMatrix::<f64>::identity(3, 3) * 0.1),
        other => panic!("expected reset, got {other:?}"),
    }
    assert!(!detect_and_unstick(101, &acc, &history, 1, &cov).changed());
}

// ---------------------------------------------------------------------------
// End-to-end runs
// ---------------------------------------------------------------------------

#[test]
fn gaussian_recovery_single_model() {
    let x_star = 1.5;
    let model = GaussianTarget::new(x_star, 4.0);
    let cfg = RunConfig {
        burn_in_length: 1000,
        max_iterations: 4000,
        k_min: 1,
        k_max: 1,
        t_start: 1.0,
        chi_scaled_temperature: false,
        seed: 2024,
        ..RunConfig::default()
    };
    let result = sample_rjmcmc(&model, &cfg).unwrap();
    assert_eq!(result.chains.len(), 1);
    assert_eq!(result.chains[0].iterations, 5000);

    let mean = result.param_mean(1, 0).unwrap();
    assert!((mean - x_star).abs() < 0.1, "posterior mean {mean} vs {x_star}");

    let trace = &result.chains[0].models[0];
    let rate = post_burn_in_acceptance(&trace.draws, &trace.draw_iterations, cfg.burn_in_length);
    assert!((0.2..=0.5).contains(&rate), "post-burn-in acceptance rate {rate}");
    assert_eq!(result.model_probabilities(true), vec![(1, 1.0)]);
}

#[test]
fn multichain_runs_on_every_topology() {
    let model = SyntheticBursts::demo(2, 3);
    for topology in ["all", "ring", "cliques", "grid"] {
        let cfg = bursts_config(5, topology);
        let result = sample_rjmcmc(&model, &cfg).unwrap_or_else(|e| panic!("{topology}: {e}"));
        assert_eq!(result.chains.len(), 5);
        let best = result.global_best.as_ref().expect("global best");
        for c in &result.chains {
            assert_eq!(c.iterations, 400, "{topology}");
            assert!(best.chi <= c.best.chi, "{topology}: global best above a chain best");
            assert!(c.k_trace.iter().all(|k| (1..=4).contains(k)));
            for m in &c.models {
                for d in &m.draws {
                    assert!(model.layout().is_age_sorted(d));
                }
            }
        }
        assert_eq!(best.param.len(), model.layout().param_len(best.k));
    }
}

#[test]
fn swarm_functions_run() {
    let model = SyntheticBursts::demo(2, 9);
    for f in ["vanilla", "hybrid", "tuning"] {
        let cfg = RunConfig { swarm_function: f.to_string(), ..bursts_config(3, "all") };
        let result = sample_rjmcmc(&model, &cfg).unwrap_or_else(|e| panic!("{f}: {e}"));
        assert!(result.global_best.is_some(), "{f}");
    }
}

#[test]
fn iteration_cap_stops_every_chain() {
    let model = GaussianTarget::new(0.0, 1.0);
    let cfg = RunConfig {
        burn_in_length: 1000,
        max_iterations: 10_000,
        k_max: 1,
        n_chains: 3,
        iteration_cap: Some(600),
        ..RunConfig::default()
    };
    let result = sample_rjmcmc(&model, &cfg).unwrap();
    for c in &result.chains {
        assert!(c.iterations < 11_000, "chain {} ran to completion", c.chain_id);
    }
    assert!(result.total_iterations >= 600);
}

#[test]
fn delayed_rejection_with_helpers_runs() {
    let model = SyntheticBursts::demo(2, 4);
    let cfg = RunConfig {
        delayed_rejection: Some(DelayedRejectionConfig { stages: 3, initial_scale: 1e-3, helper_workers: 2 }),
        ..bursts_config(2, "ring")
    };
    let result = sample_rjmcmc(&model, &cfg).unwrap();
    for c in &result.chains {
        assert_eq!(c.iterations, 400);
        let accepted: usize = c.models.iter().map(|m| m.n_accepted).sum();
        assert!(accepted > 0);
    }
}

#[test]
fn infeasible_model_reports_no_viable_start() {
    struct Impossible;
    impl LikelihoodModel for Impossible {
        fn layout(&self) -> BlockLayout {
            BlockLayout::scalar()
        }
        fn slot_ranges(&self) -> Vec<(f64, f64)> {
            vec![(0.0, 1.0)]
        }
        fn initialize_parameters(
            &self,
            k: usize,
            _rng: &mut impl Rng,
        ) -> rjs_core::Result<(Vec<f64>, DMatrix<f64>)> {
            Ok((vec![0.5; k], DMatrix::identity(k, k)))
        }
        fn log_posterior(&self, _param: &[f64], _k: usize) -> f64 {
            f64::NAN
        }
        fn log_prior(&self, _param: &[f64], _k: usize) -> f64 {
            0.0
        }
    }
    let cfg = RunConfig { init_timeout_secs: 0.05, n_chains: 2, ..RunConfig::default() };
    match sample_rjmcmc(&Impossible, &cfg) {
        Err(Error::NoViableStart { .. }) => {}
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("expected NoViableStart"),
    }
}

#[test]
fn unknown_topology_is_rejected_before_sampling() {
    let model = GaussianTarget::new(0.0, 1.0);
    let cfg = RunConfig { topology: "hexagon".into(), ..RunConfig::default() };
    assert!(matches!(sample_rjmcmc(&model, &cfg), Err(Error::UnknownTopology(_))));
}
