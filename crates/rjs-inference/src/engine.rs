//! Reversible-jump chain: within-model moves, adaptation and dimension changes.
//!
//! One [`RjChain`] keeps a [`ModelState`] for every reachable model index.
//! Only the state at the current `k` advances; the others are a cache that a
//! dimension change lands in.

use std::time::{Duration, Instant};

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Exp1;
use rjs_core::{BlockLayout, Error, ModelBounds, Result};

use crate::adapt::{AdaptInput, RollingAcceptance, STUCK_CHECK_EVERY, Unstick, adaptation_active, detect_and_unstick};
use crate::anneal::{chi_scaled_start, metropolis_accept, temperature};
use crate::chain::{BestFit, ChainOutput, ModelTrace};
use crate::config::{RunConfig, SwarmFunction};
use crate::delayed_rejection::delayed_rejection;
use crate::dr_pool::{DrPool, accept_result};
use crate::likelihood::{LikelihoodModel, chi_of};
use crate::proposal::propose_with_recovery;
use crate::swarm::SwarmHandle;

/// Rolling acceptance band outside which the `tuning` swarm function pulls.
const TUNING_BAND: (f64, f64) = (0.235, 0.5);

/// Per-model chain state.
#[derive(Debug, Clone)]
pub struct ModelState {
    /// Model index.
    pub k: usize,
    /// Current parameter vector.
    pub param: Vec<f64>,
    /// Proposal covariance.
    pub cov: DMatrix<f64>,
    /// Chi of `param`.
    pub chi: f64,
    /// Smallest chi seen at this model.
    pub min_chi: f64,
    /// Chi per recorded draw.
    pub chi_history: Vec<f64>,
    /// Recorded draws; a rejection repeats the previous point.
    pub draws: Vec<Vec<f64>>,
    /// Chain iteration of each recorded draw.
    pub draw_iterations: Vec<usize>,
    /// Accepted within-model moves.
    pub n_accepted: usize,
    /// Rejected within-model moves.
    pub n_rejected: usize,
    /// Rolling acceptance window.
    pub rolling: RollingAcceptance,
    /// Rolling acceptance rate after each iteration at this model.
    pub acceptance_trace: Vec<f64>,
    /// Bayes factors of dimension changes attempted from this model.
    pub bayes_factors: Vec<f64>,
    /// `true` once the chain has been at this model.
    pub visited: bool,
}

impl ModelState {
    fn new(k: usize, param: Vec<f64>, cov: DMatrix<f64>, chi: f64) -> Self {
        Self {
            k,
            param,
            cov,
            chi,
            min_chi: chi,
            chi_history: Vec::new(),
            draws: Vec::new(),
            draw_iterations: Vec::new(),
            n_accepted: 0,
            n_rejected: 0,
            rolling: RollingAcceptance::default(),
            acceptance_trace: Vec::new(),
            bayes_factors: Vec::new(),
            visited: false,
        }
    }

    fn record(&mut self, iteration: usize) {
        self.draws.push(self.param.clone());
        self.draw_iterations.push(iteration);
        self.chi_history.push(self.chi);
    }

    fn into_trace(self) -> ModelTrace {
        ModelTrace {
            k: self.k,
            draws: self.draws,
            draw_iterations: self.draw_iterations,
            chi: self.chi_history,
            acceptance_rate: self.acceptance_trace,
            bayes_factors: self.bayes_factors,
            cov_diagonal: self.cov.diagonal().iter().copied().collect(),
            n_accepted: self.n_accepted,
            n_rejected: self.n_rejected,
        }
    }
}

fn draw_wait(mean: f64, rng: &mut impl Rng) -> f64 {
    let e: f64 = rng.sample(Exp1);
    e * mean
}

fn initial_point<M: LikelihoodModel>(
    model: &M,
    layout: &BlockLayout,
    k: usize,
    rng: &mut StdRng,
) -> Result<ModelState> {
    let (mut param, cov) = model.initialize_parameters(k, rng)?;
    let n = layout.param_len(k);
    if param.len() != n {
        return Err(Error::Validation(format!(
            "initialize_parameters(k={k}) returned {} values, expected {n}",
            param.len()
        )));
    }
    if cov.nrows() != n || cov.ncols() != n {
        return Err(Error::Validation(format!(
            "initialize_parameters(k={k}) returned a {}x{} covariance, expected {n}x{n}",
            cov.nrows(),
            cov.ncols()
        )));
    }
    layout.sort_blocks_by_age(&mut param);
    let chi = chi_of(model.log_posterior(&param, k));
    Ok(ModelState::new(k, param, cov, chi))
}

/// Reversible-jump chain over model indices `[k_min, k_max]`.
pub struct RjChain<'a, M: LikelihoodModel> {
    model: &'a M,
    config: RunConfig,
    swarm_function: SwarmFunction,
    layout: BlockLayout,
    bounds: ModelBounds,
    chain_id: usize,
    seed: u64,
    rng: StdRng,
    states: Vec<ModelState>,
    k: usize,
    iteration: usize,
    t_start: f64,
    temperature: f64,
    birth_rate: f64,
    jump_clock: usize,
    jump_wait: f64,
    jumps_attempted: usize,
    jumps_accepted: usize,
    k_trace: Vec<usize>,
    chi_trace: Vec<f64>,
    best: BestFit,
}

impl<'a, M: LikelihoodModel> RjChain<'a, M> {
    /// Initialize every model index and pick a random starting `k`.
    ///
    /// The starting point is redrawn until its chi is finite; after
    /// `init_timeout_secs` this fails with [`Error::NoViableStart`].
    pub fn new(model: &'a M, config: &RunConfig, chain_id: usize, seed: u64) -> Result<Self> {
        config.validate()?;
        let swarm_function = config.swarm_function()?;
        let bounds = config.bounds()?;
        let layout = model.layout();
        layout.validate()?;

        let mut rng = StdRng::seed_from_u64(seed);
        let started = Instant::now();
        let timeout = Duration::from_secs_f64(config.init_timeout_secs);

        let k0 = rng.random_range(bounds.k_min..=bounds.k_max);
        let mut states = Vec::with_capacity(bounds.len());
        for k in bounds.k_min..=bounds.k_max {
            states.push(initial_point(model, &layout, k, &mut rng)?);
        }
        let idx0 = bounds.index(k0);
        while !states[idx0].chi.is_finite() {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(Error::NoViableStart { k: k0, elapsed_secs: elapsed.as_secs_f64() });
            }
            states[idx0] = initial_point(model, &layout, k0, &mut rng)?;
        }
        states[idx0].visited = true;

        let best = BestFit { param: states[idx0].param.clone(), chi: states[idx0].chi, k: k0 };
        let jump_wait = draw_wait(config.jump_wait_initial, &mut rng);
        log::debug!("chain {chain_id}: starting at k={k0} with chi={:.4}", states[idx0].chi);

        Ok(Self {
            model,
            config: config.clone(),
            swarm_function,
            layout,
            bounds,
            chain_id,
            seed,
            rng,
            states,
            k: k0,
            iteration: 0,
            t_start: config.t_start,
            temperature: config.t_start.max(1.0),
            birth_rate: config.effective_birth_rate(),
            jump_clock: 0,
            jump_wait,
            jumps_attempted: 0,
            jumps_accepted: 0,
            k_trace: Vec::new(),
            chi_trace: Vec::new(),
            best,
        })
    }

    /// Current model index.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Current parameter vector.
    pub fn param(&self) -> &[f64] {
        &self.current().param
    }

    /// Current chi.
    pub fn chi(&self) -> f64 {
        self.current().chi
    }

    /// Completed iterations.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Temperature used by the last iteration.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Current birth rate (may be overridden by the swarm).
    pub fn birth_rate(&self) -> f64 {
        self.birth_rate
    }

    /// Best point seen by this chain.
    pub fn best(&self) -> &BestFit {
        &self.best
    }

    /// State of model index `k`.
    pub fn state(&self, k: usize) -> Option<&ModelState> {
        self.bounds.contains(k).then(|| &self.states[self.bounds.index(k)])
    }

    /// Model index per completed iteration.
    pub fn k_trace(&self) -> &[usize] {
        &self.k_trace
    }

    fn current(&self) -> &ModelState {
        &self.states[self.bounds.index(self.k)]
    }

    /// Sort `cand` and evaluate its chi at model `k`; non-finite entries give `+inf`.
    fn evaluate(&self, mut cand: Vec<f64>, k: usize) -> (Vec<f64>, f64) {
        if cand.iter().any(|v| !v.is_finite()) {
            return (cand, f64::INFINITY);
        }
        self.layout.sort_blocks_by_age(&mut cand);
        let chi = chi_of(self.model.log_posterior(&cand, k));
        (cand, chi)
    }

    fn note_best(&mut self, param: &[f64], chi: f64, k: usize) {
        if chi < self.best.chi {
            self.best = BestFit { param: param.to_vec(), chi, k };
        }
    }

    /// Whether the configured swarm function pulls at the current iteration.
    fn swarm_applies(&self, rolling_rate: f64) -> bool {
        let i = self.iteration;
        match self.swarm_function {
            SwarmFunction::Vanilla => i < self.config.burn_in_length || i % self.config.swarm_late_interval == 0,
            SwarmFunction::Hybrid => true,
            SwarmFunction::Tuning => rolling_rate < TUNING_BAND.0 || rolling_rate > TUNING_BAND.1,
        }
    }

    /// Apply the configured swarm blend to `cand` and evaluate the result.
    ///
    /// The swarm's birth pressure replaces the birth rate only when the
    /// pulled candidate is the one returned.
    fn blend(&mut self, handle: &SwarmHandle<'_>, cand: Vec<f64>, k: usize, rolling_rate: f64) -> (Vec<f64>, f64) {
        if !self.swarm_applies(rolling_rate) {
            return self.evaluate(cand, k);
        }
        let pressure = handle.birth_pressure(cand.len()).map(|p| p.clamp(0.2, 0.8));
        let pull = handle.pull_vector(&cand, &mut self.rng);
        let pulled: Vec<f64> = cand.iter().zip(&pull).map(|(c, p)| c - p).collect();
        let swarmed = self.evaluate(pulled, k);
        if self.swarm_function == SwarmFunction::Hybrid {
            let local = self.evaluate(cand, k);
            if !(swarmed.1 < local.1) {
                return local;
            }
        }
        if let Some(p) = pressure {
            self.birth_rate = p;
        }
        swarmed
    }

    /// Advance one iteration; returns `true` if a within-model move was accepted.
    ///
    /// `swarm` enables the configured swarm blend. `pool` supplies helper
    /// delayed-rejection results and receives the chain's current point.
    pub fn step(&mut self, swarm: Option<&SwarmHandle<'_>>, mut pool: Option<&mut DrPool>) -> bool {
        let i = self.iteration;
        let t = temperature(i, self.config.burn_in_length, self.t_start, self.config.t_stop, self.config.anneal_modes);
        self.temperature = t;
        let k = self.k;
        let idx = self.bounds.index(k);
        let model = self.model;

        let proposed = {
            let state = &mut self.states[idx];
            let rng = &mut self.rng;
            propose_with_recovery(&state.param, &mut state.cov, |x, c| model.propose(x, c, rng))
        };
        let rolling_rate = self.states[idx].rolling.rate();
        let (cand, chi_cand) = match (proposed, swarm) {
            (Some(c), Some(h)) => self.blend(h, c, k, rolling_rate),
            (Some(c), None) => self.evaluate(c, k),
            (None, _) => (Vec::new(), f64::INFINITY),
        };

        let chi_prev = self.states[idx].chi;
        let u: f64 = self.rng.random();
        let mut accepted = if !cand.is_empty() && metropolis_accept(chi_prev, chi_cand, t, u) {
            Some((cand.clone(), chi_cand))
        } else {
            None
        };

        if accepted.is_none()
            && !cand.is_empty()
            && let Some(dr) = self.config.delayed_rejection.as_ref().filter(|dr| dr.stages > 0)
        {
            let state = &self.states[idx];
            accepted = delayed_rejection(
                model,
                k,
                &state.param,
                -chi_prev,
                &cand,
                -chi_cand,
                &state.cov,
                t,
                dr.stages,
                dr.initial_scale,
                &mut self.rng,
            )
            .map(|acc| (acc.param, chi_of(acc.prob)));
        }
        if accepted.is_none()
            && let Some(pool) = pool.as_deref_mut()
        {
            for result in pool.drain() {
                let u: f64 = self.rng.random();
                if accepted.is_none()
                    && self.layout.n_blocks(result.param.len()) == Some(k)
                    && accept_result(&result, k, -chi_prev, -chi_cand, t, u)
                {
                    accepted = Some((result.param, chi_of(result.prob)));
                }
            }
        }

        let was_accepted = accepted.is_some();
        let state = &mut self.states[idx];
        if let Some((param, chi)) = accepted {
            state.param = param;
            state.chi = chi;
            state.n_accepted += 1;
            state.min_chi = state.min_chi.min(chi);
        } else {
            state.n_rejected += 1;
        }
        state.record(i);
        let rate = state.rolling.push(was_accepted);
        state.acceptance_trace.push(rate);

        if was_accepted
            && self.config.chi_scaled_temperature
            && let Some(ts) = chi_scaled_start(state.min_chi)
        {
            self.t_start = ts;
        }

        if adaptation_active(i, self.config.burn_in_length, rate) {
            let input = AdaptInput {
                iteration: i,
                burn_in_length: self.config.burn_in_length,
                acceptance_rate: rate,
                just_accepted: was_accepted,
                n_accepted: state.n_accepted,
                draws: &state.draws,
            };
            let cov = model.adapt_step(&input, &state.cov, k);
            state.cov = cov;
        }

        if i % STUCK_CHECK_EVERY == 0 {
            match detect_and_unstick(i, &state.acceptance_trace, &state.draws, self.layout.age_slot, &state.cov) {
                Unstick::Unchanged(_) => {}
                Unstick::Inflated(cov) => {
                    log::debug!("chain {}: stuck at k={k}, inflating proposal covariance", self.chain_id);
                    state.cov = cov;
                }
                Unstick::Reset(cov) => {
                    log::warn!("chain {}: proposal covariance collapsed at k={k}; reset to 0.1*I", self.chain_id);
                    state.cov = cov;
                }
            }
        }

        if let Some(pool) = pool {
            pool.publish(&state.param, -state.chi, &state.cov, k, t);
        }

        if was_accepted {
            let (param, chi) = (state.param.clone(), state.chi);
            self.note_best(&param, chi, k);
        }

        if self.config.birth_death && self.bounds.is_transdimensional() {
            self.jump_clock += 1;
            if self.jump_clock as f64 > self.jump_wait {
                self.attempt_jump();
                self.jump_clock = 0;
                self.jump_wait = draw_wait(self.config.jump_wait_mean, &mut self.rng);
            }
        }

        self.k_trace.push(self.k);
        self.chi_trace.push(self.chi());
        self.iteration += 1;
        was_accepted
    }

    /// Propose a birth or death and accept it by its Bayes factor.
    ///
    /// Returns `true` if the chain changed model index.
    pub fn attempt_jump(&mut self) -> bool {
        let k = self.k;
        let idx = self.bounds.index(k);
        let proposal = {
            let state = &self.states[idx];
            self.model.propose_birth_death(self.birth_rate, k, self.bounds, &state.param, &mut self.rng)
        };
        let Some(p) = proposal else {
            return false;
        };
        if !self.bounds.contains(p.to_k) || self.layout.param_len(p.to_k) != p.param.len() {
            log::warn!(
                "chain {}: dropping jump to k={} with {} values",
                self.chain_id,
                p.to_k,
                p.param.len()
            );
            return false;
        }
        self.jumps_attempted += 1;

        let (cand, chi_cand) = self.evaluate(p.param, p.to_k);
        let chi_cur = self.states[idx].chi;
        let bf = ((chi_cur - chi_cand) / 2.0).exp() * p.criterion;
        self.states[idx].bayes_factors.push(bf.min(f64::MAX));

        let u: f64 = self.rng.random();
        if !(bf > u) {
            return false;
        }

        let iteration = self.iteration;
        let landing = &mut self.states[self.bounds.index(p.to_k)];
        landing.param = cand;
        landing.chi = chi_cand;
        landing.min_chi = landing.min_chi.min(chi_cand);
        landing.visited = true;
        landing.record(iteration);
        let param = landing.param.clone();

        log::debug!("chain {}: k {k} -> {} (bayes factor {bf:.3e})", self.chain_id, p.to_k);
        self.k = p.to_k;
        self.jumps_accepted += 1;
        self.note_best(&param, chi_cand, p.to_k);
        true
    }

    /// Consume the chain and collect its traces.
    pub fn into_output(self) -> ChainOutput {
        let models: Vec<ModelTrace> =
            self.states.into_iter().filter(|s| s.visited).map(ModelState::into_trace).collect();
        ChainOutput {
            chain_id: self.chain_id,
            seed: self.seed,
            iterations: self.iteration,
            k_trace: self.k_trace,
            chi_trace: self.chi_trace,
            models,
            best: self.best,
            birth_rate: self.birth_rate,
            jumps_attempted: self.jumps_attempted,
            jumps_accepted: self.jumps_accepted,
        }
    }
}
