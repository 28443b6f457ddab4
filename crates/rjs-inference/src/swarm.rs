//! Swarm coordinator: best-fit exchange between concurrently running chains.
//!
//! Each chain owns a [`SwarmHandle`]. `report` writes the chain's latest point
//! into its own slot; `sync` publishes progress, merges the chain best into the
//! global best and refreshes the handle's view of its neighbours. No call ever
//! waits for another chain beyond one short critical section.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use rand::Rng;
use rjs_core::{BlockLayout, Error, Result};
use serde::{Deserialize, Serialize};

use crate::topology::{Topology, clique_of, default_clique_size};

/// One chain's published point, padded with NaN to a common length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmRecord {
    /// Parameter vector padded to the coordinator's length.
    pub param: Vec<f64>,
    /// Chi of `param` (smaller is better).
    pub chi: f64,
    /// Model index of `param`.
    pub k: usize,
}

impl SwarmRecord {
    /// Placeholder with `chi = +inf`.
    pub fn empty(padded_len: usize) -> Self {
        Self { param: vec![f64::NAN; padded_len], chi: f64::INFINITY, k: 0 }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared state of the swarm.
pub struct SwarmCoordinator {
    topology: Topology,
    layout: BlockLayout,
    padded_len: usize,
    clique_size: usize,
    iteration_cap: Option<u64>,
    slots: Vec<Mutex<SwarmRecord>>,
    group_bests: Vec<Mutex<SwarmRecord>>,
    global_best: Mutex<SwarmRecord>,
    iterations: Vec<AtomicU64>,
    stop: AtomicBool,
}

impl SwarmCoordinator {
    /// Create a coordinator for `n_chains` chains.
    ///
    /// `padded_len` must hold the longest vector (`layout.param_len(k_max)`).
    /// `clique_size` defaults to `round(sqrt(n_chains))`.
    pub fn new(
        topology: Topology,
        n_chains: usize,
        layout: BlockLayout,
        padded_len: usize,
        clique_size: Option<usize>,
        iteration_cap: Option<u64>,
    ) -> Result<Self> {
        if n_chains == 0 {
            return Err(Error::Validation("swarm needs at least one chain".to_string()));
        }
        layout.validate()?;
        let clique_size = clique_size.unwrap_or_else(|| default_clique_size(n_chains)).max(1);
        let n_groups = n_chains.div_ceil(clique_size);
        Ok(Self {
            topology,
            layout,
            padded_len,
            clique_size,
            iteration_cap,
            slots: (0..n_chains).map(|_| Mutex::new(SwarmRecord::empty(padded_len))).collect(),
            group_bests: (0..n_groups).map(|_| Mutex::new(SwarmRecord::empty(padded_len))).collect(),
            global_best: Mutex::new(SwarmRecord::empty(padded_len)),
            iterations: (0..n_chains).map(|_| AtomicU64::new(0)).collect(),
            stop: AtomicBool::new(false),
        })
    }

    /// Number of chains.
    pub fn n_chains(&self) -> usize {
        self.slots.len()
    }

    /// Communication topology.
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Handle for `chain_id`. Each chain must use exactly one handle.
    pub fn handle(&self, chain_id: usize) -> SwarmHandle<'_> {
        let neighbours = self.topology.neighbours(chain_id, self.n_chains(), self.clique_size);
        SwarmHandle {
            coordinator: self,
            chain_id,
            neighbours,
            view: Vec::new(),
            best: SwarmRecord::empty(self.padded_len),
            global_best: SwarmRecord::empty(self.padded_len),
            iteration: 0,
            stopped: false,
        }
    }

    /// Ask every chain to stop at its next sync.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// `true` once a stop was requested or the iteration cap was reached.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Snapshot of the global best.
    pub fn global_best(&self) -> SwarmRecord {
        lock(&self.global_best).clone()
    }

    /// Sum of the last published iteration counters.
    pub fn total_iterations(&self) -> u64 {
        self.iterations.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    fn pad(&self, param: &[f64]) -> Vec<f64> {
        let mut out = vec![f64::NAN; self.padded_len.max(param.len())];
        out[..param.len()].copy_from_slice(param);
        out
    }
}

fn merge_min(slot: &Mutex<SwarmRecord>, candidate: &SwarmRecord) {
    let mut g = lock(slot);
    if candidate.chi < g.chi {
        *g = candidate.clone();
    }
}

/// One chain's view of the swarm.
pub struct SwarmHandle<'a> {
    coordinator: &'a SwarmCoordinator,
    chain_id: usize,
    neighbours: Vec<usize>,
    view: Vec<SwarmRecord>,
    best: SwarmRecord,
    global_best: SwarmRecord,
    iteration: u64,
    stopped: bool,
}

impl SwarmHandle<'_> {
    /// Chain id of this handle.
    pub fn chain_id(&self) -> usize {
        self.chain_id
    }

    /// Records seen at the last sync, excluding this chain's own.
    pub fn view(&self) -> &[SwarmRecord] {
        &self.view
    }

    /// Global best copied at the last sync.
    pub fn global_best(&self) -> &SwarmRecord {
        &self.global_best
    }

    /// Best point reported through this handle.
    pub fn best(&self) -> &SwarmRecord {
        &self.best
    }

    /// `true` once the stop flag was observed at a sync.
    pub fn should_stop(&self) -> bool {
        self.stopped
    }

    /// Publish the chain's current point and count one iteration.
    pub fn report(&mut self, param: &[f64], chi: f64, k: usize) {
        let record = SwarmRecord { param: self.coordinator.pad(param), chi, k };
        if chi < self.best.chi {
            self.best = record.clone();
        }
        *lock(&self.coordinator.slots[self.chain_id]) = record;
        self.iteration += 1;
    }

    /// Exchange state with the coordinator; returns the global iteration sum.
    pub fn sync(&mut self) -> u64 {
        let c = self.coordinator;
        c.iterations[self.chain_id].store(self.iteration, Ordering::SeqCst);
        merge_min(&c.global_best, &self.best);

        self.view.clear();
        for &j in &self.neighbours {
            self.view.push(lock(&c.slots[j]).clone());
        }
        if c.topology == Topology::Cliques {
            merge_min(&c.group_bests[clique_of(self.chain_id, c.clique_size)], &self.best);
            let best_of_groups = c
                .group_bests
                .iter()
                .map(|g| lock(g).clone())
                .min_by(|a, b| a.chi.total_cmp(&b.chi));
            if let Some(r) = best_of_groups {
                self.view.push(r);
            }
        }
        self.global_best = c.global_best();

        let total = c.total_iterations();
        if c.iteration_cap.is_some_and(|cap| total >= cap) {
            c.request_stop();
        }
        if c.stop_requested() {
            self.stopped = true;
        }
        total
    }

    fn valid_len(&self, r: &SwarmRecord) -> usize {
        self.coordinator.layout.param_len(r.k).min(r.param.len())
    }

    /// Normalized inverse-chi weights of finite-chi view records.
    fn weights(&self) -> Vec<(usize, f64)> {
        let finite: Vec<(usize, f64)> =
            self.view.iter().enumerate().filter(|(_, r)| r.chi.is_finite()).map(|(i, r)| (i, r.chi)).collect();
        if finite.is_empty() {
            return finite;
        }
        let min_chi = finite.iter().map(|&(_, c)| c).fold(f64::INFINITY, f64::min);
        let shift = if min_chi <= 0.0 { 1.0 - min_chi } else { 0.0 };
        let inv: Vec<(usize, f64)> = finite.iter().map(|&(i, c)| (i, 1.0 / (c + shift))).collect();
        let total: f64 = inv.iter().map(|&(_, w)| w).sum();
        inv.into_iter().map(|(i, w)| (i, w / total)).collect()
    }

    /// Inverse-chi weighted pull `sum_i w_i * (own - other_i) * u`.
    ///
    /// When any finite chi is `<= 0`, every chi is shifted by `1 - min_chi`
    /// before inverting so the weights stay positive.
    ///
    /// Callers subtract the result from their candidate. Records longer than
    /// `own_param` contribute only their first block and the shared tail;
    /// shorter ones are skipped. Zero when no other record has finite chi.
    pub fn pull_vector(&self, own_param: &[f64], rng: &mut impl Rng) -> Vec<f64> {
        let n = own_param.len();
        let mut pull = vec![0.0; n];
        let weights = self.weights();
        if weights.is_empty() {
            return pull;
        }
        let u: f64 = rng.random();
        let layout = &self.coordinator.layout;
        let shared = layout.shared_len.min(n);
        for (i, w) in weights {
            let r = &self.view[i];
            let len = self.valid_len(r);
            if len == n {
                for (p, (a, b)) in pull.iter_mut().zip(own_param.iter().zip(&r.param)) {
                    *p += w * (a - b) * u;
                }
            } else if len > n {
                for s in 0..layout.block_len.min(n - shared) {
                    pull[s] += w * (own_param[s] - r.param[s]) * u;
                }
                for t in 0..shared {
                    pull[n - shared + t] += w * (own_param[n - shared + t] - r.param[len - shared + t]) * u;
                }
            }
        }
        if pull.iter().all(|x| x.is_finite()) { pull } else { vec![0.0; n] }
    }

    /// Inverse-chi weight carried by records longer than `own_len`.
    ///
    /// `None` when no record has finite chi.
    pub fn birth_pressure(&self, own_len: usize) -> Option<f64> {
        let weights = self.weights();
        if weights.is_empty() {
            return None;
        }
        Some(weights.iter().filter(|&&(i, _)| self.valid_len(&self.view[i]) > own_len).map(|&(_, w)| w).sum())
    }
}
