//! Run configuration.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use rjs_core::{BlockLayout, Error, ModelBounds, Result};
use serde::{Deserialize, Serialize};

use crate::topology::Topology;

/// How the swarm pull is blended into within-model candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwarmFunction {
    /// Every iteration during burn-in, every `swarm_late_interval`-th after.
    Vanilla,
    /// Only when the pulled candidate has the better log-posterior.
    Hybrid,
    /// Only when the rolling acceptance rate leaves `[0.235, 0.5]`.
    Tuning,
}

impl FromStr for SwarmFunction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vanilla" => Ok(SwarmFunction::Vanilla),
            "hybrid" => Ok(SwarmFunction::Hybrid),
            "tuning" => Ok(SwarmFunction::Tuning),
            _ => Err(Error::UnknownSwarmFunction(s.to_string())),
        }
    }
}

impl fmt::Display for SwarmFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwarmFunction::Vanilla => write!(f, "vanilla"),
            SwarmFunction::Hybrid => write!(f, "hybrid"),
            SwarmFunction::Tuning => write!(f, "tuning"),
        }
    }
}

/// Delayed-rejection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedRejectionConfig {
    /// Cascade stages run by the chain itself.
    #[serde(default = "default_dr_stages")]
    pub stages: usize,
    /// Covariance scale of the first stage.
    #[serde(default = "default_dr_initial_scale")]
    pub initial_scale: f64,
    /// Helper threads per chain (0 = none).
    #[serde(default)]
    pub helper_workers: usize,
}

impl Default for DelayedRejectionConfig {
    fn default() -> Self {
        Self { stages: default_dr_stages(), initial_scale: default_dr_initial_scale(), helper_workers: 0 }
    }
}

fn default_dr_stages() -> usize {
    10
}

fn default_dr_initial_scale() -> f64 {
    1e-3
}

/// Full sampler configuration.
///
/// Topology and swarm function are kept as strings so that unknown names
/// surface as [`Error::UnknownTopology`] / [`Error::UnknownSwarmFunction`]
/// from [`RunConfig::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Burn-in iterations (annealing and adaptation window).
    #[serde(default = "default_burn_in_length")]
    pub burn_in_length: usize,
    /// Iterations after burn-in.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Smallest model index.
    #[serde(default = "default_k_min")]
    pub k_min: usize,
    /// Largest model index.
    #[serde(default = "default_k_max")]
    pub k_max: usize,
    /// Probability of choosing a birth; clamped into `[0.2, 0.8]`.
    #[serde(default = "default_birth_rate")]
    pub birth_rate: f64,
    /// `all`, `ring`, `cliques` or `grid`.
    #[serde(default = "default_topology")]
    pub topology: String,
    /// `vanilla`, `hybrid` or `tuning`.
    #[serde(default = "default_swarm_function")]
    pub swarm_function: String,
    /// Number of chains.
    #[serde(default = "default_n_chains")]
    pub n_chains: usize,
    /// Base seed; chain `i` uses `seed + i`.
    #[serde(default)]
    pub seed: u64,
    /// Initial annealing temperature.
    #[serde(default = "default_t_start")]
    pub t_start: f64,
    /// Temperature the schedule decays towards.
    #[serde(default = "default_t_stop")]
    pub t_stop: f64,
    /// Number of annealing modes.
    #[serde(default = "default_anneal_modes")]
    pub anneal_modes: usize,
    /// Reset the start temperature from the best chi on every acceptance.
    #[serde(default = "default_true")]
    pub chi_scaled_temperature: bool,
    /// Iterations between swarm syncs.
    #[serde(default = "default_sync_interval")]
    pub sync_interval: usize,
    /// Pull interval after burn-in for the `vanilla` swarm function.
    #[serde(default = "default_swarm_late_interval")]
    pub swarm_late_interval: usize,
    /// Seconds allowed for finding a finite starting point.
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: f64,
    /// Mean of the first birth/death countdown.
    #[serde(default = "default_jump_wait_initial")]
    pub jump_wait_initial: f64,
    /// Mean of later birth/death countdowns.
    #[serde(default = "default_jump_wait_mean")]
    pub jump_wait_mean: f64,
    /// Enable dimension-changing moves.
    #[serde(default = "default_true")]
    pub birth_death: bool,
    /// Group size for the `cliques` topology (default `round(sqrt(n_chains))`).
    #[serde(default)]
    pub clique_size: Option<usize>,
    /// Global iteration budget summed over chains.
    #[serde(default)]
    pub iteration_cap: Option<u64>,
    /// Delayed rejection; off when absent.
    #[serde(default)]
    pub delayed_rejection: Option<DelayedRejectionConfig>,
}

fn default_burn_in_length() -> usize {
    5000
}
fn default_max_iterations() -> usize {
    100_000
}
fn default_k_min() -> usize {
    1
}
fn default_k_max() -> usize {
    16
}
fn default_birth_rate() -> f64 {
    0.5
}
fn default_topology() -> String {
    "all".to_string()
}
fn default_swarm_function() -> String {
    "vanilla".to_string()
}
fn default_n_chains() -> usize {
    1
}
fn default_t_start() -> f64 {
    3e5
}
fn default_t_stop() -> f64 {
    1.0
}
fn default_anneal_modes() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_sync_interval() -> usize {
    10
}
fn default_swarm_late_interval() -> usize {
    100
}
fn default_init_timeout_secs() -> f64 {
    60.0
}
fn default_jump_wait_initial() -> f64 {
    100.0
}
fn default_jump_wait_mean() -> f64 {
    200.0
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            burn_in_length: default_burn_in_length(),
            max_iterations: default_max_iterations(),
            k_min: default_k_min(),
            k_max: default_k_max(),
            birth_rate: default_birth_rate(),
            topology: default_topology(),
            swarm_function: default_swarm_function(),
            n_chains: default_n_chains(),
            seed: 0,
            t_start: default_t_start(),
            t_stop: default_t_stop(),
            anneal_modes: default_anneal_modes(),
            chi_scaled_temperature: true,
            sync_interval: default_sync_interval(),
            swarm_late_interval: default_swarm_late_interval(),
            init_timeout_secs: default_init_timeout_secs(),
            jump_wait_initial: default_jump_wait_initial(),
            jump_wait_mean: default_jump_wait_mean(),
            birth_death: true,
            clique_size: None,
            iteration_cap: None,
            delayed_rejection: None,
        }
    }
}

impl RunConfig {
    /// Parse JSON.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: RunConfig = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and validate a JSON config file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let cfg: RunConfig = serde_json::from_slice(&bytes)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parsed topology.
    pub fn topology(&self) -> Result<Topology> {
        self.topology.parse()
    }

    /// Parsed swarm function.
    pub fn swarm_function(&self) -> Result<SwarmFunction> {
        self.swarm_function.parse()
    }

    /// Model-index bounds.
    pub fn bounds(&self) -> Result<ModelBounds> {
        ModelBounds::new(self.k_min, self.k_max)
    }

    /// Birth rate clamped into `[0.2, 0.8]`.
    pub fn effective_birth_rate(&self) -> f64 {
        self.birth_rate.clamp(0.2, 0.8)
    }

    /// Iterations each chain runs (`burn_in_length + max_iterations`).
    pub fn total_iterations(&self) -> usize {
        self.burn_in_length + self.max_iterations
    }

    /// Length of a padded swarm record for `layout`.
    pub fn padded_len(&self, layout: &BlockLayout) -> usize {
        layout.param_len(self.k_max)
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        self.topology()?;
        self.swarm_function()?;
        self.bounds()?;
        if self.n_chains == 0 {
            return Err(Error::Validation("n_chains must be >= 1".to_string()));
        }
        if !self.birth_rate.is_finite() {
            return Err(Error::Validation("birth_rate must be finite".to_string()));
        }
        if !(self.t_start.is_finite() && self.t_stop.is_finite()) || self.t_stop <= 0.0 {
            return Err(Error::Validation(format!(
                "temperatures must be finite with t_stop > 0 (t_start={}, t_stop={})",
                self.t_start, self.t_stop
            )));
        }
        if self.sync_interval == 0 || self.swarm_late_interval == 0 {
            return Err(Error::Validation("sync_interval and swarm_late_interval must be > 0".to_string()));
        }
        if !(self.init_timeout_secs >= 0.0) {
            return Err(Error::Validation("init_timeout_secs must be >= 0".to_string()));
        }
        if !(self.jump_wait_initial > 0.0 && self.jump_wait_mean > 0.0)
            || !self.jump_wait_initial.is_finite()
            || !self.jump_wait_mean.is_finite()
        {
            return Err(Error::Validation("jump wait means must be finite and > 0".to_string()));
        }
        if self.clique_size == Some(0) {
            return Err(Error::Validation("clique_size must be >= 1".to_string()));
        }
        if let Some(dr) = &self.delayed_rejection
            && !(dr.initial_scale > 0.0 && dr.initial_scale.is_finite())
        {
            return Err(Error::Validation("delayed_rejection.initial_scale must be finite and > 0".to_string()));
        }
        Ok(())
    }
}
