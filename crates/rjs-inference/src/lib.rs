//! # rjs-inference
//!
//! Reversible-jump MCMC with particle-swarm coupling between chains.
//!
//! This crate provides:
//! - Within-model Metropolis moves with annealing and covariance adaptation
//! - Birth/death moves on block-structured parameter vectors
//! - Delayed rejection, optionally with helper threads
//! - A swarm coordinator that lets concurrent chains pull towards each other
//!
//! ## Architecture
//!
//! The engine only talks to a user posterior through the [`LikelihoodModel`]
//! trait, and to other chains only through a [`SwarmHandle`].

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Covariance adaptation, rolling acceptance and stuck-chain recovery.
pub mod adapt;
/// Annealing schedule and Metropolis acceptance.
pub mod anneal;
/// Default birth/death moves.
pub mod birth_death;
/// Chain output and the multi-chain runner.
pub mod chain;
/// Run configuration.
pub mod config;
/// Delayed-rejection cascade.
pub mod delayed_rejection;
/// MCMC diagnostics: split R-hat, bulk/tail ESS.
pub mod diagnostics;
/// Delayed-rejection helper threads.
pub mod dr_pool;
/// The reversible-jump chain.
pub mod engine;
/// Likelihood contract.
pub mod likelihood;
/// Multivariate normal proposals.
pub mod proposal;
/// Swarm coordinator.
pub mod swarm;
/// Swarm communication topologies.
pub mod topology;
/// Synthetic likelihoods.
pub mod toy;

pub use chain::{BestFit, ChainOutput, ModelTrace, SamplerResult, run_chain, sample_rjmcmc};
pub use config::{DelayedRejectionConfig, RunConfig, SwarmFunction};
pub use diagnostics::{DiagnosticsResult, QualityGates, QualitySummary, compute_diagnostics, quality_summary};
pub use engine::{ModelState, RjChain};
pub use likelihood::{JumpProposal, LikelihoodModel, chi_of};
pub use swarm::{SwarmCoordinator, SwarmHandle, SwarmRecord};
pub use topology::Topology;
