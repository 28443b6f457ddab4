//! Communication graphs between swarm chains.

use std::fmt;
use std::str::FromStr;

use rjs_core::Error;
use serde::{Deserialize, Serialize};

/// Which chains a chain reads at sync time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Every other chain.
    All,
    /// Previous and next chain on a cycle.
    Ring,
    /// Members of a fixed group, plus the best of all group bests.
    Cliques,
    /// Four neighbours on a row-major torus.
    Grid,
}

impl FromStr for Topology {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Topology::All),
            "ring" => Ok(Topology::Ring),
            "cliques" => Ok(Topology::Cliques),
            "grid" => Ok(Topology::Grid),
            _ => Err(Error::UnknownTopology(s.to_string())),
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::All => write!(f, "all"),
            Topology::Ring => write!(f, "ring"),
            Topology::Cliques => write!(f, "cliques"),
            Topology::Grid => write!(f, "grid"),
        }
    }
}

/// `round(sqrt(n))`, at least one.
pub fn default_clique_size(n_chains: usize) -> usize {
    ((n_chains as f64).sqrt().round() as usize).max(1)
}

/// `(rows, cols)` of the grid holding `n_chains`, with `cols = ceil(sqrt(n))`.
pub fn grid_shape(n_chains: usize) -> (usize, usize) {
    if n_chains == 0 {
        return (0, 0);
    }
    let cols = (n_chains as f64).sqrt().ceil() as usize;
    (n_chains.div_ceil(cols), cols)
}

/// Group index of `chain_id` when groups hold `clique_size` consecutive chains.
pub fn clique_of(chain_id: usize, clique_size: usize) -> usize {
    chain_id / clique_size.max(1)
}

impl Topology {
    /// Neighbours of `chain_id`, excluding itself, in ascending order.
    pub fn neighbours(&self, chain_id: usize, n_chains: usize, clique_size: usize) -> Vec<usize> {
        let mut out: Vec<usize> = match self {
            Topology::All => (0..n_chains).collect(),
            Topology::Ring => {
                if n_chains < 2 {
                    Vec::new()
                } else {
                    vec![(chain_id + n_chains - 1) % n_chains, (chain_id + 1) % n_chains]
                }
            }
            Topology::Cliques => {
                let size = clique_size.max(1);
                let start = clique_of(chain_id, size) * size;
                (start..(start + size).min(n_chains)).collect()
            }
            Topology::Grid => {
                let (rows, cols) = grid_shape(n_chains);
                let (r, c) = (chain_id / cols.max(1), chain_id % cols.max(1));
                [
                    ((r + rows - 1) % rows, c),
                    ((r + 1) % rows, c),
                    (r, (c + cols - 1) % cols),
                    (r, (c + 1) % cols),
                ]
                .into_iter()
                .map(|(rr, cc)| rr * cols + cc)
                .filter(|&j| j < n_chains)
                .collect()
            }
        };
        out.retain(|&j| j != chain_id);
        out.sort_unstable();
        out.dedup();
        out
    }
}
