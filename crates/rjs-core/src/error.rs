//! Error types for RJSwarm

use thiserror::Error;

/// RJSwarm error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error (e.g. a covariance that is not positive definite)
    #[error("Computation error: {0}")]
    Computation(String),

    /// No finite posterior was found while drawing starting points.
    #[error("no viable starting point for k={k} after {elapsed_secs:.1}s of redraws")]
    NoViableStart {
        /// Model index the chain tried to start in.
        k: usize,
        /// Wall-clock time spent redrawing.
        elapsed_secs: f64,
    },

    /// Unknown communication topology name
    #[error("unknown topology '{0}' (expected one of: all, ring, cliques, grid)")]
    UnknownTopology(String),

    /// Unknown swarm blending function name
    #[error("unknown swarm function '{0}' (expected one of: vanilla, hybrid, tuning)")]
    UnknownSwarmFunction(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_viable_start_message() {
        let e = Error::NoViableStart { k: 3, elapsed_secs: 60.0 };
        let msg = e.to_string();
        assert!(msg.contains("k=3"), "{msg}");
        assert!(msg.contains("60.0s"), "{msg}");
    }

    #[test]
    fn test_unknown_topology_message() {
        let e = Error::UnknownTopology("square".into());
        assert!(e.to_string().contains("'square'"));
    }
}
