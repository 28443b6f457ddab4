//! # rjs-core
//!
//! Core types for RJSwarm: the error taxonomy and the block layout of
//! variable-dimension parameter vectors. Sampler logic lives in
//! `rjs-inference`, which depends on this crate and nothing above it.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error taxonomy.
pub mod error;
/// Block layout and model-index bounds.
pub mod types;

pub use error::{Error, Result};
pub use types::{BlockLayout, ModelBounds};
