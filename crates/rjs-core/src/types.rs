//! Parameter-vector layout shared by the engine and likelihood objects.
//!
//! A parameter vector for model index `k` is a flat arena of `k` fixed-size
//! blocks followed by a tail of slots shared by all blocks:
//!
//! ```text
//! [ b0s0 b0s1 b0s2 | b1s0 b1s1 b1s2 | ... | b(k-1)s2 | shared_0 .. shared_m ]
//! ```
//!
//! Birth and death moves are index-range operations on this arena.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Block structure of a parameter vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLayout {
    /// Slots per block (3 for metallicity, age, weight).
    pub block_len: usize,
    /// Index of the age slot within a block. Blocks are kept sorted by it.
    pub age_slot: usize,
    /// Index of the weight slot within a block.
    pub weight_slot: usize,
    /// Trailing slots shared by all blocks (dust/LOSVD extension).
    pub shared_len: usize,
}

impl Default for BlockLayout {
    fn default() -> Self {
        Self { block_len: 3, age_slot: 1, weight_slot: 2, shared_len: 0 }
    }
}

impl BlockLayout {
    /// Layout with a single slot per block and no shared tail.
    pub fn scalar() -> Self {
        Self { block_len: 1, age_slot: 0, weight_slot: 0, shared_len: 0 }
    }

    /// Check that slot indices fit inside a block.
    pub fn validate(&self) -> Result<()> {
        if self.block_len == 0 {
            return Err(Error::Validation("block_len must be > 0".to_string()));
        }
        if self.age_slot >= self.block_len || self.weight_slot >= self.block_len {
            return Err(Error::Validation(format!(
                "age_slot ({}) and weight_slot ({}) must be < block_len ({})",
                self.age_slot, self.weight_slot, self.block_len
            )));
        }
        Ok(())
    }

    /// Length of a parameter vector holding `k` blocks.
    #[inline]
    pub fn param_len(&self, k: usize) -> usize {
        self.block_len * k + self.shared_len
    }

    /// Number of blocks encoded in a vector of length `len`, if the length is valid.
    pub fn n_blocks(&self, len: usize) -> Option<usize> {
        let body = len.checked_sub(self.shared_len)?;
        if body % self.block_len == 0 { Some(body / self.block_len) } else { None }
    }

    /// Block `i` of `param`.
    #[inline]
    pub fn block<'a>(&self, param: &'a [f64], i: usize) -> &'a [f64] {
        &param[i * self.block_len..(i + 1) * self.block_len]
    }

    /// Shared tail of `param` (empty when `shared_len == 0`).
    pub fn shared<'a>(&self, param: &'a [f64]) -> &'a [f64] {
        &param[param.len() - self.shared_len..]
    }

    /// Age slot values in block order.
    pub fn ages(&self, param: &[f64]) -> Vec<f64> {
        self.slot_values(param, self.age_slot)
    }

    /// Weight slot values in block order.
    pub fn weights(&self, param: &[f64]) -> Vec<f64> {
        self.slot_values(param, self.weight_slot)
    }

    fn slot_values(&self, param: &[f64], slot: usize) -> Vec<f64> {
        let k = self.n_blocks(param.len()).unwrap_or(0);
        (0..k).map(|i| param[i * self.block_len + slot]).collect()
    }

    /// `true` if the age slots are non-decreasing in block order.
    pub fn is_age_sorted(&self, param: &[f64]) -> bool {
        self.ages(param).windows(2).all(|w| w[0] <= w[1])
    }

    /// Stable sort of whole blocks by the age slot; the shared tail is untouched.
    ///
    /// Returns `true` if the vector was permuted. NaN ages sort last.
    pub fn sort_blocks_by_age(&self, param: &mut [f64]) -> bool {
        let Some(k) = self.n_blocks(param.len()) else {
            return false;
        };
        if k < 2 || self.is_age_sorted(param) {
            return false;
        }
        let mut order: Vec<usize> = (0..k).collect();
        order.sort_by(|&a, &b| {
            let xa = param[a * self.block_len + self.age_slot];
            let xb = param[b * self.block_len + self.age_slot];
            xa.total_cmp(&xb)
        });
        let body: Vec<f64> = order
            .iter()
            .flat_map(|&i| param[i * self.block_len..(i + 1) * self.block_len].iter().copied())
            .collect();
        param[..body.len()].copy_from_slice(&body);
        true
    }

    /// Pad `param` to `padded_len` with NaN sentinels.
    pub fn pad(&self, param: &[f64], padded_len: usize) -> Vec<f64> {
        let mut out = vec![f64::NAN; padded_len.max(param.len())];
        out[..param.len()].copy_from_slice(param);
        out
    }
}

/// Allowed range of model indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelBounds {
    /// Smallest number of blocks.
    pub k_min: usize,
    /// Largest number of blocks.
    pub k_max: usize,
}

impl ModelBounds {
    /// Create bounds, rejecting `k_min == 0` and `k_min > k_max`.
    pub fn new(k_min: usize, k_max: usize) -> Result<Self> {
        if k_min == 0 {
            return Err(Error::Validation("k_min must be >= 1".to_string()));
        }
        if k_min > k_max {
            return Err(Error::Validation(format!("k_min ({k_min}) must be <= k_max ({k_max})")));
        }
        Ok(Self { k_min, k_max })
    }

    /// Number of reachable model indices.
    pub fn len(&self) -> usize {
        self.k_max - self.k_min + 1
    }

    /// Always false for validated bounds.
    pub fn is_empty(&self) -> bool {
        self.k_max < self.k_min
    }

    /// `true` if `k` lies in `[k_min, k_max]`.
    pub fn contains(&self, k: usize) -> bool {
        (self.k_min..=self.k_max).contains(&k)
    }

    /// Dense index of `k` (`k - k_min`).
    #[inline]
    pub fn index(&self, k: usize) -> usize {
        k - self.k_min
    }

    /// `true` if dimension changes are possible.
    pub fn is_transdimensional(&self) -> bool {
        self.k_max > self.k_min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_len_and_blocks() {
        let layout = BlockLayout { shared_len: 2, ..BlockLayout::default() };
        assert_eq!(layout.param_len(4), 14);
        assert_eq!(layout.n_blocks(14), Some(4));
        assert_eq!(layout.n_blocks(13), None);
        assert_eq!(layout.n_blocks(1), None);
    }

    #[test]
    fn test_sort_blocks_keeps_blocks_and_tail() {
        let layout = BlockLayout { shared_len: 1, ..BlockLayout::default() };
        let mut p = vec![0.1, 9.0, 1.0, 0.2, 7.0, 2.0, 0.3, 8.0, 3.0, 42.0];
        assert!(layout.sort_blocks_by_age(&mut p));
        assert_eq!(p, vec![0.2, 7.0, 2.0, 0.3, 8.0, 3.0, 0.1, 9.0, 1.0, 42.0]);
        assert!(layout.is_age_sorted(&p));
        assert!(!layout.sort_blocks_by_age(&mut p));
    }

    #[test]
    fn test_sort_nan_ages_last() {
        let layout = BlockLayout::default();
        let mut p = vec![0.0, f64::NAN, 1.0, 0.0, 3.0, 1.0];
        layout.sort_blocks_by_age(&mut p);
        assert_eq!(p[1], 3.0);
        assert!(p[4].is_nan());
    }

    #[test]
    fn test_pad() {
        let layout = BlockLayout::default();
        let padded = layout.pad(&[1.0, 2.0, 3.0], 6);
        assert_eq!(&padded[..3], &[1.0, 2.0, 3.0]);
        assert!(padded[3..].iter().all(|x| x.is_nan()));
    }

    #[test]
    fn test_model_bounds() {
        assert!(ModelBounds::new(0, 3).is_err());
        assert!(ModelBounds::new(4, 3).is_err());
        let b = ModelBounds::new(2, 5).unwrap();
        assert_eq!(b.len(), 4);
        assert_eq!(b.index(4), 2);
        assert!(b.contains(5) && !b.contains(1));
        assert!(b.is_transdimensional());
        assert!(!ModelBounds::new(1, 1).unwrap().is_transdimensional());
    }
}
