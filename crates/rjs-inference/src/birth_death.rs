//! Default birth/death moves on block-structured parameter vectors.
//!
//! A birth adds one block, either by splitting the heaviest block or by
//! drawing a fresh block from the slot ranges. A death removes near-zero
//! blocks outright, or removes one block chosen with probability
//! proportional to its inverse weight and merges its weight into the
//! age-adjacent neighbour.

use rand::Rng;
use rjs_core::{BlockLayout, ModelBounds};

use crate::likelihood::{JumpProposal, LikelihoodModel};

/// Redraw budget for a birth candidate.
pub const BIRTH_ATTEMPTS: usize = 100;
/// Weights below this magnitude count as zero.
pub const ZERO_WEIGHT: f64 = 1e-10;
/// Probability floor below which no death is attempted.
pub const DEATH_SKIP: f64 = 0.01;

/// Jacobian/proposal ratio for one added block.
#[inline]
pub fn birth_criterion(birth_rate: f64) -> f64 {
    birth_rate / 4f64.powi(3)
}

/// Jacobian/proposal ratio for `removed` blocks.
#[inline]
pub fn death_criterion(birth_rate: f64, removed: usize) -> f64 {
    4f64.powi(3 * removed as i32) * (1.0 - birth_rate)
}

/// Choose between a birth and a death and build the candidate.
///
/// Birth happens when `birth_rate > u` and `k < k_max`, and is forced at
/// `k == k_min < k_max`. Returns `None` when nothing was attempted.
pub fn propose_birth_death<M: LikelihoodModel + ?Sized>(
    model: &M,
    birth_rate: f64,
    k: usize,
    bounds: ModelBounds,
    current: &[f64],
    rng: &mut impl Rng,
) -> Option<JumpProposal> {
    let layout = model.layout();
    if layout.n_blocks(current.len()) != Some(k) || !bounds.contains(k) {
        log::debug!("birth/death skipped: vector of length {} does not hold k={k}", current.len());
        return None;
    }
    let u: f64 = rng.random();
    let forced_birth = k == bounds.k_min && k < bounds.k_max;
    if forced_birth || (birth_rate > u && k < bounds.k_max) {
        return birth(model, &layout, birth_rate, k, current, rng);
    }
    if k > bounds.k_min && rng.random::<f64>() > DEATH_SKIP {
        return death(&layout, birth_rate, k, bounds.k_min, current, rng);
    }
    None
}

fn insert_block(layout: &BlockLayout, k: usize, current: &[f64], block: &[f64]) -> Vec<f64> {
    let body = layout.block_len * k;
    let mut out = Vec::with_capacity(current.len() + layout.block_len);
    out.extend_from_slice(&current[..body]);
    out.extend_from_slice(block);
    out.extend_from_slice(&current[body..]);
    out
}

fn remove_blocks(layout: &BlockLayout, current: &[f64], remove: &[usize]) -> Vec<f64> {
    let k = layout.n_blocks(current.len()).unwrap_or(0);
    let mut out = Vec::with_capacity(current.len());
    for i in (0..k).filter(|i| !remove.contains(i)) {
        out.extend_from_slice(layout.block(current, i));
    }
    out.extend_from_slice(layout.shared(current));
    out
}

/// Add one block to `current`; `None` when no candidate inside the prior support was found.
pub fn birth<M: LikelihoodModel + ?Sized>(
    model: &M,
    layout: &BlockLayout,
    birth_rate: f64,
    k: usize,
    current: &[f64],
    rng: &mut impl Rng,
) -> Option<JumpProposal> {
    let ranges = model.slot_ranges();
    if ranges.len() != layout.block_len {
        log::warn!(
            "slot_ranges has {} entries but blocks have {} slots; birth skipped",
            ranges.len(),
            layout.block_len
        );
        return None;
    }
    let to_k = k + 1;
    let criterion = birth_criterion(birth_rate);
    let accept = |mut cand: Vec<f64>| -> Option<JumpProposal> {
        layout.sort_blocks_by_age(&mut cand);
        model.log_prior(&cand, to_k).is_finite().then_some(JumpProposal { to_k, param: cand, criterion })
    };

    if k > 0 && rng.random::<bool>() {
        let weights = layout.weights(current);
        let heaviest = (0..k).max_by(|&a, &b| weights[a].total_cmp(&weights[b])).unwrap_or(0);
        let source = layout.block(current, heaviest).to_vec();
        let u3: f64 = rng.random();
        let mut step: Vec<f64> = ranges
            .iter()
            .enumerate()
            .map(|(s, &(lo, hi))| if s == layout.weight_slot { u3 } else { u3 * (hi - lo) })
            .collect();
        for _ in 0..BIRTH_ATTEMPTS {
            let lower: Vec<f64> = source.iter().zip(&step).map(|(x, d)| x - d).collect();
            let upper: Vec<f64> = source.iter().zip(&step).map(|(x, d)| x + d).collect();
            let mut cand = insert_block(layout, k, current, &upper);
            let start = heaviest * layout.block_len;
            cand[start..start + layout.block_len].copy_from_slice(&lower);
            if let Some(p) = accept(cand) {
                return Some(p);
            }
            step.iter_mut().for_each(|d| *d *= 0.5);
        }
        log::debug!("block split found no valid candidate after {BIRTH_ATTEMPTS} attempts");
        None
    } else {
        for _ in 0..BIRTH_ATTEMPTS {
            let block: Vec<f64> = ranges
                .iter()
                .map(|&(lo, hi)| if hi > lo { rng.random_range(lo..hi) } else { lo })
                .collect();
            if let Some(p) = accept(insert_block(layout, k, current, &block)) {
                return Some(p);
            }
        }
        log::debug!("fresh block draw found no valid candidate after {BIRTH_ATTEMPTS} attempts");
        None
    }
}

/// Remove one or more blocks from `current`, never going below `k_min`.
pub fn death(
    layout: &BlockLayout,
    birth_rate: f64,
    k: usize,
    k_min: usize,
    current: &[f64],
    rng: &mut impl Rng,
) -> Option<JumpProposal> {
    if k <= k_min {
        return None;
    }
    let weights = layout.weights(current);
    let zero: Vec<usize> = (0..k).filter(|&i| weights[i].abs() < ZERO_WEIGHT).collect();

    if zero.len() > 1 {
        let removable = (k - k_min).min(zero.len());
        let remove = &zero[..removable];
        let mut param = remove_blocks(layout, current, remove);
        layout.sort_blocks_by_age(&mut param);
        return Some(JumpProposal {
            to_k: k - removable,
            param,
            criterion: death_criterion(birth_rate, removable),
        });
    }

    let victim = match zero.first() {
        Some(&i) => i,
        None => pick_inverse_weight(&weights, rng)?,
    };

    let ages = layout.ages(current);
    let neighbour = match (victim.checked_sub(1), (victim + 1 < k).then_some(victim + 1)) {
        (Some(l), Some(r)) => {
            if (ages[victim] - ages[l]).abs() <= (ages[r] - ages[victim]).abs() { l } else { r }
        }
        (Some(l), None) => l,
        (None, Some(r)) => r,
        (None, None) => return None,
    };

    let mut merged = current.to_vec();
    merged[neighbour * layout.block_len + layout.weight_slot] += weights[victim];
    let mut param = remove_blocks(layout, &merged, &[victim]);
    layout.sort_blocks_by_age(&mut param);
    Some(JumpProposal { to_k: k - 1, param, criterion: death_criterion(birth_rate, 1) })
}

fn pick_inverse_weight(weights: &[f64], rng: &mut impl Rng) -> Option<usize> {
    let inv: Vec<f64> = weights
        .iter()
        .map(|w| {
            let v = 1.0 / w.abs();
            if v.is_finite() { v } else { 0.0 }
        })
        .collect();
    let total: f64 = inv.iter().sum();
    if !(total > 0.0) || !total.is_finite() {
        return if weights.is_empty() { None } else { Some(rng.random_range(0..weights.len())) };
    }
    let r = rng.random::<f64>() * total;
    let mut acc = 0.0;
    for (i, v) in inv.iter().enumerate() {
        acc += v;
        if r < acc {
            return Some(i);
        }
    }
    Some(inv.len() - 1)
}
