//! Synthetic likelihoods for tests, benchmarks and the CLI demo.
//!
//! [`GaussianTarget`] is a separable Gaussian over any number of scalar
//! blocks. [`SyntheticBursts`] mimics a star-formation-history fit: each block
//! is `(metallicity, age, weight)` and contributes a weighted Gaussian bump to
//! a model spectrum compared against noisy data generated from known bursts.

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rjs_core::{BlockLayout, Error, Result};

use crate::likelihood::LikelihoodModel;

/// Half-width of the [`GaussianTarget`] prior support around the centre.
const GAUSSIAN_SUPPORT: f64 = 10.0;

/// `log p(x) = -sum_i (x_i - center)^2` on `center ± 10`, one slot per block.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianTarget {
    center: f64,
    proposal_var: f64,
}

impl GaussianTarget {
    /// Target centred on `center`; chains start with covariance `proposal_var * I`.
    pub fn new(center: f64, proposal_var: f64) -> Self {
        Self { center, proposal_var }
    }

    /// Mode of the target.
    pub fn center(&self) -> f64 {
        self.center
    }
}

impl LikelihoodModel for GaussianTarget {
    fn layout(&self) -> BlockLayout {
        BlockLayout::scalar()
    }

    fn slot_ranges(&self) -> Vec<(f64, f64)> {
        vec![(self.center - GAUSSIAN_SUPPORT, self.center + GAUSSIAN_SUPPORT)]
    }

    fn initialize_parameters(&self, k: usize, rng: &mut impl Rng) -> Result<(Vec<f64>, DMatrix<f64>)> {
        if !(self.proposal_var > 0.0 && self.proposal_var.is_finite()) {
            return Err(Error::Validation(format!("proposal_var must be > 0, got {}", self.proposal_var)));
        }
        let x = (0..k)
            .map(|_| {
                let z: f64 = rng.sample(StandardNormal);
                self.center + 0.5 * z
            })
            .collect();
        Ok((x, DMatrix::identity(k, k) * self.proposal_var))
    }

    fn log_posterior(&self, param: &[f64], k: usize) -> f64 {
        let lp = self.log_prior(param, k);
        if !lp.is_finite() {
            return lp;
        }
        lp - param.iter().map(|x| (x - self.center).powi(2)).sum::<f64>()
    }

    fn log_prior(&self, param: &[f64], _k: usize) -> f64 {
        if param.iter().all(|x| (x - self.center).abs() <= GAUSSIAN_SUPPORT) { 0.0 } else { f64::NEG_INFINITY }
    }
}

/// Number of wavelength samples in [`SyntheticBursts::demo`].
pub const DEMO_GRID: usize = 64;
/// Noise level of [`SyntheticBursts::demo`] data.
pub const DEMO_SIGMA: f64 = 0.02;

/// Sum-of-bursts spectrum fit with blocks `(metallicity, age, weight)`.
///
/// A burst with metallicity `z` and age `a` has template
/// `exp(-(lambda - (0.1 + 0.8 a))^2 / (2 (0.03 + 0.07 z)^2))` on `lambda in [0, 1]`.
/// Metallicity and age live in `[0, 1]`, weights in `[0, 5]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticBursts {
    wavelengths: Vec<f64>,
    data: Vec<f64>,
    sigma: f64,
    truth: Vec<f64>,
}

fn template(lambda: f64, metallicity: f64, age: f64) -> f64 {
    let centre = 0.1 + 0.8 * age;
    let width = 0.03 + 0.07 * metallicity;
    (-(lambda - centre).powi(2) / (2.0 * width * width)).exp()
}

impl SyntheticBursts {
    /// Fit `data` observed at `wavelengths` with Gaussian noise `sigma`.
    pub fn new(wavelengths: Vec<f64>, data: Vec<f64>, sigma: f64) -> Result<Self> {
        if wavelengths.len() != data.len() || wavelengths.is_empty() {
            return Err(Error::Validation(format!(
                "wavelengths ({}) and data ({}) must be equally long and non-empty",
                wavelengths.len(),
                data.len()
            )));
        }
        if !(sigma > 0.0 && sigma.is_finite()) {
            return Err(Error::Validation(format!("sigma must be > 0, got {sigma}")));
        }
        Ok(Self { wavelengths, data, sigma, truth: Vec::new() })
    }

    /// `n_true` evenly spaced bursts observed with seeded noise.
    pub fn demo(n_true: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let wavelengths: Vec<f64> = (0..DEMO_GRID).map(|i| i as f64 / (DEMO_GRID - 1) as f64).collect();
        let mut truth = Vec::with_capacity(3 * n_true);
        for i in 0..n_true {
            let age = (i as f64 + 0.5) / n_true as f64;
            truth.extend_from_slice(&[rng.random_range(0.2..0.8), age, rng.random_range(0.5..2.0)]);
        }
        let mut model = Self { wavelengths, data: Vec::new(), sigma: DEMO_SIGMA, truth };
        let clean = model.spectrum(&model.truth);
        model.data = clean
            .iter()
            .map(|m| {
                let z: f64 = rng.sample(StandardNormal);
                m + DEMO_SIGMA * z
            })
            .collect();
        model
    }

    /// Parameters the demo data were generated from (empty for user data).
    pub fn truth(&self) -> &[f64] {
        &self.truth
    }

    /// Observed spectrum.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Model spectrum of the blocks in `param`.
    pub fn spectrum(&self, param: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.wavelengths.len()];
        for block in param.chunks_exact(3) {
            let (z, a, w) = (block[0], block[1], block[2]);
            for (o, &l) in out.iter_mut().zip(&self.wavelengths) {
                *o += w * template(l, z, a);
            }
        }
        out
    }
}

impl LikelihoodModel for SyntheticBursts {
    fn layout(&self) -> BlockLayout {
        BlockLayout::default()
    }

    fn slot_ranges(&self) -> Vec<(f64, f64)> {
        vec![(0.0, 1.0), (0.0, 1.0), (0.0, 5.0)]
    }

    fn initialize_parameters(&self, k: usize, rng: &mut impl Rng) -> Result<(Vec<f64>, DMatrix<f64>)> {
        let mut param = Vec::with_capacity(3 * k);
        for _ in 0..k {
            param.push(rng.random_range(0.0..1.0));
            param.push(rng.random_range(0.0..1.0));
            param.push(rng.random_range(0.1..2.0));
        }
        let diag: Vec<f64> = (0..3 * k).map(|i| if i % 3 == 2 { 1e-2 } else { 1e-3 }).collect();
        Ok((param, DMatrix::from_diagonal(&nalgebra::DVector::from_vec(diag))))
    }

    fn log_posterior(&self, param: &[f64], k: usize) -> f64 {
        let lp = self.log_prior(param, k);
        if !lp.is_finite() {
            return lp;
        }
        let model = self.spectrum(param);
        let sse: f64 = model.iter().zip(&self.data).map(|(m, d)| ((d - m) / self.sigma).powi(2)).sum();
        lp - 0.5 * sse
    }

    fn log_prior(&self, param: &[f64], k: usize) -> f64 {
        if param.len() != 3 * k {
            return f64::NEG_INFINITY;
        }
        let ranges = self.slot_ranges();
        let inside = param.chunks_exact(3).all(|b| b.iter().zip(&ranges).all(|(v, &(lo, hi))| *v >= lo && *v <= hi));
        if inside { 0.0 } else { f64::NEG_INFINITY }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_gaussian_target_shape() {
        let m = GaussianTarget::new(2.0, 0.5);
        assert_eq!(m.log_posterior(&[2.0], 1), 0.0);
        assert_relative_eq!(m.log_posterior(&[3.0, 1.0], 2), -2.0);
        assert_eq!(m.log_posterior(&[20.0], 1), f64::NEG_INFINITY);
        let mut rng = StdRng::seed_from_u64(0);
        let (x, cov) = m.initialize_parameters(3, &mut rng).unwrap();
        assert_eq!(x.len(), 3);
        assert_eq!(cov[(1, 1)], 0.5);
        assert_eq!(cov[(0, 1)], 0.0);
    }

    #[test]
    fn test_gaussian_rejects_bad_variance() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(GaussianTarget::new(0.0, 0.0).initialize_parameters(1, &mut rng).is_err());
    }

    #[test]
    fn test_demo_truth_beats_random_points() {
        let m = SyntheticBursts::demo(2, 11);
        assert_eq!(m.truth().len(), 6);
        assert_eq!(m.data().len(), DEMO_GRID);
        let at_truth = m.log_posterior(m.truth(), 2);
        assert!(at_truth.is_finite());
        // Chi at the truth is about half the number of samples.
        assert!(-at_truth < DEMO_GRID as f64 * 2.0, "chi at truth {}", -at_truth);

        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..20 {
            let (p, _) = m.initialize_parameters(2, &mut rng).unwrap();
            assert!(m.log_posterior(&p, 2) <= at_truth + 1.0);
        }
    }

    #[test]
    fn test_demo_is_seeded() {
        assert_eq!(SyntheticBursts::demo(3, 4), SyntheticBursts::demo(3, 4));
        assert_ne!(SyntheticBursts::demo(3, 4).data(), SyntheticBursts::demo(3, 5).data());
    }

    #[test]
    fn test_demo_noise_level() {
        let m = SyntheticBursts::demo(2, 9);
        let clean = m.spectrum(m.truth());
        let n = clean.len() as f64;
        let rms = (m.data().iter().zip(&clean).map(|(d, c)| (d - c).powi(2)).sum::<f64>() / n).sqrt();
        assert!(rms > 0.5 * DEMO_SIGMA && rms < 1.5 * DEMO_SIGMA, "noise rms {rms}");
    }

    #[test]
    fn test_bursts_prior_support() {
        let m = SyntheticBursts::demo(1, 0);
        assert_eq!(m.log_prior(&[0.5, 0.5, 1.0], 1), 0.0);
        assert_eq!(m.log_prior(&[0.5, 1.5, 1.0], 1), f64::NEG_INFINITY);
        assert_eq!(m.log_prior(&[0.5, 0.5, -0.1], 1), f64::NEG_INFINITY);
        assert_eq!(m.log_prior(&[0.5, 0.5], 1), f64::NEG_INFINITY);
        assert_eq!(m.log_posterior(&[0.5, 0.5, 0.0, 0.2, 0.9, 6.0], 2), f64::NEG_INFINITY);
    }

    #[test]
    fn test_new_validates_inputs() {
        assert!(SyntheticBursts::new(vec![0.0, 1.0], vec![1.0], 0.1).is_err());
        assert!(SyntheticBursts::new(vec![0.0], vec![1.0], 0.0).is_err());
        let m = SyntheticBursts::new(vec![0.0, 0.5], vec![0.0, 0.0], 0.1).unwrap();
        assert!(m.truth().is_empty());
        assert_eq!(m.log_posterior(&[0.5, 0.5, 0.0], 1), 0.0);
    }
}
