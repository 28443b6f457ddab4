//! Helper threads that run delayed-rejection cascades for a chain.
//!
//! The chain publishes its current point on a bounded job channel and drains
//! accepted points from a bounded result channel. Both sides use `try_send`,
//! so a slow helper never blocks the chain; jobs and results may be dropped.
//! Helpers exit once the job sender is dropped.

use std::sync::mpsc::{Receiver, SyncSender, TryRecvError, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::Scope;

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::delayed_rejection::{DrAccept, delayed_rejection, relative_improvement_accept};
use crate::likelihood::LikelihoodModel;

/// Job channel capacity.
pub const JOB_CAPACITY: usize = 6;
/// Cascade stages run by a helper.
pub const HELPER_STAGES: usize = 20;
/// Upper bound of the random covariance scale used by helpers.
pub const HELPER_MAX_SCALE: f64 = 5.0;

/// Snapshot of the chain handed to helpers.
#[derive(Debug, Clone)]
pub struct DrJob {
    /// Current parameter vector.
    pub param: Vec<f64>,
    /// Its log-posterior.
    pub prob: f64,
    /// Current proposal covariance.
    pub cov: DMatrix<f64>,
    /// Current model index.
    pub k: usize,
    /// Current temperature.
    pub temperature: f64,
    /// Publication counter.
    pub generation: u64,
}

/// Point accepted by a helper cascade.
#[derive(Debug, Clone, PartialEq)]
pub struct DrResult {
    /// Accepted parameter vector.
    pub param: Vec<f64>,
    /// Its log-posterior.
    pub prob: f64,
    /// Model index the job was published at.
    pub k: usize,
    /// Generation of the job that produced it.
    pub generation: u64,
}

/// Decide whether a helper result replaces the chain's current point.
///
/// Results from another model index are stale and discarded. Otherwise the
/// result is accepted if it beats `current_prob`, or by the relative
/// improvement test against the just-rejected candidate.
pub fn accept_result(
    result: &DrResult,
    current_k: usize,
    current_prob: f64,
    rejected_prob: f64,
    temperature: f64,
    u: f64,
) -> bool {
    if result.k != current_k || !result.prob.is_finite() {
        log::debug!(
            "discarding helper result (generation {}, k={} vs current k={current_k})",
            result.generation,
            result.k
        );
        return false;
    }
    if result.prob > current_prob {
        return true;
    }
    relative_improvement_accept(result.prob, current_prob, rejected_prob, temperature, u)
}

/// Chain-side ends of the helper channels.
pub struct DrPool {
    job_tx: SyncSender<DrJob>,
    result_rx: Receiver<DrResult>,
    generation: u64,
    workers: usize,
}

impl DrPool {
    /// Spawn `workers` helpers on `scope`.
    ///
    /// Helper `i` seeds its RNG with `seed + 1000 * (i + 1)`.
    pub fn spawn<'scope, 'env, M: LikelihoodModel>(
        scope: &'scope Scope<'scope, 'env>,
        model: &'env M,
        workers: usize,
        seed: u64,
        initial_scale: f64,
    ) -> Self {
        let (job_tx, job_rx) = sync_channel::<DrJob>(JOB_CAPACITY);
        let (result_tx, result_rx) = sync_channel::<DrResult>(JOB_CAPACITY * workers.max(1));
        let job_rx = Arc::new(Mutex::new(job_rx));
        for w in 0..workers {
            let jobs = Arc::clone(&job_rx);
            let results = result_tx.clone();
            let rng = StdRng::seed_from_u64(seed.wrapping_add(1000 * (w as u64 + 1)));
            scope.spawn(move || helper_loop(model, jobs, results, rng, initial_scale));
        }
        Self { job_tx, result_rx, generation: 0, workers }
    }

    /// Number of helper threads.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Offer the chain's current point to the helpers; `false` if the queue was full.
    pub fn publish(&mut self, param: &[f64], prob: f64, cov: &DMatrix<f64>, k: usize, temperature: f64) -> bool {
        self.generation += 1;
        let job =
            DrJob { param: param.to_vec(), prob, cov: cov.clone(), k, temperature, generation: self.generation };
        match self.job_tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Take every result currently waiting.
    pub fn drain(&self) -> Vec<DrResult> {
        let mut out = Vec::new();
        loop {
            match self.result_rx.try_recv() {
                Ok(r) => out.push(r),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return out,
            }
        }
    }
}

fn helper_loop<M: LikelihoodModel>(
    model: &M,
    jobs: Arc<Mutex<Receiver<DrJob>>>,
    results: SyncSender<DrResult>,
    mut rng: StdRng,
    initial_scale: f64,
) {
    let layout = model.layout();
    loop {
        let job = {
            let rx = jobs.lock().unwrap_or_else(|p| p.into_inner());
            let Ok(mut job) = rx.recv() else {
                return;
            };
            while let Ok(newer) = rx.try_recv() {
                job = newer;
            }
            job
        };

        let scale = rng.random_range(f64::EPSILON..HELPER_MAX_SCALE);
        let cov = &job.cov * scale;
        let Ok(mut y0) = model.propose(&job.param, &cov, &mut rng) else {
            continue;
        };
        layout.sort_blocks_by_age(&mut y0);
        let y0_prob = model.log_posterior(&y0, job.k);

        let accepted = if y0_prob.is_finite() && y0_prob >= job.prob {
            Some(DrAccept { param: y0, prob: y0_prob, stage: 0 })
        } else {
            delayed_rejection(
                model,
                job.k,
                &job.param,
                job.prob,
                &y0,
                y0_prob,
                &cov,
                job.temperature,
                HELPER_STAGES,
                initial_scale,
                &mut rng,
            )
        };

        if let Some(acc) = accepted {
            let result = DrResult { param: acc.param, prob: acc.prob, k: job.k, generation: job.generation };
            if let Err(TrySendError::Disconnected(_)) = results.try_send(result) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rjs_core::{BlockLayout, Result};
    use std::time::{Duration, Instant};

    struct Bowl;

    impl LikelihoodModel for Bowl {
        fn layout(&self) -> BlockLayout {
            BlockLayout::scalar()
        }
        fn slot_ranges(&self) -> Vec<(f64, f64)> {
            vec![(-100.0, 100.0)]
        }
        fn initialize_parameters(&self, _k: usize, _rng: &mut impl Rng) -> Result<(Vec<f64>, DMatrix<f64>)> {
            Ok((vec![3.0], DMatrix::identity(1, 1)))
        }
        fn log_posterior(&self, param: &[f64], _k: usize) -> f64 {
            -param[0] * param[0]
        }
        fn log_prior(&self, _param: &[f64], _k: usize) -> f64 {
            0.0
        }
    }

    #[test]
    fn test_accept_result_rules() {
        let r = DrResult { param: vec![0.0], prob: -1.0, k: 2, generation: 1 };
        assert!(!accept_result(&r, 3, -5.0, -9.0, 1.0, 0.0), "wrong k must be discarded");
        assert!(accept_result(&r, 2, -5.0, -9.0, 1.0, 0.99));
        // Worse than current, better than rejected: relative test decides.
        assert!(accept_result(&r, 2, -0.999, -9.0, 1.0, 0.5));
        assert!(!accept_result(&r, 2, 0.0, -1.0, 1.0, 0.0), "no improvement over rejected candidate");
    }

    #[test]
    fn test_helpers_return_improvements_and_shut_down() {
        let model = Bowl;
        let got = std::thread::scope(|s| {
            let mut pool = DrPool::spawn(s, &model, 2, 7, 1e-3);
            assert_eq!(pool.workers(), 2);
            let cov = DMatrix::from_element(1, 1, 1.0);
            let deadline = Instant::now() + Duration::from_secs(10);
            let mut got = Vec::new();
            while got.is_empty() && Instant::now() < deadline {
                pool.publish(&[3.0], -9.0, &cov, 1, 1.0);
                std::thread::sleep(Duration::from_millis(5));
                got.extend(pool.drain());
            }
            got
        });
        assert!(!got.is_empty(), "helpers should improve on x=3");
        for r in got {
            assert_eq!(r.k, 1);
            assert!(r.prob.is_finite());
        }
    }
}
