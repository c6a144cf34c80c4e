//! Covariance matrix adaptation evolution strategy.
//!
//! (µ/µ_w, λ)-CMA-ES with the default parameters of Hansen's tutorial.
//! Candidates are clipped to the box before evaluation while the update
//! uses the unclipped genotypes. Infeasible candidates are redrawn.
//! Feasibility checks and objective evaluations of a generation run on the
//! worker pool; all random draws happen on the calling thread.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::linalg::{identity, norm, symmetric_eigen, Matrix};
use super::OptimizationResult;
use crate::engine::{SimRng, WorkerPool};
use crate::error::{ChainError, ChainResult};

/// Smallest eigenvalue kept when factoring the covariance.
const MIN_EIGENVALUE: f64 = 1e-20;

/// Solver parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CmaEsSettings {
    /// Initial step size.
    pub sigma0: f64,
    /// Objective evaluation budget.
    pub max_fevals: usize,
    /// Generation cap.
    pub max_iter: usize,
    /// Stop when every coordinate's step falls below this.
    pub tol_x: f64,
    /// Stop when recent objective values span less than this.
    pub tol_fun: f64,
    /// Redraws allowed per infeasible candidate.
    pub max_resample: usize,
    /// Population size; `None` uses `4 + ⌊3 ln n⌋`.
    pub popsize: Option<usize>,
    /// Lower bound of every coordinate.
    pub lower: f64,
    /// Upper bound of every coordinate.
    pub upper: f64,
}

impl Default for CmaEsSettings {
    fn default() -> Self {
        Self {
            sigma0: 0.25,
            max_fevals: 1000,
            max_iter: 1000,
            tol_x: 1e-11,
            tol_fun: 1e-11,
            max_resample: 100,
            popsize: None,
            lower: 0.0,
            upper: 1.0,
        }
    }
}

/// Strategy parameters derived from the dimension.
struct Strategy {
    lambda: usize,
    weights: Vec<f64>,
    mu_eff: f64,
    c_sigma: f64,
    d_sigma: f64,
    c_c: f64,
    c_1: f64,
    c_mu: f64,
    chi_n: f64,
}

impl Strategy {
    fn new(n: usize, popsize: Option<usize>) -> Self {
        let nf = n as f64;
        let lambda = popsize
            .unwrap_or(4 + (3.0 * nf.ln()).floor() as usize)
            .max(2);
        let mu = lambda / 2;
        let raw: Vec<f64> = (1..=mu)
            .map(|i| (mu as f64 + 0.5).ln() - (i as f64).ln())
            .collect();
        let total: f64 = raw.iter().sum();
        let weights: Vec<f64> = raw.iter().map(|w| w / total).collect();
        let mu_eff = 1.0 / weights.iter().map(|w| w * w).sum::<f64>();

        let c_sigma = (mu_eff + 2.0) / (nf + mu_eff + 5.0);
        let d_sigma = 2.0f64.mul_add(
            (((mu_eff - 1.0) / (nf + 1.0)).sqrt() - 1.0).max(0.0),
            1.0,
        ) + c_sigma;
        let c_c = (4.0 + mu_eff / nf) / (nf + 4.0 + 2.0 * mu_eff / nf);
        let c_1 = 2.0 / ((nf + 1.3).powi(2) + mu_eff);
        let c_mu = (1.0 - c_1)
            .min(2.0 * (mu_eff - 2.0 + 1.0 / mu_eff) / ((nf + 2.0).powi(2) + mu_eff));
        let chi_n = nf.sqrt() * (1.0 - 1.0 / (4.0 * nf) + 1.0 / (21.0 * nf * nf));

        Self {
            lambda,
            weights,
            mu_eff,
            c_sigma,
            d_sigma,
            c_c,
            c_1,
            c_mu,
            chi_n,
        }
    }
}

/// Minimize `objective` over the box, drawing only candidates for which
/// `feasible` holds (up to `max_resample` redraws each).
///
/// Returns the best evaluated point.
///
/// # Errors
///
/// Returns an optimization error for an empty start point and propagates
/// evaluation errors.
pub fn minimize_cmaes<F, V>(
    objective: F,
    feasible: V,
    x0: &[f64],
    settings: &CmaEsSettings,
    rng: &mut SimRng,
    pool: &WorkerPool,
) -> ChainResult<OptimizationResult>
where
    F: Fn(&[f64]) -> ChainResult<f64> + Sync,
    V: Fn(&[f64]) -> ChainResult<bool> + Sync,
{
    let n = x0.len();
    if n == 0 {
        return Err(ChainError::optimization("empty start point"));
    }
    let (lower, upper) = (settings.lower, settings.upper);
    let clip = |x: &[f64]| -> Vec<f64> { x.iter().map(|v| v.clamp(lower, upper)).collect() };
    let strategy = Strategy::new(n, settings.popsize);
    let lambda = strategy.lambda;
    let mu = strategy.weights.len();
    let history_len = 10 + (30 * n).div_ceil(lambda);

    let mut mean = clip(x0);
    let mut sigma = settings.sigma0;
    let mut cov = identity(n);
    let mut p_sigma = vec![0.0; n];
    let mut p_c = vec![0.0; n];
    let mut best_x = mean.clone();
    let mut best_f = f64::INFINITY;
    let mut history: VecDeque<f64> = VecDeque::with_capacity(history_len);
    let mut nfev = 0;
    let mut nit = 0;
    let mut success = false;
    let message;

    loop {
        if nfev + lambda > settings.max_fevals {
            message = "Evaluation budget exhausted";
            break;
        }
        if nit >= settings.max_iter {
            message = "Iteration limit reached";
            break;
        }

        let (eigenvalues, basis) = symmetric_eigen(&cov)?;
        let scales: Vec<f64> = eigenvalues.iter().map(|v| v.max(MIN_EIGENVALUE).sqrt()).collect();

        let mut steps: Vec<Vec<f64>> = vec![Vec::new(); lambda];
        let mut pending: Vec<usize> = (0..lambda).collect();
        for _ in 0..=settings.max_resample {
            for &k in &pending {
                let z: Vec<f64> = (0..n).map(|_| rng.gen_standard_normal()).collect();
                steps[k] = (0..n)
                    .map(|i| (0..n).map(|j| basis[i][j] * scales[j] * z[j]).sum())
                    .collect();
            }
            let candidates: Vec<Vec<f64>> = pending
                .iter()
                .map(|&k| clip(&candidate(&mean, sigma, &steps[k])))
                .collect();
            let ok = pool.try_map(&candidates, |_, x| feasible(x.as_slice()))?;
            pending = pending
                .into_iter()
                .zip(ok)
                .filter_map(|(k, ok)| (!ok).then_some(k))
                .collect();
            if pending.is_empty() {
                break;
            }
        }
        if !pending.is_empty() {
            warn!(infeasible = pending.len(), "keeping infeasible candidates after resampling");
        }

        let phenotypes: Vec<Vec<f64>> = steps
            .iter()
            .map(|y| clip(&candidate(&mean, sigma, y)))
            .collect();
        let values = pool.try_map(&phenotypes, |_, x| objective(x.as_slice()))?;
        nfev += lambda;
        nit += 1;

        let mut order: Vec<usize> = (0..lambda).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        if values[order[0]] < best_f {
            best_f = values[order[0]];
            best_x.clone_from(&phenotypes[order[0]]);
        }

        // Mean update in genotype space, kept inside the box.
        let old_mean = mean.clone();
        for i in 0..n {
            let shift: f64 = (0..mu)
                .map(|r| strategy.weights[r] * steps[order[r]][i])
                .sum();
            mean[i] = sigma.mul_add(shift, old_mean[i]).clamp(lower, upper);
        }
        let y_w: Vec<f64> = (0..n).map(|i| (mean[i] - old_mean[i]) / sigma).collect();

        // C^{-1/2} y_w = B D^{-1} Bᵀ y_w
        let projected: Vec<f64> = (0..n)
            .map(|j| (0..n).map(|i| basis[i][j] * y_w[i]).sum::<f64>() / scales[j])
            .collect();
        let whitened: Vec<f64> = (0..n)
            .map(|i| (0..n).map(|j| basis[i][j] * projected[j]).sum())
            .collect();

        let cs = strategy.c_sigma;
        let ps_coeff = (cs * (2.0 - cs) * strategy.mu_eff).sqrt();
        for i in 0..n {
            p_sigma[i] = (1.0 - cs).mul_add(p_sigma[i], ps_coeff * whitened[i]);
        }
        let ps_norm = norm(&p_sigma);
        let ps_decay = (1.0 - (1.0 - cs).powi(2 * i32::try_from(nit).unwrap_or(i32::MAX))).sqrt();
        let h_sigma = ps_norm / ps_decay < (1.4 + 2.0 / (n as f64 + 1.0)) * strategy.chi_n;

        let cc = strategy.c_c;
        let pc_coeff = if h_sigma {
            (cc * (2.0 - cc) * strategy.mu_eff).sqrt()
        } else {
            0.0
        };
        for i in 0..n {
            p_c[i] = (1.0 - cc).mul_add(p_c[i], pc_coeff * y_w[i]);
        }

        let delta_h = if h_sigma { 0.0 } else { cc * (2.0 - cc) };
        update_covariance(&mut cov, &strategy, &p_c, delta_h, &steps, &order);

        sigma *= ((cs / strategy.d_sigma) * (ps_norm / strategy.chi_n - 1.0)).exp();

        // Flat fitness: widen the search.
        let kth = order[(7 * lambda / 10).min(lambda - 1)];
        if (values[kth] - values[order[0]]).abs() <= f64::EPSILON * values[order[0]].abs() {
            sigma *= (0.2 + cs / strategy.d_sigma).exp();
            debug!(nit, "flat fitness, increasing step size");
        }

        history.push_back(values[order[0]]);
        if history.len() > history_len {
            history.pop_front();
        }
        debug!(nit, nfev, best = best_f, sigma, "cma-es generation");

        let spread = history
            .iter()
            .chain(values.iter())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        if history.len() >= history_len && spread.1 - spread.0 < settings.tol_fun {
            success = true;
            message = "Objective tolerance reached";
            break;
        }
        let widest = (0..n)
            .map(|i| cov[i][i].sqrt().max(p_c[i].abs()))
            .fold(0.0, f64::max);
        if sigma * widest < settings.tol_x {
            success = true;
            message = "Step tolerance reached";
            break;
        }
    }

    if !best_f.is_finite() {
        best_f = objective(&best_x)?;
        nfev += 1;
    }

    Ok(OptimizationResult {
        x: best_x,
        fun: best_f,
        nfev,
        nit,
        success,
        message: message.to_string(),
    })
}

fn candidate(mean: &[f64], sigma: f64, step: &[f64]) -> Vec<f64> {
    mean.iter().zip(step).map(|(m, y)| sigma.mul_add(*y, *m)).collect()
}

fn update_covariance(
    cov: &mut Matrix,
    strategy: &Strategy,
    p_c: &[f64],
    delta_h: f64,
    steps: &[Vec<f64>],
    order: &[usize],
) {
    let n = p_c.len();
    let keep = 1.0 - strategy.c_1 - strategy.c_mu;
    for i in 0..n {
        for j in 0..n {
            let rank_mu: f64 = strategy
                .weights
                .iter()
                .enumerate()
                .map(|(r, w)| w * steps[order[r]][i] * steps[order[r]][j])
                .sum();
            let rank_one = delta_h.mul_add(cov[i][j], p_c[i] * p_c[j]);
            cov[i][j] = strategy
                .c_mu
                .mul_add(rank_mu, keep.mul_add(cov[i][j], strategy.c_1 * rank_one));
        }
    }
    // Enforce symmetry against rounding drift.
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (cov[i][j] + cov[j][i]);
            cov[i][j] = avg;
            cov[j][i] = avg;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn sphere(target: &[f64]) -> impl Fn(&[f64]) -> ChainResult<f64> + Sync + '_ {
        move |x: &[f64]| Ok(x.iter().zip(target).map(|(a, b)| (a - b).powi(2)).sum())
    }

    fn always(_: &[f64]) -> ChainResult<bool> {
        Ok(true)
    }

    #[test]
    fn test_strategy_defaults() {
        let s = Strategy::new(2, None);
        assert_eq!(s.lambda, 6);
        assert_eq!(s.weights.len(), 3);
        assert!((s.weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(s.weights.windows(2).all(|w| w[0] > w[1]));
        assert!(s.c_1 + s.c_mu <= 1.0);
        assert_eq!(Strategy::new(10, None).lambda, 10);
    }

    #[test]
    fn test_minimizes_sphere() {
        let target = [0.3, 0.6, 0.45];
        let settings = CmaEsSettings {
            max_fevals: 4000,
            ..CmaEsSettings::default()
        };
        let res = minimize_cmaes(
            sphere(&target),
            always,
            &[0.9, 0.1, 0.9],
            &settings,
            &mut SimRng::new(42),
            &WorkerPool::with_workers(2),
        )
        .unwrap();
        assert!(res.fun < 1e-8, "{res:?}");
        for (x, t) in res.x.iter().zip(&target) {
            assert!((x - t).abs() < 1e-3);
        }
        assert!(res.nfev <= 4000);
    }

    #[test]
    fn test_respects_bounds_and_budget() {
        let target = [1.4, -0.2];
        let settings = CmaEsSettings {
            max_fevals: 300,
            ..CmaEsSettings::default()
        };
        let res = minimize_cmaes(
            sphere(&target),
            always,
            &[0.5, 0.5],
            &settings,
            &mut SimRng::new(1),
            &WorkerPool::with_workers(1),
        )
        .unwrap();
        assert!(res.nfev <= 300);
        assert!((res.x[0] - 1.0).abs() < 1e-2);
        assert!(res.x[1].abs() < 1e-2);
    }

    #[test]
    fn test_only_feasible_points_are_evaluated() {
        let seen = Mutex::new(Vec::new());
        let objective = |x: &[f64]| {
            if let Ok(mut seen) = seen.lock() {
                seen.push(x.to_vec());
            }
            Ok((x[0] - 0.1).powi(2) + (x[1] - 0.1).powi(2))
        };
        // forbid the lower-left quarter
        let feasible = |x: &[f64]| Ok(x[0] >= 0.25 || x[1] >= 0.25);
        let settings = CmaEsSettings {
            max_fevals: 600,
            ..CmaEsSettings::default()
        };
        let res = minimize_cmaes(
            objective,
            feasible,
            &[0.8, 0.8],
            &settings,
            &mut SimRng::new(9),
            &WorkerPool::with_workers(2),
        )
        .unwrap();
        assert!(res.x[0] >= 0.25 || res.x[1] >= 0.25);
        let seen = seen.into_inner().unwrap();
        assert!(seen.iter().all(|x| x[0] >= 0.25 || x[1] >= 0.25));
    }

    #[test]
    fn test_same_seed_same_result() {
        let run = |workers| {
            minimize_cmaes(
                sphere(&[0.2, 0.7]),
                always,
                &[0.5, 0.5],
                &CmaEsSettings {
                    max_fevals: 200,
                    ..CmaEsSettings::default()
                },
                &mut SimRng::new(4),
                &WorkerPool::with_workers(workers),
            )
            .unwrap()
        };
        let (a, b) = (run(1), run(3));
        assert_eq!(a.x, b.x);
        assert_eq!(a.nfev, b.nfev);
    }
}
