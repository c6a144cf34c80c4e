//! Robustness optimization.
//!
//! Given boundary estimators learned by [`crate::robustness`], find the
//! sample whose least robust event is as robust as possible, while staying
//! physically valid. The local optimizer follows gradients from a warm
//! start; the global one explores with CMA-ES and also checks causal
//! success with the oracle.

pub mod cmaes;
pub mod linalg;
pub mod slsqp;

use serde::{Deserialize, Serialize};
use tracing::info;

pub use cmaes::{minimize_cmaes, CmaEsSettings};
pub use slsqp::{minimize_sqp, SqpSettings};

use crate::engine::{SimRng, WorkerPool};
use crate::error::{ChainError, ChainResult};
use crate::robustness::{BoundaryEstimator, LabelOracle, Sample};

/// Penalty scale of the combined energy.
const PENALTY: f64 = 100.0;

/// Outcome of a minimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    /// Best point found.
    pub x: Vec<f64>,
    /// Objective at `x`.
    pub fun: f64,
    /// Objective evaluations.
    pub nfev: usize,
    /// Iterations (generations for CMA-ES).
    pub nit: usize,
    /// True if a convergence criterion was met.
    pub success: bool,
    /// Why the solver stopped.
    pub message: String,
}

/// Optimizer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    /// Sharpness `k` of the soft minimum.
    pub smin_coeff: f64,
    /// Initial CMA-ES step size.
    pub sigma0: f64,
    /// CMA-ES evaluation budget.
    pub max_fevals: usize,
    /// Iteration cap of both solvers.
    pub max_iter: usize,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            smin_coeff: 1.0,
            sigma0: 0.25,
            max_fevals: 1000,
            max_iter: 100,
        }
    }
}

/// Negative soft minimum of the predicted success probabilities:
/// `-Σ r·e^{-k r} / Σ e^{-k r}`.
#[derive(Debug, Clone)]
pub struct RobustnessEnergy<'a> {
    estimators: Vec<&'a BoundaryEstimator>,
    smin_coeff: f64,
}

impl<'a> RobustnessEnergy<'a> {
    /// Create the energy.
    ///
    /// # Errors
    ///
    /// Returns an optimization error without estimators or if one lacks
    /// probability estimates.
    pub fn new(
        estimators: impl IntoIterator<Item = &'a BoundaryEstimator>,
        smin_coeff: f64,
    ) -> ChainResult<Self> {
        let estimators: Vec<_> = estimators.into_iter().collect();
        if estimators.is_empty() {
            return Err(ChainError::optimization("robustness energy needs an estimator"));
        }
        if estimators.iter().any(|e| !e.has_probability()) {
            return Err(ChainError::optimization(
                "robustness energy needs probability estimates",
            ));
        }
        Ok(Self {
            estimators,
            smin_coeff,
        })
    }

    /// Energy at `x`; lower is more robust.
    ///
    /// # Errors
    ///
    /// Propagates estimator errors.
    pub fn evaluate(&self, x: &[f64]) -> ChainResult<f64> {
        let mut weighted = 0.0;
        let mut total = 0.0;
        for estimator in &self.estimators {
            let r = estimator.predict_proba(x)?;
            let w = (-self.smin_coeff * r).exp();
            weighted += r * w;
            total += w;
        }
        Ok(-weighted / total)
    }
}

/// Interpenetration measure, `0` when valid and negative otherwise.
#[derive(Debug, Clone, Copy)]
pub struct PhysicalValidityConstraint<'a, O: ?Sized> {
    oracle: &'a O,
}

impl<'a, O: LabelOracle + ?Sized> PhysicalValidityConstraint<'a, O> {
    /// Wrap an oracle.
    #[must_use]
    pub const fn new(oracle: &'a O) -> Self {
        Self { oracle }
    }

    /// Constraint value at `x`.
    ///
    /// # Errors
    ///
    /// Propagates oracle errors.
    pub fn evaluate(&self, x: &[f64]) -> ChainResult<f64> {
        Ok(self.oracle.validity_constraint(x)?.min(0.0))
    }

    /// Boolean form used as a feasibility predicate.
    ///
    /// # Errors
    ///
    /// Propagates oracle errors.
    pub fn is_feasible(&self, x: &[f64]) -> ChainResult<bool> {
        self.oracle.is_physically_valid(x)
    }
}

/// `0` if `x` succeeds (or is invalid), `-1` if it fails.
#[derive(Debug, Clone, Copy)]
pub struct SuccessConstraint<'a, O: ?Sized> {
    oracle: &'a O,
}

impl<'a, O: LabelOracle + ?Sized> SuccessConstraint<'a, O> {
    /// Wrap an oracle.
    #[must_use]
    pub const fn new(oracle: &'a O) -> Self {
        Self { oracle }
    }

    /// Constraint value at `x`. Runs a simulation for valid samples.
    ///
    /// # Errors
    ///
    /// Propagates oracle errors.
    pub fn evaluate(&self, x: &[f64]) -> ChainResult<f64> {
        if !self.oracle.is_physically_valid(x)? {
            return Ok(0.0);
        }
        Ok(if self.oracle.label(x)?.is_success() { 0.0 } else { -1.0 })
    }
}

/// Staged energy of the global search: a penalty proportional to the
/// violation if invalid, a flat penalty if unsuccessful, else the
/// robustness energy.
#[derive(Debug, Clone)]
pub struct CombinedEnergy<'a, O: ?Sized> {
    robustness: RobustnessEnergy<'a>,
    validity: PhysicalValidityConstraint<'a, O>,
    success: SuccessConstraint<'a, O>,
}

impl<'a, O: LabelOracle + ?Sized> CombinedEnergy<'a, O> {
    /// Combine the robustness energy with the oracle's constraints.
    #[must_use]
    pub fn new(robustness: RobustnessEnergy<'a>, oracle: &'a O) -> Self {
        Self {
            robustness,
            validity: PhysicalValidityConstraint::new(oracle),
            success: SuccessConstraint::new(oracle),
        }
    }

    /// Energy at `x`.
    ///
    /// # Errors
    ///
    /// Propagates oracle and estimator errors.
    pub fn evaluate(&self, x: &[f64]) -> ChainResult<f64> {
        let phys = self.validity.evaluate(x)?;
        if phys < 0.0 {
            return Ok(PENALTY * -phys);
        }
        if self.success.evaluate(x)? < 0.0 {
            return Ok(PENALTY);
        }
        self.robustness.evaluate(x)
    }
}

/// Sample with the highest product of predicted success probabilities.
///
/// Returns `None` for an empty sample list.
///
/// # Errors
///
/// Returns an error if an estimator lacks probability estimates.
pub fn select_warm_start(
    estimators: &[&BoundaryEstimator],
    samples: &[Sample],
) -> ChainResult<Option<Sample>> {
    let mut best: Option<(f64, &Sample)> = None;
    for sample in samples {
        let mut score = 1.0;
        for estimator in estimators {
            score *= estimator.predict_proba(sample)?;
        }
        if best.map_or(true, |(s, _)| score > s) {
            best = Some((score, sample));
        }
    }
    Ok(best.map(|(_, s)| s.clone()))
}

/// Gradient-based refinement from `x0` of the robustness energy, under
/// the physical validity constraint.
///
/// # Errors
///
/// Propagates oracle, estimator and solver errors.
pub fn maximize_robustness_local<O: LabelOracle + ?Sized>(
    oracle: &O,
    estimators: &[&BoundaryEstimator],
    x0: &[f64],
    settings: &OptimizerSettings,
) -> ChainResult<OptimizationResult> {
    check_start(oracle, x0)?;
    let energy = RobustnessEnergy::new(estimators.iter().copied(), settings.smin_coeff)?;
    let validity = PhysicalValidityConstraint::new(oracle);
    let sqp = SqpSettings {
        max_iter: settings.max_iter,
        ..SqpSettings::default()
    };
    let result = minimize_sqp(
        |x: &[f64]| energy.evaluate(x),
        |x: &[f64]| validity.evaluate(x),
        x0,
        &sqp,
    )?;
    info!(
        fun = result.fun,
        nit = result.nit,
        nfev = result.nfev,
        success = result.success,
        message = %result.message,
        "local robustness optimization"
    );
    Ok(result)
}

/// CMA-ES search of the combined energy from `x0`, drawing only physically
/// valid candidates.
///
/// # Errors
///
/// Propagates oracle, estimator and solver errors.
pub fn maximize_robustness_global<O: LabelOracle + ?Sized>(
    oracle: &O,
    estimators: &[&BoundaryEstimator],
    x0: &[f64],
    settings: &OptimizerSettings,
    rng: &mut SimRng,
    pool: &WorkerPool,
) -> ChainResult<OptimizationResult> {
    check_start(oracle, x0)?;
    let robustness = RobustnessEnergy::new(estimators.iter().copied(), settings.smin_coeff)?;
    let energy = CombinedEnergy::new(robustness, oracle);
    let validity = PhysicalValidityConstraint::new(oracle);
    let cma = CmaEsSettings {
        sigma0: settings.sigma0,
        max_fevals: settings.max_fevals,
        max_iter: settings.max_iter,
        ..CmaEsSettings::default()
    };
    let result = minimize_cmaes(
        |x: &[f64]| energy.evaluate(x),
        |x: &[f64]| validity.is_feasible(x),
        x0,
        &cma,
        rng,
        pool,
    )?;
    info!(
        fun = result.fun,
        nit = result.nit,
        nfev = result.nfev,
        message = %result.message,
        "global robustness optimization"
    );
    Ok(result)
}

fn check_start<O: LabelOracle + ?Sized>(oracle: &O, x0: &[f64]) -> ChainResult<()> {
    if x0.len() == oracle.dims() {
        Ok(())
    } else {
        Err(ChainError::DimensionMismatch {
            expected: oracle.dims(),
            found: x0.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::robustness::estimator::{LogSpace, SvcSettings};
    use crate::robustness::testing::DiskOracle;
    use crate::robustness::train_svc;

    fn disk_estimator(oracle: &DiskOracle) -> BoundaryEstimator {
        let mut samples = Vec::new();
        let mut labels = Vec::new();
        for i in 0..12 {
            for j in 0..12 {
                let s = vec![(f64::from(i) + 0.5) / 12.0, (f64::from(j) + 0.5) / 12.0];
                labels.push(oracle.label(&s).unwrap().is_success());
                samples.push(s);
            }
        }
        let settings = SvcSettings {
            c_range: LogSpace::new(0.0, 2.0, 3),
            gamma_range: LogSpace::new(-1.0, 1.0, 3),
            ..SvcSettings::default()
        };
        train_svc(&samples, &labels, None, true, &settings, &WorkerPool::with_workers(2))
            .unwrap()
            .0
    }

    #[test]
    fn test_soft_min_tracks_the_weakest_estimator() {
        let oracle = DiskOracle::new(2);
        let est = disk_estimator(&oracle);
        let single = RobustnessEnergy::new([&est], 1.0).unwrap();
        let center = single.evaluate(&[0.5, 0.5]).unwrap();
        let corner = single.evaluate(&[0.05, 0.95]).unwrap();
        assert!(center < corner);
        assert!((-1.0..=0.0).contains(&center));

        // a very sharp soft min approaches the minimum probability
        let sharp = RobustnessEnergy::new([&est, &est], 50.0).unwrap();
        let p = est.predict_proba(&[0.5, 0.5]).unwrap();
        assert!((sharp.evaluate(&[0.5, 0.5]).unwrap() + p).abs() < 1e-9);
    }

    #[test]
    fn test_energy_requires_estimators() {
        assert!(RobustnessEnergy::new(Vec::<&BoundaryEstimator>::new(), 1.0).is_err());
    }

    #[test]
    fn test_constraints() {
        let oracle = DiskOracle::new(2).with_forbidden_corner(0.2);
        let validity = PhysicalValidityConstraint::new(&oracle);
        assert!(validity.evaluate(&[0.1, 0.1]).unwrap() < 0.0);
        assert!(validity.evaluate(&[0.5, 0.5]).unwrap().abs() < f64::EPSILON);
        let success = SuccessConstraint::new(&oracle);
        assert!(success.evaluate(&[0.5, 0.5]).unwrap().abs() < f64::EPSILON);
        assert!((success.evaluate(&[0.9, 0.9]).unwrap() + 1.0).abs() < f64::EPSILON);
        assert!(success.evaluate(&[0.1, 0.1]).unwrap().abs() < f64::EPSILON);
    }

    #[test]
    fn test_combined_energy_stages() {
        let oracle = DiskOracle::new(2).with_forbidden_corner(0.2);
        let est = disk_estimator(&oracle);
        let energy = CombinedEnergy::new(RobustnessEnergy::new([&est], 1.0).unwrap(), &oracle);
        let invalid = energy.evaluate(&[0.1, 0.15]).unwrap();
        assert!((invalid - 5.0).abs() < 1e-9);
        assert!((energy.evaluate(&[0.9, 0.9]).unwrap() - PENALTY).abs() < f64::EPSILON);
        assert!(energy.evaluate(&[0.5, 0.5]).unwrap() < 0.0);
    }

    #[test]
    fn test_warm_start_prefers_center() {
        let oracle = DiskOracle::new(2);
        let est = disk_estimator(&oracle);
        let samples = vec![vec![0.1, 0.1], vec![0.5, 0.52], vec![0.7, 0.5]];
        let start = select_warm_start(&[&est], &samples).unwrap();
        assert_eq!(start, Some(vec![0.5, 0.52]));
        assert_eq!(select_warm_start(&[&est], &[]).unwrap(), None);
    }

    #[test]
    fn test_local_improves_robustness() {
        let oracle = DiskOracle::new(2);
        let est = disk_estimator(&oracle);
        let x0 = [0.62, 0.55];
        let before = RobustnessEnergy::new([&est], 1.0).unwrap().evaluate(&x0).unwrap();
        let res = maximize_robustness_local(&oracle, &[&est], &x0, &OptimizerSettings::default())
            .unwrap();
        assert!(res.fun <= before);
        assert!(res.x.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_global_stays_valid() {
        let oracle = DiskOracle::new(2).with_forbidden_corner(0.3);
        let est = disk_estimator(&DiskOracle::new(2));
        let settings = OptimizerSettings {
            max_fevals: 120,
            ..OptimizerSettings::default()
        };
        let res = maximize_robustness_global(
            &oracle,
            &[&est],
            &[0.6, 0.6],
            &settings,
            &mut SimRng::new(2),
            &WorkerPool::with_workers(2),
        )
        .unwrap();
        assert!(oracle.is_physically_valid(&res.x).unwrap());
        assert!(res.fun < 0.0);
        assert!(res.nfev <= 120);
    }

    #[test]
    fn test_dimension_checked() {
        let oracle = DiskOracle::new(2);
        let est = disk_estimator(&oracle);
        let err = maximize_robustness_local(&oracle, &[&est], &[0.5], &OptimizerSettings::default())
            .unwrap_err();
        assert!(matches!(err, ChainError::DimensionMismatch { .. }));
    }
}
