//! Success-boundary estimator.
//!
//! A [`BoundaryEstimator`] is a dimension selector, a [`StandardScaler`] and
//! an RBF [`Svc`], with hyperparameters chosen by a cross-validated grid
//! search. Optionally it carries a [`PlattScaling`] for probabilities.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::svm::{ClassWeight, PlattScaling, Svc, SvcParams};
use super::Sample;
use crate::engine::WorkerPool;
use crate::error::{ChainError, ChainResult};

/// Folds used to collect decision values for Platt scaling.
const PLATT_FOLDS: usize = 5;

/// `num` values evenly spaced in log10 between `10^start` and `10^stop`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogSpace {
    /// Exponent of the first value.
    pub start: f64,
    /// Exponent of the last value.
    pub stop: f64,
    /// Number of values.
    pub num: usize,
}

impl LogSpace {
    /// Create a range.
    #[must_use]
    pub const fn new(start: f64, stop: f64, num: usize) -> Self {
        Self { start, stop, num }
    }

    /// Values of the range.
    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        match self.num {
            0 => Vec::new(),
            1 => vec![10f64.powf(self.start)],
            n => {
                let step = (self.stop - self.start) / (n - 1) as f64;
                (0..n)
                    .map(|i| 10f64.powf((i as f64).mul_add(step, self.start)))
                    .collect()
            }
        }
    }
}

/// Grid search settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SvcSettings {
    /// Penalty grid.
    pub c_range: LogSpace,
    /// Kernel width grid.
    pub gamma_range: LogSpace,
    /// Cross-validation folds.
    pub cv_folds: usize,
    /// SMO iteration cap.
    pub max_iter: usize,
}

impl Default for SvcSettings {
    fn default() -> Self {
        Self {
            c_range: LogSpace::new(-2.0, 3.0, 6),
            gamma_range: LogSpace::new(-3.0, 2.0, 6),
            cv_folds: 3,
            max_iter: 100_000,
        }
    }
}

impl SvcSettings {
    /// Every hyperparameter combination, `gamma` varying fastest.
    #[must_use]
    pub fn grid(&self) -> Vec<SvcParams> {
        let gammas = self.gamma_range.values();
        let mut grid = Vec::new();
        for c in self.c_range.values() {
            for class_weight in [ClassWeight::Uniform, ClassWeight::Balanced] {
                for &gamma in &gammas {
                    grid.push(SvcParams {
                        c,
                        gamma,
                        class_weight,
                        max_iter: self.max_iter,
                        ..SvcParams::default()
                    });
                }
            }
        }
        grid
    }
}

/// Per-feature standardization with population statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl StandardScaler {
    /// Fit on rows of `x`. Constant features get a scale of 1.
    #[must_use]
    pub fn fit(x: &[Vec<f64>]) -> Self {
        let dims = x.first().map_or(0, Vec::len);
        let n = x.len().max(1) as f64;
        let mut mean = vec![0.0; dims];
        for row in x {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v / n;
            }
        }
        let mut var = vec![0.0; dims];
        for row in x {
            for ((s, v), m) in var.iter_mut().zip(row).zip(&mean) {
                *s += (v - m) * (v - m) / n;
            }
        }
        let scale = var
            .into_iter()
            .map(|v| {
                let s = v.sqrt();
                if s > 0.0 && s.is_finite() {
                    s
                } else {
                    1.0
                }
            })
            .collect();
        Self { mean, scale }
    }

    /// Standardize one row.
    #[must_use]
    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(&self.mean)
            .zip(&self.scale)
            .map(|((v, m), s)| (v - m) / s)
            .collect()
    }

    /// Feature means.
    #[must_use]
    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// Feature standard deviations.
    #[must_use]
    pub fn scale(&self) -> &[f64] {
        &self.scale
    }
}

/// Scaler followed by an SVC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Pipeline {
    scaler: StandardScaler,
    svc: Svc,
}

impl Pipeline {
    fn fit(x: &[Vec<f64>], y: &[bool], params: &SvcParams) -> ChainResult<Self> {
        let scaler = StandardScaler::fit(x);
        let scaled: Vec<Vec<f64>> = x.iter().map(|row| scaler.transform(row)).collect();
        let svc = Svc::fit(&scaled, y, params)?;
        Ok(Self { scaler, svc })
    }

    fn decision_function(&self, row: &[f64]) -> f64 {
        self.svc.decision_function(&self.scaler.transform(row))
    }
}

/// Model trained on one cross-validation fold.
enum FoldModel {
    /// Training fold held a single class.
    Constant(bool),
    Fitted(Pipeline),
}

impl FoldModel {
    fn fit(x: &[Vec<f64>], y: &[bool], params: &SvcParams) -> ChainResult<Self> {
        match y.first() {
            Some(&first) if y.iter().all(|&v| v == first) => Ok(Self::Constant(first)),
            _ => Pipeline::fit(x, y, params).map(Self::Fitted),
        }
    }

    fn decision_function(&self, row: &[f64]) -> f64 {
        match self {
            Self::Constant(true) => 1.0,
            Self::Constant(false) => -1.0,
            Self::Fitted(pipeline) => pipeline.decision_function(row),
        }
    }
}

/// Split indices into `k` stratified folds.
///
/// Each class's indices, in order, are cut into `k` contiguous chunks whose
/// sizes differ by at most one (larger chunks first); fold `f` is the union
/// of the `f`-th chunks.
#[must_use]
pub fn stratified_folds(labels: &[bool], k: usize) -> Vec<Vec<usize>> {
    let k = k.max(1);
    let mut folds = vec![Vec::new(); k];
    for class in [false, true] {
        let members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
        let base = members.len() / k;
        let extra = members.len() % k;
        let mut start = 0;
        for (f, fold) in folds.iter_mut().enumerate() {
            let size = base + usize::from(f < extra);
            fold.extend_from_slice(&members[start..start + size]);
            start += size;
        }
    }
    for fold in &mut folds {
        fold.sort_unstable();
    }
    folds
}

/// Split `x`/`y` into the complement of `test` and `test` itself.
fn split(x: &[Vec<f64>], y: &[bool], test: &[usize]) -> (Vec<Vec<f64>>, Vec<bool>) {
    let mut in_test = vec![false; x.len()];
    for &i in test {
        in_test[i] = true;
    }
    (0..x.len())
        .filter(|&i| !in_test[i])
        .map(|i| (x[i].clone(), y[i]))
        .unzip()
}

/// Mean accuracy over stratified folds.
fn cross_val_score(
    x: &[Vec<f64>],
    y: &[bool],
    params: &SvcParams,
    folds: &[Vec<usize>],
) -> ChainResult<f64> {
    let mut total = 0.0;
    let mut counted = 0usize;
    for test in folds.iter().filter(|f| !f.is_empty()) {
        let (x_train, y_train) = split(x, y, test);
        if y_train.is_empty() {
            continue;
        }
        let model = FoldModel::fit(&x_train, &y_train, params)?;
        let correct = test
            .iter()
            .filter(|&&i| (model.decision_function(&x[i]) > 0.0) == y[i])
            .count();
        total += correct as f64 / test.len() as f64;
        counted += 1;
    }
    Ok(if counted == 0 { 0.0 } else { total / counted as f64 })
}

/// Decision values of each sample from a model that did not see it.
fn cross_val_decision(
    x: &[Vec<f64>],
    y: &[bool],
    params: &SvcParams,
    folds: &[Vec<usize>],
) -> ChainResult<Vec<f64>> {
    let mut decision = vec![0.0; x.len()];
    for test in folds.iter().filter(|f| !f.is_empty()) {
        let (x_train, y_train) = split(x, y, test);
        if y_train.is_empty() {
            continue;
        }
        let model = FoldModel::fit(&x_train, &y_train, params)?;
        for &i in test {
            decision[i] = model.decision_function(&x[i]);
        }
    }
    Ok(decision)
}

/// Fitted classifier of success over the unit cube.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryEstimator {
    dims: Vec<usize>,
    pipeline: Pipeline,
    platt: Option<PlattScaling>,
    cv_score: f64,
}

impl BoundaryEstimator {
    fn project(&self, sample: &[f64]) -> Vec<f64> {
        self.dims.iter().map(|&d| sample[d]).collect()
    }

    /// Signed score; positive means success.
    #[must_use]
    pub fn decision_function(&self, sample: &[f64]) -> f64 {
        self.pipeline.decision_function(&self.project(sample))
    }

    /// Predicted success.
    #[must_use]
    pub fn predict(&self, sample: &[f64]) -> bool {
        self.decision_function(sample) > 0.0
    }

    /// Probability of success.
    ///
    /// # Errors
    ///
    /// Returns a learning error if the estimator was trained without
    /// probability estimates.
    pub fn predict_proba(&self, sample: &[f64]) -> ChainResult<f64> {
        let platt = self.platt.as_ref().ok_or_else(|| {
            ChainError::learning("estimator was trained without probability estimates")
        })?;
        Ok(platt.probability(self.decision_function(sample)))
    }

    /// True if [`BoundaryEstimator::predict_proba`] is available.
    #[must_use]
    pub const fn has_probability(&self) -> bool {
        self.platt.is_some()
    }

    /// Dimensions the estimator looks at.
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Scaler standard deviations, aligned with [`BoundaryEstimator::dims`].
    #[must_use]
    pub fn scale(&self) -> &[f64] {
        self.pipeline.scaler.scale()
    }

    /// Training-set indices of the support vectors.
    #[must_use]
    pub fn support(&self) -> &[usize] {
        self.pipeline.svc.support()
    }

    /// Selected hyperparameters.
    #[must_use]
    pub const fn params(&self) -> &SvcParams {
        self.pipeline.svc.params()
    }

    /// Cross-validated accuracy of the selected hyperparameters.
    #[must_use]
    pub const fn cv_score(&self) -> f64 {
        self.cv_score
    }
}

/// Grid-search an SVC on `samples` restricted to `dims` (all dimensions if
/// `None`) and refit the best one on all data.
///
/// Returns the estimator and its cross-validated accuracy.
///
/// # Errors
///
/// Returns a learning error if fewer than two classes are present, and a
/// dimension error if samples disagree on length or `dims` is out of range.
pub fn train_svc(
    samples: &[Sample],
    labels: &[bool],
    dims: Option<&[usize]>,
    probability: bool,
    settings: &SvcSettings,
    pool: &WorkerPool,
) -> ChainResult<(BoundaryEstimator, f64)> {
    if samples.len() != labels.len() {
        return Err(ChainError::DimensionMismatch {
            expected: samples.len(),
            found: labels.len(),
        });
    }
    let width = samples.first().map_or(0, Vec::len);
    if let Some(bad) = samples.iter().find(|s| s.len() != width) {
        return Err(ChainError::DimensionMismatch {
            expected: width,
            found: bad.len(),
        });
    }
    let dims: Vec<usize> = dims.map_or_else(|| (0..width).collect(), <[usize]>::to_vec);
    if let Some(&d) = dims.iter().find(|&&d| d >= width) {
        return Err(ChainError::DimensionMismatch {
            expected: width,
            found: d + 1,
        });
    }
    let n_pos = labels.iter().filter(|&&l| l).count();
    if n_pos == 0 || n_pos == labels.len() {
        return Err(ChainError::learning(format!(
            "need both classes to train, got {n_pos} successes out of {}",
            labels.len()
        )));
    }

    let x: Vec<Vec<f64>> = samples
        .iter()
        .map(|s| dims.iter().map(|&d| s[d]).collect())
        .collect();

    let grid = settings.grid();
    if grid.is_empty() {
        return Err(ChainError::config("empty hyperparameter grid"));
    }
    let folds = stratified_folds(labels, settings.cv_folds);
    let scores = pool.try_map(&grid, |_, params| cross_val_score(&x, labels, params, &folds))?;

    let mut best = 0;
    for (i, &score) in scores.iter().enumerate() {
        if score > scores[best] {
            best = i;
        }
    }
    let params = grid[best];
    let cv_score = scores[best];
    debug!(
        c = params.c,
        gamma = params.gamma,
        class_weight = ?params.class_weight,
        cv_score,
        n = samples.len(),
        "selected SVC hyperparameters"
    );

    let pipeline = Pipeline::fit(&x, labels, &params)?;
    let platt = if probability {
        let platt_folds = stratified_folds(labels, PLATT_FOLDS);
        let decision = cross_val_decision(&x, labels, &params, &platt_folds)?;
        Some(PlattScaling::fit(&decision, labels))
    } else {
        None
    };

    Ok((
        BoundaryEstimator {
            dims,
            pipeline,
            platt,
            cv_score,
        },
        cv_score,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_settings() -> SvcSettings {
        SvcSettings {
            c_range: LogSpace::new(0.0, 2.0, 3),
            gamma_range: LogSpace::new(-1.0, 1.0, 3),
            ..SvcSettings::default()
        }
    }

    /// Grid over the unit square, success inside a disk.
    fn disk_data() -> (Vec<Sample>, Vec<bool>) {
        let mut samples = Vec::new();
        let mut labels = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                let s = vec![(f64::from(i) + 0.5) / 10.0, (f64::from(j) + 0.5) / 10.0];
                labels.push((s[0] - 0.5).powi(2) + (s[1] - 0.5).powi(2) < 0.09);
                samples.push(s);
            }
        }
        (samples, labels)
    }

    #[test]
    fn test_logspace() {
        let v = LogSpace::new(-1.0, 1.0, 3).values();
        assert_eq!(v.len(), 3);
        assert!((v[0] - 0.1).abs() < 1e-12);
        assert!((v[1] - 1.0).abs() < 1e-12);
        assert!((v[2] - 10.0).abs() < 1e-12);
        assert_eq!(LogSpace::new(2.0, 5.0, 1).values(), vec![100.0]);
        assert!(LogSpace::new(0.0, 1.0, 0).values().is_empty());
    }

    #[test]
    fn test_grid_order() {
        let grid = small_settings().grid();
        assert_eq!(grid.len(), 18);
        assert!(grid[0].gamma < grid[1].gamma);
        assert_eq!(grid[0].class_weight, ClassWeight::Uniform);
        assert_eq!(grid[3].class_weight, ClassWeight::Balanced);
        assert!(grid[6].c > grid[0].c);
    }

    #[test]
    fn test_scaler() {
        let x = vec![vec![0.0, 5.0], vec![2.0, 5.0]];
        let scaler = StandardScaler::fit(&x);
        assert_eq!(scaler.mean(), &[1.0, 5.0]);
        assert_eq!(scaler.scale(), &[1.0, 1.0]);
        assert_eq!(scaler.transform(&[2.0, 6.0]), vec![1.0, 1.0]);
    }

    #[test]
    fn test_stratified_folds() {
        let labels = [true, false, true, false, false, true, false, false];
        let folds = stratified_folds(&labels, 3);
        assert_eq!(folds.len(), 3);
        // negatives 1,3,4,6,7 -> [1,3],[4,6],[7]; positives 0,2,5 -> [0],[2],[5]
        assert_eq!(folds[0], vec![0, 1, 3]);
        assert_eq!(folds[1], vec![2, 4, 6]);
        assert_eq!(folds[2], vec![5, 7]);
    }

    #[test]
    fn test_train_disk() {
        let (samples, labels) = disk_data();
        let pool = WorkerPool::with_workers(2);
        let (est, score) =
            train_svc(&samples, &labels, None, true, &small_settings(), &pool).unwrap();
        assert!(score > 0.85, "cv score {score}");
        assert!((est.cv_score() - score).abs() < f64::EPSILON);
        assert!(est.predict(&[0.5, 0.5]));
        assert!(!est.predict(&[0.02, 0.98]));
        let center = est.predict_proba(&[0.5, 0.5]).unwrap();
        assert!(center > est.predict_proba(&[0.02, 0.98]).unwrap());
        assert_eq!(est.dims(), &[0, 1]);
        assert_eq!(est.scale().len(), 2);
    }

    #[test]
    fn test_train_selected_dims() {
        // success depends on the first coordinate only
        let samples: Vec<Sample> = (0..40)
            .map(|i| vec![f64::from(i) / 39.0, f64::from((i * 7) % 40) / 39.0])
            .collect();
        let labels: Vec<bool> = samples.iter().map(|s| s[0] > 0.5).collect();
        let (est, score) = train_svc(
            &samples,
            &labels,
            Some(&[0]),
            false,
            &small_settings(),
            &WorkerPool::with_workers(1),
        )
        .unwrap();
        assert!(score > 0.9);
        assert_eq!(est.dims(), &[0]);
        assert!(est.predict(&[0.9, 0.0]) && est.predict(&[0.9, 1.0]));
        assert!(!est.predict(&[0.1, 0.5]));
        assert!(est.predict_proba(&[0.9, 0.0]).is_err());
    }

    #[test]
    fn test_single_class_rejected() {
        let samples = vec![vec![0.1], vec![0.2], vec![0.3]];
        let err = train_svc(
            &samples,
            &[false, false, false],
            None,
            false,
            &small_settings(),
            &WorkerPool::with_workers(1),
        )
        .unwrap_err();
        assert!(matches!(err, ChainError::Learning(_)));
    }

    #[test]
    fn test_out_of_range_dims_rejected() {
        let samples = vec![vec![0.1], vec![0.9]];
        let err = train_svc(
            &samples,
            &[false, true],
            Some(&[1]),
            false,
            &small_settings(),
            &WorkerPool::with_workers(1),
        )
        .unwrap_err();
        assert!(matches!(err, ChainError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_worker_count_does_not_change_result() {
        let (samples, labels) = disk_data();
        let run = |workers| {
            train_svc(
                &samples,
                &labels,
                None,
                false,
                &small_settings(),
                &WorkerPool::with_workers(workers),
            )
            .unwrap()
        };
        let (one, four) = (run(1), run(4));
        assert_eq!(one.0, four.0);
    }
}
