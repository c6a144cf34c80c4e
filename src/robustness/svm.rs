//! Binary C-SVC with an RBF kernel.
//!
//! The dual is solved by SMO with second-order working set selection
//! (Fan, Chen & Lin, 2005). Probabilities come from Platt scaling fitted
//! on cross-validated decision values (Lin, Lin & Weng, 2007).

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ChainError, ChainResult};

/// Floor for non-positive curvature in the SMO step.
const TAU: f64 = 1e-12;

/// Per-class penalty scaling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassWeight {
    /// Same penalty for both classes.
    #[default]
    Uniform,
    /// Penalty inversely proportional to class frequency.
    Balanced,
}

/// Hyperparameters of one SVC fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SvcParams {
    /// Penalty `C`.
    pub c: f64,
    /// RBF width `γ` in `exp(-γ‖x − x'‖²)`.
    pub gamma: f64,
    /// Class weighting.
    pub class_weight: ClassWeight,
    /// KKT tolerance.
    pub tol: f64,
    /// SMO iteration cap.
    pub max_iter: usize,
}

impl Default for SvcParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            gamma: 1.0,
            class_weight: ClassWeight::Uniform,
            tol: 1e-3,
            max_iter: 100_000,
        }
    }
}

/// RBF kernel.
#[must_use]
pub fn rbf(a: &[f64], b: &[f64], gamma: f64) -> f64 {
    let d2: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    (-gamma * d2).exp()
}

/// Fitted support vector classifier; `true` is the positive class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Svc {
    params: SvcParams,
    /// Indices of the support vectors in the training set.
    support: Vec<usize>,
    support_vectors: Vec<Vec<f64>>,
    /// `α_i y_i` for each support vector.
    dual_coef: Vec<f64>,
    rho: f64,
    n_iter: usize,
}

impl Svc {
    /// Train on `x` with labels `y`.
    ///
    /// # Errors
    ///
    /// Returns a learning error if the data is empty, the lengths differ, or
    /// only one class is present.
    pub fn fit(x: &[Vec<f64>], y: &[bool], params: &SvcParams) -> ChainResult<Self> {
        if x.is_empty() {
            return Err(ChainError::learning("cannot train on an empty set"));
        }
        if x.len() != y.len() {
            return Err(ChainError::learning(format!(
                "{} samples but {} labels",
                x.len(),
                y.len()
            )));
        }
        let n_pos = y.iter().filter(|&&v| v).count();
        let n_neg = y.len() - n_pos;
        if n_pos == 0 || n_neg == 0 {
            return Err(ChainError::learning("training set contains a single class"));
        }

        let n = x.len();
        let (w_pos, w_neg) = match params.class_weight {
            ClassWeight::Uniform => (1.0, 1.0),
            ClassWeight::Balanced => (
                n as f64 / (2.0 * n_pos as f64),
                n as f64 / (2.0 * n_neg as f64),
            ),
        };
        let sign: Vec<f64> = y.iter().map(|&v| if v { 1.0 } else { -1.0 }).collect();
        let upper: Vec<f64> = y
            .iter()
            .map(|&v| params.c * if v { w_pos } else { w_neg })
            .collect();

        let mut kernel = vec![0.0; n * n];
        for i in 0..n {
            kernel[i * n + i] = 1.0;
            for j in (i + 1)..n {
                let k = rbf(&x[i], &x[j], params.gamma);
                kernel[i * n + j] = k;
                kernel[j * n + i] = k;
            }
        }

        let solution = Smo {
            n,
            kernel: &kernel,
            sign: &sign,
            upper: &upper,
            tol: params.tol,
            max_iter: params.max_iter,
        }
        .solve();

        let support: Vec<usize> = (0..n).filter(|&i| solution.alpha[i] > 0.0).collect();
        Ok(Self {
            params: *params,
            support_vectors: support.iter().map(|&i| x[i].clone()).collect(),
            dual_coef: support.iter().map(|&i| solution.alpha[i] * sign[i]).collect(),
            support,
            rho: solution.rho,
            n_iter: solution.n_iter,
        })
    }

    /// Signed distance proxy; positive means `true`.
    #[must_use]
    pub fn decision_function(&self, x: &[f64]) -> f64 {
        self.support_vectors
            .iter()
            .zip(&self.dual_coef)
            .map(|(sv, coef)| coef * rbf(sv, x, self.params.gamma))
            .sum::<f64>()
            - self.rho
    }

    /// Predicted class.
    #[must_use]
    pub fn predict(&self, x: &[f64]) -> bool {
        self.decision_function(x) > 0.0
    }

    /// Training-set indices of the support vectors.
    #[must_use]
    pub fn support(&self) -> &[usize] {
        &self.support
    }

    /// Hyperparameters used for the fit.
    #[must_use]
    pub const fn params(&self) -> &SvcParams {
        &self.params
    }

    /// SMO iterations used.
    #[must_use]
    pub const fn n_iter(&self) -> usize {
        self.n_iter
    }
}

struct Solution {
    alpha: Vec<f64>,
    rho: f64,
    n_iter: usize,
}

/// `min ½αᵀQα − eᵀα` s.t. `yᵀα = 0`, `0 ≤ α_i ≤ upper_i`, with
/// `Q_ij = y_i y_j K_ij`.
struct Smo<'a> {
    n: usize,
    kernel: &'a [f64],
    sign: &'a [f64],
    upper: &'a [f64],
    tol: f64,
    max_iter: usize,
}

impl Smo<'_> {
    fn q(&self, i: usize, j: usize) -> f64 {
        self.sign[i] * self.sign[j] * self.kernel[i * self.n + j]
    }

    fn is_upper(&self, alpha: &[f64], i: usize) -> bool {
        alpha[i] >= self.upper[i]
    }

    fn is_lower(alpha: &[f64], i: usize) -> bool {
        alpha[i] <= 0.0
    }

    fn solve(&self) -> Solution {
        let n = self.n;
        let mut alpha = vec![0.0; n];
        let mut grad = vec![-1.0; n];
        let mut n_iter = 0;

        while n_iter < self.max_iter {
            let Some((i, j)) = self.select_working_set(&alpha, &grad) else {
                break;
            };
            n_iter += 1;
            self.update_pair(i, j, &mut alpha, &mut grad);
        }
        if n_iter >= self.max_iter {
            warn!(max_iter = self.max_iter, "SMO reached the iteration cap");
        }

        Solution {
            rho: self.rho(&alpha, &grad),
            alpha,
            n_iter,
        }
    }

    fn select_working_set(&self, alpha: &[f64], grad: &[f64]) -> Option<(usize, usize)> {
        let mut g_max = f64::NEG_INFINITY;
        let mut i_sel = None;
        for t in 0..self.n {
            let candidate = if self.sign[t] > 0.0 {
                (!self.is_upper(alpha, t)).then(|| -grad[t])
            } else {
                (!Self::is_lower(alpha, t)).then(|| grad[t])
            };
            if let Some(value) = candidate {
                if value >= g_max {
                    g_max = value;
                    i_sel = Some(t);
                }
            }
        }
        let i = i_sel?;

        let mut g_max2 = f64::NEG_INFINITY;
        let mut obj_min = f64::INFINITY;
        let mut j_sel = None;
        for t in 0..self.n {
            let (eligible, value) = if self.sign[t] > 0.0 {
                (!Self::is_lower(alpha, t), grad[t])
            } else {
                (!self.is_upper(alpha, t), -grad[t])
            };
            if !eligible {
                continue;
            }
            g_max2 = g_max2.max(value);
            let grad_diff = g_max + value;
            if grad_diff > 0.0 {
                let quad = 2.0f64.mul_add(-self.kernel[i * self.n + t], 2.0);
                let quad = if quad > 0.0 { quad } else { TAU };
                let obj = -(grad_diff * grad_diff) / quad;
                if obj <= obj_min {
                    obj_min = obj;
                    j_sel = Some(t);
                }
            }
        }

        if g_max + g_max2 < self.tol {
            return None;
        }
        j_sel.map(|j| (i, j))
    }

    fn update_pair(&self, i: usize, j: usize, alpha: &mut [f64], grad: &mut [f64]) {
        let (c_i, c_j) = (self.upper[i], self.upper[j]);
        let (old_i, old_j) = (alpha[i], alpha[j]);
        let q_ij = self.q(i, j);

        if (self.sign[i] - self.sign[j]).abs() > f64::EPSILON {
            let quad = (2.0 + 2.0 * q_ij).max(TAU);
            let delta = (-grad[i] - grad[j]) / quad;
            let diff = alpha[i] - alpha[j];
            alpha[i] += delta;
            alpha[j] += delta;
            if diff > 0.0 {
                if alpha[j] < 0.0 {
                    alpha[j] = 0.0;
                    alpha[i] = diff;
                }
            } else if alpha[i] < 0.0 {
                alpha[i] = 0.0;
                alpha[j] = -diff;
            }
            if diff > c_i - c_j {
                if alpha[i] > c_i {
                    alpha[i] = c_i;
                    alpha[j] = c_i - diff;
                }
            } else if alpha[j] > c_j {
                alpha[j] = c_j;
                alpha[i] = c_j + diff;
            }
        } else {
            let quad = (2.0 - 2.0 * q_ij).max(TAU);
            let delta = (grad[i] - grad[j]) / quad;
            let sum = alpha[i] + alpha[j];
            alpha[i] -= delta;
            alpha[j] += delta;
            if sum > c_i {
                if alpha[i] > c_i {
                    alpha[i] = c_i;
                    alpha[j] = sum - c_i;
                }
            } else if alpha[j] < 0.0 {
                alpha[j] = 0.0;
                alpha[i] = sum;
            }
            if sum > c_j {
                if alpha[j] > c_j {
                    alpha[j] = c_j;
                    alpha[i] = sum - c_j;
                }
            } else if alpha[i] < 0.0 {
                alpha[i] = 0.0;
                alpha[j] = sum;
            }
        }

        let d_i = alpha[i] - old_i;
        let d_j = alpha[j] - old_j;
        for (k, g) in grad.iter_mut().enumerate() {
            *g += self.q(i, k) * d_i + self.q(j, k) * d_j;
        }
    }

    fn rho(&self, alpha: &[f64], grad: &[f64]) -> f64 {
        let mut ub = f64::INFINITY;
        let mut lb = f64::NEG_INFINITY;
        let mut n_free = 0usize;
        let mut sum_free = 0.0;
        for i in 0..self.n {
            let yg = self.sign[i] * grad[i];
            let positive = self.sign[i] > 0.0;
            if self.is_upper(alpha, i) {
                if positive {
                    lb = lb.max(yg);
                } else {
                    ub = ub.min(yg);
                }
            } else if Self::is_lower(alpha, i) {
                if positive {
                    ub = ub.min(yg);
                } else {
                    lb = lb.max(yg);
                }
            } else {
                n_free += 1;
                sum_free += yg;
            }
        }
        if n_free > 0 {
            sum_free / n_free as f64
        } else {
            (ub + lb) / 2.0
        }
    }
}

/// Sigmoid map from decision values to probabilities:
/// `P(true | f) = 1 / (1 + exp(a·f + b))`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlattScaling {
    /// Slope (negative for a useful classifier).
    pub a: f64,
    /// Offset.
    pub b: f64,
}

impl PlattScaling {
    /// Fit by Newton's method with backtracking on regularized targets.
    #[must_use]
    pub fn fit(decision: &[f64], labels: &[bool]) -> Self {
        const MAX_ITER: usize = 100;
        const MIN_STEP: f64 = 1e-10;
        const SIGMA: f64 = 1e-12;
        const EPS: f64 = 1e-5;

        let prior1 = labels.iter().filter(|&&l| l).count() as f64;
        let prior0 = labels.len() as f64 - prior1;
        let hi = (prior1 + 1.0) / (prior1 + 2.0);
        let lo = 1.0 / (prior0 + 2.0);
        let target: Vec<f64> = labels.iter().map(|&l| if l { hi } else { lo }).collect();

        let objective = |a: f64, b: f64| -> f64 {
            decision
                .iter()
                .zip(&target)
                .map(|(&f, &t)| {
                    let z = f.mul_add(a, b);
                    if z >= 0.0 {
                        t.mul_add(z, (-z).exp().ln_1p())
                    } else {
                        (t - 1.0).mul_add(z, z.exp().ln_1p())
                    }
                })
                .sum()
        };

        let mut a = 0.0;
        let mut b = ((prior0 + 1.0) / (prior1 + 1.0)).ln();
        let mut fval = objective(a, b);

        for _ in 0..MAX_ITER {
            let (mut h11, mut h22, mut h21, mut g1, mut g2) = (SIGMA, SIGMA, 0.0, 0.0, 0.0);
            for (&f, &t) in decision.iter().zip(&target) {
                let z = f.mul_add(a, b);
                let (p, q) = if z >= 0.0 {
                    let e = (-z).exp();
                    (e / (1.0 + e), 1.0 / (1.0 + e))
                } else {
                    let e = z.exp();
                    (1.0 / (1.0 + e), e / (1.0 + e))
                };
                let d2 = p * q;
                h11 += f * f * d2;
                h22 += d2;
                h21 += f * d2;
                let d1 = t - p;
                g1 += f * d1;
                g2 += d1;
            }
            if g1.abs() < EPS && g2.abs() < EPS {
                break;
            }

            let det = h11 * h22 - h21 * h21;
            let da = -(h22 * g1 - h21 * g2) / det;
            let db = -(-h21 * g1 + h11 * g2) / det;
            let gd = g1 * da + g2 * db;

            let mut step = 1.0;
            while step >= MIN_STEP {
                let (na, nb) = (a + step * da, b + step * db);
                let nf = objective(na, nb);
                if nf < 0.0001f64.mul_add(step * gd, fval) {
                    a = na;
                    b = nb;
                    fval = nf;
                    break;
                }
                step /= 2.0;
            }
            if step < MIN_STEP {
                break;
            }
        }

        Self { a, b }
    }

    /// Probability of the positive class.
    #[must_use]
    pub fn probability(&self, decision: f64) -> f64 {
        let z = decision.mul_add(self.a, self.b);
        if z >= 0.0 {
            let e = (-z).exp();
            e / (1.0 + e)
        } else {
            1.0 / (1.0 + z.exp())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_data() -> (Vec<Vec<f64>>, Vec<bool>) {
        let x: Vec<Vec<f64>> = (0..20).map(|i| vec![f64::from(i) / 10.0 - 1.0]).collect();
        let y = x.iter().map(|p| p[0] > 0.05).collect();
        (x, y)
    }

    #[test]
    fn test_separable_line() {
        let (x, y) = line_data();
        let params = SvcParams {
            c: 1000.0,
            gamma: 10.0,
            ..SvcParams::default()
        };
        let svc = Svc::fit(&x, &y, &params).unwrap();
        for (p, &label) in x.iter().zip(&y) {
            assert_eq!(svc.predict(p), label, "at {p:?}");
        }
        assert!(!svc.support().is_empty());
        assert!(svc.decision_function(&[1.0]) > 0.0);
        assert!(svc.decision_function(&[-1.0]) < 0.0);
    }

    #[test]
    fn test_ring_needs_rbf() {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..12 {
            for j in 0..12 {
                let p = vec![f64::from(i) / 11.0 * 2.0 - 1.0, f64::from(j) / 11.0 * 2.0 - 1.0];
                y.push(p[0] * p[0] + p[1] * p[1] < 0.4);
                x.push(p);
            }
        }
        let params = SvcParams {
            c: 100.0,
            gamma: 2.0,
            ..SvcParams::default()
        };
        let svc = Svc::fit(&x, &y, &params).unwrap();
        let correct = x.iter().zip(&y).filter(|(p, &l)| svc.predict(p) == l).count();
        assert!(correct as f64 / x.len() as f64 > 0.95);
        assert!(svc.predict(&[0.0, 0.0]));
        assert!(!svc.predict(&[1.0, 1.0]));
    }

    #[test]
    fn test_single_class_is_an_error() {
        let x = vec![vec![0.0], vec![1.0]];
        let err = Svc::fit(&x, &[true, true], &SvcParams::default()).unwrap_err();
        assert!(matches!(err, ChainError::Learning(_)));
        assert!(Svc::fit(&[], &[], &SvcParams::default()).is_err());
    }

    #[test]
    fn test_balanced_weights_favor_minority() {
        // one positive among many negatives
        let mut x: Vec<Vec<f64>> = (0..20).map(|i| vec![(f64::from(i) + 0.5) / 20.0]).collect();
        let mut y = vec![false; 20];
        x.push(vec![0.5]);
        y.push(true);
        let weak = SvcParams {
            c: 0.1,
            gamma: 10.0,
            ..SvcParams::default()
        };
        let uniform = Svc::fit(&x, &y, &weak).unwrap();
        let balanced = Svc::fit(
            &x,
            &y,
            &SvcParams {
                class_weight: ClassWeight::Balanced,
                ..weak
            },
        )
        .unwrap();
        assert!(balanced.decision_function(&[0.5]) > uniform.decision_function(&[0.5]));
    }

    #[test]
    fn test_platt_is_monotone() {
        let decision: Vec<f64> = (0..40).map(|i| f64::from(i) / 10.0 - 2.0).collect();
        let labels: Vec<bool> = decision
            .iter()
            .map(|&d| d > 0.3 || (d > -0.5 && d < -0.3))
            .collect();
        let platt = PlattScaling::fit(&decision, &labels);
        assert!(platt.a < 0.0);
        assert!(platt.probability(2.0) > 0.9);
        assert!(platt.probability(-2.0) < 0.1);
        assert!(platt.probability(1.0) > platt.probability(0.0));
    }
}
