//! Sequential quadratic programming for box-bounded problems with one
//! inequality constraint.
//!
//! Each iteration solves a quadratic model of the Lagrangian subject to the
//! linearized constraint, then takes an Armijo step on the L1 merit
//! function. The Hessian approximation is kept positive definite with
//! Powell's damped BFGS update. Gradients are forward differences.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::linalg::{dot, identity, mat_vec, Matrix};
use super::OptimizationResult;
use crate::error::{ChainError, ChainResult};

/// Solver parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SqpSettings {
    /// Iteration cap.
    pub max_iter: usize,
    /// Convergence tolerance on the step, objective change and violation.
    pub tol: f64,
    /// Finite-difference step.
    pub step: f64,
    /// Lower bound of every coordinate.
    pub lower: f64,
    /// Upper bound of every coordinate.
    pub upper: f64,
}

impl Default for SqpSettings {
    fn default() -> Self {
        Self {
            max_iter: 100,
            tol: 1e-6,
            step: 1.490_116_119_384_765_6e-8,
            lower: 0.0,
            upper: 1.0,
        }
    }
}

/// Objective and constraint with an evaluation counter.
struct Problem<'a, F, C> {
    objective: &'a F,
    constraint: &'a C,
    settings: &'a SqpSettings,
    nfev: usize,
}

impl<F, C> Problem<'_, F, C>
where
    F: Fn(&[f64]) -> ChainResult<f64>,
    C: Fn(&[f64]) -> ChainResult<f64>,
{
    fn values(&mut self, x: &[f64]) -> ChainResult<(f64, f64)> {
        self.nfev += 1;
        Ok(((self.objective)(x)?, (self.constraint)(x)?))
    }

    /// Forward differences, backward at the upper bound.
    fn gradients(&mut self, x: &[f64], f: f64, c: f64) -> ChainResult<(Vec<f64>, Vec<f64>)> {
        let n = x.len();
        let mut grad_f = vec![0.0; n];
        let mut grad_c = vec![0.0; n];
        let mut probe = x.to_vec();
        for i in 0..n {
            let h = if x[i] + self.settings.step > self.settings.upper {
                -self.settings.step
            } else {
                self.settings.step
            };
            probe[i] = x[i] + h;
            let (fi, ci) = self.values(&probe)?;
            probe[i] = x[i];
            grad_f[i] = (fi - f) / h;
            grad_c[i] = (ci - c) / h;
        }
        Ok((grad_f, grad_c))
    }

    fn clip(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .map(|v| v.clamp(self.settings.lower, self.settings.upper))
            .collect()
    }
}

/// `min ½dᵀBd + qᵀd` over the box `[lo, hi]` by projected Gauss-Seidel.
fn box_qp(b: &[Vec<f64>], q: &[f64], lo: &[f64], hi: &[f64], d: &mut [f64]) {
    const SWEEPS: usize = 500;
    const TOL: f64 = 1e-14;
    let n = q.len();
    for _ in 0..SWEEPS {
        let mut change: f64 = 0.0;
        for i in 0..n {
            let r: f64 = q[i] + (0..n).filter(|&j| j != i).map(|j| b[i][j] * d[j]).sum::<f64>();
            let next = (-r / b[i][i]).clamp(lo[i], hi[i]);
            change = change.max((next - d[i]).abs());
            d[i] = next;
        }
        if change < TOL {
            return;
        }
    }
}

/// Search direction and multiplier for
/// `min ½dᵀBd + gᵀd` s.t. `c + aᵀd ≥ 0`, `lo ≤ d ≤ hi`.
///
/// The multiplier is found by bisection on the monotone dual slope.
fn solve_qp(
    b: &[Vec<f64>],
    g: &[f64],
    a: &[f64],
    c: f64,
    lo: &[f64],
    hi: &[f64],
) -> (Vec<f64>, f64) {
    const MAX_LAMBDA: f64 = 1e10;
    const BISECTIONS: usize = 60;

    let mut d = vec![0.0; g.len()];
    let solve = |lambda: f64, d: &mut Vec<f64>| {
        let q: Vec<f64> = g.iter().zip(a).map(|(gi, ai)| gi - lambda * ai).collect();
        box_qp(b, &q, lo, hi, d);
        c + dot(a, d)
    };

    if solve(0.0, &mut d) >= 0.0 {
        return (d, 0.0);
    }
    let mut low = 0.0;
    let mut high = 1.0;
    while solve(high, &mut d) < 0.0 {
        low = high;
        high *= 2.0;
        if high > MAX_LAMBDA {
            return (d, high);
        }
    }
    for _ in 0..BISECTIONS {
        let mid = 0.5 * (low + high);
        if solve(mid, &mut d) < 0.0 {
            low = mid;
        } else {
            high = mid;
        }
    }
    solve(high, &mut d);
    (d, high)
}

/// Powell-damped BFGS update of `b` in place.
fn damped_bfgs(b: &mut Matrix, s: &[f64], y: &[f64]) {
    let bs = mat_vec(b, s);
    let sbs = dot(s, &bs);
    if sbs <= f64::EPSILON * f64::EPSILON {
        return;
    }
    let sy = dot(s, y);
    let theta = if sy >= 0.2 * sbs {
        1.0
    } else {
        0.8 * sbs / (sbs - sy)
    };
    let r: Vec<f64> = y
        .iter()
        .zip(&bs)
        .map(|(yi, bsi)| theta * yi + (1.0 - theta) * bsi)
        .collect();
    let sr = dot(s, &r);
    if sr <= f64::EPSILON * f64::EPSILON {
        return;
    }
    for (i, row) in b.iter_mut().enumerate() {
        for (j, value) in row.iter_mut().enumerate() {
            *value += r[i] * r[j] / sr - bs[i] * bs[j] / sbs;
        }
    }
}

fn violation(c: f64) -> f64 {
    (-c).max(0.0)
}

/// Minimize `objective` subject to `constraint(x) ≥ 0` and box bounds.
///
/// # Errors
///
/// Returns an optimization error for an empty start point and propagates
/// evaluation errors.
pub fn minimize_sqp<F, C>(
    objective: F,
    constraint: C,
    x0: &[f64],
    settings: &SqpSettings,
) -> ChainResult<OptimizationResult>
where
    F: Fn(&[f64]) -> ChainResult<f64>,
    C: Fn(&[f64]) -> ChainResult<f64>,
{
    if x0.is_empty() {
        return Err(ChainError::optimization("empty start point"));
    }
    let mut problem = Problem {
        objective: &objective,
        constraint: &constraint,
        settings,
        nfev: 0,
    };
    let n = x0.len();
    let mut x = problem.clip(x0);
    let (mut f, mut c) = problem.values(&x)?;
    let (mut g, mut a) = problem.gradients(&x, f, c)?;
    let mut b = identity(n);
    let mut penalty: f64 = 0.0;
    let mut nit = 0;
    let mut success = false;
    let mut message = "Iteration limit reached";

    while nit < settings.max_iter {
        nit += 1;
        let lo: Vec<f64> = x.iter().map(|v| settings.lower - v).collect();
        let hi: Vec<f64> = x.iter().map(|v| settings.upper - v).collect();
        let (d, lambda) = solve_qp(&b, &g, &a, c, &lo, &hi);

        let step_size = d.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        if step_size < settings.tol && violation(c) < settings.tol {
            success = true;
            message = "Optimization terminated successfully";
            break;
        }

        penalty = lambda.max(0.5 * (penalty + lambda));
        let merit0 = penalty.mul_add(violation(c), f);
        let slope = (dot(&g, &d) - penalty * violation(c)).min(0.0);

        let mut alpha = 1.0;
        let accepted = loop {
            let trial: Vec<f64> = x.iter().zip(&d).map(|(xi, di)| alpha * di + xi).collect();
            let trial = problem.clip(&trial);
            let (ft, ct) = problem.values(&trial)?;
            if penalty.mul_add(violation(ct), ft) <= (1e-4 * alpha).mul_add(slope, merit0) {
                break Some((trial, ft, ct));
            }
            alpha *= 0.5;
            if alpha < 1e-10 {
                break None;
            }
        };
        let Some((x_new, f_new, c_new)) = accepted else {
            message = "Line search failed";
            break;
        };

        let (g_new, a_new) = problem.gradients(&x_new, f_new, c_new)?;
        let s: Vec<f64> = x_new.iter().zip(&x).map(|(p, q)| p - q).collect();
        let y: Vec<f64> = (0..n)
            .map(|i| (g_new[i] - lambda * a_new[i]) - (g[i] - lambda * a[i]))
            .collect();
        damped_bfgs(&mut b, &s, &y);

        let converged = (f_new - f).abs() < settings.tol && violation(c_new) < settings.tol;
        x = x_new;
        f = f_new;
        c = c_new;
        g = g_new;
        a = a_new;
        debug!(nit, f, c, alpha, "sqp iteration");
        if converged {
            success = true;
            message = "Optimization terminated successfully";
            break;
        }
    }

    Ok(OptimizationResult {
        x,
        fun: f,
        nfev: problem.nfev,
        nit,
        success,
        message: message.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unconstrained(_: &[f64]) -> ChainResult<f64> {
        Ok(0.0)
    }

    #[test]
    fn test_quadratic_interior_minimum() {
        let f = |x: &[f64]| Ok((x[0] - 0.3).powi(2) + 2.0 * (x[1] - 0.7).powi(2));
        let res = minimize_sqp(f, unconstrained, &[0.9, 0.1], &SqpSettings::default()).unwrap();
        assert!(res.success, "{}", res.message);
        assert!((res.x[0] - 0.3).abs() < 1e-2);
        assert!((res.x[1] - 0.7).abs() < 1e-2);
        assert!(res.nfev > res.nit);
    }

    #[test]
    fn test_bound_is_active() {
        let f = |x: &[f64]| Ok((x[0] - 1.5).powi(2));
        let res = minimize_sqp(f, unconstrained, &[0.2], &SqpSettings::default()).unwrap();
        assert!((res.x[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_linear_constraint_is_active() {
        let f = |x: &[f64]| Ok(x[0] * x[0] + x[1] * x[1]);
        let g = |x: &[f64]| Ok(x[0] + x[1] - 1.0);
        let res = minimize_sqp(f, g, &[0.9, 0.8], &SqpSettings::default()).unwrap();
        assert!((res.x[0] - 0.5).abs() < 1e-2, "{:?}", res.x);
        assert!((res.x[1] - 0.5).abs() < 1e-2, "{:?}", res.x);
        assert!(res.x[0] + res.x[1] - 1.0 > -1e-4);
    }

    #[test]
    fn test_errors_propagate() {
        let f = |_: &[f64]| Err(ChainError::optimization("boom"));
        assert!(minimize_sqp(f, unconstrained, &[0.5], &SqpSettings::default()).is_err());
        let empty = minimize_sqp(|_: &[f64]| Ok(0.0), unconstrained, &[], &SqpSettings::default());
        assert!(empty.is_err());
    }

    #[test]
    fn test_damped_bfgs_keeps_positive_curvature() {
        let mut b = identity(2);
        // negative curvature pair
        damped_bfgs(&mut b, &[1.0, 0.0], &[-1.0, 0.0]);
        let v = [1.0, 0.0];
        assert!(dot(&v, &mat_vec(&b, &v)) > 0.0);
    }
}
