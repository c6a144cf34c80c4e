//! Small dense linear algebra on row-major `Vec<Vec<f64>>` matrices.

use crate::error::{ChainError, ChainResult};

/// Dense matrix, one `Vec` per row.
pub type Matrix = Vec<Vec<f64>>;

/// Sweeps before the Jacobi method gives up.
const MAX_SWEEPS: usize = 100;

/// `n × n` identity.
#[must_use]
pub fn identity(n: usize) -> Matrix {
    (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect()
}

/// Inner product.
#[must_use]
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `A · v`.
#[must_use]
pub fn mat_vec(a: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    a.iter().map(|row| dot(row, v)).collect()
}

/// Euclidean norm.
#[must_use]
pub fn norm(v: &[f64]) -> f64 {
    dot(v, v).sqrt()
}

/// Eigen-decomposition of a symmetric matrix by cyclic Jacobi rotations.
///
/// Returns the eigenvalues and a matrix whose columns are the matching
/// unit eigenvectors.
///
/// # Errors
///
/// Returns an optimization error if the matrix is not square or the
/// rotations do not converge.
pub fn symmetric_eigen(a: &[Vec<f64>]) -> ChainResult<(Vec<f64>, Matrix)> {
    let n = a.len();
    if a.iter().any(|row| row.len() != n) {
        return Err(ChainError::optimization("eigen-decomposition needs a square matrix"));
    }
    let mut m: Matrix = a.to_vec();
    let mut v = identity(n);

    let scale: f64 = m.iter().flatten().map(|x| x * x).sum::<f64>().sqrt();
    let threshold = f64::EPSILON * scale.max(f64::MIN_POSITIVE);

    for _ in 0..MAX_SWEEPS {
        let off: f64 = (0..n)
            .flat_map(|i| (0..n).filter(move |&j| j != i).map(move |j| (i, j)))
            .map(|(i, j)| m[i][j] * m[i][j])
            .sum::<f64>()
            .sqrt();
        if off <= threshold {
            let values = (0..n).map(|i| m[i][i]).collect();
            return Ok((values, v));
        }

        for p in 0..n {
            for q in (p + 1)..n {
                if m[p][q].abs() <= f64::MIN_POSITIVE {
                    continue;
                }
                let theta = (m[q][q] - m[p][p]) / (2.0 * m[p][q]);
                let t = theta.signum() / (theta.abs() + theta.hypot(1.0));
                let c = 1.0 / t.hypot(1.0);
                let s = t * c;

                for k in 0..n {
                    let (mkp, mkq) = (m[k][p], m[k][q]);
                    m[k][p] = c * mkp - s * mkq;
                    m[k][q] = s * mkp + c * mkq;
                }
                for k in 0..n {
                    let (mpk, mqk) = (m[p][k], m[q][k]);
                    m[p][k] = c * mpk - s * mqk;
                    m[q][k] = s * mpk + c * mqk;
                }
                for row in &mut v {
                    let (vkp, vkq) = (row[p], row[q]);
                    row[p] = c * vkp - s * vkq;
                    row[q] = s * vkp + c * vkq;
                }
            }
        }
    }

    Err(ChainError::optimization("Jacobi eigen-decomposition did not converge"))
}
