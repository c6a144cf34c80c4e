//! Sobol low-discrepancy sequence.
//!
//! Gray-code construction with Joe–Kuo direction numbers. The first point
//! (the origin) is skipped.

use crate::error::{ChainError, ChainResult};

/// Bits of precision per coordinate.
const BITS: usize = 32;

/// `2^-BITS`.
const SCALE: f64 = 1.0 / 4_294_967_296.0;

/// Largest supported dimension.
pub const MAX_SOBOL_DIMS: usize = 40;

/// `(degree, polynomial coefficients, initial direction numbers)` for
/// dimensions `2..=MAX_SOBOL_DIMS`.
const DIRECTIONS: [(u32, u32, &[u32]); MAX_SOBOL_DIMS - 1] = [
    (1, 0, &[1]),
    (2, 1, &[1, 3]),
    (3, 1, &[1, 3, 1]),
    (3, 2, &[1, 1, 1]),
    (4, 1, &[1, 1, 3, 3]),
    (4, 4, &[1, 3, 5, 13]),
    (5, 2, &[1, 1, 5, 5, 17]),
    (5, 4, &[1, 1, 5, 5, 5]),
    (5, 7, &[1, 1, 7, 11, 19]),
    (5, 11, &[1, 1, 5, 1, 1]),
    (5, 13, &[1, 1, 1, 3, 11]),
    (5, 14, &[1, 3, 5, 5, 31]),
    (6, 1, &[1, 3, 3, 9, 7, 49]),
    (6, 13, &[1, 1, 1, 15, 21, 21]),
    (6, 16, &[1, 3, 1, 13, 27, 49]),
    (6, 19, &[1, 1, 1, 15, 7, 5]),
    (6, 22, &[1, 3, 1, 15, 13, 25]),
    (6, 25, &[1, 1, 5, 5, 19, 61]),
    (7, 1, &[1, 3, 7, 11, 23, 15, 103]),
    (7, 4, &[1, 3, 7, 13, 13, 15, 69]),
    (7, 7, &[1, 1, 3, 13, 7, 35, 63]),
    (7, 8, &[1, 3, 5, 9, 1, 25, 53]),
    (7, 14, &[1, 3, 1, 13, 9, 35, 107]),
    (7, 19, &[1, 3, 1, 5, 27, 61, 31]),
    (7, 21, &[1, 1, 5, 11, 19, 41, 61]),
    (7, 28, &[1, 3, 5, 3, 3, 13, 69]),
    (7, 31, &[1, 1, 7, 13, 1, 19, 1]),
    (7, 32, &[1, 3, 7, 5, 13, 19, 59]),
    (7, 37, &[1, 1, 3, 9, 25, 29, 41]),
    (7, 41, &[1, 3, 5, 13, 23, 1, 55]),
    (7, 42, &[1, 3, 7, 3, 13, 59, 17]),
    (7, 50, &[1, 3, 1, 3, 5, 53, 69]),
    (7, 55, &[1, 1, 5, 5, 23, 33, 13]),
    (7, 56, &[1, 1, 7, 7, 1, 61, 123]),
    (7, 59, &[1, 1, 7, 9, 13, 61, 49]),
    (7, 62, &[1, 3, 3, 5, 3, 55, 33]),
    (8, 14, &[1, 3, 1, 15, 31, 13, 49, 245]),
    (8, 21, &[1, 3, 5, 15, 31, 59, 171, 97]),
    (8, 22, &[1, 3, 1, 11, 3, 59, 105, 185]),
];

/// Point generator in `[0, 1)^dims`.
#[derive(Debug, Clone)]
pub struct SobolGenerator {
    /// `directions[d][j]` is the `j`-th direction number of dimension `d`.
    directions: Vec<[u32; BITS]>,
}

impl SobolGenerator {
    /// Create a generator.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for `dims == 0` or
    /// `dims > MAX_SOBOL_DIMS`.
    pub fn new(dims: usize) -> ChainResult<Self> {
        if dims == 0 || dims > MAX_SOBOL_DIMS {
            return Err(ChainError::config(format!(
                "Sobol sequence supports 1..={MAX_SOBOL_DIMS} dimensions, got {dims}"
            )));
        }

        let mut directions = Vec::with_capacity(dims);
        let mut first = [0u32; BITS];
        for (j, v) in first.iter_mut().enumerate() {
            *v = 1 << (BITS - 1 - j);
        }
        directions.push(first);

        for &(degree, poly, init) in DIRECTIONS.iter().take(dims - 1) {
            let s = degree as usize;
            let mut v = [0u32; BITS];
            for (j, &m) in init.iter().enumerate() {
                v[j] = m << (BITS - 1 - j);
            }
            for j in s..BITS {
                let mut value = v[j - s] ^ (v[j - s] >> s);
                for k in 1..s {
                    if (poly >> (s - 1 - k)) & 1 == 1 {
                        value ^= v[j - k];
                    }
                }
                v[j] = value;
            }
            directions.push(v);
        }

        Ok(Self { directions })
    }

    /// Number of dimensions.
    #[must_use]
    pub fn dims(&self) -> usize {
        self.directions.len()
    }

    /// First `n` points after the origin.
    #[must_use]
    pub fn generate(&self, n: usize) -> Vec<Vec<f64>> {
        let mut state = vec![0u32; self.dims()];
        let mut points = Vec::with_capacity(n);
        for index in 0..n {
            let bit = (index as u64).trailing_ones() as usize;
            if bit >= BITS {
                break;
            }
            for (x, v) in state.iter_mut().zip(&self.directions) {
                *x ^= v[bit];
            }
            points.push(state.iter().map(|&x| f64::from(x) * SCALE).collect());
        }
        points
    }
}
