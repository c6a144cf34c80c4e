//! Event-to-dimension attribution.
//!
//! For every event of the causal graph, find the sample dimensions that
//! best predict whether the event succeeds. Dependence is measured by the
//! mutual information between each continuous dimension and the binary
//! event outcome, estimated with the nearest-neighbour method of Ross
//! (2014).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{DimensionAssignment, Sample};
use crate::engine::SimRng;
use crate::error::{ChainError, ChainResult};

/// Neighbours used by the mutual information estimator.
const N_NEIGHBORS: usize = 3;

/// Relative amplitude of the tie-breaking noise.
const JITTER: f64 = 1e-10;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Attribution thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttributionSettings {
    /// Events succeeding at least this often are invariant.
    pub invar_success_rate: f64,
    /// Keep dimensions scoring above this fraction of the best score.
    pub select_coeff: f64,
}

impl Default for AttributionSettings {
    fn default() -> Self {
        Self {
            invar_success_rate: 0.95,
            select_coeff: 0.1,
        }
    }
}

/// Digamma at a positive integer.
fn digamma(n: usize) -> f64 {
    (1..n).map(|i| 1.0 / i as f64).sum::<f64>() - EULER_GAMMA
}

/// Mutual information between one continuous feature and a binary target.
///
/// Points whose class has a single member are ignored. The result is
/// clamped at zero.
#[must_use]
pub fn mutual_information(feature: &[f64], target: &[bool]) -> f64 {
    let n = feature.len().min(target.len());
    let count_of = |class: bool| target[..n].iter().filter(|&&t| t == class).count();
    let counts = [count_of(false), count_of(true)];
    let class_count = |i: usize| counts[usize::from(target[i])];

    let kept: Vec<usize> = (0..n).filter(|&i| class_count(i) > 1).collect();
    if kept.is_empty() {
        return 0.0;
    }

    let mut sum_k = 0.0;
    let mut sum_label = 0.0;
    let mut sum_m = 0.0;
    let mut distances = Vec::with_capacity(n);
    for &i in &kept {
        let k = N_NEIGHBORS.min(class_count(i) - 1);
        distances.clear();
        distances.extend(
            kept.iter()
                .filter(|&&j| j != i && target[j] == target[i])
                .map(|&j| (feature[j] - feature[i]).abs()),
        );
        distances.sort_unstable_by(f64::total_cmp);
        let radius = distances[k - 1];
        let m = kept
            .iter()
            .filter(|&&j| (feature[j] - feature[i]).abs() < radius)
            .count();

        sum_k += digamma(k);
        sum_label += digamma(class_count(i));
        sum_m += digamma(m.max(1));
    }

    let len = kept.len() as f64;
    let mi = digamma(kept.len()) + (sum_k - sum_label - sum_m) / len;
    mi.max(0.0)
}

/// Mutual information of every column of `samples` with `target`.
///
/// Columns are scaled to unit variance and jittered with tiny Gaussian
/// noise so that repeated values do not collapse the neighbour search.
pub fn feature_scores(samples: &[&Sample], target: &[bool], rng: &mut SimRng) -> Vec<f64> {
    let dims = samples.first().map_or(0, |s| s.len());
    let n = samples.len() as f64;
    (0..dims)
        .map(|d| {
            let column: Vec<f64> = samples.iter().map(|s| s[d]).collect();
            let mean = column.iter().sum::<f64>() / n;
            let std = (column.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).sqrt();
            let std = if std > 0.0 { std } else { 1.0 };
            let scaled: Vec<f64> = column.iter().map(|x| x / std).collect();
            let amplitude = JITTER * (scaled.iter().map(|x| x.abs()).sum::<f64>() / n).max(1.0);
            let jittered: Vec<f64> = scaled
                .iter()
                .map(|&x| amplitude.mul_add(rng.gen_standard_normal(), x))
                .collect();
            mutual_information(&jittered, target)
        })
        .collect()
}

/// Map each event to the dimensions that predict its outcome.
///
/// Unresolved labels are dropped per event. Events whose success rate is
/// at least `invar_success_rate` (or that were never resolved) map to no
/// dimension. Otherwise a dimension is kept when its score exceeds
/// `select_coeff` times the best score.
///
/// # Errors
///
/// Returns a dimension mismatch if a label column is not aligned with
/// `samples`.
pub fn map_events_to_dimensions(
    samples: &[Sample],
    event_labels: &IndexMap<String, Vec<Option<bool>>>,
    invar_success_rate: f64,
    select_coeff: f64,
    rng: &mut SimRng,
) -> ChainResult<DimensionAssignment> {
    let mut assignment = DimensionAssignment::new();
    let mut key_events = Vec::new();
    for (event, labels) in event_labels {
        if labels.len() != samples.len() {
            return Err(ChainError::DimensionMismatch {
                expected: samples.len(),
                found: labels.len(),
            });
        }
        let (event_samples, target): (Vec<&Sample>, Vec<bool>) = samples
            .iter()
            .zip(labels)
            .filter_map(|(s, l)| l.map(|l| (s, l)))
            .unzip();

        let successes = target.iter().filter(|&&t| t).count();
        let is_key = !target.is_empty()
            && (successes as f64 / target.len() as f64) < invar_success_rate;
        if !is_key {
            assignment.insert(event.clone(), Vec::new());
            continue;
        }
        key_events.push(event.as_str());

        let scores = feature_scores(&event_samples, &target, rng);
        let best = scores.iter().copied().fold(0.0, f64::max);
        let dims: Vec<usize> = (0..scores.len())
            .filter(|&d| scores[d] > best * select_coeff)
            .collect();
        debug!(event = %event, ?scores, ?dims, "event attribution");
        assignment.insert(event.clone(), dims);
    }
    info!(?key_events, "key events");
    Ok(assignment)
}
