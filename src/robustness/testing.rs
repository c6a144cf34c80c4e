//! Synthetic oracle for unit tests.

use super::oracle::{Label, LabelOracle};
use crate::causal::EventLabels;
use crate::error::ChainResult;

/// Succeeds inside a disk around the cube center.
///
/// Two events: `near` fires within twice the radius, `hit` (its child)
/// within the radius. Distances only use `active` dimensions. Samples whose
/// first two coordinates are both below `corner` are invalid.
#[derive(Debug, Clone)]
pub struct DiskOracle {
    dims: usize,
    radius: f64,
    active: Vec<usize>,
    corner: f64,
}

impl DiskOracle {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            radius: 0.25,
            active: (0..dims).collect(),
            corner: 0.0,
        }
    }

    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = radius;
        self
    }

    pub fn with_active_dims(mut self, active: Vec<usize>) -> Self {
        self.active = active;
        self
    }

    pub fn with_forbidden_corner(mut self, corner: f64) -> Self {
        self.corner = corner;
        self
    }

    pub fn distance(&self, sample: &[f64]) -> f64 {
        self.active
            .iter()
            .map(|&i| (sample[i] - 0.5).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    fn overlap(&self, sample: &[f64]) -> f64 {
        sample
            .iter()
            .take(2)
            .map(|&x| self.corner - x)
            .fold(f64::INFINITY, f64::min)
    }
}

impl LabelOracle for DiskOracle {
    fn dims(&self) -> usize {
        self.dims
    }

    fn is_physically_valid(&self, sample: &[f64]) -> ChainResult<bool> {
        Ok(self.overlap(sample) <= 0.0)
    }

    fn validity_constraint(&self, sample: &[f64]) -> ChainResult<f64> {
        Ok((-self.overlap(sample)).min(0.0))
    }

    fn label(&self, sample: &[f64]) -> ChainResult<Label> {
        Ok(self.label_with_events(sample)?.0)
    }

    fn label_with_events(&self, sample: &[f64]) -> ChainResult<(Label, EventLabels)> {
        let mut events = EventLabels::new();
        if !self.is_physically_valid(sample)? {
            events.insert("near".into(), None);
            events.insert("hit".into(), None);
            return Ok((Label::Invalid, events));
        }
        let d = self.distance(sample);
        let near = d < 2.0 * self.radius;
        let hit = d < self.radius;
        events.insert("near".into(), Some(near));
        events.insert("hit".into(), near.then_some(hit));
        Ok((Label::from_success(hit), events))
    }
}
