//! Design space of a scenario.
//!
//! Every object has a 6-component transform `(x, y, z, h, p, r)`. Each
//! component is either fixed or free within a range; free components are
//! normalized to `[0, 1]` and concatenated in object order to form a sample.

use serde::{Deserialize, Serialize};

use super::{ObjectSpec, Xform, Xforms};
use crate::error::{ChainError, ChainResult};

const COMPONENTS: [char; 6] = ['x', 'y', 'z', 'h', 'p', 'r'];

/// Per-component range; `lo == hi` fixes the component.
pub type Range = (f64, f64);

/// Bijection between `[0, 1]^d` and object transforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignSpace {
    names: Vec<String>,
    ranges: Vec<[Range; 6]>,
    /// `(origin, scale)` of each free component, in sample order.
    origin_scale: Vec<(f64, f64)>,
}

impl DesignSpace {
    /// Build from `(object name, component ranges)` pairs.
    #[must_use]
    pub fn new(ranges: Vec<(String, [Range; 6])>) -> Self {
        let origin_scale = ranges
            .iter()
            .flat_map(|(_, r)| r.iter())
            .filter(|(a, b)| a != b)
            .map(|&(a, b)| (a, b - a))
            .collect();
        let (names, ranges) = ranges.into_iter().unzip();
        Self {
            names,
            ranges,
            origin_scale,
        }
    }

    /// Read ranges from scene objects.
    ///
    /// Without `xform.range` the object is fixed at `xform.value` (zeros if
    /// absent); a `null` range entry fixes that component.
    ///
    /// # Errors
    ///
    /// Returns a scenario error if a value or range list does not have six
    /// entries.
    pub fn from_objects(objects: &[ObjectSpec]) -> ChainResult<Self> {
        let mut ranges = Vec::with_capacity(objects.len());
        for object in objects {
            let xform = object.xform.as_ref();
            let value = object_value(object)?;
            let range = match xform.and_then(|x| x.range.as_ref()) {
                None => value.map(|p| (p, p)),
                Some(r) if r.len() == 6 => {
                    let mut out = [(0.0, 0.0); 6];
                    for (i, (rng, p)) in r.iter().zip(value).enumerate() {
                        out[i] = rng.map_or((p, p), |[a, b]| (a, b));
                    }
                    out
                }
                Some(r) => {
                    return Err(ChainError::scenario(format!(
                        "object '{}' has {} range entries, expected 6",
                        object.name,
                        r.len()
                    )))
                }
            };
            ranges.push((object.name.clone(), range));
        }
        Ok(Self::new(ranges))
    }

    /// Number of free parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.origin_scale.len()
    }

    /// True if every component is fixed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.origin_scale.is_empty()
    }

    /// Object names.
    #[must_use]
    pub fn object_names(&self) -> &[String] {
        &self.names
    }

    /// `name_c` for every object and component `c ∈ xyzhpr`.
    #[must_use]
    pub fn parameter_names(&self) -> Vec<String> {
        self.names
            .iter()
            .flat_map(|n| COMPONENTS.iter().map(move |c| format!("{n}_{c}")))
            .collect()
    }

    /// Names of the free parameters, in sample order.
    #[must_use]
    pub fn free_parameter_names(&self) -> Vec<String> {
        self.parameter_names()
            .into_iter()
            .zip(self.ranges.iter().flat_map(|r| r.iter()))
            .filter(|(_, (a, b))| a != b)
            .map(|(name, _)| name)
            .collect()
    }

    /// Convert a sample to transforms.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::DimensionMismatch`] if the sample length differs
    /// from [`DesignSpace::len`].
    pub fn sample_to_xforms(&self, sample: &[f64]) -> ChainResult<Xforms> {
        self.check_dims(sample.len())?;
        let mut free = sample.iter().zip(&self.origin_scale);
        let mut xforms = Xforms::with_capacity(self.names.len());
        for (name, ranges) in self.names.iter().zip(&self.ranges) {
            let mut xform: Xform = [0.0; 6];
            for (slot, &(a, b)) in xform.iter_mut().zip(ranges) {
                *slot = if a == b {
                    a
                } else {
                    free.next().map_or(a, |(s, (origin, scale))| s * scale + origin)
                };
            }
            xforms.insert(name.clone(), xform);
        }
        Ok(xforms)
    }

    /// Convert transforms back to a sample.
    ///
    /// # Errors
    ///
    /// Returns a scenario error if an object has no transform.
    pub fn xforms_to_sample(&self, xforms: &Xforms) -> ChainResult<Vec<f64>> {
        let mut sample = Vec::with_capacity(self.len());
        for (name, ranges) in self.names.iter().zip(&self.ranges) {
            let xform = xforms
                .get(name)
                .ok_or_else(|| ChainError::scenario(format!("no transform for '{name}'")))?;
            for (&v, &(a, b)) in xform.iter().zip(ranges) {
                if a != b {
                    sample.push((v - a) / (b - a));
                }
            }
        }
        Ok(sample)
    }

    /// Error unless `found` equals the number of free parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::DimensionMismatch`] on mismatch.
    pub fn check_dims(&self, found: usize) -> ChainResult<()> {
        if found == self.len() {
            Ok(())
        } else {
            Err(ChainError::DimensionMismatch {
                expected: self.len(),
                found,
            })
        }
    }

    /// Bytes identifying the ranges, for hashing.
    #[must_use]
    pub fn fingerprint(&self) -> Vec<u8> {
        self.ranges
            .iter()
            .flat_map(|r| r.iter())
            .flat_map(|(a, b)| a.to_le_bytes().into_iter().chain(b.to_le_bytes()))
            .collect()
    }
}

/// Fixed transform of an object (zeros if absent).
///
/// # Errors
///
/// Returns a scenario error if the value list does not have six entries.
pub(crate) fn object_value(object: &ObjectSpec) -> ChainResult<Xform> {
    match object.xform.as_ref().and_then(|x| x.value.as_ref()) {
        None => Ok([0.0; 6]),
        Some(v) => <[f64; 6]>::try_from(v.as_slice()).map_err(|_| {
            ChainError::scenario(format!(
                "object '{}' has {} transform values, expected 6",
                object.name,
                v.len()
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn objects(value: serde_json::Value) -> Vec<ObjectSpec> {
        serde_json::from_value(value).unwrap()
    }

    fn two_object_space() -> DesignSpace {
        DesignSpace::from_objects(&objects(json!([
            {"name": "floor", "type": "Ground"},
            {"name": "ball", "type": "Ball",
             "xform": {"value": [0.0, 0.0, 0.1, 0.0, 0.0, 0.0],
                       "range": [[-1.0, 1.0], null, null, null, null, [0.0, 90.0]]}}
        ])))
        .unwrap()
    }

    #[test]
    fn test_len_counts_free_components() {
        let space = two_object_space();
        assert_eq!(space.len(), 2);
        assert_eq!(space.free_parameter_names(), vec!["ball_x", "ball_r"]);
        assert_eq!(space.parameter_names().len(), 12);
    }

    #[test]
    fn test_sample_to_xforms() {
        let space = two_object_space();
        let xforms = space.sample_to_xforms(&[0.75, 0.5]).unwrap();
        assert_eq!(xforms["floor"], [0.0; 6]);
        assert_eq!(xforms["ball"], [0.5, 0.0, 0.1, 0.0, 0.0, 45.0]);
    }

    #[test]
    fn test_xforms_to_sample_inverts() {
        let space = two_object_space();
        let sample = vec![0.2, 0.9];
        let back = space
            .xforms_to_sample(&space.sample_to_xforms(&sample).unwrap())
            .unwrap();
        for (a, b) in sample.iter().zip(&back) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let space = two_object_space();
        let err = space.sample_to_xforms(&[0.5]).unwrap_err();
        assert!(matches!(err, ChainError::DimensionMismatch { expected: 2, found: 1 }));
    }

    #[test]
    fn test_missing_range_fixes_object() {
        let space = DesignSpace::from_objects(&objects(json!([
            {"name": "a", "type": "Ball", "xform": {"value": [1.0, 2.0, 3.0, 0.0, 0.0, 0.0]}}
        ])))
        .unwrap();
        assert!(space.is_empty());
        assert_eq!(space.sample_to_xforms(&[]).unwrap()["a"], [1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_bad_value_length() {
        let err = DesignSpace::from_objects(&objects(json!([
            {"name": "a", "type": "Ball", "xform": {"value": [1.0, 2.0]}}
        ])))
        .unwrap_err();
        assert!(err.is_scenario_error());
    }

    #[test]
    fn test_equal_bounds_are_fixed() {
        let space = DesignSpace::new(vec![(
            "a".to_string(),
            [(0.0, 1.0), (2.0, 2.0), (0.0, 0.0), (0.0, 0.0), (0.0, 0.0), (0.0, 0.0)],
        )]);
        assert_eq!(space.len(), 1);
        assert_eq!(space.sample_to_xforms(&[0.5]).unwrap()["a"][1], 2.0);
    }
}
