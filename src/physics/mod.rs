//! Physics backend seam.
//!
//! Event conditions, the label oracle and the validity filter only talk to a
//! rigid-body world through [`PhysicsWorld`]. Any backend (a Bullet binding,
//! a custom solver, a replayed recording) plugs in by implementing it; the
//! crate ships [`SphereWorld`], a small sphere/ground-plane integrator used
//! by the CLI and the test suites.

pub mod sphere;

use serde::{Deserialize, Serialize};

pub use sphere::{Shape, SphereWorld, SphereWorldFactory};

use crate::error::ChainResult;

/// Penetration tolerance below which a configuration is physically invalid.
pub const VALIDITY_TOLERANCE: f64 = -1e-3;

/// Handle of a rigid body inside a world.
pub type BodyId = usize;

/// 3D vector for positions and velocities.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    /// X component.
    pub x: f64,
    /// Y component.
    pub y: f64,
    /// Z component.
    pub z: f64,
}

impl Vec3 {
    /// Create a new vector.
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Zero vector.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }

    /// Build from a 3-element slice, `None` for any other length.
    #[must_use]
    pub fn from_slice(values: &[f64]) -> Option<Self> {
        match values {
            [x, y, z] => Some(Self::new(*x, *y, *z)),
            _ => None,
        }
    }

    /// Magnitude squared.
    #[must_use]
    pub fn magnitude_squared(&self) -> f64 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// Magnitude (length).
    #[must_use]
    pub fn magnitude(&self) -> f64 {
        self.magnitude_squared().sqrt()
    }

    /// Dot product.
    #[must_use]
    pub fn dot(&self, other: &Self) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Normalize to unit vector.
    #[must_use]
    pub fn normalize(&self) -> Self {
        let mag = self.magnitude();
        if mag < f64::EPSILON {
            Self::zero()
        } else {
            self.scale(1.0 / mag)
        }
    }

    /// Scale by scalar.
    #[must_use]
    pub fn scale(&self, s: f64) -> Self {
        Self {
            x: self.x * s,
            y: self.y * s,
            z: self.z * s,
        }
    }

    /// True if every component of `self - other` is within `tol`.
    #[must_use]
    pub fn approx_eq(&self, other: &Self, tol: f64) -> bool {
        (self.x - other.x).abs() <= tol
            && (self.y - other.y).abs() <= tol
            && (self.z - other.z).abs() <= tol
    }

    /// Check if all components are finite.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // is_finite not const
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl std::ops::Add for Vec3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
            z: self.z + rhs.z,
        }
    }
}

impl std::ops::Sub for Vec3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
            z: self.z - rhs.z,
        }
    }
}

impl std::ops::Mul<f64> for Vec3 {
    type Output = Self;

    fn mul(self, rhs: f64) -> Self::Output {
        self.scale(rhs)
    }
}

impl std::ops::Neg for Vec3 {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Self {
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }
}

/// World-space pose of a body.
///
/// Orientation is heading/pitch/roll in degrees: heading about Z, pitch
/// about X, roll about Y.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    /// Position.
    pub position: Vec3,
    /// Heading, pitch, roll (degrees).
    pub hpr: Vec3,
}

impl Pose {
    /// Create a pose from an `(x, y, z, h, p, r)` transform.
    #[must_use]
    pub const fn from_xform(xform: &[f64; 6]) -> Self {
        Self {
            position: Vec3::new(xform[0], xform[1], xform[2]),
            hpr: Vec3::new(xform[3], xform[4], xform[5]),
        }
    }

    /// Roll angle (degrees).
    #[must_use]
    pub const fn roll(&self) -> f64 {
        self.hpr.z
    }
}

/// Rigid-body world queried by event conditions.
///
/// Body handles come from [`PhysicsWorld::body`]; queries on handles that
/// were not obtained from the same world return neutral values.
pub trait PhysicsWorld {
    /// Look up a body by name.
    fn body(&self, name: &str) -> Option<BodyId>;

    /// Advance the world by `dt` seconds.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to integrate.
    fn step(&mut self, dt: f64) -> ChainResult<()>;

    /// World-space pose.
    fn pose(&self, body: BodyId) -> Pose;

    /// Linear velocity (m/s).
    fn linear_velocity(&self, body: BodyId) -> Vec3;

    /// Angular velocity (rad/s).
    fn angular_velocity(&self, body: BodyId) -> Vec3;

    /// True if the two bodies currently touch.
    fn in_contact(&self, a: BodyId, b: BodyId) -> bool;

    /// Closest body hit by the segment `from → to`.
    fn ray_test_closest(&self, from: Vec3, to: Vec3) -> Option<BodyId>;

    /// Radius of the body's bounding sphere.
    fn bounding_radius(&self, body: BodyId) -> f64;

    /// Sum of all constraint violations (always `<= 0`).
    fn physical_validity_constraint(&self) -> f64;

    /// True if the violations are within tolerance.
    fn is_physically_valid(&self) -> bool {
        self.physical_validity_constraint() > VALIDITY_TOLERANCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec3_operations() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(4.0, 5.0, 6.0);

        assert_eq!(a + b, Vec3::new(5.0, 7.0, 9.0));
        assert_eq!(b - a, Vec3::new(3.0, 3.0, 3.0));
        assert_eq!(a * 2.0, Vec3::new(2.0, 4.0, 6.0));
        assert_eq!(-a, Vec3::new(-1.0, -2.0, -3.0));
        assert!((a.dot(&b) - 32.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_vec3_normalize_zero() {
        assert_eq!(Vec3::zero().normalize(), Vec3::zero());
        let n = Vec3::new(3.0, 0.0, 4.0).normalize();
        assert!((n.magnitude() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_vec3_approx_eq() {
        let a = Vec3::new(1.0, 1.0, 1.0);
        assert!(a.approx_eq(&Vec3::new(1.0005, 0.9995, 1.0), 1e-3));
        assert!(!a.approx_eq(&Vec3::new(1.01, 1.0, 1.0), 1e-3));
    }

    #[test]
    fn test_vec3_from_slice() {
        assert_eq!(Vec3::from_slice(&[1.0, 2.0, 3.0]), Some(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(Vec3::from_slice(&[1.0, 2.0]), None);
    }

    #[test]
    fn test_pose_from_xform() {
        let pose = Pose::from_xform(&[1.0, 2.0, 3.0, 10.0, 20.0, 30.0]);
        assert_eq!(pose.position, Vec3::new(1.0, 2.0, 3.0));
        assert!((pose.roll() - 30.0).abs() < f64::EPSILON);
    }
}
