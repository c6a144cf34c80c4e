//! Sphere world.
//!
//! A small rigid-body integrator where every body is either a sphere (solid
//! or hollow) or a horizontal ground plane. It is enough to script chain
//! reactions made of rolling, falling and colliding balls, and to exercise
//! every event kind (hollow spheres act as containers for inclusion tests).
//!
//! Integration is semi-implicit Euler followed by one pass of pairwise
//! penetration resolution with restitution. Spheres touching the ground roll
//! without slipping and lose speed at a constant rolling-resistance rate.

use indexmap::IndexMap;
use serde::Deserialize;

use super::{BodyId, PhysicsWorld, Pose, Vec3};
use crate::engine::SimTime;
use crate::error::{ChainError, ChainResult};
use crate::scene::{ObjectSpec, WorldFactory, Xforms};

/// Separation under which two bodies are reported in contact.
pub const CONTACT_MARGIN: f64 = 1e-3;

/// Normal speed under which an impact becomes a resting contact.
const RESTING_SPEED: f64 = 0.1;

/// Shape of a body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape {
    /// Sphere; a hollow sphere is a thin shell that can contain other bodies.
    Sphere {
        /// Radius (m).
        radius: f64,
        /// Shell instead of solid ball.
        hollow: bool,
    },
    /// Infinite horizontal plane at the body's height.
    Ground,
}

#[derive(Debug, Clone)]
struct Body {
    name: String,
    shape: Shape,
    inv_mass: f64,
    pose: Pose,
    linvel: Vec3,
    angvel: Vec3,
}

impl Body {
    const fn is_dynamic(&self) -> bool {
        self.inv_mass > 0.0
    }
}

/// Sphere/ground-plane rigid-body world.
#[derive(Debug, Clone)]
pub struct SphereWorld {
    bodies: Vec<Body>,
    gravity: Vec3,
    restitution: f64,
    rolling_resistance: f64,
    time: SimTime,
}

impl Default for SphereWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl SphereWorld {
    /// Empty world with standard gravity.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bodies: Vec::new(),
            gravity: Vec3::new(0.0, 0.0, -9.81),
            restitution: 0.5,
            rolling_resistance: 0.05,
            time: SimTime::ZERO,
        }
    }

    /// Set gravitational acceleration.
    #[must_use]
    pub const fn with_gravity(mut self, gravity: Vec3) -> Self {
        self.gravity = gravity;
        self
    }

    /// Set the coefficient of restitution for impacts.
    #[must_use]
    pub const fn with_restitution(mut self, restitution: f64) -> Self {
        self.restitution = restitution;
        self
    }

    /// Set the rolling resistance coefficient (fraction of gravity).
    #[must_use]
    pub const fn with_rolling_resistance(mut self, rolling_resistance: f64) -> Self {
        self.rolling_resistance = rolling_resistance;
        self
    }

    /// Add a solid ball; `mass = None` makes it fixed.
    pub fn add_ball(
        &mut self,
        name: impl Into<String>,
        radius: f64,
        position: Vec3,
        mass: Option<f64>,
    ) -> BodyId {
        self.add_body(
            name,
            Shape::Sphere {
                radius,
                hollow: false,
            },
            Pose {
                position,
                hpr: Vec3::zero(),
            },
            mass,
        )
    }

    /// Add a horizontal ground plane at `height`.
    pub fn add_ground(&mut self, name: impl Into<String>, height: f64) -> BodyId {
        self.add_body(
            name,
            Shape::Ground,
            Pose {
                position: Vec3::new(0.0, 0.0, height),
                hpr: Vec3::zero(),
            },
            None,
        )
    }

    /// Add a body of any shape.
    pub fn add_body(
        &mut self,
        name: impl Into<String>,
        shape: Shape,
        pose: Pose,
        mass: Option<f64>,
    ) -> BodyId {
        let inv_mass = match (shape, mass) {
            (Shape::Sphere { .. }, Some(m)) if m > 0.0 => 1.0 / m,
            _ => 0.0,
        };
        self.bodies.push(Body {
            name: name.into(),
            shape,
            inv_mass,
            pose,
            linvel: Vec3::zero(),
            angvel: Vec3::zero(),
        });
        self.bodies.len() - 1
    }

    /// Set a body's linear velocity.
    pub fn set_linear_velocity(&mut self, body: BodyId, velocity: Vec3) {
        if let Some(b) = self.bodies.get_mut(body) {
            b.linvel = velocity;
        }
    }

    /// Set a body's angular velocity.
    pub fn set_angular_velocity(&mut self, body: BodyId, velocity: Vec3) {
        if let Some(b) = self.bodies.get_mut(body) {
            b.angvel = velocity;
        }
    }

    /// Set a body's pose.
    pub fn set_pose(&mut self, body: BodyId, pose: Pose) {
        if let Some(b) = self.bodies.get_mut(body) {
            b.pose = pose;
        }
    }

    /// Number of bodies.
    #[must_use]
    pub fn num_bodies(&self) -> usize {
        self.bodies.len()
    }

    /// Simulated time.
    #[must_use]
    pub const fn time(&self) -> SimTime {
        self.time
    }

    /// Signed separation between two bodies and the unit direction in which
    /// `b` must move to increase it. `None` for two ground planes.
    fn separation(a: &Body, b: &Body) -> Option<(f64, Vec3)> {
        let up = Vec3::new(0.0, 0.0, 1.0);
        match (a.shape, b.shape) {
            (Shape::Ground, Shape::Ground) => None,
            (Shape::Sphere { radius, .. }, Shape::Ground) => {
                Some((a.pose.position.z - radius - b.pose.position.z, -up))
            }
            (Shape::Ground, Shape::Sphere { radius, .. }) => {
                Some((b.pose.position.z - radius - a.pose.position.z, up))
            }
            (
                Shape::Sphere {
                    radius: ra,
                    hollow: hollow_a,
                },
                Shape::Sphere {
                    radius: rb,
                    hollow: hollow_b,
                },
            ) => {
                let d = b.pose.position - a.pose.position;
                let dist = d.magnitude();
                let n = if dist < f64::EPSILON { up } else { d.scale(1.0 / dist) };
                if hollow_a && dist < ra {
                    Some((ra - dist - rb, -n))
                } else if hollow_b && dist < rb {
                    Some((rb - dist - ra, -n))
                } else {
                    Some((dist - ra - rb, n))
                }
            }
        }
    }

    fn pair_separation(&self, a: BodyId, b: BodyId) -> Option<f64> {
        let (ba, bb) = (self.bodies.get(a)?, self.bodies.get(b)?);
        if a == b {
            return None;
        }
        Self::separation(ba, bb).map(|(sep, _)| sep)
    }

    fn resolve_pair(&mut self, i: usize, j: usize) {
        let (a, b) = (&self.bodies[i], &self.bodies[j]);
        let total_inv = a.inv_mass + b.inv_mass;
        if total_inv <= 0.0 {
            return;
        }
        let Some((sep, normal)) = Self::separation(a, b) else {
            return;
        };
        if sep >= 0.0 {
            return;
        }

        let (wa, wb) = (a.inv_mass / total_inv, b.inv_mass / total_inv);
        let rel = (b.linvel - a.linvel).dot(&normal);
        let restitution = self.restitution;

        let push = normal * (-sep);
        self.bodies[i].pose.position = self.bodies[i].pose.position - push * wa;
        self.bodies[j].pose.position = self.bodies[j].pose.position + push * wb;

        if rel < 0.0 {
            let bounce = if -rel * restitution < RESTING_SPEED { 0.0 } else { restitution };
            let impulse = -(1.0 + bounce) * rel;
            self.bodies[i].linvel = self.bodies[i].linvel - normal * (impulse * wa);
            self.bodies[j].linvel = self.bodies[j].linvel + normal * (impulse * wb);
        }
    }

    fn grounded(&self, i: usize) -> Option<f64> {
        let body = &self.bodies[i];
        let Shape::Sphere { radius, .. } = body.shape else {
            return None;
        };
        self.bodies
            .iter()
            .filter(|g| g.shape == Shape::Ground)
            .any(|g| {
                Self::separation(body, g)
                    .is_some_and(|(sep, _)| sep <= CONTACT_MARGIN)
            })
            .then_some(radius)
    }

    fn apply_rolling(&mut self, dt: f64) {
        let decel = self.rolling_resistance * self.gravity.magnitude() * dt;
        for i in 0..self.bodies.len() {
            if !self.bodies[i].is_dynamic() {
                continue;
            }
            let Some(radius) = self.grounded(i) else {
                continue;
            };
            let body = &mut self.bodies[i];
            let horizontal = Vec3::new(body.linvel.x, body.linvel.y, 0.0);
            let speed = horizontal.magnitude();
            let slowed = if speed <= decel {
                Vec3::zero()
            } else {
                horizontal.scale((speed - decel) / speed)
            };
            body.linvel = Vec3::new(slowed.x, slowed.y, body.linvel.z);
            body.angvel = Vec3::new(-slowed.y / radius, slowed.x / radius, 0.0);
        }
    }

    fn ray_hit(body: &Body, from: Vec3, dir: Vec3) -> Option<f64> {
        match body.shape {
            Shape::Ground => {
                let h = body.pose.position.z;
                if from.z > h && from.z + dir.z <= h {
                    Some((from.z - h) / -dir.z)
                } else {
                    None
                }
            }
            Shape::Sphere { radius, hollow } => {
                let a = dir.magnitude_squared();
                if a < f64::EPSILON {
                    return None;
                }
                let f = from - body.pose.position;
                let b = f.dot(&dir);
                let c = f.magnitude_squared() - radius * radius;
                let disc = b * b - a * c;
                if disc < 0.0 {
                    return None;
                }
                let sq = disc.sqrt();
                let t = if c < 0.0 {
                    if !hollow {
                        return None;
                    }
                    (-b + sq) / a
                } else {
                    (-b - sq) / a
                };
                (0.0..=1.0).contains(&t).then_some(t)
            }
        }
    }
}

impl PhysicsWorld for SphereWorld {
    fn body(&self, name: &str) -> Option<BodyId> {
        self.bodies.iter().position(|b| b.name == name)
    }

    fn step(&mut self, dt: f64) -> ChainResult<()> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(ChainError::physics(format!("invalid step size {dt}")));
        }

        let gravity = self.gravity;
        for body in self.bodies.iter_mut().filter(|b| b.is_dynamic()) {
            body.linvel = body.linvel + gravity * dt;
            body.pose.position = body.pose.position + body.linvel * dt;
            let w = body.angvel;
            body.pose.hpr =
                body.pose.hpr + Vec3::new(w.z, w.x, w.y).scale(dt.to_degrees());
        }

        let n = self.bodies.len();
        for i in 0..n {
            for j in (i + 1)..n {
                self.resolve_pair(i, j);
            }
        }
        self.apply_rolling(dt);

        if self
            .bodies
            .iter()
            .any(|b| !b.pose.position.is_finite() || !b.linvel.is_finite())
        {
            return Err(ChainError::physics("non-finite body state"));
        }

        self.time = self.time + SimTime::from_secs(dt);
        Ok(())
    }

    fn pose(&self, body: BodyId) -> Pose {
        self.bodies.get(body).map(|b| b.pose).unwrap_or_default()
    }

    fn linear_velocity(&self, body: BodyId) -> Vec3 {
        self.bodies.get(body).map(|b| b.linvel).unwrap_or_default()
    }

    fn angular_velocity(&self, body: BodyId) -> Vec3 {
        self.bodies.get(body).map(|b| b.angvel).unwrap_or_default()
    }

    fn in_contact(&self, a: BodyId, b: BodyId) -> bool {
        self.pair_separation(a, b)
            .is_some_and(|sep| sep <= CONTACT_MARGIN)
    }

    fn ray_test_closest(&self, from: Vec3, to: Vec3) -> Option<BodyId> {
        let dir = to - from;
        self.bodies
            .iter()
            .enumerate()
            .filter_map(|(id, body)| Self::ray_hit(body, from, dir).map(|t| (id, t)))
            .min_by(|(_, t1), (_, t2)| t1.total_cmp(t2))
            .map(|(id, _)| id)
    }

    fn bounding_radius(&self, body: BodyId) -> f64 {
        match self.bodies.get(body).map(|b| b.shape) {
            Some(Shape::Sphere { radius, .. }) => radius,
            _ => 0.0,
        }
    }

    fn physical_validity_constraint(&self) -> f64 {
        let n = self.bodies.len();
        let mut constraint = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                if let Some((sep, _)) = Self::separation(&self.bodies[i], &self.bodies[j]) {
                    constraint += sep.min(0.0);
                }
            }
        }
        constraint
    }
}

fn default_mass() -> Option<f64> {
    Some(1.0)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BallArgs {
    radius: f64,
    /// `null` makes the ball fixed.
    #[serde(default = "default_mass")]
    mass: Option<f64>,
    #[serde(default)]
    hollow: bool,
    #[serde(default)]
    velocity: Option<[f64; 3]>,
    #[serde(default)]
    angular_velocity: Option<[f64; 3]>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GroundArgs {
    #[serde(default)]
    distance: f64,
}

/// Builds a [`SphereWorld`] from a scene description.
///
/// Supported object types: `Ball` (args: `radius`, optional `mass` with
/// `null` for fixed, `hollow`, `velocity`, `angular_velocity`) and `Ground`
/// (optional `distance` added to the transform height). A parent's
/// translation is added to its children's positions.
#[derive(Debug, Clone)]
pub struct SphereWorldFactory {
    gravity: Vec3,
    restitution: f64,
    rolling_resistance: f64,
}

impl Default for SphereWorldFactory {
    fn default() -> Self {
        let world = SphereWorld::new();
        Self {
            gravity: world.gravity,
            restitution: world.restitution,
            rolling_resistance: world.rolling_resistance,
        }
    }
}

impl SphereWorldFactory {
    /// Factory with default world parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set gravitational acceleration.
    #[must_use]
    pub const fn with_gravity(mut self, gravity: Vec3) -> Self {
        self.gravity = gravity;
        self
    }

    /// Set the coefficient of restitution.
    #[must_use]
    pub const fn with_restitution(mut self, restitution: f64) -> Self {
        self.restitution = restitution;
        self
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(object: &ObjectSpec) -> ChainResult<T> {
    let args = if object.args.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        object.args.clone()
    };
    serde_json::from_value(args).map_err(|e| {
        ChainError::scenario(format!("invalid args for object '{}': {e}", object.name))
    })
}

fn world_position(
    object: &ObjectSpec,
    objects: &IndexMap<&str, &ObjectSpec>,
    xforms: &Xforms,
) -> ChainResult<Vec3> {
    let mut position = Vec3::zero();
    let mut current = Some(object);
    let mut depth = 0;
    while let Some(obj) = current {
        let xform = xforms
            .get(&obj.name)
            .ok_or_else(|| ChainError::scenario(format!("no transform for '{}'", obj.name)))?;
        position = position + Vec3::new(xform[0], xform[1], xform[2]);
        current = match &obj.parent {
            Some(parent) => Some(*objects.get(parent.as_str()).ok_or_else(|| {
                ChainError::scenario(format!("'{}' has unknown parent '{parent}'", obj.name))
            })?),
            None => None,
        };
        depth += 1;
        if depth > objects.len() {
            return Err(ChainError::scenario(format!(
                "parent cycle through '{}'",
                object.name
            )));
        }
    }
    Ok(position)
}

impl WorldFactory for SphereWorldFactory {
    type World = SphereWorld;

    fn build(&self, objects: &[ObjectSpec], xforms: &Xforms) -> ChainResult<SphereWorld> {
        let mut world = SphereWorld::new()
            .with_gravity(self.gravity)
            .with_restitution(self.restitution)
            .with_rolling_resistance(self.rolling_resistance);
        let by_name: IndexMap<&str, &ObjectSpec> =
            objects.iter().map(|o| (o.name.as_str(), o)).collect();

        for object in objects {
            if object.components.is_some() {
                return Err(ChainError::scenario(format!(
                    "composite object '{}' is not supported by the sphere world",
                    object.name
                )));
            }
            let position = world_position(object, &by_name, xforms)?;
            let hpr = xforms
                .get(&object.name)
                .map_or_else(Vec3::zero, |x| Vec3::new(x[3], x[4], x[5]));
            match object.kind.as_str() {
                "Ball" => {
                    let args: BallArgs = parse_args(object)?;
                    if !args.radius.is_finite() || args.radius <= 0.0 {
                        return Err(ChainError::scenario(format!(
                            "ball '{}' needs a positive radius",
                            object.name
                        )));
                    }
                    let id = world.add_body(
                        object.name.clone(),
                        Shape::Sphere {
                            radius: args.radius,
                            hollow: args.hollow,
                        },
                        Pose { position, hpr },
                        args.mass,
                    );
                    if let Some(v) = args.velocity {
                        world.set_linear_velocity(id, Vec3::new(v[0], v[1], v[2]));
                    }
                    if let Some(w) = args.angular_velocity {
                        world.set_angular_velocity(id, Vec3::new(w[0], w[1], w[2]));
                    }
                }
                "Ground" => {
                    let args: GroundArgs = parse_args(object)?;
                    world.add_ground(object.name.clone(), position.z + args.distance);
                }
                other => {
                    return Err(ChainError::scenario(format!(
                        "object '{}' has type '{other}' unsupported by the sphere world",
                        object.name
                    )));
                }
            }
        }
        Ok(world)
    }
}
