//! Event kinds.
//!
//! Each kind is a named condition over one or two bodies. Scenario files
//! refer to kinds by name; [`EventKind::from_name`] is the registry that
//! maps a name and its JSON arguments to a typed kind, and
//! [`EventKind::embed`] resolves body names against a world.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{Condition, Probe, Signal};
use crate::error::{ChainError, ChainResult};
use crate::physics::{BodyId, PhysicsWorld, Pose, Vec3};

fn default_stop_linvel() -> f64 {
    1e-3
}

fn default_stop_angvel() -> f64 {
    1.0
}

fn default_pos_tol() -> f64 {
    1e-3
}

fn default_hpr_tol() -> f64 {
    1.0
}

/// Two bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairArgs {
    /// First body.
    pub first: String,
    /// Second body.
    pub second: String,
}

/// Container test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InclusionArgs {
    /// Contained body.
    pub inside: String,
    /// Container.
    pub outside: String,
}

/// Rolling contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollingOnArgs {
    /// Rolling body.
    pub rolling: String,
    /// Supporting body.
    pub support: String,
    /// Angular speed threshold (rad/s).
    #[serde(default)]
    pub min_angvel: f64,
}

/// Roll angle change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopplingArgs {
    /// Toppling body.
    pub body: String,
    /// Angle (degrees).
    pub angle: f64,
}

/// Angular speed threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PivotingArgs {
    /// Pivoting body.
    pub body: String,
    /// Angular speed threshold (rad/s).
    #[serde(default)]
    pub min_angvel: f64,
}

/// Vertical speed threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerticalArgs {
    /// Moving body.
    pub body: String,
    /// Vertical speed threshold (m/s, sign ignored).
    #[serde(default)]
    pub min_linvel: f64,
}

/// Rest test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoppingArgs {
    /// Body.
    pub body: String,
    /// Linear speed bound (m/s).
    #[serde(default = "default_stop_linvel")]
    pub max_linvel: f64,
    /// Angular speed bound (rad/s).
    #[serde(default = "default_stop_angvel")]
    pub max_angvel: f64,
}

/// Pose unchanged since embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotMovingArgs {
    /// Body.
    pub body: String,
    /// Per-axis position tolerance (m).
    #[serde(default = "default_pos_tol")]
    pub pos_tol: f64,
    /// Per-axis orientation tolerance (degrees).
    #[serde(default = "default_hpr_tol")]
    pub hpr_tol: f64,
}

/// First of several bodies to be touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirstContactArgs {
    /// Body whose contacts are watched.
    pub body: String,
    /// Candidate bodies, in priority order for simultaneous contacts.
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

/// Registered event kinds with their arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Bodies touch.
    Contact(PairArgs),
    /// Bodies do not touch.
    NoContact(PairArgs),
    /// One body sits inside another.
    Inclusion(InclusionArgs),
    /// A body spins while touching a support.
    RollingOn(RollingOnArgs),
    /// Roll changed by more than `angle + 1` degrees.
    Toppling(TopplingArgs),
    /// Angular speed above threshold.
    Pivoting(PivotingArgs),
    /// Downward speed above threshold.
    Falling(VerticalArgs),
    /// Upward speed above threshold.
    Rising(VerticalArgs),
    /// Linear and angular speeds below bounds.
    Stopping(StoppingArgs),
    /// Pose within tolerance of the initial pose.
    NotMoving(NotMovingArgs),
    /// Always true.
    Dummy,
    /// Categorical: name of the first candidate touched.
    FirstContact(FirstContactArgs),
}

impl EventKind {
    /// Names accepted by [`EventKind::from_name`].
    pub const NAMES: [&'static str; 12] = [
        "Contact",
        "NoContact",
        "Inclusion",
        "RollingOn",
        "Toppling",
        "Pivoting",
        "Falling",
        "Rising",
        "Stopping",
        "NotMoving",
        "Dummy",
        "FirstContact",
    ];

    /// Resolve a kind name and its arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::UnknownEventKind`] for unregistered names and
    /// [`ChainError::InvalidEventArgs`] when the arguments do not match.
    pub fn from_name(event: &str, kind: &str, args: &serde_json::Value) -> ChainResult<Self> {
        Ok(match kind {
            "Contact" => Self::Contact(parse(event, args)?),
            "NoContact" => Self::NoContact(parse(event, args)?),
            "Inclusion" => Self::Inclusion(parse(event, args)?),
            "RollingOn" => Self::RollingOn(parse(event, args)?),
            "Toppling" => Self::Toppling(parse(event, args)?),
            "Pivoting" => Self::Pivoting(parse(event, args)?),
            "Falling" => Self::Falling(parse(event, args)?),
            "Rising" => Self::Rising(parse(event, args)?),
            "Stopping" => Self::Stopping(parse(event, args)?),
            "NotMoving" => Self::NotMoving(parse(event, args)?),
            "Dummy" => {
                parse::<NoArgs>(event, args)?;
                Self::Dummy
            }
            "FirstContact" => Self::FirstContact(parse(event, args)?),
            other => {
                return Err(ChainError::UnknownEventKind {
                    event: event.to_string(),
                    kind: other.to_string(),
                })
            }
        })
    }

    /// Registered name of this kind.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Contact(_) => "Contact",
            Self::NoContact(_) => "NoContact",
            Self::Inclusion(_) => "Inclusion",
            Self::RollingOn(_) => "RollingOn",
            Self::Toppling(_) => "Toppling",
            Self::Pivoting(_) => "Pivoting",
            Self::Falling(_) => "Falling",
            Self::Rising(_) => "Rising",
            Self::Stopping(_) => "Stopping",
            Self::NotMoving(_) => "NotMoving",
            Self::Dummy => "Dummy",
            Self::FirstContact(_) => "FirstContact",
        }
    }

    /// True if the condition returns categories rather than booleans.
    #[must_use]
    pub const fn is_categorical(&self) -> bool {
        matches!(self, Self::FirstContact(_))
    }

    /// Body names referenced by the arguments.
    #[must_use]
    pub fn body_names(&self) -> Vec<&str> {
        match self {
            Self::Contact(a) | Self::NoContact(a) => vec![a.first.as_str(), a.second.as_str()],
            Self::Inclusion(a) => vec![a.inside.as_str(), a.outside.as_str()],
            Self::RollingOn(a) => vec![a.rolling.as_str(), a.support.as_str()],
            Self::Toppling(a) => vec![a.body.as_str()],
            Self::Pivoting(a) => vec![a.body.as_str()],
            Self::Falling(a) | Self::Rising(a) => vec![a.body.as_str()],
            Self::Stopping(a) => vec![a.body.as_str()],
            Self::NotMoving(a) => vec![a.body.as_str()],
            Self::Dummy => Vec::new(),
            Self::FirstContact(a) => std::iter::once(a.body.as_str())
                .chain(a.candidates.iter().map(String::as_str))
                .collect(),
        }
    }

    /// Build the condition for `event` in `world`.
    ///
    /// Body names are resolved once; `NotMoving` and `Toppling` capture the
    /// body's current pose as their reference.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::UnknownBody`] if a body is missing from the world.
    pub fn embed(&self, event: &str, world: &dyn PhysicsWorld) -> ChainResult<Box<dyn Condition>> {
        let body = |name: &str| {
            world.body(name).ok_or_else(|| ChainError::UnknownBody {
                event: event.to_string(),
                body: name.to_string(),
            })
        };

        let condition: Box<dyn Condition> = match self {
            Self::Contact(a) => Box::new(Contact {
                first: body(&a.first)?,
                second: body(&a.second)?,
                expect: true,
            }),
            Self::NoContact(a) => Box::new(Contact {
                first: body(&a.first)?,
                second: body(&a.second)?,
                expect: false,
            }),
            Self::Inclusion(a) => Box::new(Inclusion {
                inside: body(&a.inside)?,
                outside: body(&a.outside)?,
            }),
            Self::RollingOn(a) => Box::new(RollingOn {
                rolling: body(&a.rolling)?,
                support: body(&a.support)?,
                min_angvel_sq: a.min_angvel * a.min_angvel,
            }),
            Self::Toppling(a) => {
                let id = body(&a.body)?;
                Box::new(Toppling {
                    body: id,
                    angle: a.angle,
                    start_roll: world.pose(id).roll(),
                })
            }
            Self::Pivoting(a) => Box::new(Pivoting {
                body: body(&a.body)?,
                min_angvel_sq: a.min_angvel * a.min_angvel,
            }),
            Self::Falling(a) => Box::new(Vertical {
                body: body(&a.body)?,
                min_linvel: a.min_linvel.abs(),
                upward: false,
            }),
            Self::Rising(a) => Box::new(Vertical {
                body: body(&a.body)?,
                min_linvel: a.min_linvel.abs(),
                upward: true,
            }),
            Self::Stopping(a) => Box::new(Stopping {
                body: body(&a.body)?,
                max_linvel_sq: a.max_linvel * a.max_linvel,
                max_angvel_sq: a.max_angvel * a.max_angvel,
            }),
            Self::NotMoving(a) => {
                let id = body(&a.body)?;
                Box::new(NotMoving {
                    body: id,
                    initial: world.pose(id),
                    pos_tol: a.pos_tol,
                    hpr_tol: a.hpr_tol,
                })
            }
            Self::Dummy => Box::new(|_: &Probe<'_>| Signal::Bool(true)),
            Self::FirstContact(a) => {
                let mut candidates = Vec::with_capacity(a.candidates.len());
                for name in &a.candidates {
                    candidates.push((body(name)?, name.clone()));
                }
                Box::new(FirstContact {
                    body: body(&a.body)?,
                    candidates,
                })
            }
        };
        Ok(condition)
    }
}

fn parse<T: DeserializeOwned>(event: &str, args: &serde_json::Value) -> ChainResult<T> {
    let args = if args.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        args.clone()
    };
    serde_json::from_value(args).map_err(|e| ChainError::InvalidEventArgs {
        event: event.to_string(),
        message: e.to_string(),
    })
}

struct Contact {
    first: BodyId,
    second: BodyId,
    expect: bool,
}

impl Condition for Contact {
    fn check(&mut self, probe: &Probe<'_>) -> Signal {
        Signal::from(probe.world.in_contact(self.first, self.second) == self.expect)
    }
}

struct Inclusion {
    inside: BodyId,
    outside: BodyId,
}

impl Condition for Inclusion {
    fn check(&mut self, probe: &Probe<'_>) -> Signal {
        let world = probe.world;
        let ci = world.pose(self.inside).position;
        let co = world.pose(self.outside).position;
        // Nothing between the container and the contained body
        if world.ray_test_closest(co, ci) != Some(self.inside) {
            return Signal::Bool(false);
        }
        // The container surrounds the body in every XY direction
        let r = world.bounding_radius(self.outside);
        let directions = [
            Vec3::new(-r, 0.0, 0.0),
            Vec3::new(r, 0.0, 0.0),
            Vec3::new(0.0, -r, 0.0),
            Vec3::new(0.0, r, 0.0),
        ];
        Signal::from(
            directions
                .iter()
                .all(|&d| world.ray_test_closest(ci, ci + d) == Some(self.outside)),
        )
    }
}

struct RollingOn {
    rolling: BodyId,
    support: BodyId,
    min_angvel_sq: f64,
}

impl Condition for RollingOn {
    fn check(&mut self, probe: &Probe<'_>) -> Signal {
        let world = probe.world;
        Signal::from(
            world.in_contact(self.rolling, self.support)
                && world.angular_velocity(self.rolling).magnitude_squared() > self.min_angvel_sq,
        )
    }
}

struct Toppling {
    body: BodyId,
    angle: f64,
    start_roll: f64,
}

impl Condition for Toppling {
    fn check(&mut self, probe: &Probe<'_>) -> Signal {
        let roll = probe.world.pose(self.body).roll();
        Signal::from((roll - self.start_roll).abs() >= self.angle + 1.0)
    }
}

struct Pivoting {
    body: BodyId,
    min_angvel_sq: f64,
}

impl Condition for Pivoting {
    fn check(&mut self, probe: &Probe<'_>) -> Signal {
        let angvel_sq = probe.world.angular_velocity(self.body).magnitude_squared();
        Signal::from(angvel_sq > self.min_angvel_sq)
    }
}

struct Vertical {
    body: BodyId,
    min_linvel: f64,
    upward: bool,
}

impl Condition for Vertical {
    fn check(&mut self, probe: &Probe<'_>) -> Signal {
        let vz = probe.world.linear_velocity(self.body).z;
        Signal::from(if self.upward {
            vz > self.min_linvel
        } else {
            vz < -self.min_linvel
        })
    }
}

struct Stopping {
    body: BodyId,
    max_linvel_sq: f64,
    max_angvel_sq: f64,
}

impl Condition for Stopping {
    fn check(&mut self, probe: &Probe<'_>) -> Signal {
        let world = probe.world;
        Signal::from(
            world.linear_velocity(self.body).magnitude_squared() < self.max_linvel_sq
                && world.angular_velocity(self.body).magnitude_squared() < self.max_angvel_sq,
        )
    }
}

struct NotMoving {
    body: BodyId,
    initial: Pose,
    pos_tol: f64,
    hpr_tol: f64,
}

impl Condition for NotMoving {
    fn check(&mut self, probe: &Probe<'_>) -> Signal {
        let pose = probe.world.pose(self.body);
        Signal::from(
            pose.position.approx_eq(&self.initial.position, self.pos_tol)
                && pose.hpr.approx_eq(&self.initial.hpr, self.hpr_tol),
        )
    }
}

struct FirstContact {
    body: BodyId,
    candidates: Vec<(BodyId, String)>,
}

impl Condition for FirstContact {
    fn check(&mut self, probe: &Probe<'_>) -> Signal {
        self.candidates
            .iter()
            .find(|(id, _)| probe.world.in_contact(self.body, *id))
            .map_or(Signal::Bool(false), |(_, name)| Signal::Category(name.clone()))
    }
}
