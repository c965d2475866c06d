//! Typed parameter, action and status blocks of the entity protocol.
//!
//! Every block is a variant of a closed enum, so dispatch is a `match` on
//! the tag. Optional fields are "unused" markers: setters leave the
//! corresponding state alone when a field is `None`.

use nalgebra::{Point3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use sim_types::{Gravity, JointId, MassProperties, PartId, Pose, SimulationConfig};

use crate::collaborator::Aabb;
use crate::error::Result;
use crate::joint::AxisState;

/// Per-axis optional values.
pub type AxisValues<T> = [Option<T>; 3];

/// Parameter blocks accepted by `set_params`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Params {
    /// Simulation settings of one entity.
    Simulation(SimulationParams),
    /// Joint configuration.
    Joint(JointParams),
    /// Attach a geometry part.
    Part(PartParams),
    /// Move the entity.
    Pose(PoseParams),
    /// Articulated-only settings.
    Articulated(ArticulatedParams),
}

impl Params {
    /// Tag name for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Simulation(_) => "simulation params",
            Self::Joint(_) => "joint params",
            Self::Part(_) => "part params",
            Self::Pose(_) => "pose params",
            Self::Articulated(_) => "articulated params",
        }
    }
}

/// Entity simulation settings.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Gravity acceleration.
    pub gravity: Option<Vector3<f64>>,
    /// Velocity damping per second.
    pub damping: Option<f64>,
    /// Largest substep.
    pub max_time_step: Option<f64>,
    /// Sleep energy threshold per unit mass.
    pub min_energy: Option<f64>,
}

impl SimulationParams {
    /// `config` with the set fields replaced.
    ///
    /// # Errors
    ///
    /// The merged configuration fails validation.
    pub fn apply_to(&self, config: &SimulationConfig) -> Result<SimulationConfig> {
        let mut merged = config.clone();
        if let Some(gravity) = self.gravity {
            merged.gravity = Gravity::custom(gravity);
        }
        if let Some(damping) = self.damping {
            merged.damping = damping;
        }
        if let Some(max_time_step) = self.max_time_step {
            merged.max_time_step = max_time_step;
        }
        if let Some(min_energy) = self.min_energy {
            merged.sleep.min_energy = min_energy;
        }
        merged.validate()?;
        Ok(merged)
    }
}

/// Joint configuration. Axis arrays are indexed x, y, z.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointParams {
    /// Joint to configure.
    pub id: JointId,
    /// World pivot; recomputes both pivot offsets from the current pose.
    pub pivot: Option<Point3<f64>>,
    /// Home orientation relative to the parent frame.
    pub q0: Option<UnitQuaternion<f64>>,
    /// Angles to set (rad).
    pub angles: AxisValues<f64>,
    /// Joint rates to set (rad/s).
    pub velocity: AxisValues<f64>,
    /// Lower bounds (rad).
    pub lo: AxisValues<f64>,
    /// Upper bounds (rad).
    pub hi: AxisValues<f64>,
    /// Lock or unlock axes.
    pub locked: AxisValues<bool>,
    /// Spring constants.
    pub stiffness: AxisValues<f64>,
    /// Damping constants.
    pub damping: AxisValues<f64>,
    /// Dashpot constants.
    pub dashpot: AxisValues<f64>,
    /// Dashpot zone widths.
    pub dashpot_zone: AxisValues<f64>,
    /// Limit bounce coefficients.
    pub bounciness: AxisValues<f64>,
    /// Pin a root to the world or release it.
    pub grounded: Option<bool>,
}

impl JointParams {
    /// Block touching nothing on joint `id`.
    #[must_use]
    pub fn new(id: JointId) -> Self {
        Self {
            id,
            pivot: None,
            q0: None,
            angles: [None; 3],
            velocity: [None; 3],
            lo: [None; 3],
            hi: [None; 3],
            locked: [None; 3],
            stiffness: [None; 3],
            damping: [None; 3],
            dashpot: [None; 3],
            dashpot_zone: [None; 3],
            bounciness: [None; 3],
            grounded: None,
        }
    }

    /// Set the limit interval of one axis.
    #[must_use]
    pub fn limits(mut self, axis: usize, lo: f64, hi: f64) -> Self {
        self.lo[axis] = Some(lo);
        self.hi[axis] = Some(hi);
        self
    }

    /// Lock one axis.
    #[must_use]
    pub fn lock(mut self, axis: usize) -> Self {
        self.locked[axis] = Some(true);
        self
    }

    /// Lock every axis.
    #[must_use]
    pub fn lock_all(mut self) -> Self {
        self.locked = [Some(true); 3];
        self
    }

    /// Set one angle.
    #[must_use]
    pub fn angle(mut self, axis: usize, angle: f64) -> Self {
        self.angles[axis] = Some(angle);
        self
    }

    /// Set one joint rate.
    #[must_use]
    pub fn rate(mut self, axis: usize, rate: f64) -> Self {
        self.velocity[axis] = Some(rate);
        self
    }

    /// Spring and damper on one axis.
    #[must_use]
    pub fn spring(mut self, axis: usize, stiffness: f64, damping: f64) -> Self {
        self.stiffness[axis] = Some(stiffness);
        self.damping[axis] = Some(damping);
        self
    }

    /// Pin the root to the world.
    #[must_use]
    pub fn grounded(mut self, grounded: bool) -> Self {
        self.grounded = Some(grounded);
        self
    }
}

/// Where a new joint hangs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParentRef {
    /// Start a new floating tree.
    Root,
    /// Child of an existing joint.
    Joint(JointId),
}

/// Attach a part. Creates the joint if it does not exist yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartParams {
    /// Part id, unique within the entity.
    pub part: PartId,
    /// Joint carrying the part (ignored by non-articulated entities).
    pub joint: JointId,
    /// Parent of a newly created joint.
    pub parent: ParentRef,
    /// World frame of a newly created joint's body.
    pub frame: Pose,
    /// World pivot of a newly created joint; the frame origin if unset.
    pub pivot: Option<Point3<f64>>,
    /// Placement of the part in the body frame.
    pub local: Pose,
    /// Mass properties in the part frame.
    pub props: MassProperties,
}

impl PartParams {
    /// Part on a new floating root at `frame`.
    #[must_use]
    pub fn root(part: PartId, joint: JointId, frame: Pose, props: MassProperties) -> Self {
        Self {
            part,
            joint,
            parent: ParentRef::Root,
            frame,
            pivot: None,
            local: Pose::identity(),
            props,
        }
    }

    /// Part on a new joint hanging from `parent` at `pivot`.
    #[must_use]
    pub fn child(
        part: PartId,
        joint: JointId,
        parent: JointId,
        frame: Pose,
        pivot: Point3<f64>,
        props: MassProperties,
    ) -> Self {
        Self {
            parent: ParentRef::Joint(parent),
            pivot: Some(pivot),
            ..Self::root(part, joint, frame, props)
        }
    }
}

/// Move the entity so its first root's body frame lands on this pose.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseParams {
    /// New position.
    pub position: Option<Point3<f64>>,
    /// New orientation.
    pub rotation: Option<UnitQuaternion<f64>>,
}

/// Articulated-only settings.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ArticulatedParams {
    /// Make this joint the root of its tree.
    pub reroot: Option<JointId>,
}

/// Actions accepted by `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// Impulse on a body.
    Impulse(ImpulseAction),
    /// Request joint rates for the next step.
    SetJointVelocity {
        /// Target joint.
        joint: JointId,
        /// Requested rate per axis.
        velocity: AxisValues<f64>,
    },
    /// Set the root (or single body) velocity.
    SetVelocity {
        /// Linear velocity of the centre of mass.
        linear: Vector3<f64>,
        /// Angular velocity.
        angular: Vector3<f64>,
    },
    /// Force the awake state.
    Awake {
        /// `true` to wake, `false` to put to sleep.
        awake: bool,
    },
    /// Zero velocities and drop pending requests.
    Reset,
    /// Detach a part.
    RemovePart {
        /// Part to remove.
        part: PartId,
    },
}

impl Action {
    /// Tag name for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Impulse(_) => "impulse",
            Self::SetJointVelocity { .. } => "set joint velocity",
            Self::SetVelocity { .. } => "set velocity",
            Self::Awake { .. } => "awake",
            Self::Reset => "reset",
            Self::RemovePart { .. } => "remove part",
        }
    }
}

/// Linear and angular impulse.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImpulseAction {
    /// Body to hit; the first root when unset.
    pub joint: Option<JointId>,
    /// Linear impulse.
    pub impulse: Vector3<f64>,
    /// World application point; the centre of mass when unset.
    pub point: Option<Vector3<f64>>,
    /// Additional angular impulse.
    pub angular: Vector3<f64>,
}

/// Status queries accepted by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusQuery {
    /// Pose and bounds.
    Pose,
    /// Mass and motion of one body, or the whole entity when unset.
    Dynamics {
        /// Joint to report.
        joint: Option<JointId>,
    },
    /// Joint state.
    Joint(JointId),
    /// Joint and part counts.
    Counts,
    /// Awake flag.
    Awake,
}

/// Answers to [`StatusQuery`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Status {
    /// Pose and bounds.
    Pose(PoseStatus),
    /// Mass and motion.
    Dynamics(DynamicsStatus),
    /// Joint state.
    Joint(JointStatus),
    /// Counts.
    Counts {
        /// Joints.
        joints: usize,
        /// Parts.
        parts: usize,
    },
    /// Awake flag.
    Awake(bool),
}

/// Pose status.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseStatus {
    /// Root body frame.
    pub pose: Pose,
    /// World bounds of all parts.
    pub bbox: Aabb,
}

/// Dynamics status.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DynamicsStatus {
    /// Mass.
    pub mass: f64,
    /// Centre of mass.
    pub center_of_mass: Vector3<f64>,
    /// Linear velocity of the centre of mass.
    pub velocity: Vector3<f64>,
    /// Angular velocity (of the root body for whole-entity queries).
    pub angular_velocity: Vector3<f64>,
    /// Kinetic energy.
    pub energy: f64,
    /// Awake flag.
    pub awake: bool,
    /// External contacts in the last step.
    pub contacts: usize,
}

/// Joint status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointStatus {
    /// Joint id.
    pub id: JointId,
    /// Parent joint, `None` for roots.
    pub parent: Option<JointId>,
    /// Angles.
    pub angles: Vector3<f64>,
    /// Joint rates.
    pub velocity: Vector3<f64>,
    /// Axis states.
    pub states: [AxisState; 3],
    /// Lower bounds.
    pub lo: Vector3<f64>,
    /// Upper bounds.
    pub hi: Vector3<f64>,
    /// World pivot.
    pub pivot: Vector3<f64>,
    /// Body frame pose.
    pub pose: Pose,
    /// Whether the root is pinned to the world.
    pub grounded: bool,
}
