//! Joints: a body plus its 3-axis angular connection to the parent.
//!
//! A joint rotates its body relative to the parent frame through XYZ Euler
//! angles applied on top of a home orientation `q0`:
//!
//! ```text
//! R_child = R_parent · q0 · Rx(q.x) · Ry(q.y) · Rz(q.z)
//! ```
//!
//! so the world rotation axes are `base·x`, `base·Rx·y` and `base·Rx·Ry·z`
//! with `base = R_parent · q0`. The x and z axes are not orthogonal in
//! general and become parallel when `|q.y| → π/2` (gimbal lock).
//!
//! Everything describing the relation to the parent lives in [`JointLink`];
//! re-rooting moves links along the reversed path while the bodies stay put.

use nalgebra::{Matrix3, Matrix6x3, Point3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use sim_types::{JointId, MassProperties, PartId, Pose, RigidBody, SpatialMatrix, SpatialVector};

use crate::tree::JointHandle;

/// Which bound of an axis interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitSide {
    /// The `lo` bound.
    Lower,
    /// The `hi` bound.
    Upper,
}

impl LimitSide {
    /// Sign of joint velocity that moves further past this bound.
    #[must_use]
    pub fn outward_sign(self) -> f64 {
        match self {
            Self::Lower => -1.0,
            Self::Upper => 1.0,
        }
    }
}

/// Per-axis state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AxisState {
    /// Moves freely.
    #[default]
    Free,
    /// Rigid by configuration.
    Locked,
    /// Resting on or pushing against a bound.
    LimitReached(LimitSide),
    /// Frozen because the x and z axes went parallel.
    GimbalLocked,
}

impl AxisState {
    /// Whether the axis contributes a column to the motion subspace.
    #[must_use]
    pub fn is_mobile(self) -> bool {
        matches!(self, Self::Free | Self::LimitReached(_))
    }
}

/// Configuration and state of one rotation axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Lower bound (rad). `-inf` when unlimited.
    pub lo: f64,
    /// Upper bound (rad). `+inf` when unlimited.
    pub hi: f64,
    /// Spring constant pulling the angle towards zero.
    pub stiffness: f64,
    /// Viscous damping on the axis velocity.
    pub damping: f64,
    /// Extra damping applied when moving into a nearby bound.
    pub dashpot: f64,
    /// Distance from a bound inside which the dashpot acts (rad).
    pub dashpot_zone: f64,
    /// Bounce coefficient for limit impacts, 0..=1.
    pub bounciness: f64,
    /// Current state.
    pub state: AxisState,
    /// One-shot velocity request consumed by the next solve.
    pub requested_velocity: Option<f64>,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            lo: f64::NEG_INFINITY,
            hi: f64::INFINITY,
            stiffness: 0.0,
            damping: 0.0,
            dashpot: 0.0,
            dashpot_zone: 0.0,
            bounciness: 0.0,
            state: AxisState::Free,
            requested_velocity: None,
        }
    }
}

impl AxisConfig {
    /// Whether either bound is finite.
    #[must_use]
    pub fn is_limited(&self) -> bool {
        self.lo.is_finite() || self.hi.is_finite()
    }

    /// Whether the axis is locked by configuration.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state == AxisState::Locked
    }

    /// Generalised force from spring, damper and dashpot.
    #[must_use]
    pub fn drive_torque(&self, angle: f64, velocity: f64) -> f64 {
        let mut torque = -self.stiffness * angle - self.damping * velocity;
        if self.dashpot > 0.0 {
            let near_lo = velocity < 0.0 && angle - self.lo < self.dashpot_zone;
            let near_hi = velocity > 0.0 && self.hi - angle < self.dashpot_zone;
            if near_lo || near_hi {
                torque -= self.dashpot * velocity;
            }
        }
        torque
    }
}

/// Relation of a joint's body to its parent. Moves as a unit on reroot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointLink {
    /// Parent joint; `None` for a tree root.
    pub parent: Option<JointHandle>,
    /// A root pinned to the world at `pivot_parent` instead of floating.
    pub grounded: bool,
    /// Pivot in the parent frame (world for a grounded root).
    pub pivot_parent: Vector3<f64>,
    /// Pivot in this body's frame.
    pub pivot_child: Vector3<f64>,
    /// Home orientation relative to the parent frame.
    pub q0: UnitQuaternion<f64>,
    /// Set once `q0` differs from the value given at creation.
    pub reference_changed: bool,
    /// Current XYZ Euler angles.
    pub angles: Vector3<f64>,
    /// Angles at the start of the last step.
    pub prev_angles: Vector3<f64>,
    /// Angle rates.
    pub dq: Vector3<f64>,
    /// Per-axis configuration and state.
    pub axes: [AxisConfig; 3],
}

impl JointLink {
    /// Root whose body moves freely in 6 DOF.
    #[must_use]
    pub fn floating_root() -> Self {
        Self {
            parent: None,
            grounded: false,
            pivot_parent: Vector3::zeros(),
            pivot_child: Vector3::zeros(),
            q0: UnitQuaternion::identity(),
            reference_changed: false,
            angles: Vector3::zeros(),
            prev_angles: Vector3::zeros(),
            dq: Vector3::zeros(),
            axes: Default::default(),
        }
    }

    /// Root pinned to the world at `pivot_world`, currently oriented as
    /// `frame`.
    #[must_use]
    pub fn grounded_root(frame: &Pose, pivot_world: &Point3<f64>) -> Self {
        Self {
            grounded: true,
            ..Self::child_of(None, &Pose::identity(), frame, pivot_world)
        }
    }

    /// Link for a body at `frame` hanging from `parent_frame` at
    /// `pivot_world`. The current configuration becomes zero angles.
    #[must_use]
    pub fn child_of(
        parent: Option<JointHandle>,
        parent_frame: &Pose,
        frame: &Pose,
        pivot_world: &Point3<f64>,
    ) -> Self {
        Self {
            parent,
            grounded: false,
            pivot_parent: parent_frame.inverse_transform_point(pivot_world).coords,
            pivot_child: frame.inverse_transform_point(pivot_world).coords,
            q0: parent_frame.rotation.inverse() * frame.rotation,
            ..Self::floating_root()
        }
    }

    /// Whether this link has no parent joint.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// A root that is not pinned: its body carries the tree's free motion.
    #[must_use]
    pub fn is_floating_root(&self) -> bool {
        self.parent.is_none() && !self.grounded
    }

    /// Per-axis mobility mask.
    #[must_use]
    pub fn mobile_mask(&self) -> [bool; 3] {
        [
            self.axes[0].state.is_mobile(),
            self.axes[1].state.is_mobile(),
            self.axes[2].state.is_mobile(),
        ]
    }

    /// Frame of this joint given the frame of whatever it hangs from
    /// (identity for a grounded root).
    #[must_use]
    pub fn frame(&self, parent_frame: &Pose) -> JointFrame {
        let base = parent_frame.rotation * self.q0;
        let rx = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), self.angles.x);
        let ry = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), self.angles.y);
        let rz = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), self.angles.z);
        let rotation = base * rx * ry * rz;
        let axes = [
            base * Vector3::x(),
            base * (rx * Vector3::y()),
            base * (rx * (ry * Vector3::z())),
        ];
        let pivot = parent_frame
            .transform_point(&Point3::from(self.pivot_parent))
            .coords;
        JointFrame {
            base,
            rotation,
            axes,
            pivot,
            position: pivot - rotation * self.pivot_child,
        }
    }

    /// Relative rotation `q0 · Rx · Ry · Rz`.
    #[must_use]
    pub fn relative_rotation(&self) -> UnitQuaternion<f64> {
        let rx = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), self.angles.x);
        let ry = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), self.angles.y);
        let rz = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), self.angles.z);
        self.q0 * rx * ry * rz
    }

    /// The same relation seen from the other side.
    ///
    /// `omega_rel` is the world angular velocity of the child relative to
    /// the parent; `parent_rotation` the parent's world frame rotation.
    /// The result hangs the old parent from `new_parent` at zero angles,
    /// with swapped pivots and mirrored limits.
    #[must_use]
    pub fn reversed(
        &self,
        new_parent: JointHandle,
        parent_rotation: &UnitQuaternion<f64>,
        omega_rel: &Vector3<f64>,
    ) -> Self {
        let mut dq = -(parent_rotation.inverse() * omega_rel);
        let mut axes = self.axes.clone();
        for (k, axis) in axes.iter_mut().enumerate() {
            let angle = self.angles[k];
            let (lo, hi) = (axis.lo, axis.hi);
            axis.lo = -(hi - angle);
            axis.hi = -(lo - angle);
            axis.requested_velocity = None;
            if axis.is_locked() {
                dq[k] = 0.0;
            } else {
                axis.state = AxisState::Free;
            }
        }
        Self {
            parent: Some(new_parent),
            grounded: false,
            pivot_parent: self.pivot_child,
            pivot_child: self.pivot_parent,
            q0: self.relative_rotation().inverse(),
            reference_changed: true,
            angles: Vector3::zeros(),
            prev_angles: Vector3::zeros(),
            dq,
            axes,
        }
    }
}

/// World-space joint geometry derived from the link and the parent frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointFrame {
    /// `R_parent · q0`.
    pub base: UnitQuaternion<f64>,
    /// World rotation of the body frame.
    pub rotation: UnitQuaternion<f64>,
    /// World rotation axes for x, y, z.
    pub axes: [Vector3<f64>; 3],
    /// World pivot.
    pub pivot: Vector3<f64>,
    /// World origin of the body frame.
    pub position: Vector3<f64>,
}

impl JointFrame {
    /// Body frame pose.
    #[must_use]
    pub fn pose(&self) -> Pose {
        Pose::new(Point3::from(self.position), self.rotation)
    }
}

/// A geometry part attached to a joint's body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedPart {
    /// Caller id.
    pub id: PartId,
    /// Placement in the body frame.
    pub local: Pose,
    /// Mass properties in the part's own frame.
    pub props: MassProperties,
}

impl AttachedPart {
    /// Mass properties re-expressed in the body frame.
    #[must_use]
    pub fn body_props(&self) -> MassProperties {
        let r = self.local.rotation.to_rotation_matrix();
        MassProperties {
            center_of_mass: self.local.transform_point(&Point3::from(self.props.center_of_mass)).coords,
            inertia: r.matrix() * self.props.inertia * r.matrix().transpose(),
            ..self.props
        }
    }
}

/// Per-joint scratch of the three-pass solver.
///
/// Recomputed from scratch by every solve; nothing here survives a step
/// in a meaningful way. Allocated on first use and reused.
#[repr(align(16))]
#[derive(Debug, Clone, PartialEq)]
pub struct FeatherstoneData {
    /// Articulated inertia of the subtree at this body's centre of mass.
    pub ia: SpatialMatrix,
    /// `ia` with this joint's mobile axes factored out, as seen by the parent.
    pub ia_eff: SpatialMatrix,
    /// Motion subspace, one column per axis; immobile axes are zero.
    pub s: Matrix6x3<f64>,
    /// `ia · s`.
    pub ia_s: Matrix6x3<f64>,
    /// `sᵀ · ia · s`, identity on immobile axes.
    pub d: Matrix3<f64>,
    /// Inverse joint-space mass, zero on immobile axes.
    pub qinv: Matrix3<f64>,
    /// Velocity-product acceleration.
    pub c: SpatialVector,
    /// Bias force of the subtree.
    pub pa: SpatialVector,
    /// `τ − sᵀ · pa`.
    pub u: Vector3<f64>,
    /// Joint-local acceleration from the last solve.
    pub ddq: Vector3<f64>,
    /// Spatial acceleration from the last solve.
    pub accel: SpatialVector,
    /// Body velocity `[ω; v]` at the centre of mass from the last forward
    /// kinematics pass.
    pub velocity: SpatialVector,
    /// Inverse of `ia` for a floating root, zero otherwise.
    pub root_inv: SpatialMatrix,
    /// This body's centre of mass minus the parent's.
    pub lever: Vector3<f64>,
    /// Axes contributing to `s`.
    pub mobile: [bool; 3],
}

impl Default for FeatherstoneData {
    fn default() -> Self {
        Self {
            ia: SpatialMatrix::zeros(),
            ia_eff: SpatialMatrix::zeros(),
            s: Matrix6x3::zeros(),
            ia_s: Matrix6x3::zeros(),
            d: Matrix3::identity(),
            qinv: Matrix3::zeros(),
            c: SpatialVector::zeros(),
            pa: SpatialVector::zeros(),
            u: Vector3::zeros(),
            ddq: Vector3::zeros(),
            accel: SpatialVector::zeros(),
            velocity: SpatialVector::zeros(),
            root_inv: SpatialMatrix::zeros(),
            lever: Vector3::zeros(),
            mobile: [false; 3],
        }
    }
}

/// One joint and the body it owns.
#[derive(Debug, Clone)]
pub struct Joint {
    /// Caller id.
    pub id: JointId,
    /// The body moved by this joint.
    pub body: RigidBody,
    /// Geometry attached to the body.
    pub parts: SmallVec<[AttachedPart; 2]>,
    /// Relation to the parent.
    pub link: JointLink,
    /// World rotation axes from the last kinematics update.
    pub axes_world: [Vector3<f64>; 3],
    /// World pivot from the last kinematics update.
    pub pivot_world: Vector3<f64>,
    /// Kinetic plus unprojection energy from the last step.
    pub energy: f64,
    /// Energy injected by penetration push-out in the last step.
    pub unproj_energy: f64,
    /// Above the sleep threshold (own or inherited from the parent).
    pub awake: bool,
    /// External contacts assigned in the last step.
    pub contacts: usize,
    pub(crate) children: SmallVec<[u32; 4]>,
    pub(crate) n_subtree: usize,
    pub(crate) level: usize,
    pub(crate) fs: Option<Box<FeatherstoneData>>,
}

impl Joint {
    /// Joint owning `body`, related to its parent by `link`.
    #[must_use]
    pub fn new(id: JointId, body: RigidBody, link: JointLink) -> Self {
        let pivot_world = body.frame_pose().transform_point(&Point3::from(link.pivot_child)).coords;
        Self {
            id,
            body,
            parts: SmallVec::new(),
            link,
            axes_world: [Vector3::x(), Vector3::y(), Vector3::z()],
            pivot_world,
            energy: 0.0,
            unproj_energy: 0.0,
            awake: true,
            contacts: 0,
            children: SmallVec::new(),
            n_subtree: 1,
            level: 0,
            fs: None,
        }
    }

    /// Number of direct children.
    #[must_use]
    pub fn n_children(&self) -> usize {
        self.children.len()
    }

    /// Size of the subtree rooted here, including this joint.
    #[must_use]
    pub fn n_subtree(&self) -> usize {
        self.n_subtree
    }

    /// Depth below the tree root.
    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }

    /// Solver scratch, allocated on first use.
    pub fn scratch_mut(&mut self) -> &mut FeatherstoneData {
        self.fs.get_or_insert_with(Box::default)
    }

    /// Solver scratch if a solve has run.
    #[must_use]
    pub fn scratch(&self) -> Option<&FeatherstoneData> {
        self.fs.as_deref()
    }

    /// Child angular velocity relative to the parent, world axes.
    #[must_use]
    pub fn relative_angular_velocity(&self) -> Vector3<f64> {
        let mobile = self.link.mobile_mask();
        (0..3)
            .filter(|&k| mobile[k])
            .map(|k| self.axes_world[k] * self.link.dq[k])
            .sum()
    }

    /// Part lookup.
    #[must_use]
    pub fn part(&self, id: PartId) -> Option<&AttachedPart> {
        self.parts.iter().find(|p| p.id == id)
    }

    /// Body frame pose.
    #[must_use]
    pub fn frame_pose(&self) -> Pose {
        self.body.frame_pose()
    }

    /// Mass of the body, 0 for massless joints.
    #[must_use]
    pub fn mass(&self) -> f64 {
        self.body.mass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_frame_axes_follow_euler_order() {
        let mut link = JointLink::floating_root();
        link.angles = Vector3::new(FRAC_PI_2, 0.0, 0.0);
        let frame = link.frame(&Pose::identity());

        assert_relative_eq!(frame.axes[0], Vector3::x(), epsilon = 1e-12);
        // y axis rotated about x by 90° points along +z.
        assert_relative_eq!(frame.axes[1], Vector3::z(), epsilon = 1e-12);
        assert_relative_eq!(frame.axes[2], -Vector3::y(), epsilon = 1e-12);
    }

    #[test]
    fn test_gimbal_geometry() {
        let mut link = JointLink::floating_root();
        link.angles = Vector3::new(0.3, FRAC_PI_2, -0.2);
        let frame = link.frame(&Pose::identity());
        assert_relative_eq!(frame.axes[0].dot(&frame.axes[2]).abs(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_child_of_places_pivot() {
        let parent = Pose::from_position(Point3::new(0.0, 0.0, 1.0));
        let child = Pose::from_position(Point3::new(1.0, 0.0, 1.0));
        let pivot = Point3::new(0.5, 0.0, 1.0);
        let link = JointLink::child_of(None, &parent, &child, &pivot);

        assert_relative_eq!(link.pivot_parent, Vector3::new(0.5, 0.0, 0.0));
        assert_relative_eq!(link.pivot_child, Vector3::new(-0.5, 0.0, 0.0));
        let frame = link.frame(&parent);
        assert_relative_eq!(frame.position, child.position.coords, epsilon = 1e-12);
        assert_relative_eq!(frame.pivot, pivot.coords, epsilon = 1e-12);
    }

    #[test]
    fn test_reversed_preserves_world_frame() {
        let parent = Pose::new(
            Point3::new(0.2, -0.1, 1.0),
            UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
        );
        let child = Pose::new(Point3::new(1.0, 0.5, 1.2), UnitQuaternion::from_euler_angles(-0.4, 0.1, 0.0));
        let mut link = JointLink::child_of(None, &parent, &child, &Point3::new(0.6, 0.2, 1.1));
        link.angles = Vector3::new(0.3, -0.2, 0.5);
        link.axes[0].lo = -0.5;
        link.axes[0].hi = 1.0;
        let child_frame = link.frame(&parent);

        let back = link.reversed(JointHandle::new(0, 0), &parent.rotation, &Vector3::zeros());
        let parent_again = back.frame(&child_frame.pose());

        assert_relative_eq!(parent_again.position, parent.position.coords, epsilon = 1e-12);
        assert_relative_eq!(parent_again.rotation.angle_to(&parent.rotation), 0.0, epsilon = 1e-12);
        assert_relative_eq!(back.axes[0].lo, -0.7, epsilon = 1e-12);
        assert_relative_eq!(back.axes[0].hi, 0.8, epsilon = 1e-12);
        assert!(back.reference_changed);
    }

    #[test]
    fn test_dashpot_only_near_bound() {
        let axis = AxisConfig {
            lo: -1.0,
            hi: 1.0,
            dashpot: 5.0,
            dashpot_zone: 0.1,
            ..Default::default()
        };
        assert_relative_eq!(axis.drive_torque(0.0, 1.0), 0.0);
        assert_relative_eq!(axis.drive_torque(0.95, 1.0), -5.0);
        // Moving away from the bound is not braked.
        assert_relative_eq!(axis.drive_torque(0.95, -1.0), 0.0);
    }

    #[test]
    fn test_scratch_allocated_lazily() {
        let mut joint = Joint::new(JointId(1), RigidBody::new_static(), JointLink::floating_root());
        assert!(joint.scratch().is_none());
        joint.scratch_mut().lever = Vector3::x();
        assert!(joint.scratch().is_some());
        let addr = std::ptr::from_ref(joint.scratch_mut()) as usize;
        assert_eq!(addr % 16, 0);
    }
}
