//! Single 6-DOF rigid body with an explicit momentum integrator.
//!
//! State is kept at the centre of mass in world space. The body carries its
//! inertia in principal axes, so the orientation `q` is the orientation of
//! the principal frame; `qfb`/`offsfb` map between that frame and the
//! user-facing frame the geometry parts were attached in.
//!
//! Momentum (`p`, `l`) is the integrated quantity. Velocities (`v`, `w`) and
//! the world inverse inertia are derived from it by [`RigidBody::update_state`].

use nalgebra::{Matrix3, Point3, Rotation3, SymmetricEigen, UnitQuaternion, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::spatial::skew;
use crate::{MassProperties, Pose, Twist};

/// Eigenvalues below this are treated as a massless direction.
const MIN_PRINCIPAL_INERTIA: f64 = 1e-12;

/// Rigid body state.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RigidBody {
    /// Centre of mass, world.
    pub pos: Vector3<f64>,
    /// Orientation of the principal axes, world.
    pub q: UnitQuaternion<f64>,
    /// Linear momentum.
    pub p: Vector3<f64>,
    /// Angular momentum about the centre of mass.
    pub l: Vector3<f64>,
    /// Linear velocity of the centre of mass.
    pub v: Vector3<f64>,
    /// Angular velocity.
    pub w: Vector3<f64>,
    /// Mass (0 for static).
    pub mass: f64,
    /// Inverse mass (0 for static).
    pub inv_mass: f64,
    /// Principal moments of inertia.
    pub ibody: Vector3<f64>,
    /// Inverse principal moments (0 on massless directions).
    pub ibody_inv: Vector3<f64>,
    /// Centre of mass in the attach frame.
    pub offsfb: Vector3<f64>,
    /// Rotation from principal axes to the attach frame.
    pub qfb: UnitQuaternion<f64>,
    /// World-space inverse inertia, refreshed by `update_state`.
    pub iinv: Matrix3<f64>,
    /// Accumulated part volume.
    pub volume: f64,
    /// Accumulated properties in the attach frame, kept for part removal.
    pub frame_props: MassProperties,
}

impl Default for RigidBody {
    fn default() -> Self {
        Self::new_static()
    }
}

impl RigidBody {
    /// Immovable body at the origin.
    #[must_use]
    pub fn new_static() -> Self {
        Self {
            pos: Vector3::zeros(),
            q: UnitQuaternion::identity(),
            p: Vector3::zeros(),
            l: Vector3::zeros(),
            v: Vector3::zeros(),
            w: Vector3::zeros(),
            mass: 0.0,
            inv_mass: 0.0,
            ibody: Vector3::zeros(),
            ibody_inv: Vector3::zeros(),
            offsfb: Vector3::zeros(),
            qfb: UnitQuaternion::identity(),
            iinv: Matrix3::zeros(),
            volume: 0.0,
            frame_props: MassProperties::empty(),
        }
    }

    /// Body at `frame` with the given mass properties, at rest.
    #[must_use]
    pub fn create(frame: &Pose, props: &MassProperties) -> Self {
        let mut body = Self::new_static();
        body.set_mass_properties(props);
        body.set_frame_pose(frame);
        body
    }

    /// Replace mass properties, keeping the attach-frame pose and velocity.
    pub fn set_mass_properties(&mut self, props: &MassProperties) {
        let frame = self.frame_pose();
        let twist = self.twist();

        self.frame_props = *props;
        self.volume = props.volume;
        self.mass = props.mass.max(0.0);
        self.inv_mass = props.inverse_mass();
        self.offsfb = props.center_of_mass;

        let (moments, rotation) = principal_axes(&props.inertia);
        self.ibody = moments;
        self.ibody_inv = moments.map(|m| {
            if m > MIN_PRINCIPAL_INERTIA && self.inv_mass > 0.0 {
                1.0 / m
            } else {
                0.0
            }
        });
        self.qfb = rotation;

        self.set_frame_pose(&frame);
        self.set_velocity(&twist);
    }

    /// Accumulate another part, keeping pose and velocity.
    pub fn add(&mut self, props: &MassProperties) {
        let combined = self.frame_props.combine(props);
        self.set_mass_properties(&combined);
    }

    /// Remove a previously added part.
    pub fn remove(&mut self, props: &MassProperties) {
        let remaining = self.frame_props.subtract(props);
        self.set_mass_properties(&remaining);
    }

    /// Place the attach frame in the world.
    pub fn set_frame_pose(&mut self, frame: &Pose) {
        self.q = frame.rotation * self.qfb;
        self.pos = frame.position.coords + frame.rotation * self.offsfb;
        self.update_state();
    }

    /// Pose of the attach frame.
    #[must_use]
    pub fn frame_pose(&self) -> Pose {
        let rotation = self.q * self.qfb.inverse();
        Pose::new(Point3::from(self.pos - rotation * self.offsfb), rotation)
    }

    /// Current velocity.
    #[must_use]
    pub fn twist(&self) -> Twist {
        Twist::new(self.v, self.w)
    }

    /// Whether the body is immovable.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.inv_mass <= 0.0
    }

    /// World-space inertia tensor.
    #[must_use]
    pub fn inertia_world(&self) -> Matrix3<f64> {
        let r = self.q.to_rotation_matrix();
        r.matrix() * Matrix3::from_diagonal(&self.ibody) * r.matrix().transpose()
    }

    /// Recompute world inverse inertia and velocities from momentum.
    pub fn update_state(&mut self) {
        let r = self.q.to_rotation_matrix();
        self.iinv = r.matrix() * Matrix3::from_diagonal(&self.ibody_inv) * r.matrix().transpose();
        self.v = self.p * self.inv_mass;
        self.w = self.iinv * self.l;
    }

    /// Set velocity directly; momentum follows.
    pub fn set_velocity(&mut self, twist: &Twist) {
        if self.is_static() {
            self.zero_velocity();
            return;
        }
        self.p = twist.linear * self.mass;
        self.l = self.inertia_world() * twist.angular;
        self.update_state();
    }

    /// Zero momentum and velocity.
    pub fn zero_velocity(&mut self) {
        self.p = Vector3::zeros();
        self.l = Vector3::zeros();
        self.v = Vector3::zeros();
        self.w = Vector3::zeros();
    }

    /// Advance the pose by `dt` using the current momentum.
    ///
    /// Explicit: velocity is derived from the momentum at the start of the
    /// step, then the orientation is advanced along `w` and renormalised.
    pub fn step(&mut self, dt: f64) {
        if self.is_static() {
            return;
        }
        self.update_state();
        self.pos += self.v * dt;
        let rotation = UnitQuaternion::from_scaled_axis(self.w * dt);
        self.q = UnitQuaternion::new_normalize((rotation * self.q).into_inner());
        self.update_state();
    }

    /// Move the pose by `dt` along a prescribed velocity, leaving momentum
    /// alone.
    ///
    /// Massless bodies hold no momentum, so whatever carries them supplies
    /// the velocity.
    pub fn advance(&mut self, twist: &Twist, dt: f64) {
        self.pos += twist.linear * dt;
        let rotation = UnitQuaternion::from_scaled_axis(twist.angular * dt);
        self.q = UnitQuaternion::new_normalize((rotation * self.q).into_inner());
        self.update_state();
    }

    /// 3x3 operator mapping a unit impulse applied at offset `r` from the
    /// centre of mass to the velocity change of that point.
    ///
    /// `K = m⁻¹·I − [r]× · I⁻¹ · [r]×`. Zero for static bodies.
    #[must_use]
    pub fn contact_matrix(&self, r: &Vector3<f64>) -> Matrix3<f64> {
        let rx = skew(r);
        Matrix3::identity() * self.inv_mass - rx * self.iinv * rx
    }

    /// Apply a linear impulse at a world point.
    pub fn apply_impulse(&mut self, impulse: &Vector3<f64>, point: &Vector3<f64>) {
        if self.is_static() {
            return;
        }
        self.p += impulse;
        self.l += (point - self.pos).cross(impulse);
        self.update_state();
    }

    /// Apply a pure angular impulse.
    pub fn apply_angular_impulse(&mut self, impulse: &Vector3<f64>) {
        if self.is_static() {
            return;
        }
        self.l += impulse;
        self.update_state();
    }

    /// Kinetic energy `½(m v² + ω·L)`.
    #[must_use]
    pub fn kinetic_energy(&self) -> f64 {
        0.5 * (self.mass * self.v.norm_squared() + self.w.dot(&self.l))
    }

    /// Check pose and momentum for `NaN`/`Inf`.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.pos.iter().all(|x| x.is_finite())
            && self.q.coords.iter().all(|x| x.is_finite())
            && self.p.iter().all(|x| x.is_finite())
            && self.l.iter().all(|x| x.is_finite())
    }
}

/// Diagonalise a symmetric inertia tensor.
///
/// Returns principal moments and the rotation taking principal axes to the
/// tensor's frame. The eigenvector basis is flipped if needed so that it is
/// a proper rotation.
fn principal_axes(inertia: &Matrix3<f64>) -> (Vector3<f64>, UnitQuaternion<f64>) {
    let sym = (inertia + inertia.transpose()) * 0.5;
    if sym.iter().all(|x| x.abs() < MIN_PRINCIPAL_INERTIA) {
        return (Vector3::zeros(), UnitQuaternion::identity());
    }
    let eigen = SymmetricEigen::new(sym);
    let mut axes = eigen.eigenvectors;
    if axes.determinant() < 0.0 {
        let flipped = -axes.column(2);
        axes.set_column(2, &flipped);
    }
    let moments = eigen.eigenvalues.map(|m| m.max(0.0));
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(axes));
    (moments, rotation)
}
