//! Pose, velocity and mass property types.
//!
//! Mass properties here describe one geometry part (or an accumulation of
//! parts) in the frame of the body that owns it. Articulated and rigid
//! entities build their [`RigidBody`](crate::RigidBody) from these.

use nalgebra::{Matrix3, Point3, UnitQuaternion, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Position and orientation of a frame in world space.
///
/// # Example
///
/// ```
/// use sim_types::Pose;
/// use nalgebra::Point3;
///
/// let pose = Pose::from_position(Point3::new(1.0, 2.0, 3.0));
/// let world = pose.transform_point(&Point3::new(1.0, 0.0, 0.0));
/// assert_eq!(world, Point3::new(2.0, 2.0, 3.0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Pose {
    /// Position in world coordinates.
    pub position: Point3<f64>,
    /// Orientation as a unit quaternion.
    pub rotation: UnitQuaternion<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    /// Origin, no rotation.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            position: Point3::origin(),
            rotation: UnitQuaternion::identity(),
        }
    }

    /// Pose at a position with identity rotation.
    #[must_use]
    pub fn from_position(position: Point3<f64>) -> Self {
        Self {
            position,
            rotation: UnitQuaternion::identity(),
        }
    }

    /// Pose from position and rotation.
    #[must_use]
    pub const fn new(position: Point3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self { position, rotation }
    }

    /// Local point to world.
    #[must_use]
    pub fn transform_point(&self, local: &Point3<f64>) -> Point3<f64> {
        self.position + self.rotation * local.coords
    }

    /// Local direction to world (rotation only).
    #[must_use]
    pub fn transform_vector(&self, local: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * local
    }

    /// World point to local.
    #[must_use]
    pub fn inverse_transform_point(&self, world: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation.inverse() * (world - self.position))
    }

    /// Compose two poses: `self * other`.
    #[must_use]
    pub fn compose(&self, other: &Self) -> Self {
        Self {
            position: self.transform_point(&other.position),
            rotation: self.rotation * other.rotation,
        }
    }

    /// Inverse pose.
    #[must_use]
    pub fn inverse(&self) -> Self {
        let inv = self.rotation.inverse();
        Self {
            position: Point3::from(-(inv * self.position.coords)),
            rotation: inv,
        }
    }

    /// Interpolate towards `other`, slerping the rotation.
    #[must_use]
    pub fn lerp(&self, other: &Self, t: f64) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self {
            position: Point3::from(self.position.coords.lerp(&other.position.coords, t)),
            rotation: self.rotation.slerp(&other.rotation, t),
        }
    }

    /// Check for `NaN`/`Inf`.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.position.coords.iter().all(|x| x.is_finite())
            && self.rotation.coords.iter().all(|x| x.is_finite())
    }
}

/// Linear and angular velocity of a body, both in world axes.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Twist {
    /// Linear velocity of the centre of mass (m/s).
    pub linear: Vector3<f64>,
    /// Angular velocity (rad/s).
    pub angular: Vector3<f64>,
}

impl Default for Twist {
    fn default() -> Self {
        Self::zero()
    }
}

impl Twist {
    /// Twist from linear and angular parts.
    #[must_use]
    pub const fn new(linear: Vector3<f64>, angular: Vector3<f64>) -> Self {
        Self { linear, angular }
    }

    /// At rest.
    #[must_use]
    pub fn zero() -> Self {
        Self {
            linear: Vector3::zeros(),
            angular: Vector3::zeros(),
        }
    }

    /// Velocity of a point at `offset` from the centre of mass.
    #[must_use]
    pub fn velocity_at_point(&self, offset: &Vector3<f64>) -> Vector3<f64> {
        self.linear + self.angular.cross(offset)
    }

    /// Check for `NaN`/`Inf`.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.linear.iter().all(|x| x.is_finite()) && self.angular.iter().all(|x| x.is_finite())
    }
}

/// Mass properties of a geometry part, or of several parts accumulated into
/// one body.
///
/// The centre of mass and inertia are expressed in the owning body's frame;
/// the inertia is taken about the centre of mass.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MassProperties {
    /// Total mass in kg. Zero means static.
    pub mass: f64,
    /// Enclosed volume (m³).
    pub volume: f64,
    /// Centre of mass in the body frame.
    pub center_of_mass: Vector3<f64>,
    /// Inertia tensor about the centre of mass, body-frame axes (kg·m²).
    pub inertia: Matrix3<f64>,
}

impl Default for MassProperties {
    fn default() -> Self {
        Self::empty()
    }
}

impl MassProperties {
    /// Mass properties with explicit values.
    #[must_use]
    pub const fn new(
        mass: f64,
        volume: f64,
        center_of_mass: Vector3<f64>,
        inertia: Matrix3<f64>,
    ) -> Self {
        Self {
            mass,
            volume,
            center_of_mass,
            inertia,
        }
    }

    /// No mass, no volume.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            mass: 0.0,
            volume: 0.0,
            center_of_mass: Vector3::zeros(),
            inertia: Matrix3::zeros(),
        }
    }

    /// Solid sphere: I = (2/5) m r².
    #[must_use]
    pub fn sphere(mass: f64, radius: f64) -> Self {
        let i = 0.4 * mass * radius * radius;
        Self {
            mass,
            volume: 4.0 / 3.0 * std::f64::consts::PI * radius.powi(3),
            center_of_mass: Vector3::zeros(),
            inertia: Matrix3::from_diagonal_element(i),
        }
    }

    /// Solid box with the given half extents.
    #[must_use]
    pub fn cuboid(mass: f64, half_extents: Vector3<f64>) -> Self {
        let size = half_extents * 2.0;
        let (x2, y2, z2) = (size.x * size.x, size.y * size.y, size.z * size.z);
        Self {
            mass,
            volume: size.x * size.y * size.z,
            center_of_mass: Vector3::zeros(),
            inertia: Matrix3::from_diagonal(&Vector3::new(
                mass * (y2 + z2) / 12.0,
                mass * (x2 + z2) / 12.0,
                mass * (x2 + y2) / 12.0,
            )),
        }
    }

    /// Move the centre of mass by `offset` in the body frame.
    #[must_use]
    pub fn translated(mut self, offset: Vector3<f64>) -> Self {
        self.center_of_mass += offset;
        self
    }

    /// Inverse mass, 0 for static.
    #[must_use]
    pub fn inverse_mass(&self) -> f64 {
        if self.mass <= 0.0 || !self.mass.is_finite() {
            0.0
        } else {
            1.0 / self.mass
        }
    }

    /// Whether this is immovable.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.mass <= 0.0 || !self.mass.is_finite()
    }

    /// Accumulate another set of properties into this one.
    ///
    /// Both inertias are moved to the combined centre of mass with the
    /// parallel axis theorem before summation.
    #[must_use]
    pub fn combine(&self, other: &Self) -> Self {
        let mass = self.mass + other.mass;
        let volume = self.volume + other.volume;
        if mass <= 0.0 {
            return Self {
                volume,
                ..Self::empty()
            };
        }
        let com = (self.center_of_mass * self.mass + other.center_of_mass * other.mass) / mass;
        let inertia = self.inertia
            + parallel_axis(self.mass, &(self.center_of_mass - com))
            + other.inertia
            + parallel_axis(other.mass, &(other.center_of_mass - com));
        Self {
            mass,
            volume,
            center_of_mass: com,
            inertia,
        }
    }

    /// Remove a previously combined set of properties.
    ///
    /// Inverse of [`combine`](Self::combine) up to rounding; a result with
    /// no mass left collapses to [`empty`](Self::empty) plus remaining volume.
    #[must_use]
    pub fn subtract(&self, other: &Self) -> Self {
        let mass = self.mass - other.mass;
        let volume = (self.volume - other.volume).max(0.0);
        if mass <= 1e-12 {
            return Self {
                volume,
                ..Self::empty()
            };
        }
        let com = (self.center_of_mass * self.mass - other.center_of_mass * other.mass) / mass;
        let inertia = self.inertia + parallel_axis(self.mass, &(self.center_of_mass - com))
            - other.inertia
            - parallel_axis(other.mass, &(other.center_of_mass - com));
        Self {
            mass,
            volume,
            center_of_mass: com,
            inertia,
        }
    }

    /// General validation: finite, non-negative mass, PSD inertia.
    pub fn validate(&self) -> crate::Result<()> {
        if self.mass < 0.0 || !self.mass.is_finite() {
            return Err(crate::SimError::invalid_mass(
                "mass must be finite and non-negative",
            ));
        }
        if !self.center_of_mass.iter().all(|x| x.is_finite()) {
            return Err(crate::SimError::invalid_mass(
                "center of mass must be finite",
            ));
        }
        let eigenvalues = self.inertia.symmetric_eigenvalues();
        if eigenvalues.iter().any(|&e| e < -1e-10) {
            return Err(crate::SimError::invalid_mass(
                "inertia tensor must be positive semi-definite",
            ));
        }
        Ok(())
    }

    /// Validation applied when a geometry part is attached to an entity.
    ///
    /// On top of [`validate`](Self::validate): a part carrying mass must
    /// enclose a positive volume and have a strictly positive inertia.
    pub fn validate_part(&self, part: i32) -> crate::Result<()> {
        self.validate()
            .map_err(|e| crate::SimError::invalid_geometry(part, e.to_string()))?;
        if self.mass > 0.0 {
            if self.volume <= 0.0 {
                return Err(crate::SimError::invalid_geometry(
                    part,
                    format!("non-positive volume {} with mass {}", self.volume, self.mass),
                ));
            }
            if self.inertia.symmetric_eigenvalues().iter().any(|&e| e <= 0.0) {
                return Err(crate::SimError::invalid_geometry(
                    part,
                    "inertia must be positive definite",
                ));
            }
        }
        Ok(())
    }
}

/// Inertia of a point mass `m` at offset `d`: `m (|d|² I − d dᵀ)`.
pub(crate) fn parallel_axis(m: f64, d: &Vector3<f64>) -> Matrix3<f64> {
    (Matrix3::identity() * d.norm_squared() - d * d.transpose()) * m
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pose_compose_inverse() {
        let pose = Pose::new(
            Point3::new(1.0, 2.0, 3.0),
            UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
        );
        let composed = pose.compose(&pose.inverse());
        assert_relative_eq!(composed.position.coords, Vector3::zeros(), epsilon = 1e-10);
        assert_relative_eq!(composed.rotation.angle(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_pose_rotation() {
        let pose = Pose::new(
            Point3::origin(),
            UnitQuaternion::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_2),
        );
        let world = pose.transform_vector(&Vector3::x());
        assert_relative_eq!(world, Vector3::y(), epsilon = 1e-10);

        let back = pose.inverse_transform_point(&Point3::new(0.0, 1.0, 0.0));
        assert_relative_eq!(back.coords, Vector3::x(), epsilon = 1e-10);
    }

    #[test]
    fn test_twist_velocity_at_point() {
        let twist = Twist::new(Vector3::zeros(), Vector3::z());
        let v = twist.velocity_at_point(&Vector3::x());
        assert_relative_eq!(v, Vector3::y(), epsilon = 1e-10);
    }

    #[test]
    fn test_cuboid_inertia() {
        let props = MassProperties::cuboid(12.0, Vector3::new(0.5, 0.5, 0.5));
        assert_relative_eq!(props.inertia[(0, 0)], 2.0, epsilon = 1e-10);
        assert_relative_eq!(props.volume, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_combine_two_spheres() {
        let a = MassProperties::sphere(1.0, 0.1).translated(Vector3::new(-1.0, 0.0, 0.0));
        let b = MassProperties::sphere(1.0, 0.1).translated(Vector3::new(1.0, 0.0, 0.0));
        let c = a.combine(&b);

        assert_relative_eq!(c.mass, 2.0);
        assert_relative_eq!(c.center_of_mass, Vector3::zeros(), epsilon = 1e-12);
        // Each point contributes m*d² = 1 about the y and z axes.
        assert_relative_eq!(c.inertia[(1, 1)], 2.0 + 2.0 * 0.004, epsilon = 1e-12);
        assert_relative_eq!(c.inertia[(0, 0)], 2.0 * 0.004, epsilon = 1e-12);
    }

    #[test]
    fn test_subtract_undoes_combine() {
        let a = MassProperties::cuboid(3.0, Vector3::new(0.2, 0.3, 0.4))
            .translated(Vector3::new(0.5, 0.0, 0.1));
        let b = MassProperties::sphere(2.0, 0.25).translated(Vector3::new(-0.3, 0.2, 0.0));
        let back = a.combine(&b).subtract(&b);

        assert_relative_eq!(back.mass, a.mass, epsilon = 1e-10);
        assert_relative_eq!(back.center_of_mass, a.center_of_mass, epsilon = 1e-10);
        assert_relative_eq!(back.inertia, a.inertia, epsilon = 1e-10);
    }

    #[test]
    fn test_validate_part_rejects_massive_empty_volume() {
        let mut props = MassProperties::sphere(1.0, 0.5);
        props.volume = 0.0;
        let err = props.validate_part(4).unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("volume"));

        // Massless parts may be flat (trigger volumes, decals).
        let massless = MassProperties::empty();
        assert!(massless.validate_part(5).is_ok());
    }
}
