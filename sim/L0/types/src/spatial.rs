//! Spatial algebra utilities for 6D motion and force vectors.
//!
//! Featherstone's spatial vector algebra, specialised to the layout the
//! articulated solver uses: every body's spatial quantities are expressed in
//! world axes and referenced at that body's centre of mass. Moving a
//! quantity between two bodies is therefore a pure translation of the
//! reference point, encoded by the lever arm `d` between them.
//!
//! Conventions:
//! - Motion vectors: `[ω, v]` (angular velocity, linear velocity)
//! - Force vectors: `[τ, f]` (torque, force)
//! - Lever arm `d` = old reference point − new reference point

use nalgebra::{Matrix3, Matrix6, Vector3, Vector6};

/// 6D spatial vector: [angular (3), linear (3)].
pub type SpatialVector = Vector6<f64>;

/// 6×6 spatial matrix (spatial inertia, articulated inertia, transforms).
pub type SpatialMatrix = Matrix6<f64>;

/// Skew-symmetric cross-product matrix: `skew(a) * b == a × b`.
#[must_use]
pub fn skew(a: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -a.z, a.y, a.z, 0.0, -a.x, -a.y, a.x, 0.0)
}

/// Assemble a spatial vector from its angular and linear halves.
#[must_use]
pub fn spatial(angular: &Vector3<f64>, linear: &Vector3<f64>) -> SpatialVector {
    SpatialVector::new(
        angular.x, angular.y, angular.z, linear.x, linear.y, linear.z,
    )
}

/// Angular half of a spatial vector.
#[must_use]
pub fn angular_part(v: &SpatialVector) -> Vector3<f64> {
    Vector3::new(v[0], v[1], v[2])
}

/// Linear half of a spatial vector.
#[must_use]
pub fn linear_part(v: &SpatialVector) -> Vector3<f64> {
    Vector3::new(v[3], v[4], v[5])
}

/// Spatial inertia of a rigid body about its own centre of mass.
///
/// ```text
/// I = [ I_world   0   ]
///     [   0     m*I_3 ]
/// ```
#[must_use]
pub fn rigid_spatial_inertia(mass: f64, inertia_world: &Matrix3<f64>) -> SpatialMatrix {
    let mut ia = SpatialMatrix::zeros();
    ia.fixed_view_mut::<3, 3>(0, 0).copy_from(inertia_world);
    ia[(3, 3)] = mass;
    ia[(4, 4)] = mass;
    ia[(5, 5)] = mass;
    ia
}

/// Motion transform moving the reference point by lever arm `d`.
///
/// ```text
/// X = [   I     0 ]
///     [ -[d]×   I ]
/// ```
#[must_use]
pub fn motion_transform(d: &Vector3<f64>) -> SpatialMatrix {
    let mut x = SpatialMatrix::identity();
    x.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-skew(d)));
    x
}

/// Re-reference a motion vector: `v` known at point B, returned at point A
/// where `d = A − B`.
///
/// Used top-down: a parent's velocity delta seen at a child's reference.
#[must_use]
pub fn shift_motion(v: &SpatialVector, d: &Vector3<f64>) -> SpatialVector {
    let w = angular_part(v);
    spatial(&w, &(linear_part(v) + w.cross(d)))
}

/// Re-reference a force vector: `f` known at point A, returned at point B
/// where `d = A − B`.
///
/// Used bottom-up: a child's reduced bias force moved to its parent.
#[must_use]
pub fn shift_force(f: &SpatialVector, d: &Vector3<f64>) -> SpatialVector {
    let force = linear_part(f);
    spatial(&(angular_part(f) + d.cross(&force)), &force)
}

/// Congruence transform of a (possibly articulated) spatial inertia known at
/// point A to point B, `d = A − B`: `Xᵀ · Ia · X`.
///
/// Unlike a rigid parallel-axis shift this does not assume the rigid-body
/// block structure, so it is valid for effective inertias that already had
/// joint motion factored out.
#[must_use]
pub fn shift_inertia(ia: &SpatialMatrix, d: &Vector3<f64>) -> SpatialMatrix {
    let x = motion_transform(d);
    x.transpose() * ia * x
}

/// Check a spatial vector for `NaN`/`Inf`.
#[must_use]
pub fn is_finite(v: &SpatialVector) -> bool {
    v.iter().all(|x| x.is_finite())
}
