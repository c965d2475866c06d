//! Featherstone articulated-body algorithm over an [`ArticulationTree`].
//!
//! Spatial quantities are `[angular; linear]`, expressed in world axes and
//! referenced at each body's own centre of mass. Moving a quantity between
//! a child and its parent therefore only needs the lever arm between the
//! two centres of mass (`FeatherstoneData::lever`).
//!
//! One step runs:
//!
//! 1. [`update_kinematics`] / [`update_velocities`]: forward kinematics of
//!    poses and body velocities from joint angles and rates.
//! 2. [`calc_body_ia`] (post-order): articulated inertias, with each joint's
//!    mobile axes factored out before the parent sees them.
//! 3. [`calc_body_za`] (post-order): bias forces (gravity, gyroscopic,
//!    drive torques) reduced the same way.
//! 4. [`solve_velocities`] (pre-order): joint accelerations, limit and
//!    velocity-request handling, then the velocity update.
//!
//! [`propagate_impulses`] reuses the factorisation of pass 2 to map any set
//! of body or joint impulses to the resulting velocity change in O(n); the
//! constraint resolver calls it once per row update.
//!
//! Reference: Featherstone, "Rigid Body Dynamics Algorithms", table 7.1

use nalgebra::{Matrix3, Matrix6x3, Point3, Vector3};

use sim_types::spatial::{
    angular_part, linear_part, rigid_spatial_inertia, shift_force, shift_inertia, shift_motion, spatial,
};
use sim_types::{SpatialMatrix, SpatialVector, Twist};

use crate::context::ImpulseScratch;
use crate::joint::{AxisState, FeatherstoneData, Joint};
use crate::tree::ArticulationTree;

/// Joint-space inertia below which an axis is treated as massless and
/// dropped from the solve.
pub const MIN_AXIS_INERTIA: f64 = 1e-10;

/// Singular values below this fraction of the largest entry are treated
/// as zero when inverting joint-space and root inertias.
const SINGULAR_RATIO: f64 = 1e-12;

/// Current body velocity `[ω; v]` at the centre of mass.
#[must_use]
pub fn body_velocity(joint: &Joint) -> SpatialVector {
    joint
        .scratch()
        .map_or_else(|| spatial(&joint.body.w, &joint.body.v), |fs| fs.velocity)
}

/// Velocity of a world point rigidly attached to the joint's body.
#[must_use]
pub fn point_velocity(joint: &Joint, point: &Vector3<f64>) -> Vector3<f64> {
    let v = body_velocity(joint);
    linear_part(&v) + angular_part(&v).cross(&(point - joint.body.pos))
}

/// Spatial impulse at the centre of mass for a linear impulse applied at a
/// world point.
#[must_use]
pub fn impulse_at_point(joint: &Joint, impulse: &Vector3<f64>, point: &Vector3<f64>) -> SpatialVector {
    spatial(&(point - joint.body.pos).cross(impulse), impulse)
}

fn twist_of(v: &SpatialVector) -> Twist {
    Twist::new(linear_part(v), angular_part(v))
}

/// Velocity of a floating root.
///
/// A massive root keeps it as momentum in its body. A root without mass of
/// its own cannot, and is carried by the solver scratch instead.
fn root_velocity(joint: &Joint) -> SpatialVector {
    if joint.body.is_static() {
        body_velocity(joint)
    } else {
        spatial(&joint.body.w, &joint.body.v)
    }
}

/// Set a floating root's velocity `[ω; v]` at its centre of mass.
pub fn set_root_velocity(joint: &mut Joint, velocity: &SpatialVector) {
    joint.scratch_mut().velocity = *velocity;
    joint.body.set_velocity(&twist_of(velocity));
}

/// Advance a floating root's pose by `dt`.
///
/// Massive roots integrate their momentum; massless ones move along the
/// velocity the solver gave them.
pub fn integrate_root(joint: &mut Joint, dt: f64) {
    if joint.body.is_static() {
        let velocity = body_velocity(joint);
        joint.body.advance(&twist_of(&velocity), dt);
    } else {
        joint.body.step(dt);
    }
}

/// Pseudo-inverse of a joint-space inertia.
///
/// Directions the subtree cannot resist, such as turning a massless body
/// about the single point its children hang from, get no response rather
/// than an arbitrarily large one.
fn joint_space_inverse(d: Matrix3<f64>) -> Option<Matrix3<f64>> {
    let eps = MIN_AXIS_INERTIA.max(d.amax() * SINGULAR_RATIO);
    d.pseudo_inverse(eps).ok()
}

/// Pseudo-inverse of the articulated inertia of a root without mass of its
/// own.
fn root_inertia_inverse(ia: SpatialMatrix) -> Option<SpatialMatrix> {
    let eps = MIN_AXIS_INERTIA.max(ia.amax() * SINGULAR_RATIO);
    ia.pseudo_inverse(eps).ok()
}

// ========== Kinematics ==========

/// Forward kinematics of poses, pre-order.
///
/// Places every non-root body from its parent's frame and the joint angles
/// and refreshes the world joint axes and pivots. A floating root keeps the
/// pose its body integrated to.
pub fn update_kinematics(tree: &mut ArticulationTree) {
    for pos in 0..tree.len() {
        let parent_frame = tree.parent_pos(pos).map(|p| tree.at(p).frame_pose());
        let joint = tree.at_mut(pos);
        if joint.link.is_floating_root() {
            let frame = joint.frame_pose();
            joint.axes_world = [
                frame.rotation * Vector3::x(),
                frame.rotation * Vector3::y(),
                frame.rotation * Vector3::z(),
            ];
            joint.pivot_world = frame
                .transform_point(&Point3::from(joint.link.pivot_child))
                .coords;
            continue;
        }
        let frame = joint.link.frame(&parent_frame.unwrap_or_default());
        joint.body.set_frame_pose(&frame.pose());
        joint.axes_world = frame.axes;
        joint.pivot_world = frame.pivot;
    }
}

/// Forward kinematics of velocities, pre-order.
///
/// ```text
/// ω_i = ω_p + Σ a_k dq_k
/// v_i = v_p + ω_p × (c_i − c_p) + ω_rel × (c_i − P)
/// ```
///
/// Grounded roots hang from a world at rest. Results go to the solver
/// scratch and to the bodies.
pub fn update_velocities(tree: &mut ArticulationTree) {
    for pos in 0..tree.len() {
        let parent = tree
            .parent_pos(pos)
            .map(|p| (body_velocity(tree.at(p)), tree.at(p).body.pos));
        let joint = tree.at_mut(pos);

        let velocity = if joint.link.is_floating_root() {
            root_velocity(joint)
        } else {
            let omega_rel = joint.relative_angular_velocity();
            let arm = joint.body.pos - joint.pivot_world;
            let (w_p, v_p, c_p) = match parent {
                Some((v, c)) => (angular_part(&v), linear_part(&v), c),
                None => (Vector3::zeros(), Vector3::zeros(), joint.body.pos),
            };
            let w = w_p + omega_rel;
            let v = v_p + w_p.cross(&(joint.body.pos - c_p)) + omega_rel.cross(&arm);
            spatial(&w, &v)
        };

        joint.scratch_mut().velocity = velocity;
        joint.body.set_velocity(&twist_of(&velocity));
    }
}

/// Motion subspace of a joint: column `k` is `[a_k; a_k × (c − P)]` for a
/// mobile axis, zero otherwise. Floating roots have none.
fn motion_subspace(joint: &Joint) -> (Matrix6x3<f64>, [bool; 3]) {
    let mut s = Matrix6x3::zeros();
    if joint.link.is_floating_root() {
        return (s, [false; 3]);
    }
    let mobile = joint.link.mobile_mask();
    let arm = joint.body.pos - joint.pivot_world;
    for k in 0..3 {
        if mobile[k] {
            let a = joint.axes_world[k];
            s.set_column(k, &spatial(&a, &a.cross(&arm)));
        }
    }
    (s, mobile)
}

/// Velocity-product acceleration `c` of a joint: the body acceleration
/// produced by the current velocities alone, with zero joint accelerations
/// and a parent at zero acceleration.
fn velocity_product(joint: &Joint, parent: Option<(SpatialVector, Vector3<f64>)>) -> SpatialVector {
    if joint.link.is_floating_root() {
        return SpatialVector::zeros();
    }
    let mobile = joint.link.mobile_mask();
    let dq = Vector3::from_fn(|k, _| if mobile[k] { joint.link.dq[k] } else { 0.0 });
    let a = &joint.axes_world;

    let (w_p, v_p) = match parent {
        Some((v, _)) => (angular_part(&v), linear_part(&v)),
        None => (Vector3::zeros(), Vector3::zeros()),
    };
    let v_i = body_velocity(joint);
    let (w_i, lin_i) = (angular_part(&v_i), linear_part(&v_i));

    // Each axis is carried by everything above it in the Euler chain.
    let w_x = w_p;
    let w_y = w_x + a[0] * dq.x;
    let w_z = w_y + a[1] * dq.y;
    let c_ang = w_x.cross(&a[0]) * dq.x + w_y.cross(&a[1]) * dq.y + w_z.cross(&a[2]) * dq.z;

    let omega_rel = a[0] * dq.x + a[1] * dq.y + a[2] * dq.z;
    let arm = joint.body.pos - joint.pivot_world;
    let c_lin = w_p.cross(&(lin_i - v_p)) + c_ang.cross(&arm) + omega_rel.cross(&w_i.cross(&arm));
    spatial(&c_ang, &c_lin)
}

// ========== Pass 1: articulated inertia ==========

/// Factor a joint's mobile axes out of its articulated inertia.
///
/// Axes whose joint-space inertia is below [`MIN_AXIS_INERTIA`] are
/// masked for this step. `d` keeps identity on masked axes so it stays
/// invertible; `qinv` is zero there.
fn factor_axes(fs: &mut FeatherstoneData) {
    fs.ia_s = fs.ia * fs.s;
    let diag = (fs.s.transpose() * fs.ia_s).diagonal();
    for k in 0..3 {
        if fs.mobile[k] && diag[k] < MIN_AXIS_INERTIA {
            fs.mobile[k] = false;
            fs.s.column_mut(k).fill(0.0);
            fs.ia_s.column_mut(k).fill(0.0);
        }
    }

    let mut d = fs.s.transpose() * fs.ia_s;
    for k in 0..3 {
        if !fs.mobile[k] {
            d.row_mut(k).fill(0.0);
            d.column_mut(k).fill(0.0);
            d[(k, k)] = 1.0;
        }
    }
    fs.d = d;

    fs.qinv = match joint_space_inverse(d) {
        Some(mut inv) => {
            for k in 0..3 {
                if !fs.mobile[k] {
                    inv.row_mut(k).fill(0.0);
                    inv.column_mut(k).fill(0.0);
                }
            }
            inv
        }
        None => {
            // SVD failed to converge: treat the joint as rigid.
            fs.mobile = [false; 3];
            fs.s.fill(0.0);
            fs.ia_s.fill(0.0);
            Matrix3::zeros()
        }
    };
    fs.ia_eff = fs.ia - fs.ia_s * fs.qinv * fs.ia_s.transpose();
}

/// Pass 1: articulated inertias, post-order.
///
/// Each body starts from its rigid spatial inertia; every child adds its
/// effective inertia shifted to the parent's centre of mass, and the
/// joint's own mobile axes are factored out through
/// `ia_eff = ia − U · D⁻¹ · Uᵀ` with `U = ia · s`, `D = sᵀ · U`.
/// Floating roots keep the full inertia and cache its inverse, a
/// pseudo-inverse when the root has no mass of its own.
pub fn calc_body_ia(tree: &mut ArticulationTree) {
    let n = tree.len();
    for pos in 0..n {
        let parent_com = tree.parent_pos(pos).map(|p| tree.at(p).body.pos);
        let joint = tree.at_mut(pos);
        let (s, mobile) = motion_subspace(joint);
        let ia = rigid_spatial_inertia(joint.body.mass, &joint.body.inertia_world());
        let lever = parent_com.map_or_else(Vector3::zeros, |c| joint.body.pos - c);

        let fs = joint.scratch_mut();
        fs.ia = ia;
        fs.s = s;
        fs.mobile = mobile;
        fs.lever = lever;
    }

    for pos in (0..n).rev() {
        let joint = tree.at_mut(pos);
        let floating = joint.link.is_floating_root();
        let massless = joint.body.is_static();
        let fs = joint.scratch_mut();
        if floating {
            let inverse = if massless { root_inertia_inverse(fs.ia) } else { fs.ia.try_inverse() };
            fs.ia_s.fill(0.0);
            fs.d = Matrix3::identity();
            fs.qinv = Matrix3::zeros();
            fs.ia_eff = fs.ia;
            fs.root_inv = inverse.unwrap_or_else(SpatialMatrix::zeros);
            continue;
        }
        factor_axes(fs);
        fs.root_inv = SpatialMatrix::zeros();
        let (ia_eff, lever) = (fs.ia_eff, fs.lever);

        if let Some(parent) = tree.parent_pos(pos) {
            tree.at_mut(parent).scratch_mut().ia += shift_inertia(&ia_eff, &lever);
        }
    }
}

// ========== Pass 2: bias forces ==========

/// Pass 2: bias forces, post-order.
///
/// Per body: gyroscopic torque `ω × Iω` and gravity `−m·g`, plus the
/// children's reduced bias `pa + ia_eff·c + U·D⁻¹·u` shifted up. The joint
/// force `u = τ − sᵀ·pa` uses the axis springs, dampers and dashpots as `τ`.
/// A grounded root hands its reduced bias to the world.
pub fn calc_body_za(tree: &mut ArticulationTree, gravity: &Vector3<f64>) {
    let n = tree.len();
    for pos in 0..n {
        let parent = tree
            .parent_pos(pos)
            .map(|p| (body_velocity(tree.at(p)), tree.at(p).body.pos));
        let joint = tree.at_mut(pos);
        let c = velocity_product(joint, parent);
        let w = angular_part(&body_velocity(joint));
        let gyro = w.cross(&(joint.body.inertia_world() * w));
        let weight = gravity * joint.body.mass;

        let fs = joint.scratch_mut();
        fs.c = c;
        fs.pa = spatial(&gyro, &(-weight));
    }

    for pos in (0..n).rev() {
        let joint = tree.at_mut(pos);
        if joint.link.is_floating_root() {
            joint.scratch_mut().u = Vector3::zeros();
            continue;
        }
        let angles = joint.link.angles;
        let dq = joint.link.dq;
        let tau = Vector3::from_fn(|k, _| joint.link.axes[k].drive_torque(angles[k], dq[k]));

        let fs = joint.scratch_mut();
        let mut u = tau - fs.s.transpose() * fs.pa;
        for k in 0..3 {
            if !fs.mobile[k] {
                u[k] = 0.0;
            }
        }
        fs.u = u;
        let pa_eff = fs.pa + fs.ia_eff * fs.c + fs.ia_s * (fs.qinv * u);
        let lever = fs.lever;

        if let Some(parent) = tree.parent_pos(pos) {
            tree.at_mut(parent).scratch_mut().pa += shift_force(&pa_eff, &lever);
        }
    }
}

// ========== Pass 3: accelerations and velocity update ==========

/// Joint accelerations for one joint given the parent's body acceleration
/// already shifted to this body (`a_in`, including `c`).
///
/// Requested velocities and limit-reached axes pushing outward are
/// prescribed: their rows of `D·ddq = u − Uᵀ·a_in` are replaced by the
/// target and the remaining axes re-solved. Requests are consumed.
fn solve_joint(joint: &mut Joint, a_in: &SpatialVector, dt: f64) -> Vector3<f64> {
    let Joint { link, fs, .. } = joint;
    let fs = fs.get_or_insert_with(Box::default);

    let rhs = fs.u - fs.ia_s.transpose() * a_in;
    let mut ddq = fs.qinv * rhs;

    let mut system = fs.d;
    let mut target = rhs;
    let mut prescribed = false;
    for k in 0..3 {
        let request = link.axes[k].requested_velocity.take();
        if !fs.mobile[k] {
            continue;
        }
        let fixed = match (request, link.axes[k].state) {
            (Some(velocity), _) if dt > 0.0 => Some((velocity - link.dq[k]) / dt),
            (_, AxisState::LimitReached(side)) if ddq[k] * side.outward_sign() > 0.0 => Some(0.0),
            _ => None,
        };
        if let Some(value) = fixed {
            system.row_mut(k).fill(0.0);
            system[(k, k)] = 1.0;
            target[k] = value;
            prescribed = true;
        }
    }
    if prescribed {
        if let Some(inv) = system.try_inverse().or_else(|| system.pseudo_inverse(MIN_AXIS_INERTIA).ok()) {
            ddq = inv * target;
        }
    }
    for k in 0..3 {
        if !fs.mobile[k] {
            ddq[k] = 0.0;
        }
    }
    fs.ddq = ddq;
    ddq
}

/// Pass 3: accelerations pre-order, then the velocity update.
///
/// A floating root accelerates as `−ia⁻¹·pa`; every other joint takes the
/// parent's acceleration shifted by the lever arm plus `c`, and adds its
/// own `s·ddq`. Joint rates and the root twist advance by `dt`, are scaled
/// by `1 − damping·dt`, and the body velocities are refreshed.
#[allow(clippy::needless_range_loop)]
pub fn solve_velocities(tree: &mut ArticulationTree, dt: f64, damping: f64) {
    let n = tree.len();
    for pos in 0..n {
        let parent_accel = tree
            .parent_pos(pos)
            .and_then(|p| tree.at(p).scratch().map(|fs| fs.accel));
        let joint = tree.at_mut(pos);

        if joint.link.is_floating_root() {
            for axis in &mut joint.link.axes {
                axis.requested_velocity = None;
            }
            let fs = joint.scratch_mut();
            fs.accel = -(fs.root_inv * fs.pa);
            fs.ddq = Vector3::zeros();
            continue;
        }

        let (lever, c) = {
            let fs = joint.scratch_mut();
            (fs.lever, fs.c)
        };
        let a_in = parent_accel.map_or_else(SpatialVector::zeros, |a| shift_motion(&a, &lever)) + c;
        let ddq = solve_joint(joint, &a_in, dt);
        let fs = joint.scratch_mut();
        fs.accel = a_in + fs.s * ddq;
    }

    let keep = (1.0 - damping * dt).max(0.0);
    for pos in 0..n {
        let joint = tree.at_mut(pos);
        let floating = joint.link.is_floating_root();
        let Joint { link, body, fs, .. } = joint;
        let Some(fs) = fs.as_deref_mut() else {
            continue;
        };
        if floating {
            let v = (fs.velocity + fs.accel * dt) * keep;
            fs.velocity = v;
            body.set_velocity(&twist_of(&v));
        } else {
            for k in 0..3 {
                if fs.mobile[k] {
                    link.dq[k] = (link.dq[k] + fs.ddq[k] * dt) * keep;
                }
            }
        }
    }
    update_velocities(tree);
}

// ========== Impulses ==========

/// Velocity response of the whole tree to the impulses queued in `scratch`.
///
/// Body impulses enter as bias `p = −J`, joint impulses as `τ`. Bottom-up,
/// `u = τ − sᵀ·p` and `p + U·D⁻¹·u` is shifted to the parent; top-down, the
/// root takes `−ia⁻¹·p` (a grounded root stays still) and each joint adds
/// `Δdq = D⁻¹·(u − Uᵀ·Δv')`. Results land in `scratch.dv`/`scratch.ddq`;
/// nothing in the tree changes. Requires [`calc_body_ia`] for the current
/// configuration.
pub fn propagate_impulses(tree: &ArticulationTree, scratch: &mut ImpulseScratch) {
    let n = tree.len();
    for pos in (0..n).rev() {
        let joint = tree.at(pos);
        let Some(fs) = joint.scratch() else {
            continue;
        };
        if joint.link.is_floating_root() {
            continue;
        }
        let u = scratch.tau[pos] - fs.s.transpose() * scratch.p[pos];
        scratch.u[pos] = u;
        if let Some(parent) = tree.parent_pos(pos) {
            let p_eff = scratch.p[pos] + fs.ia_s * (fs.qinv * u);
            scratch.p[parent] += shift_force(&p_eff, &fs.lever);
        }
    }

    for pos in 0..n {
        let joint = tree.at(pos);
        let Some(fs) = joint.scratch() else {
            scratch.dv[pos] = SpatialVector::zeros();
            scratch.ddq[pos] = Vector3::zeros();
            continue;
        };
        if joint.link.is_floating_root() {
            scratch.dv[pos] = -(fs.root_inv * scratch.p[pos]);
            scratch.ddq[pos] = Vector3::zeros();
            continue;
        }
        let dv_in = tree
            .parent_pos(pos)
            .map_or_else(SpatialVector::zeros, |p| shift_motion(&scratch.dv[p], &fs.lever));
        let ddq = fs.qinv * (scratch.u[pos] - fs.ia_s.transpose() * dv_in);
        scratch.ddq[pos] = ddq;
        scratch.dv[pos] = dv_in + fs.s * ddq;
    }
}

/// Add `scale` times the response in `scratch` to the tree's velocities.
pub fn apply_velocity_change(tree: &mut ArticulationTree, scratch: &ImpulseScratch, scale: f64) {
    for pos in 0..tree.len() {
        let joint = tree.at_mut(pos);
        let floating = joint.link.is_floating_root();
        let Joint { link, body, fs, .. } = joint;
        let Some(fs) = fs.as_deref_mut() else {
            continue;
        };
        fs.velocity += scratch.dv[pos] * scale;
        if !floating {
            link.dq += scratch.ddq[pos] * scale;
        }
        body.set_velocity(&twist_of(&fs.velocity));
    }
}

/// Total kinetic energy of the tree.
#[must_use]
pub fn kinetic_energy(tree: &ArticulationTree) -> f64 {
    tree.iter().map(|j| j.body.kinetic_energy()).sum()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::joint::JointLink;
    use approx::assert_relative_eq;
    use sim_types::{JointId, MassProperties, Pose, RigidBody};

    const G: f64 = 9.81;

    fn gravity() -> Vector3<f64> {
        Vector3::new(0.0, -G, 0.0)
    }

    /// Grounded, fully locked anchor at the origin with a ball hanging off
    /// it at +x, free to swing about z only.
    fn pendulum() -> ArticulationTree {
        let mut tree = ArticulationTree::new();
        let ball = MassProperties::sphere(1.0, 0.1);
        let mut anchor_link = JointLink::grounded_root(&Pose::identity(), &Point3::origin());
        for axis in &mut anchor_link.axes {
            axis.state = AxisState::Locked;
        }
        let anchor = tree
            .insert(Joint::new(JointId(0), RigidBody::create(&Pose::identity(), &ball), anchor_link))
            .unwrap();

        let frame = Pose::from_position(Point3::new(1.0, 0.0, 0.0));
        let mut link = JointLink::child_of(Some(anchor), &Pose::identity(), &frame, &Point3::origin());
        link.axes[0].state = AxisState::Locked;
        link.axes[1].state = AxisState::Locked;
        tree.insert(Joint::new(JointId(1), RigidBody::create(&frame, &ball), link))
            .unwrap();
        tree
    }

    fn prepare(tree: &mut ArticulationTree, g: &Vector3<f64>) {
        update_kinematics(tree);
        update_velocities(tree);
        calc_body_ia(tree);
        calc_body_za(tree, g);
    }

    #[test]
    fn test_floating_body_falls() {
        let mut tree = ArticulationTree::new();
        let body = RigidBody::create(&Pose::identity(), &MassProperties::sphere(2.0, 0.5));
        tree.insert(Joint::new(JointId(0), body, JointLink::floating_root()))
            .unwrap();
        prepare(&mut tree, &gravity());
        solve_velocities(&mut tree, 0.01, 0.0);

        assert_relative_eq!(tree.at(0).body.v, gravity() * 0.01, epsilon = 1e-12);
        assert_relative_eq!(tree.at(0).body.w, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_pendulum_angular_acceleration() {
        let mut tree = pendulum();
        prepare(&mut tree, &gravity());
        solve_velocities(&mut tree, 0.01, 0.0);

        // Gravity torque about the pivot over inertia about the pivot.
        let i_pivot = tree.at(1).body.inertia_world()[(2, 2)] + 1.0;
        let ddq = tree.at(1).scratch().unwrap().ddq;
        assert_relative_eq!(ddq.z, -G / i_pivot, epsilon = 1e-9);
        assert_relative_eq!(ddq.x, 0.0);
        assert_relative_eq!(tree.at(1).link.dq.z, -G / i_pivot * 0.01, epsilon = 1e-9);
        // Anchor does not move.
        assert_relative_eq!(tree.at(0).body.v, Vector3::zeros(), epsilon = 1e-12);
        // Ball moves down at the tip speed.
        assert_relative_eq!(tree.at(1).body.v.y, -G / i_pivot * 0.01, epsilon = 1e-9);
    }

    #[test]
    fn test_free_fall_chain_keeps_shape() {
        let mut tree = ArticulationTree::new();
        let props = MassProperties::cuboid(1.5, Vector3::new(0.2, 0.1, 0.1));
        let root = tree
            .insert(Joint::new(
                JointId(0),
                RigidBody::create(&Pose::identity(), &props),
                JointLink::floating_root(),
            ))
            .unwrap();
        let frame = Pose::from_position(Point3::new(1.0, 0.0, 0.0));
        let link = JointLink::child_of(Some(root), &Pose::identity(), &frame, &Point3::new(0.5, 0.0, 0.0));
        tree.insert(Joint::new(JointId(1), RigidBody::create(&frame, &props), link))
            .unwrap();

        prepare(&mut tree, &gravity());
        solve_velocities(&mut tree, 0.01, 0.0);

        for joint in tree.iter() {
            assert_relative_eq!(joint.body.v, gravity() * 0.01, epsilon = 1e-9);
        }
        assert_relative_eq!(tree.at(1).link.dq, Vector3::zeros(), epsilon = 1e-9);
    }

    #[test]
    fn test_impulse_response_matches_inverse_inertia() {
        let mut tree = pendulum();
        prepare(&mut tree, &Vector3::zeros());
        let i_pivot = tree.at(1).body.inertia_world()[(2, 2)] + 1.0;

        let mut scratch = ImpulseScratch::default();
        scratch.reset(tree.len());
        let point = tree.at(1).body.pos;
        let j = impulse_at_point(tree.at(1), &Vector3::y(), &point);
        scratch.add_body_impulse(1, &j);
        propagate_impulses(&tree, &mut scratch);

        assert_relative_eq!(scratch.ddq[1].z, 1.0 / i_pivot, epsilon = 1e-12);
        assert_relative_eq!(linear_part(&scratch.dv[1]).y, 1.0 / i_pivot, epsilon = 1e-12);
        assert_relative_eq!(scratch.dv[0], SpatialVector::zeros(), epsilon = 1e-12);

        apply_velocity_change(&mut tree, &scratch, 2.0);
        assert_relative_eq!(tree.at(1).link.dq.z, 2.0 / i_pivot, epsilon = 1e-12);
        assert_relative_eq!(point_velocity(tree.at(1), &point).y, 2.0 / i_pivot, epsilon = 1e-12);
    }

    #[test]
    fn test_joint_impulse_on_floating_pair_conserves_momentum() {
        let mut tree = ArticulationTree::new();
        let props = MassProperties::sphere(1.0, 0.2);
        let root = tree
            .insert(Joint::new(
                JointId(0),
                RigidBody::create(&Pose::identity(), &props),
                JointLink::floating_root(),
            ))
            .unwrap();
        let frame = Pose::from_position(Point3::new(1.0, 0.0, 0.0));
        let link = JointLink::child_of(Some(root), &Pose::identity(), &frame, &Point3::new(0.5, 0.0, 0.0));
        tree.insert(Joint::new(JointId(1), RigidBody::create(&frame, &props), link))
            .unwrap();
        prepare(&mut tree, &Vector3::zeros());

        let mut scratch = ImpulseScratch::default();
        scratch.reset(tree.len());
        scratch.add_joint_impulse(1, &Vector3::new(0.0, 0.0, 1.0));
        propagate_impulses(&tree, &mut scratch);
        apply_velocity_change(&mut tree, &scratch, 1.0);

        // Internal impulse: total linear momentum stays zero.
        let p: Vector3<f64> = tree.iter().map(|j| j.body.v * j.body.mass).sum();
        assert_relative_eq!(p, Vector3::zeros(), epsilon = 1e-12);
        assert!(tree.at(1).link.dq.z > 0.0);
    }

    #[test]
    fn test_requested_velocity_is_reached_and_consumed() {
        let mut tree = pendulum();
        tree.at_mut(1).link.axes[2].requested_velocity = Some(1.5);
        prepare(&mut tree, &gravity());
        solve_velocities(&mut tree, 0.01, 0.0);

        assert_relative_eq!(tree.at(1).link.dq.z, 1.5, epsilon = 1e-12);
        assert!(tree.at(1).link.axes[2].requested_velocity.is_none());
    }

    #[test]
    fn test_limit_blocks_outward_acceleration() {
        let mut tree = pendulum();
        // Hanging at the lower bound: gravity pulls further down.
        tree.at_mut(1).link.axes[2].state = AxisState::LimitReached(crate::joint::LimitSide::Lower);
        prepare(&mut tree, &gravity());
        solve_velocities(&mut tree, 0.01, 0.0);
        assert_relative_eq!(tree.at(1).link.dq.z, 0.0, epsilon = 1e-12);
    }
}
