//! Micro-contact solver: projected Gauss-Seidel over scalar rows.
//!
//! The solver only knows rows and an [`ImpulseTarget`] that can measure a
//! row's velocity and apply an impulse along it. Articulated entities
//! answer through the Featherstone impulse propagation, single bodies
//! through their contact matrix.
//!
//! When the sweep budget runs out the tolerance is doubled and the solve
//! continues, up to `widen_steps` times. Failing that, the caller gets a
//! [`ResolveError`] and is expected to revert the velocities.

use nalgebra::Vector3;

use sim_types::spatial::{angular_part, linear_part, spatial};
use sim_types::{RigidBody, SolverConfig, SpatialVector};

use crate::context::ImpulseScratch;
use crate::error::ResolveError;
use crate::featherstone::{apply_velocity_change, body_velocity, propagate_impulses};
use crate::registrar::{Constraint, ConstraintKind};
use crate::tree::ArticulationTree;

/// Something constraint impulses can be applied to.
pub trait ImpulseTarget {
    /// Current velocity of the row.
    fn row_velocity(&self, row: &Constraint) -> f64;

    /// Row velocity change caused by a unit impulse on the same row.
    fn response(&mut self, row: &Constraint) -> f64;

    /// Apply `impulse` along the row.
    fn apply(&mut self, row: &Constraint, impulse: f64);

    /// Inverse mass of the body the row acts on.
    fn inv_mass(&self, row: &Constraint) -> f64;
}

/// Evaluate a row from per-position body velocities and joint rates.
fn measure(
    row: &Constraint,
    velocity: impl Fn(usize) -> SpatialVector,
    rate: impl Fn(usize) -> Vector3<f64>,
) -> f64 {
    if let Some((axis, sign)) = row.joint_axis() {
        return sign * rate(row.pos)[axis];
    }
    let point_velocity = |pos: usize, arm: &Vector3<f64>| {
        let v = velocity(pos);
        linear_part(&v) + angular_part(&v).cross(arm)
    };
    let mut value = row.direction.dot(&point_velocity(row.pos, &row.arm));
    if let (ConstraintKind::Pivot, Some(parent)) = (row.kind, row.parent) {
        value -= row.direction.dot(&point_velocity(parent, &row.parent_arm));
    }
    value
}

/// Tree of an articulated entity plus the worker's propagation buffers.
#[derive(Debug)]
pub struct ArticulatedTarget<'a> {
    tree: &'a mut ArticulationTree,
    scratch: &'a mut ImpulseScratch,
}

impl<'a> ArticulatedTarget<'a> {
    /// Target over `tree`; `scratch` is resized to fit.
    pub fn new(tree: &'a mut ArticulationTree, scratch: &'a mut ImpulseScratch) -> Self {
        scratch.reset(tree.len());
        Self { tree, scratch }
    }

    /// The tree being solved.
    #[must_use]
    pub fn tree(&self) -> &ArticulationTree {
        self.tree
    }

    fn propagate(&mut self, row: &Constraint, impulse: f64) {
        self.scratch.clear();
        if let Some((axis, sign)) = row.joint_axis() {
            let mut torque = Vector3::zeros();
            torque[axis] = sign * impulse;
            self.scratch.add_joint_impulse(row.pos, &torque);
        } else {
            let j = spatial(&row.arm.cross(&row.direction), &row.direction) * impulse;
            self.scratch.add_body_impulse(row.pos, &j);
            if let (ConstraintKind::Pivot, Some(parent)) = (row.kind, row.parent) {
                let reaction = spatial(&row.parent_arm.cross(&row.direction), &row.direction) * -impulse;
                self.scratch.add_body_impulse(parent, &reaction);
            }
        }
        propagate_impulses(self.tree, self.scratch);
    }
}

impl ImpulseTarget for ArticulatedTarget<'_> {
    fn row_velocity(&self, row: &Constraint) -> f64 {
        measure(row, |p| body_velocity(self.tree.at(p)), |p| self.tree.at(p).link.dq)
    }

    fn response(&mut self, row: &Constraint) -> f64 {
        self.propagate(row, 1.0);
        let scratch = &*self.scratch;
        measure(row, |p| scratch.dv[p], |p| scratch.ddq[p])
    }

    fn apply(&mut self, row: &Constraint, impulse: f64) {
        self.propagate(row, impulse);
        apply_velocity_change(self.tree, self.scratch, 1.0);
    }

    fn inv_mass(&self, row: &Constraint) -> f64 {
        self.tree.at(row.pos).body.inv_mass
    }
}

/// A single rigid body. Joint-space rows have no effect on it.
#[derive(Debug)]
pub struct RigidTarget<'a> {
    body: &'a mut RigidBody,
}

impl<'a> RigidTarget<'a> {
    /// Target over `body`.
    pub fn new(body: &'a mut RigidBody) -> Self {
        Self { body }
    }
}

impl ImpulseTarget for RigidTarget<'_> {
    fn row_velocity(&self, row: &Constraint) -> f64 {
        if row.joint_axis().is_some() {
            return 0.0;
        }
        row.direction
            .dot(&self.body.twist().velocity_at_point(&row.arm))
    }

    fn response(&mut self, row: &Constraint) -> f64 {
        if row.joint_axis().is_some() {
            return 0.0;
        }
        row.direction
            .dot(&(self.body.contact_matrix(&row.arm) * row.direction))
    }

    fn apply(&mut self, row: &Constraint, impulse: f64) {
        if row.joint_axis().is_some() {
            return;
        }
        let point = self.body.pos + row.arm;
        self.body.apply_impulse(&(row.direction * impulse), &point);
    }

    fn inv_mass(&self, _row: &Constraint) -> f64 {
        self.body.inv_mass
    }
}

/// Outcome of a successful resolve.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResolveStats {
    /// Rows solved.
    pub rows: usize,
    /// Sweeps performed.
    pub iterations: usize,
    /// Worst row error in the final sweep.
    pub residual: f64,
    /// Times the tolerance was doubled.
    pub widened: usize,
}

/// Solve `rows` with projected Gauss-Seidel.
///
/// Each sweep visits every row once, computes the impulse that would bring
/// its velocity to `vreq`, clamps the accumulated impulse of unilateral
/// rows at zero and applies the difference. A sweep in which no row is off
/// by more than the tolerance ends the solve. Rows must have a positive
/// measured `response`.
///
/// # Errors
///
/// [`ResolveError::NotConverged`] when the widened tolerance is still not
/// met, [`ResolveError::NonFinite`] when a row produces a non-finite
/// impulse. Impulses already applied are left in place; reverting is up to
/// the caller.
pub fn resolve<T: ImpulseTarget>(
    target: &mut T,
    rows: &mut [Constraint],
    cfg: &SolverConfig,
) -> Result<ResolveStats, ResolveError> {
    let mut stats = ResolveStats {
        rows: rows.len(),
        ..Default::default()
    };
    if rows.is_empty() {
        return Ok(stats);
    }

    let mut tolerance = cfg.tolerance;
    for widen in 0..=cfg.widen_steps {
        stats.widened = widen;
        for _ in 0..cfg.iterations {
            stats.iterations += 1;
            let mut residual: f64 = 0.0;
            for (index, row) in rows.iter_mut().enumerate() {
                let error = row.vreq - target.row_velocity(row);
                let mut delta = error / row.response;
                if row.is_unilateral() {
                    let accumulated = (row.impulse + delta).max(0.0);
                    delta = accumulated - row.impulse;
                    // A separating row with no impulse left is satisfied.
                    let violation = if row.impulse > 0.0 { error.abs() } else { error.max(0.0) };
                    residual = residual.max(violation);
                } else {
                    residual = residual.max(error.abs());
                }
                if !delta.is_finite() {
                    return Err(ResolveError::NonFinite { row: index });
                }
                if delta != 0.0 {
                    target.apply(row, delta);
                    row.impulse += delta;
                }
            }
            stats.residual = residual;
            if residual <= tolerance {
                return Ok(stats);
            }
        }
        tolerance *= 2.0;
    }

    Err(ResolveError::NotConverged {
        iterations: stats.iterations,
        residual: stats.residual,
        tolerance: tolerance / 2.0,
    })
}
