//! Per-worker scratch passed explicitly into every solver call.
//!
//! One context exists per pool thread. It holds only buffers whose contents
//! are rebuilt each step, so any entity may be stepped with any context.

use nalgebra::Vector3;

use sim_types::SpatialVector;

use crate::collaborator::ContactPoint;
use crate::registrar::{AssignedContact, Constraint};

/// Buffers for test-impulse propagation through a tree, indexed by order
/// position.
#[derive(Debug, Clone, Default)]
pub struct ImpulseScratch {
    /// Bias impulse accumulated bottom-up.
    pub p: Vec<SpatialVector>,
    /// Joint-space impulse (`τ − sᵀ p`).
    pub u: Vec<Vector3<f64>>,
    /// Joint-space torque impulses injected directly.
    pub tau: Vec<Vector3<f64>>,
    /// Resulting body velocity change.
    pub dv: Vec<SpatialVector>,
    /// Resulting joint rate change.
    pub ddq: Vec<Vector3<f64>>,
}

impl ImpulseScratch {
    /// Size for `n` joints and clear.
    pub fn reset(&mut self, n: usize) {
        for buf in [&mut self.p, &mut self.dv] {
            buf.clear();
            buf.resize(n, SpatialVector::zeros());
        }
        for buf in [&mut self.u, &mut self.tau, &mut self.ddq] {
            buf.clear();
            buf.resize(n, Vector3::zeros());
        }
    }

    /// Zero all buffers without resizing.
    pub fn clear(&mut self) {
        self.p.fill(SpatialVector::zeros());
        self.dv.fill(SpatialVector::zeros());
        self.u.fill(Vector3::zeros());
        self.tau.fill(Vector3::zeros());
        self.ddq.fill(Vector3::zeros());
    }

    /// Queue a spatial impulse `[angular; linear]` at the body centre of
    /// mass of the joint at order position `pos`.
    pub fn add_body_impulse(&mut self, pos: usize, impulse: &SpatialVector) {
        self.p[pos] -= impulse;
    }

    /// Queue a joint-space impulse on the axes of the joint at `pos`.
    pub fn add_joint_impulse(&mut self, pos: usize, impulse: &Vector3<f64>) {
        self.tau[pos] += impulse;
    }
}

/// Scratch owned by one worker thread.
#[derive(Debug, Default)]
pub struct WorkerContext {
    worker: usize,
    /// Impulse propagation buffers.
    pub impulses: ImpulseScratch,
    /// Contacts detected this step.
    pub contacts: Vec<ContactPoint>,
    /// Contacts mapped to joints.
    pub assigned: Vec<AssignedContact>,
    /// Constraint rows of the current resolve.
    pub rows: Vec<Constraint>,
    /// Velocity state saved before a resolve, for reverting.
    pub saved_velocities: Vec<(Vector3<f64>, Vector3<f64>, Vector3<f64>)>,
    /// Steps taken with this context.
    pub steps: u64,
}

impl WorkerContext {
    /// Context for worker `worker`.
    #[must_use]
    pub fn new(worker: usize) -> Self {
        Self {
            worker,
            ..Default::default()
        }
    }

    /// Worker index this context belongs to.
    #[must_use]
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Drop per-step contents, keeping capacity.
    pub fn begin_step(&mut self) {
        self.contacts.clear();
        self.assigned.clear();
        self.rows.clear();
        self.saved_velocities.clear();
        self.steps += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_sizes_buffers() {
        let mut ctx = WorkerContext::new(3);
        ctx.impulses.reset(5);
        assert_eq!(ctx.worker(), 3);
        assert_eq!(ctx.impulses.p.len(), 5);
        assert_eq!(ctx.impulses.ddq.len(), 5);
        ctx.impulses.p[2] = SpatialVector::repeat(1.0);
        ctx.impulses.reset(2);
        assert_eq!(ctx.impulses.p[1], SpatialVector::zeros());
    }

    #[test]
    fn test_body_impulse_is_negated_bias() {
        let mut scratch = ImpulseScratch::default();
        scratch.reset(1);
        scratch.add_body_impulse(0, &SpatialVector::repeat(2.0));
        scratch.add_joint_impulse(0, &Vector3::x());
        assert_eq!(scratch.p[0], SpatialVector::repeat(-2.0));
        assert_eq!(scratch.tau[0], Vector3::x());
        scratch.clear();
        assert_eq!(scratch.p[0], SpatialVector::zeros());
    }
}
