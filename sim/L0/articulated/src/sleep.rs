//! Energy bookkeeping and the sleep/awake state machine.

use serde::{Deserialize, Serialize};

use sim_types::{SleepConfig, SpatialVector};

use crate::featherstone::{body_velocity, kinetic_energy, set_root_velocity, update_velocities};
use crate::tree::ArticulationTree;

/// Entity-level sleep state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepTracker {
    /// Whether the entity is simulated.
    pub awake: bool,
    /// Consecutive frames every joint was calm.
    pub calm_frames: u32,
}

impl Default for SleepTracker {
    fn default() -> Self {
        Self {
            awake: true,
            calm_frames: 0,
        }
    }
}

impl SleepTracker {
    /// Wake up and restart the countdown. Returns `true` if it was asleep.
    pub fn wake(&mut self) -> bool {
        let was_asleep = !self.awake;
        self.awake = true;
        self.calm_frames = 0;
        was_asleep
    }
}

/// Refresh per-joint energy (kinetic plus unprojection) and return the
/// total.
pub fn update_energy(tree: &mut ArticulationTree) -> f64 {
    let mut total = 0.0;
    for joint in tree.iter_mut() {
        joint.energy = joint.body.kinetic_energy() + joint.unproj_energy;
        total += joint.energy;
    }
    total
}

/// Advance the sleep state machine by one frame.
///
/// A joint is calm when its energy per unit mass is below the threshold
/// for the entity's resting contact count; a calm joint under an awake
/// parent stays awake. The entity falls asleep after `sleep_frames`
/// consecutive frames with every joint calm and fewer than
/// `max_dynamic_contacts` contacts against moving peers, and its velocities
/// are zeroed. Returns `true` on the frame the entity falls asleep.
pub fn update_sleep(
    tree: &mut ArticulationTree,
    tracker: &mut SleepTracker,
    cfg: &SleepConfig,
    dynamic_contacts: usize,
) -> bool {
    let resting: usize = tree.iter().map(|j| j.contacts).sum();
    let threshold = cfg.threshold(resting);
    for pos in 0..tree.len() {
        let parent_awake = tree.parent_pos(pos).is_some_and(|p| tree.at(p).awake);
        let joint = tree.at_mut(pos);
        let calm = joint.mass() <= 0.0 || joint.energy / joint.mass() < threshold;
        joint.awake = !calm || parent_awake;
    }

    if !cfg.enabled || !tracker.awake {
        tracker.calm_frames = 0;
        return false;
    }
    if tree.iter().any(|j| j.awake) || dynamic_contacts >= cfg.max_dynamic_contacts {
        tracker.calm_frames = 0;
        return false;
    }
    tracker.calm_frames += 1;
    if tracker.calm_frames < cfg.sleep_frames {
        return false;
    }

    tracker.awake = false;
    zero_velocities(tree);
    tracing::trace!(joints = tree.len(), resting, "entity fell asleep");
    true
}

/// Zero every joint rate, body momentum and pending request.
pub fn zero_velocities(tree: &mut ArticulationTree) {
    for joint in tree.iter_mut() {
        joint.link.dq.fill(0.0);
        for axis in &mut joint.link.axes {
            axis.requested_velocity = None;
        }
        joint.body.zero_velocity();
        if let Some(fs) = joint.fs.as_deref_mut() {
            fs.velocity = SpatialVector::zeros();
        }
        joint.energy = 0.0;
        joint.unproj_energy = 0.0;
    }
}

/// Scale velocities back if a step without energy input gained energy.
///
/// Joint rates and floating-root twists are scaled by
/// `sqrt(before / after)`, which brings the kinetic energy back to
/// `before` exactly since body velocities are linear in them. Returns
/// `true` when a correction was applied.
pub fn limit_energy_gain(tree: &mut ArticulationTree, before: f64) -> bool {
    let after = kinetic_energy(tree);
    if !after.is_finite() || after <= before || after <= 0.0 {
        return false;
    }
    let scale = (before.max(0.0) / after).sqrt();
    for joint in tree.iter_mut() {
        joint.link.dq *= scale;
        if joint.link.is_floating_root() {
            let velocity = body_velocity(joint) * scale;
            set_root_velocity(joint, &velocity);
        }
    }
    update_velocities(tree);
    tracing::trace!(before, after, "energy gain removed");
    true
}
