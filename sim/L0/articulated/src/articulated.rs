//! Articulated entity: a joint tree stepped through the Featherstone passes,
//! the micro-contact resolve and the sleep machine.
//!
//! One substep runs, in order:
//!
//! 1. forward kinematics and the energy reading used by the energy guard
//! 2. the three Featherstone passes (free accelerations, new joint rates)
//! 3. contact detection against the swept bounds, constraint registration
//! 4. the resolve; on failure the velocities are reverted and the entity
//!    stays awake
//! 5. integration of angles (and of floating roots), limit and gimbal
//!    state updates
//! 6. the energy guard, energy bookkeeping and the sleep machine
//! 7. validation; a non-finite or runaway frame is rolled back
//!
//! The state at the start of a frame is kept for [`ArticulatedEntity::step_back`].

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use nalgebra::{Point3, Vector3};

use sim_types::spatial::{angular_part, linear_part, spatial};
use sim_types::{EntityId, JointId, PartId, Pose, RigidBody, SimError, SimulationConfig, SpatialVector, Twist};

use crate::collaborator::{Aabb, ContactPoint, GeometryProvider, PartPlacement};
use crate::context::{ImpulseScratch, WorkerContext};
use crate::entity::{StepEnv, StepReport};
use crate::error::{ArticulationError, Result};
use crate::featherstone::{
    apply_velocity_change, body_velocity, calc_body_ia, calc_body_za, impulse_at_point, integrate_root,
    kinetic_energy, propagate_impulses, set_root_velocity, solve_velocities, update_kinematics,
    update_velocities,
};
use crate::joint::{AttachedPart, AxisState, Joint, JointLink};
use crate::limits::{integrate_angles, set_angle, update_gimbal_lock, update_limit_states};
use crate::params::{
    Action, ArticulatedParams, DynamicsStatus, ImpulseAction, JointParams, JointStatus, ParentRef, PartParams,
    PoseParams, PoseStatus, Params, SimulationParams, Status, StatusQuery,
};
use crate::registrar::{assign_contacts_to_joints, prune_rows, register_constraints, ConstraintKind};
use crate::resolver::{resolve, ArticulatedTarget};
use crate::sleep::{limit_energy_gain, update_energy, update_sleep, zero_velocities, SleepTracker};
use crate::snapshot::{BodyPose, EntitySnapshot, JointSnapshot, PoseReader, PoseSnapshot};
use crate::tree::{ArticulationTree, JointHandle};

const KIND: &str = "articulated";

/// Consecutive failed resolves after which the failure is logged as a
/// warning instead of a debug message.
const RESOLVE_WARN_AFTER: u32 = 3;

/// Per-joint state saved at the start of a frame.
#[derive(Debug, Clone)]
struct SavedJoint {
    handle: JointHandle,
    link: JointLink,
    body: RigidBody,
    velocity: SpatialVector,
    axes_world: [Vector3<f64>; 3],
    pivot_world: Vector3<f64>,
    energy: f64,
    awake: bool,
    contacts: usize,
}

/// Everything [`ArticulatedEntity::step_back`] restores.
#[derive(Debug, Clone, Default)]
struct StepSnapshot {
    joints: Vec<SavedJoint>,
    sleep: SleepTracker,
    bbox: Aabb,
    frame: u64,
    time: f64,
}

#[derive(Debug)]
struct ArticulatedState {
    tree: ArticulationTree,
    config: SimulationConfig,
    sleep: SleepTracker,
    bbox: Aabb,
    contacts: Vec<ContactPoint>,
    failed_resolves: u32,
    frame: u64,
    time: f64,
    saved: Option<StepSnapshot>,
}

/// How a substep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubstepOutcome {
    Continue,
    FellAsleep,
    Rejected,
}

/// A tree of joints carrying geometry parts.
///
/// Joints are created by attaching parts ([`Params::Part`]) and configured
/// with [`Params::Joint`]. All methods take `&self`; structure and state sit
/// behind a reader/writer lock and published poses behind another, so
/// readers never see a half-written frame.
pub struct ArticulatedEntity {
    id: EntityId,
    geometry: Arc<dyn GeometryProvider>,
    state: RwLock<ArticulatedState>,
    poses: PoseReader,
}

impl std::fmt::Debug for ArticulatedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArticulatedEntity")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ArticulatedEntity {
    /// Empty entity.
    ///
    /// # Errors
    ///
    /// Invalid configuration.
    pub fn new(id: EntityId, config: SimulationConfig, geometry: Arc<dyn GeometryProvider>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            id,
            geometry,
            state: RwLock::new(ArticulatedState {
                tree: ArticulationTree::new(),
                config,
                sleep: SleepTracker::default(),
                bbox: Aabb::empty(),
                contacts: Vec::new(),
                failed_resolves: 0,
                frame: 0,
                time: 0.0,
                saved: None,
            }),
            poses: PoseReader::new(),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, ArticulatedState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ArticulatedState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// World-assigned id.
    #[must_use]
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Kind name.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        KIND
    }

    /// Run `f` against the joint tree.
    pub fn with_tree<R>(&self, f: impl FnOnce(&ArticulationTree) -> R) -> R {
        f(&self.read().tree)
    }

    /// Total kinetic energy.
    #[must_use]
    pub fn kinetic_energy(&self) -> f64 {
        kinetic_energy(&self.read().tree)
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> SimulationConfig {
        self.read().config.clone()
    }

    /// Whether the entity is simulated.
    #[must_use]
    pub fn is_awake(&self) -> bool {
        self.read().sleep.awake
    }

    /// Articulated entities always move.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        true
    }

    /// World bounds from the last update.
    #[must_use]
    pub fn bounding_box(&self) -> Aabb {
        self.read().bbox
    }

    /// Handle to the published poses.
    #[must_use]
    pub fn pose_reader(&self) -> PoseReader {
        self.poses.clone()
    }

    // ========== Stepping ==========

    /// Advance by `dt`, split into substeps no longer than `max_time_step`.
    pub fn step(&self, ctx: &mut WorkerContext, env: &StepEnv<'_>, dt: f64) -> StepReport {
        let mut report = StepReport::default();
        let mut state = self.write();
        if state.tree.is_empty() || !dt.is_finite() || dt <= 0.0 {
            return report;
        }

        if !state.sleep.awake {
            if !self.touches_awake_peer(&state, env) {
                return report;
            }
            state.sleep.wake();
            report.woke = true;
            tracing::trace!(entity = %self.id, "woken by an awake neighbour");
        }

        state.save_frame_start();
        let substeps = state.config.substeps(dt);
        #[allow(clippy::cast_precision_loss)]
        let h = dt / substeps as f64;
        for _ in 0..substeps {
            report.substeps += 1;
            match state.substep(self.id, self.geometry.as_ref(), ctx, h, &mut report) {
                SubstepOutcome::Continue => {}
                SubstepOutcome::FellAsleep => {
                    report.fell_asleep = true;
                    break;
                }
                SubstepOutcome::Rejected => {
                    state.restore_frame_start();
                    report.rolled_back = true;
                    tracing::warn!(entity = %self.id, frame = state.frame, "frame rejected, rolled back");
                    break;
                }
            }
        }

        self.publish(&state);
        report
    }

    /// Roll back to the state at the start of the last frame.
    ///
    /// Returns `false` when there is nothing to roll back to. Joints created
    /// since that frame keep their current state.
    pub fn step_back(&self) -> bool {
        let mut state = self.write();
        let restored = state.restore_frame_start();
        if restored {
            self.publish(&state);
        }
        restored
    }

    fn touches_awake_peer(&self, state: &ArticulatedState, env: &StepEnv<'_>) -> bool {
        let reach = state.bbox.inflate(state.config.solver.contact_tolerance);
        self.geometry
            .query_overlapping(self.id, &reach)
            .into_iter()
            .any(|peer| env.is_awake(peer))
    }

    fn publish(&self, state: &ArticulatedState) {
        self.poses.publish(PoseSnapshot {
            frame: state.frame,
            time: state.time,
            bodies: state
                .tree
                .iter()
                .map(|j| BodyPose {
                    joint: Some(j.id),
                    pose: j.frame_pose(),
                })
                .collect(),
        });
    }

    /// Refresh kinematics, bounds and published poses after an edit.
    fn commit_edit(&self, state: &mut ArticulatedState) {
        update_kinematics(&mut state.tree);
        update_velocities(&mut state.tree);
        state.bbox = self.geometry.bounding_box(&placements(&state.tree));
        state.tree.debug_check();
        self.publish(state);
    }

    // ========== Parameters ==========

    /// Apply a parameter block.
    ///
    /// # Errors
    ///
    /// Unknown ids, invalid values and rejected geometry. The entity is
    /// unchanged when an error is returned.
    pub fn set_params(&self, params: &Params) -> Result<()> {
        let mut state = self.write();
        match params {
            Params::Simulation(p) => state.set_simulation(p)?,
            Params::Joint(p) => state.set_joint(p)?,
            Params::Part(p) => {
                state.attach_part(p)?;
                state.promote_massive_roots()?;
            }
            Params::Pose(p) => state.move_to(p),
            Params::Articulated(ArticulatedParams { reroot }) => {
                if let Some(id) = reroot {
                    let joint = state.tree.by_id(*id).ok_or(ArticulationError::UnknownJoint(*id))?;
                    if joint.mass() <= 0.0 && !joint.link.is_root() {
                        return Err(ArticulationError::unsupported("massless joint", "reroot"));
                    }
                    state.tree.reroot(*id)?;
                    tracing::trace!(entity = %self.id, root = %id, "rerooted");
                }
            }
        }
        if !matches!(params, Params::Simulation(_)) {
            state.sleep.wake();
            self.commit_edit(&mut state);
        }
        Ok(())
    }

    // ========== Actions ==========

    /// Perform an action.
    ///
    /// # Errors
    ///
    /// Unknown joints or parts, and velocity requests a grounded tree
    /// cannot honour.
    pub fn action(&self, action: &Action) -> Result<()> {
        let mut state = self.write();
        match action {
            Action::Impulse(impulse) => state.apply_impulse(impulse)?,
            Action::SetJointVelocity { joint, velocity } => {
                let joint = state
                    .tree
                    .by_id_mut(*joint)
                    .ok_or(ArticulationError::UnknownJoint(*joint))?;
                if joint.link.is_floating_root() {
                    return Err(ArticulationError::unsupported("floating root", "joint velocity"));
                }
                for (axis, rate) in velocity.iter().enumerate() {
                    if let Some(rate) = rate {
                        if joint.link.axes[axis].state.is_mobile() {
                            joint.link.axes[axis].requested_velocity = Some(*rate);
                        }
                    }
                }
                state.sleep.wake();
            }
            Action::SetVelocity { linear, angular } => {
                let root = state.first_root()?;
                let joint = state.tree.at_mut(root);
                if !joint.link.is_floating_root() {
                    return Err(ArticulationError::unsupported("grounded articulated", "set velocity"));
                }
                set_root_velocity(joint, &spatial(angular, linear));
                update_velocities(&mut state.tree);
                state.sleep.wake();
            }
            Action::Awake { awake: true } => {
                if state.sleep.wake() {
                    tracing::trace!(entity = %self.id, "woken by request");
                }
            }
            Action::Awake { awake: false } => {
                state.sleep.awake = false;
                state.sleep.calm_frames = 0;
                zero_velocities(&mut state.tree);
            }
            Action::Reset => {
                zero_velocities(&mut state.tree);
                state.sleep.calm_frames = 0;
            }
            Action::RemovePart { part } => {
                state.remove_part(*part)?;
                state.sleep.wake();
                self.commit_edit(&mut state);
            }
        }
        Ok(())
    }

    // ========== Status ==========

    /// Answer a status query.
    ///
    /// # Errors
    ///
    /// Unknown joints.
    pub fn status(&self, query: &StatusQuery) -> Result<Status> {
        let state = self.read();
        let tree = &state.tree;
        match query {
            StatusQuery::Pose => Ok(Status::Pose(PoseStatus {
                pose: state.root_pose(),
                bbox: state.bbox,
            })),
            StatusQuery::Dynamics { joint: Some(id) } => {
                let joint = tree.by_id(*id).ok_or(ArticulationError::UnknownJoint(*id))?;
                let v = body_velocity(joint);
                Ok(Status::Dynamics(DynamicsStatus {
                    mass: joint.mass(),
                    center_of_mass: joint.body.pos,
                    velocity: linear_part(&v),
                    angular_velocity: angular_part(&v),
                    energy: joint.body.kinetic_energy(),
                    awake: joint.awake && state.sleep.awake,
                    contacts: joint.contacts,
                }))
            }
            StatusQuery::Dynamics { joint: None } => {
                let mass: f64 = tree.iter().map(Joint::mass).sum();
                let (mut com, mut momentum) = (Vector3::zeros(), Vector3::zeros());
                for joint in tree.iter() {
                    com += joint.body.pos * joint.mass();
                    momentum += linear_part(&body_velocity(joint)) * joint.mass();
                }
                if mass > 0.0 {
                    com /= mass;
                    momentum /= mass;
                }
                let angular_velocity = tree
                    .root_positions()
                    .first()
                    .map_or_else(Vector3::zeros, |&r| angular_part(&body_velocity(tree.at(r))));
                Ok(Status::Dynamics(DynamicsStatus {
                    mass,
                    center_of_mass: com,
                    velocity: momentum,
                    angular_velocity,
                    energy: kinetic_energy(tree),
                    awake: state.sleep.awake,
                    contacts: state.contacts.len(),
                }))
            }
            StatusQuery::Joint(id) => {
                let joint = tree.by_id(*id).ok_or(ArticulationError::UnknownJoint(*id))?;
                let link = &joint.link;
                Ok(Status::Joint(JointStatus {
                    id: joint.id,
                    parent: link.parent.and_then(|h| tree.get(h)).map(|p| p.id),
                    angles: link.angles,
                    velocity: link.dq,
                    states: [link.axes[0].state, link.axes[1].state, link.axes[2].state],
                    lo: Vector3::new(link.axes[0].lo, link.axes[1].lo, link.axes[2].lo),
                    hi: Vector3::new(link.axes[0].hi, link.axes[1].hi, link.axes[2].hi),
                    pivot: joint.pivot_world,
                    pose: joint.frame_pose(),
                    grounded: link.grounded,
                }))
            }
            StatusQuery::Counts => Ok(Status::Counts {
                joints: tree.len(),
                parts: tree.iter().map(|j| j.parts.len()).sum(),
            }),
            StatusQuery::Awake => Ok(Status::Awake(state.sleep.awake)),
        }
    }

    // ========== Snapshots ==========

    /// Persistable state.
    #[must_use]
    pub fn snapshot(&self) -> EntitySnapshot {
        let state = self.read();
        let root_twist = state.tree.root_positions().first().map_or_else(Twist::zero, |&r| {
            let v = body_velocity(state.tree.at(r));
            Twist::new(linear_part(&v), angular_part(&v))
        });
        EntitySnapshot {
            awake: state.sleep.awake,
            root_pose: state.root_pose(),
            root_twist,
            joints: state
                .tree
                .iter()
                .map(|j| JointSnapshot {
                    id: j.id,
                    angles: j.link.angles,
                    velocity: j.link.dq,
                    reference: j.link.reference_changed.then_some(j.link.q0),
                    momentum: (j.mass() > 0.0).then_some((j.body.p, j.body.l)),
                })
                .collect(),
            contacts: state.contacts.clone(),
        }
    }

    /// Apply persisted state. Joints missing from the snapshot keep their
    /// state.
    ///
    /// # Errors
    ///
    /// [`ArticulationError::SnapshotMismatch`] when the snapshot names a
    /// joint this entity does not have; nothing is changed then.
    pub fn restore(&self, snapshot: &EntitySnapshot) -> Result<()> {
        let mut state = self.write();
        if let Some(missing) = snapshot.joints.iter().find(|j| state.tree.by_id(j.id).is_none()) {
            return Err(ArticulationError::SnapshotMismatch(format!(
                "entity {} has no {}",
                self.id, missing.id
            )));
        }

        let tol = state.config.solver.limit_tolerance;
        for saved in &snapshot.joints {
            let Some(joint) = state.tree.by_id_mut(saved.id) else {
                continue;
            };
            joint.link.angles = saved.angles;
            joint.link.prev_angles = saved.angles;
            joint.link.dq = saved.velocity;
            if let Some(q0) = saved.reference {
                joint.link.q0 = q0;
                joint.link.reference_changed = true;
            }
            update_limit_states(&mut joint.link, tol);
        }

        if let Some(&root) = state.tree.root_positions().first() {
            let momentum = snapshot
                .joints
                .iter()
                .find(|j| j.id == state.tree.at(root).id)
                .and_then(|j| j.momentum);
            let joint = state.tree.at_mut(root);
            if joint.link.is_floating_root() {
                joint.body.set_frame_pose(&snapshot.root_pose);
                let twist = &snapshot.root_twist;
                set_root_velocity(joint, &spatial(&twist.angular, &twist.linear));
                if let Some((p, l)) = momentum {
                    joint.body.p = p;
                    joint.body.l = l;
                    joint.body.update_state();
                    joint.scratch_mut().velocity = spatial(&joint.body.w, &joint.body.v);
                }
            }
        }

        state.contacts.clone_from(&snapshot.contacts);
        if snapshot.awake {
            state.sleep.wake();
        } else {
            state.sleep.awake = false;
            zero_velocities(&mut state.tree);
        }
        self.commit_edit(&mut state);
        Ok(())
    }
}

impl ArticulatedState {
    fn first_root(&self) -> Result<usize> {
        self.tree
            .root_positions()
            .first()
            .copied()
            .ok_or(ArticulationError::unsupported("empty articulated", "root request"))
    }

    fn root_pose(&self) -> Pose {
        self.tree
            .root_positions()
            .first()
            .map_or_else(Pose::identity, |&r| self.tree.at(r).frame_pose())
    }

    // ========== Frame snapshot ==========

    fn save_frame_start(&mut self) {
        let mut saved = self.saved.take().unwrap_or_default();
        saved.joints.clear();
        for pos in 0..self.tree.len() {
            let Some(handle) = self.tree.handle_at(pos) else {
                continue;
            };
            let joint = self.tree.at(pos);
            saved.joints.push(SavedJoint {
                handle,
                link: joint.link.clone(),
                body: joint.body.clone(),
                velocity: body_velocity(joint),
                axes_world: joint.axes_world,
                pivot_world: joint.pivot_world,
                energy: joint.energy,
                awake: joint.awake,
                contacts: joint.contacts,
            });
        }
        saved.sleep = self.sleep;
        saved.bbox = self.bbox;
        saved.frame = self.frame;
        saved.time = self.time;
        self.saved = Some(saved);
    }

    fn restore_frame_start(&mut self) -> bool {
        let Some(saved) = self.saved.as_ref() else {
            return false;
        };
        for s in &saved.joints {
            let Some(joint) = self.tree.get_mut(s.handle) else {
                continue;
            };
            joint.link.clone_from(&s.link);
            joint.body.clone_from(&s.body);
            joint.axes_world = s.axes_world;
            joint.pivot_world = s.pivot_world;
            joint.energy = s.energy;
            joint.unproj_energy = 0.0;
            joint.awake = s.awake;
            joint.contacts = s.contacts;
            joint.scratch_mut().velocity = s.velocity;
        }
        self.sleep = saved.sleep;
        self.bbox = saved.bbox;
        self.frame = saved.frame;
        self.time = saved.time;
        true
    }

    // ========== Substep ==========

    fn substep(
        &mut self,
        id: EntityId,
        geometry: &dyn GeometryProvider,
        ctx: &mut WorkerContext,
        h: f64,
        report: &mut StepReport,
    ) -> SubstepOutcome {
        ctx.begin_step();
        let Self {
            tree,
            config,
            sleep,
            bbox,
            contacts,
            failed_resolves,
            frame,
            time,
            ..
        } = self;
        let solver = &config.solver;

        update_kinematics(tree);
        update_velocities(tree);
        let energy_before = kinetic_energy(tree);
        let mut energy_input = !config.gravity.is_zero()
            || tree.iter().any(|j| {
                j.link
                    .axes
                    .iter()
                    .any(|a| a.stiffness != 0.0 || a.requested_velocity.is_some())
            });

        // Free motion.
        calc_body_ia(tree);
        calc_body_za(tree, &config.gravity.acceleration);
        solve_velocities(tree, h, config.damping);

        // Contacts against the volume swept this substep.
        let parts = placements(tree);
        *bbox = geometry.bounding_box(&parts);
        let reach = tree
            .iter()
            .map(|j| linear_part(&body_velocity(j)).norm())
            .fold(0.0, f64::max)
            * h;
        let swept = bbox.inflate(reach + solver.contact_tolerance);
        geometry.detect_contacts(id, &parts, &swept, &mut ctx.contacts);
        assign_contacts_to_joints(tree, &ctx.contacts, &mut ctx.assigned);
        register_constraints(tree, &ctx.assigned, solver, h, &mut ctx.rows);

        for joint in tree.iter_mut() {
            joint.unproj_energy = 0.0;
        }
        for row in &ctx.rows {
            if matches!(row.kind, ConstraintKind::Contact { .. }) && row.vreq > 0.0 {
                energy_input = true;
                let joint = tree.at_mut(row.pos);
                joint.unproj_energy += 0.5 * joint.body.mass * row.vreq * row.vreq;
            }
        }

        // Resolve, reverting on failure.
        ctx.saved_velocities.clear();
        ctx.saved_velocities.extend(tree.iter().map(|j| {
            let v = body_velocity(j);
            (j.link.dq, linear_part(&v), angular_part(&v))
        }));
        let outcome = {
            let mut target = ArticulatedTarget::new(tree, &mut ctx.impulses);
            prune_rows(&mut target, &mut ctx.rows, 0, solver);
            resolve(&mut target, &mut ctx.rows, solver)
        };
        match outcome {
            Ok(_) => *failed_resolves = 0,
            Err(err) => {
                for (pos, (dq, v, w)) in ctx.saved_velocities.iter().enumerate() {
                    let joint = tree.at_mut(pos);
                    joint.link.dq = *dq;
                    joint.scratch_mut().velocity = spatial(w, v);
                    joint.body.set_velocity(&Twist::new(*v, *w));
                }
                *failed_resolves += 1;
                report.resolve_failures += 1;
                sleep.wake();
                if *failed_resolves >= RESOLVE_WARN_AFTER {
                    tracing::warn!(entity = %id, failures = *failed_resolves, error = %err, "contact resolve keeps failing");
                } else {
                    tracing::debug!(entity = %id, error = %err, "contact resolve failed, velocities reverted");
                }
            }
        }

        // Integrate.
        let tol = solver.limit_tolerance;
        for pos in 0..tree.len() {
            let joint = tree.at_mut(pos);
            if joint.link.is_floating_root() {
                integrate_root(joint, h);
            } else {
                integrate_angles(&mut joint.link, h, tol);
            }
        }
        update_kinematics(tree);
        update_velocities(tree);

        let mut rates_changed = false;
        for pos in 0..tree.len() {
            let joint = tree.at_mut(pos);
            let axes = joint.axes_world;
            update_limit_states(&mut joint.link, tol);
            rates_changed |= update_gimbal_lock(&mut joint.link, &axes);
        }
        if rates_changed {
            update_velocities(tree);
        }
        if !energy_input {
            limit_energy_gain(tree, energy_before);
        }

        // Energy and sleep.
        update_energy(tree);
        let dynamic_contacts = ctx.contacts.iter().filter(|c| c.peer_dynamic).count();
        let fell_asleep = update_sleep(tree, sleep, &config.sleep, dynamic_contacts);
        contacts.clone_from(&ctx.contacts);
        *frame += 1;
        *time += h;

        if !frame_is_valid(tree, config.max_velocity) {
            return SubstepOutcome::Rejected;
        }
        if fell_asleep {
            SubstepOutcome::FellAsleep
        } else {
            SubstepOutcome::Continue
        }
    }

    // ========== Edits ==========

    fn set_simulation(&mut self, p: &SimulationParams) -> Result<()> {
        self.config = p.apply_to(&self.config)?;
        Ok(())
    }

    fn set_joint(&mut self, p: &JointParams) -> Result<()> {
        let handle = self
            .tree
            .handle_of(p.id)
            .ok_or(ArticulationError::UnknownJoint(p.id))?;
        let current = self.tree.get(handle).ok_or(ArticulationError::StaleHandle)?;

        // Validate everything before touching anything.
        for k in 0..3 {
            let lo = p.lo[k].unwrap_or(current.link.axes[k].lo);
            let hi = p.hi[k].unwrap_or(current.link.axes[k].hi);
            if lo.is_nan() || hi.is_nan() || lo > hi {
                return Err(SimError::invalid_config(format!("{} axis {k}: lower bound {lo} above upper bound {hi}", p.id)).into());
            }
            let finite = [p.angles[k], p.velocity[k], p.stiffness[k], p.damping[k], p.dashpot[k], p.dashpot_zone[k], p.bounciness[k]]
                .iter()
                .flatten()
                .all(|x| x.is_finite());
            if !finite {
                return Err(SimError::invalid_config(format!("{} axis {k}: non-finite value", p.id)).into());
            }
        }
        if p.grounded.is_some() && !current.link.is_root() {
            return Err(ArticulationError::unsupported("non-root joint", "grounding"));
        }
        let parent_frame = current
            .link
            .parent
            .and_then(|h| self.tree.get(h))
            .map_or_else(Pose::identity, Joint::frame_pose);

        if let Some(grounded) = p.grounded {
            self.tree.set_grounded(p.id, grounded)?;
        }
        let tol = self.config.solver.limit_tolerance;
        let joint = self.tree.get_mut(handle).ok_or(ArticulationError::StaleHandle)?;
        let link = &mut joint.link;
        for k in 0..3 {
            let axis = &mut link.axes[k];
            if let Some(lo) = p.lo[k] {
                axis.lo = lo;
            }
            if let Some(hi) = p.hi[k] {
                axis.hi = hi;
            }
            if let Some(v) = p.stiffness[k] {
                axis.stiffness = v;
            }
            if let Some(v) = p.damping[k] {
                axis.damping = v;
            }
            if let Some(v) = p.dashpot[k] {
                axis.dashpot = v;
            }
            if let Some(v) = p.dashpot_zone[k] {
                axis.dashpot_zone = v;
            }
            if let Some(v) = p.bounciness[k] {
                axis.bounciness = v;
            }
            match p.locked[k] {
                Some(true) => {
                    axis.state = AxisState::Locked;
                    axis.requested_velocity = None;
                    link.dq[k] = 0.0;
                }
                Some(false) if axis.is_locked() => axis.state = AxisState::Free,
                _ => {}
            }
            if let Some(angle) = p.angles[k] {
                set_angle(link, k, angle);
            }
            if let Some(rate) = p.velocity[k] {
                if link.axes[k].state.is_mobile() {
                    link.dq[k] = rate;
                }
            }
        }
        if let Some(q0) = p.q0 {
            link.q0 = q0;
            link.reference_changed = true;
        }
        if let Some(pivot) = p.pivot {
            link.pivot_parent = parent_frame.inverse_transform_point(&pivot).coords;
            link.pivot_child = joint.body.frame_pose().inverse_transform_point(&pivot).coords;
        }
        update_limit_states(&mut joint.link, tol);
        Ok(())
    }

    fn attach_part(&mut self, p: &PartParams) -> Result<()> {
        if let Err(err) = p.props.validate_part(p.part.raw()) {
            tracing::warn!(part = %p.part, joint = %p.joint, error = %err, "part rejected");
            return Err(err.into());
        }
        if self.tree.iter().any(|j| j.part(p.part).is_some()) {
            return Err(ArticulationError::DuplicatePart(p.part));
        }
        let attached = AttachedPart {
            id: p.part,
            local: p.local,
            props: p.props,
        };
        let body_props = attached.body_props();

        if let Some(joint) = self.tree.by_id_mut(p.joint) {
            joint.body.add(&body_props);
            joint.parts.push(attached);
            return Ok(());
        }

        let pivot = p.pivot.unwrap_or(p.frame.position);
        let link = match p.parent {
            ParentRef::Root => JointLink {
                pivot_child: p.frame.inverse_transform_point(&pivot).coords,
                ..JointLink::floating_root()
            },
            ParentRef::Joint(parent) => {
                let handle = self
                    .tree
                    .handle_of(parent)
                    .ok_or(ArticulationError::UnknownJoint(parent))?;
                let parent_frame = self
                    .tree
                    .get(handle)
                    .ok_or(ArticulationError::StaleHandle)?
                    .frame_pose();
                JointLink::child_of(Some(handle), &parent_frame, &p.frame, &pivot)
            }
        };
        let mut joint = Joint::new(p.joint, RigidBody::create(&p.frame, &body_props), link);
        joint.parts.push(attached);
        self.tree.insert(joint)?;
        Ok(())
    }

    fn remove_part(&mut self, part: PartId) -> Result<()> {
        let pos = (0..self.tree.len())
            .find(|&pos| self.tree.at(pos).part(part).is_some())
            .ok_or(ArticulationError::UnknownPart(part))?;
        let joint = self.tree.at_mut(pos);
        let index = joint
            .parts
            .iter()
            .position(|p| p.id == part)
            .ok_or(ArticulationError::UnknownPart(part))?;
        let removed = joint.parts.remove(index);
        joint.body.remove(&removed.body_props());
        if joint.parts.is_empty() && joint.n_children() == 0 {
            let id = joint.id;
            self.tree.remove(id)?;
        }
        self.promote_massive_roots()
    }

    /// Hang every floating tree whose root carries no mass from the
    /// root's heaviest child, and drop the old root once it is an empty
    /// leaf. A massless root holds no momentum of its own, so its motion
    /// would be decided by nothing but the solver's choice of gauge.
    fn promote_massive_roots(&mut self) -> Result<()> {
        let roots: Vec<JointId> = self
            .tree
            .root_positions()
            .into_iter()
            .map(|pos| self.tree.at(pos))
            .filter(|j| j.link.is_floating_root() && j.mass() <= 0.0 && j.n_children() > 0)
            .map(|j| j.id)
            .collect();

        for old in roots {
            let Some(pos) = self.tree.handle_of(old).and_then(|h| self.tree.position_of(h)) else {
                continue;
            };
            let end = pos + self.tree.at(pos).n_subtree();
            let heaviest = (pos + 1..end)
                .filter(|&p| self.tree.parent_pos(p) == Some(pos))
                .map(|p| self.tree.at(p))
                .filter(|j| j.mass() > 0.0)
                .max_by(|a, b| a.mass().total_cmp(&b.mass()))
                .map(|j| j.id);
            let Some(new_root) = heaviest else {
                continue;
            };

            self.tree.reroot(new_root)?;
            let emptied = self
                .tree
                .by_id(old)
                .is_some_and(|j| j.parts.is_empty() && j.n_children() == 0);
            if emptied {
                self.tree.remove(old)?;
            }
            tracing::debug!(old = %old, root = %new_root, removed = emptied, "massless root handed over");
        }
        Ok(())
    }

    fn move_to(&mut self, p: &PoseParams) {
        let roots = self.tree.root_positions();
        let Some(&first) = roots.first() else {
            return;
        };
        let current = self.tree.at(first).frame_pose();
        let target = Pose::new(
            p.position.unwrap_or(current.position),
            p.rotation.unwrap_or(current.rotation),
        );
        let delta = target.compose(&current.inverse());
        for root in roots {
            let joint = self.tree.at_mut(root);
            if joint.link.is_floating_root() {
                let frame = delta.compose(&joint.frame_pose());
                joint.body.set_frame_pose(&frame);
            } else {
                let link = &mut joint.link;
                link.pivot_parent = delta.transform_point(&Point3::from(link.pivot_parent)).coords;
                link.q0 = delta.rotation * link.q0;
                link.reference_changed = true;
            }
        }
    }

    fn apply_impulse(&mut self, a: &ImpulseAction) -> Result<()> {
        let pos = match a.joint {
            Some(id) => {
                let handle = self.tree.handle_of(id).ok_or(ArticulationError::UnknownJoint(id))?;
                self.tree.position_of(handle).ok_or(ArticulationError::StaleHandle)?
            }
            None => self.first_root()?,
        };
        update_kinematics(&mut self.tree);
        update_velocities(&mut self.tree);
        calc_body_ia(&mut self.tree);

        let joint = self.tree.at(pos);
        let point = a.point.unwrap_or(joint.body.pos);
        let impulse = impulse_at_point(joint, &a.impulse, &point) + spatial(&a.angular, &Vector3::zeros());
        let mut scratch = ImpulseScratch::default();
        scratch.reset(self.tree.len());
        scratch.add_body_impulse(pos, &impulse);
        propagate_impulses(&self.tree, &mut scratch);
        apply_velocity_change(&mut self.tree, &scratch, 1.0);
        update_velocities(&mut self.tree);
        self.sleep.wake();
        Ok(())
    }
}

/// World placements of every attached part.
fn placements(tree: &ArticulationTree) -> Vec<PartPlacement> {
    tree.iter()
        .flat_map(|joint| {
            let frame = joint.frame_pose();
            joint.parts.iter().map(move |part| PartPlacement {
                part: part.id,
                joint: Some(joint.id),
                pose: frame.compose(&part.local),
            })
        })
        .collect()
}

/// Finite state and speeds within `max_velocity`.
fn frame_is_valid(tree: &ArticulationTree, max_velocity: f64) -> bool {
    tree.iter().all(|joint| {
        let v = body_velocity(joint);
        joint.body.is_finite()
            && joint.link.angles.iter().all(|a| a.is_finite())
            && joint.link.dq.iter().all(|a| a.is_finite())
            && linear_part(&v).norm() <= max_velocity
            && angular_part(&v).norm() <= max_velocity
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::collaborator::NullGeometry;
    use approx::assert_relative_eq;
    use hashbrown::HashSet;
    use sim_types::{JointId, MassProperties};

    fn entity(config: SimulationConfig) -> ArticulatedEntity {
        ArticulatedEntity::new(EntityId(7), config, Arc::new(NullGeometry)).unwrap()
    }

    /// Floating root at the origin with one child at +x hinged halfway.
    fn two_links(config: SimulationConfig) -> ArticulatedEntity {
        let e = entity(config);
        let props = MassProperties::sphere(1.0, 0.2);
        e.set_params(&Params::Part(PartParams::root(PartId(0), JointId(0), Pose::identity(), props)))
            .unwrap();
        e.set_params(&Params::Part(PartParams::child(
            PartId(1),
            JointId(1),
            JointId(0),
            Pose::from_position(Point3::new(1.0, 0.0, 0.0)),
            Point3::new(0.5, 0.0, 0.0),
            props,
        )))
        .unwrap();
        e
    }

    fn step(e: &ArticulatedEntity, dt: f64) -> StepReport {
        let awake = HashSet::new();
        let mut ctx = WorkerContext::new(0);
        e.step(&mut ctx, &StepEnv { awake: &awake }, dt)
    }

    #[test]
    fn test_impulse_on_single_body() {
        let e = entity(SimulationConfig::default().zero_gravity());
        e.set_params(&Params::Part(PartParams::root(
            PartId(0),
            JointId(0),
            Pose::identity(),
            MassProperties::sphere(2.0, 0.5),
        )))
        .unwrap();
        e.action(&Action::Impulse(ImpulseAction {
            impulse: Vector3::new(4.0, 0.0, 0.0),
            ..Default::default()
        }))
        .unwrap();
        match e.status(&StatusQuery::Dynamics { joint: None }).unwrap() {
            Status::Dynamics(d) => {
                assert_relative_eq!(d.velocity, Vector3::new(2.0, 0.0, 0.0), epsilon = 1e-12);
                assert_relative_eq!(d.energy, 4.0, epsilon = 1e-12);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_substeps_and_publish() {
        let e = two_links(SimulationConfig::with_max_time_step(0.01));
        let reader = e.pose_reader();
        let report = step(&e, 0.035);
        assert_eq!(report.substeps, 4);
        assert_eq!(reader.frame(), 4);
        assert_eq!(reader.latest().bodies.len(), 2);
        // Free fall keeps the chain's shape.
        let latest = reader.latest();
        let a = latest.pose_of(JointId(0)).unwrap().position;
        let b = latest.pose_of(JointId(1)).unwrap().position;
        assert_relative_eq!((b - a).norm(), 1.0, epsilon = 1e-9);
        assert!(a.z < 0.0);
    }

    #[test]
    fn test_step_back_restores_frame_start() {
        let e = two_links(SimulationConfig::default());
        e.set_params(&Params::Joint(JointParams::new(JointId(1)).rate(2, 1.5)))
            .unwrap();
        let before = e.snapshot();
        step(&e, 0.02);
        assert_ne!(e.snapshot(), before);
        assert!(e.step_back());
        assert_eq!(e.snapshot(), before);
    }

    #[test]
    fn test_invalid_joint_params_leave_state() {
        let e = two_links(SimulationConfig::default());
        let before = e.snapshot();
        let err = e
            .set_params(&Params::Joint(JointParams::new(JointId(1)).limits(0, 1.0, -1.0)))
            .unwrap_err();
        assert!(err.is_rejection());
        assert!(matches!(
            e.set_params(&Params::Joint(JointParams::new(JointId(9)))),
            Err(ArticulationError::UnknownJoint(_))
        ));
        assert_eq!(e.snapshot(), before);
    }

    #[test]
    fn test_remove_last_part_destroys_leaf_joint() {
        let e = two_links(SimulationConfig::default());
        // The root keeps its joint while it has a child.
        e.action(&Action::RemovePart { part: PartId(0) }).unwrap();
        assert_eq!(e.status(&StatusQuery::Counts).unwrap(), Status::Counts { joints: 2, parts: 1 });
        e.action(&Action::RemovePart { part: PartId(1) }).unwrap();
        assert_eq!(e.status(&StatusQuery::Counts).unwrap(), Status::Counts { joints: 1, parts: 0 });
        assert!(matches!(
            e.action(&Action::RemovePart { part: PartId(1) }),
            Err(ArticulationError::UnknownPart(_))
        ));
    }

    #[test]
    fn test_pose_params_move_whole_tree() {
        let e = two_links(SimulationConfig::default());
        e.set_params(&Params::Pose(PoseParams {
            position: Some(Point3::new(0.0, 5.0, 0.0)),
            rotation: None,
        }))
        .unwrap();
        match e.status(&StatusQuery::Joint(JointId(1))).unwrap() {
            Status::Joint(j) => {
                assert_relative_eq!(j.pose.position, Point3::new(1.0, 5.0, 0.0), epsilon = 1e-12);
                assert_relative_eq!(j.pivot, Vector3::new(0.5, 5.0, 0.0), epsilon = 1e-12);
                assert_eq!(j.parent, Some(JointId(0)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
