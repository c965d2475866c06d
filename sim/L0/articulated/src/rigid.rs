//! Single free rigid body with the same protocol as articulated entities.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use sim_types::{EntityId, PartId, Pose, RigidBody, SimulationConfig, Twist};

use crate::collaborator::{Aabb, ContactPoint, GeometryProvider, PartPlacement};
use crate::context::WorkerContext;
use crate::entity::{StepEnv, StepReport};
use crate::error::{ArticulationError, Result};
use crate::joint::AttachedPart;
use crate::params::{Action, DynamicsStatus, Params, PoseStatus, Status, StatusQuery};
use crate::registrar::{prune_rows, Constraint};
use crate::resolver::{resolve, RigidTarget};
use crate::sleep::SleepTracker;
use crate::snapshot::{BodyPose, PoseReader, PoseSnapshot};

const KIND: &str = "rigid";

#[derive(Debug, Clone)]
struct SavedFrame {
    body: RigidBody,
    sleep: SleepTracker,
    bbox: Aabb,
    frame: u64,
    time: f64,
}

#[derive(Debug)]
struct RigidState {
    body: RigidBody,
    parts: Vec<AttachedPart>,
    config: SimulationConfig,
    sleep: SleepTracker,
    bbox: Aabb,
    contacts: Vec<ContactPoint>,
    frame: u64,
    time: f64,
    saved: Option<SavedFrame>,
}

impl RigidState {
    fn placements(&self) -> Vec<PartPlacement> {
        let frame = self.body.frame_pose();
        self.parts
            .iter()
            .map(|part| PartPlacement {
                part: part.id,
                joint: None,
                pose: frame.compose(&part.local),
            })
            .collect()
    }

    /// One substep. Returns `false` when the frame must be rejected.
    fn substep(&mut self, id: EntityId, geometry: &dyn GeometryProvider, ctx: &mut WorkerContext, h: f64, report: &mut StepReport) -> bool {
        ctx.begin_step();
        let solver = &self.config.solver;
        let body = &mut self.body;

        if !body.is_static() {
            let twist = body.twist();
            let keep = (1.0 - self.config.damping * h).max(0.0);
            body.set_velocity(&Twist::new(
                (twist.linear + self.config.gravity.velocity_delta(h)) * keep,
                twist.angular * keep,
            ));
        }

        let frame = body.frame_pose();
        let parts: Vec<PartPlacement> = self
            .parts
            .iter()
            .map(|part| PartPlacement {
                part: part.id,
                joint: None,
                pose: frame.compose(&part.local),
            })
            .collect();
        self.bbox = geometry.bounding_box(&parts);
        let swept = self.bbox.inflate(body.v.norm() * h + solver.contact_tolerance);
        geometry.detect_contacts(id, &parts, &swept, &mut ctx.contacts);
        for contact in &ctx.contacts {
            if contact.penetration < -solver.contact_tolerance {
                continue;
            }
            ctx.rows.push(Constraint::contact(0, contact, contact.point - body.pos, solver, h));
        }

        let saved = body.twist();
        let outcome = {
            let mut target = RigidTarget::new(body);
            prune_rows(&mut target, &mut ctx.rows, 0, solver);
            resolve(&mut target, &mut ctx.rows, solver)
        };
        if let Err(err) = outcome {
            body.set_velocity(&saved);
            report.resolve_failures += 1;
            self.sleep.wake();
            tracing::debug!(entity = %id, error = %err, "contact resolve failed, velocities reverted");
        }

        body.step(h);

        // Sleep.
        let unproj: f64 = ctx.rows.iter().map(|r| 0.5 * body.mass * r.vreq.max(0.0).powi(2)).sum();
        let energy = body.kinetic_energy() + unproj;
        let cfg = &self.config.sleep;
        let calm = body.mass <= 0.0 || energy / body.mass < cfg.threshold(ctx.contacts.len());
        let dynamic_contacts = ctx.contacts.iter().filter(|c| c.peer_dynamic).count();
        if !calm || dynamic_contacts >= cfg.max_dynamic_contacts || !cfg.enabled {
            self.sleep.calm_frames = 0;
        } else {
            self.sleep.calm_frames += 1;
            if self.sleep.calm_frames >= cfg.sleep_frames {
                self.sleep.awake = false;
                body.zero_velocity();
                report.fell_asleep = true;
                tracing::trace!(entity = %id, "entity fell asleep");
            }
        }

        self.contacts.clone_from(&ctx.contacts);
        self.frame += 1;
        self.time += h;
        body.is_finite()
            && body.v.norm() <= self.config.max_velocity
            && body.w.norm() <= self.config.max_velocity
    }
}

/// A single body carrying geometry parts.
pub struct RigidEntity {
    id: EntityId,
    geometry: Arc<dyn GeometryProvider>,
    state: RwLock<RigidState>,
    poses: PoseReader,
}

impl std::fmt::Debug for RigidEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RigidEntity").field("id", &self.id).finish_non_exhaustive()
    }
}

impl RigidEntity {
    /// Massless body at `frame`; attach parts to give it mass.
    ///
    /// # Errors
    ///
    /// Invalid configuration.
    pub fn new(id: EntityId, frame: Pose, config: SimulationConfig, geometry: Arc<dyn GeometryProvider>) -> Result<Self> {
        config.validate()?;
        let entity = Self {
            id,
            geometry,
            state: RwLock::new(RigidState {
                body: RigidBody::create(&frame, &sim_types::MassProperties::empty()),
                parts: Vec::new(),
                config,
                sleep: SleepTracker::default(),
                bbox: Aabb::empty(),
                contacts: Vec::new(),
                frame: 0,
                time: 0.0,
                saved: None,
            }),
            poses: PoseReader::new(),
        };
        entity.commit_edit(&mut entity.write());
        Ok(entity)
    }

    fn read(&self) -> RwLockReadGuard<'_, RigidState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RigidState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &RigidState) {
        self.poses.publish(PoseSnapshot {
            frame: state.frame,
            time: state.time,
            bodies: vec![BodyPose {
                joint: None,
                pose: state.body.frame_pose(),
            }],
        });
    }

    fn commit_edit(&self, state: &mut RigidState) {
        state.bbox = self.geometry.bounding_box(&state.placements());
        self.publish(state);
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

    /// Copy of the body.
    #[must_use]
    pub fn body(&self) -> RigidBody {
        self.read().body.clone()
    }

    /// Whether the entity is simulated.
    #[must_use]
    pub fn is_awake(&self) -> bool {
        self.read().sleep.awake
    }

    /// Whether the body has mass.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        !self.read().body.is_static()
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

    /// Advance by `dt` in substeps.
    pub fn step(&self, ctx: &mut WorkerContext, env: &StepEnv<'_>, dt: f64) -> StepReport {
        let mut report = StepReport::default();
        let mut state = self.write();
        if state.body.is_static() || !dt.is_finite() || dt <= 0.0 {
            return report;
        }
        if !state.sleep.awake {
            let reach = state.bbox.inflate(state.config.solver.contact_tolerance);
            let woken = self
                .geometry
                .query_overlapping(self.id, &reach)
                .into_iter()
                .any(|peer| env.is_awake(peer));
            if !woken {
                return report;
            }
            state.sleep.wake();
            report.woke = true;
        }

        state.saved = Some(SavedFrame {
            body: state.body.clone(),
            sleep: state.sleep,
            bbox: state.bbox,
            frame: state.frame,
            time: state.time,
        });
        let substeps = state.config.substeps(dt);
        #[allow(clippy::cast_precision_loss)]
        let h = dt / substeps as f64;
        for _ in 0..substeps {
            report.substeps += 1;
            if !state.substep(self.id, self.geometry.as_ref(), ctx, h, &mut report) {
                restore(&mut state);
                report.rolled_back = true;
                tracing::warn!(entity = %self.id, "frame rejected, rolled back");
                break;
            }
            if report.fell_asleep {
                break;
            }
        }
        self.publish(&state);
        report
    }

    /// Roll back to the start of the last frame.
    pub fn step_back(&self) -> bool {
        let mut state = self.write();
        let restored = restore(&mut state);
        if restored {
            self.publish(&state);
        }
        restored
    }

    /// Apply a parameter block.
    ///
    /// # Errors
    ///
    /// Joint and articulated blocks, invalid configuration, rejected parts.
    pub fn set_params(&self, params: &Params) -> Result<()> {
        let mut state = self.write();
        match params {
            Params::Simulation(p) => {
                state.config = p.apply_to(&state.config)?;
                return Ok(());
            }
            Params::Part(p) => {
                if let Err(err) = p.props.validate_part(p.part.raw()) {
                    tracing::warn!(part = %p.part, error = %err, "part rejected");
                    return Err(err.into());
                }
                if state.parts.iter().any(|part| part.id == p.part) {
                    return Err(ArticulationError::DuplicatePart(p.part));
                }
                let part = AttachedPart {
                    id: p.part,
                    local: p.local,
                    props: p.props,
                };
                state.body.add(&part.body_props());
                state.parts.push(part);
            }
            Params::Pose(p) => {
                let mut frame = state.body.frame_pose();
                if let Some(position) = p.position {
                    frame.position = position;
                }
                if let Some(rotation) = p.rotation {
                    frame.rotation = rotation;
                }
                state.body.set_frame_pose(&frame);
            }
            other => return Err(ArticulationError::unsupported(KIND, other.name())),
        }
        state.sleep.wake();
        self.commit_edit(&mut state);
        Ok(())
    }

    /// Perform an action.
    ///
    /// # Errors
    ///
    /// Joint requests and unknown parts.
    pub fn action(&self, action: &Action) -> Result<()> {
        let mut state = self.write();
        match action {
            Action::Impulse(a) => {
                if a.joint.is_some() {
                    return Err(ArticulationError::unsupported(KIND, "joint impulse"));
                }
                let point = a.point.unwrap_or(state.body.pos);
                state.body.apply_impulse(&a.impulse, &point);
                state.body.apply_angular_impulse(&a.angular);
                state.sleep.wake();
            }
            Action::SetVelocity { linear, angular } => {
                state.body.set_velocity(&Twist::new(*linear, *angular));
                state.sleep.wake();
            }
            Action::Awake { awake: true } => {
                state.sleep.wake();
            }
            Action::Awake { awake: false } => {
                state.sleep.awake = false;
                state.sleep.calm_frames = 0;
                state.body.zero_velocity();
            }
            Action::Reset => {
                state.body.zero_velocity();
                state.sleep.calm_frames = 0;
            }
            Action::RemovePart { part } => {
                let index = state
                    .parts
                    .iter()
                    .position(|p| p.id == *part)
                    .ok_or(ArticulationError::UnknownPart(*part))?;
                let removed = state.parts.remove(index);
                state.body.remove(&removed.body_props());
                self.commit_edit(&mut state);
            }
            Action::SetJointVelocity { .. } => return Err(ArticulationError::unsupported(KIND, action.name())),
        }
        Ok(())
    }

    /// Answer a status query.
    ///
    /// # Errors
    ///
    /// Joint queries.
    pub fn status(&self, query: &StatusQuery) -> Result<Status> {
        let state = self.read();
        let body = &state.body;
        match query {
            StatusQuery::Pose => Ok(Status::Pose(PoseStatus {
                pose: body.frame_pose(),
                bbox: state.bbox,
            })),
            StatusQuery::Dynamics { joint: None } => Ok(Status::Dynamics(DynamicsStatus {
                mass: body.mass,
                center_of_mass: body.pos,
                velocity: body.v,
                angular_velocity: body.w,
                energy: body.kinetic_energy(),
                awake: state.sleep.awake,
                contacts: state.contacts.len(),
            })),
            StatusQuery::Counts => Ok(Status::Counts {
                joints: 0,
                parts: state.parts.len(),
            }),
            StatusQuery::Awake => Ok(Status::Awake(state.sleep.awake)),
            StatusQuery::Dynamics { joint: Some(_) } | StatusQuery::Joint(_) => {
                Err(ArticulationError::unsupported(KIND, "joint status"))
            }
        }
    }

    /// Ids of the attached parts.
    #[must_use]
    pub fn parts(&self) -> Vec<PartId> {
        self.read().parts.iter().map(|p| p.id).collect()
    }
}

fn restore(state: &mut RigidState) -> bool {
    let Some(saved) = state.saved.clone() else {
        return false;
    };
    state.body = saved.body;
    state.sleep = saved.sleep;
    state.bbox = saved.bbox;
    state.frame = saved.frame;
    state.time = saved.time;
    true
}
