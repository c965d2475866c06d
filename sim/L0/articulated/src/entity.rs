//! Entity kinds and the capability interface the world drives them through.

use std::sync::{Arc, PoisonError, RwLock};

use hashbrown::HashSet;

use sim_types::{EntityId, PartId, Pose};

use crate::articulated::ArticulatedEntity;
use crate::collaborator::{Aabb, GeometryProvider, PartPlacement};
use crate::context::WorkerContext;
use crate::error::{ArticulationError, Result};
use crate::params::{Action, Params, PoseStatus, Status, StatusQuery};
use crate::rigid::RigidEntity;
use crate::snapshot::{BodyPose, PoseReader, PoseSnapshot};

/// World state visible to an entity while it steps.
#[derive(Debug, Clone, Copy)]
pub struct StepEnv<'a> {
    /// Entities awake at the start of the frame.
    pub awake: &'a HashSet<EntityId>,
}

impl StepEnv<'_> {
    /// Whether `id` was awake at the start of the frame.
    #[must_use]
    pub fn is_awake(&self, id: EntityId) -> bool {
        self.awake.contains(&id)
    }
}

/// What one call to [`PhysicalEntity::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepReport {
    /// Substeps simulated (0 when asleep).
    pub substeps: usize,
    /// Contact resolves that failed and were reverted.
    pub resolve_failures: usize,
    /// The frame was rejected and rolled back.
    pub rolled_back: bool,
    /// The entity woke up this frame.
    pub woke: bool,
    /// The entity fell asleep this frame.
    pub fell_asleep: bool,
}

/// Uniform protocol of every entity kind.
pub trait PhysicalEntity: Send + Sync {
    /// World-assigned id.
    fn id(&self) -> EntityId;

    /// Kind name.
    fn kind(&self) -> &'static str;

    /// Advance by `dt` using the worker's scratch.
    fn step(&self, ctx: &mut WorkerContext, env: &StepEnv<'_>, dt: f64) -> StepReport;

    /// Apply a parameter block.
    ///
    /// # Errors
    ///
    /// Rejected blocks leave the entity unchanged.
    fn set_params(&self, params: &Params) -> Result<()>;

    /// Answer a status query.
    ///
    /// # Errors
    ///
    /// Unknown ids and queries the kind does not support.
    fn status(&self, query: &StatusQuery) -> Result<Status>;

    /// Perform an action.
    ///
    /// # Errors
    ///
    /// Unknown ids and actions the kind does not support.
    fn action(&self, action: &Action) -> Result<()>;

    /// Whether the entity is simulated.
    fn is_awake(&self) -> bool;

    /// Whether the entity moves at all.
    fn is_dynamic(&self) -> bool;

    /// World bounds from the last update.
    fn bounding_box(&self) -> Aabb;

    /// Handle to the published poses.
    fn pose_reader(&self) -> PoseReader;
}

/// Closed set of entity kinds.
#[derive(Debug)]
pub enum Entity {
    /// Immovable geometry.
    Static(StaticEntity),
    /// One free rigid body.
    Rigid(RigidEntity),
    /// Joint tree.
    Articulated(ArticulatedEntity),
}

macro_rules! dispatch {
    ($self:ident, $e:ident => $body:expr) => {
        match $self {
            Entity::Static($e) => $body,
            Entity::Rigid($e) => $body,
            Entity::Articulated($e) => $body,
        }
    };
}

impl Entity {
    /// Articulated entity, if this is one.
    #[must_use]
    pub fn as_articulated(&self) -> Option<&ArticulatedEntity> {
        match self {
            Self::Articulated(e) => Some(e),
            _ => None,
        }
    }

    /// Rigid entity, if this is one.
    #[must_use]
    pub fn as_rigid(&self) -> Option<&RigidEntity> {
        match self {
            Self::Rigid(e) => Some(e),
            _ => None,
        }
    }
}

impl PhysicalEntity for Entity {
    fn id(&self) -> EntityId {
        dispatch!(self, e => e.id())
    }

    fn kind(&self) -> &'static str {
        dispatch!(self, e => e.kind())
    }

    fn step(&self, ctx: &mut WorkerContext, env: &StepEnv<'_>, dt: f64) -> StepReport {
        dispatch!(self, e => e.step(ctx, env, dt))
    }

    fn set_params(&self, params: &Params) -> Result<()> {
        dispatch!(self, e => e.set_params(params))
    }

    fn status(&self, query: &StatusQuery) -> Result<Status> {
        dispatch!(self, e => e.status(query))
    }

    fn action(&self, action: &Action) -> Result<()> {
        dispatch!(self, e => e.action(action))
    }

    fn is_awake(&self) -> bool {
        dispatch!(self, e => e.is_awake())
    }

    fn is_dynamic(&self) -> bool {
        dispatch!(self, e => e.is_dynamic())
    }

    fn bounding_box(&self) -> Aabb {
        dispatch!(self, e => e.bounding_box())
    }

    fn pose_reader(&self) -> PoseReader {
        dispatch!(self, e => e.pose_reader())
    }
}

#[derive(Debug, Default)]
struct StaticState {
    pose: Pose,
    parts: Vec<(PartId, Pose)>,
    bbox: Aabb,
}

/// Geometry that never moves; a contact peer for the others.
pub struct StaticEntity {
    id: EntityId,
    geometry: Arc<dyn GeometryProvider>,
    state: RwLock<StaticState>,
    poses: PoseReader,
}

impl std::fmt::Debug for StaticEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticEntity").field("id", &self.id).finish_non_exhaustive()
    }
}

impl StaticEntity {
    /// Static entity at `pose`.
    #[must_use]
    pub fn new(id: EntityId, pose: Pose, geometry: Arc<dyn GeometryProvider>) -> Self {
        let entity = Self {
            id,
            geometry,
            state: RwLock::new(StaticState {
                pose,
                ..Default::default()
            }),
            poses: PoseReader::new(),
        };
        entity.refresh(&mut entity.state.write().unwrap_or_else(PoisonError::into_inner));
        entity
    }

    fn placements(state: &StaticState) -> Vec<PartPlacement> {
        state
            .parts
            .iter()
            .map(|(part, local)| PartPlacement {
                part: *part,
                joint: None,
                pose: state.pose.compose(local),
            })
            .collect()
    }

    fn refresh(&self, state: &mut StaticState) {
        state.bbox = self.geometry.bounding_box(&Self::placements(state));
        self.poses.publish(PoseSnapshot {
            frame: 0,
            time: 0.0,
            bodies: vec![BodyPose {
                joint: None,
                pose: state.pose,
            }],
        });
    }

    fn kind(&self) -> &'static str {
        "static"
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn step(&self, _ctx: &mut WorkerContext, _env: &StepEnv<'_>, _dt: f64) -> StepReport {
        StepReport::default()
    }

    fn set_params(&self, params: &Params) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match params {
            Params::Part(p) => {
                if state.parts.iter().any(|(id, _)| *id == p.part) {
                    return Err(ArticulationError::DuplicatePart(p.part));
                }
                state.parts.push((p.part, p.local));
            }
            Params::Pose(p) => {
                if let Some(position) = p.position {
                    state.pose.position = position;
                }
                if let Some(rotation) = p.rotation {
                    state.pose.rotation = rotation;
                }
            }
            other => return Err(ArticulationError::unsupported(self.kind(), other.name())),
        }
        self.refresh(&mut state);
        Ok(())
    }

    fn status(&self, query: &StatusQuery) -> Result<Status> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match query {
            StatusQuery::Pose => Ok(Status::Pose(PoseStatus {
                pose: state.pose,
                bbox: state.bbox,
            })),
            StatusQuery::Counts => Ok(Status::Counts {
                joints: 0,
                parts: state.parts.len(),
            }),
            StatusQuery::Awake => Ok(Status::Awake(false)),
            _ => Err(ArticulationError::unsupported(self.kind(), "dynamics status")),
        }
    }

    fn action(&self, action: &Action) -> Result<()> {
        match action {
            Action::RemovePart { part } => {
                let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
                let before = state.parts.len();
                state.parts.retain(|(id, _)| id != part);
                if state.parts.len() == before {
                    return Err(ArticulationError::UnknownPart(*part));
                }
                self.refresh(&mut state);
                Ok(())
            }
            // Nothing to wake or reset.
            Action::Awake { .. } | Action::Reset => Ok(()),
            other => Err(ArticulationError::unsupported(self.kind(), other.name())),
        }
    }

    fn is_awake(&self) -> bool {
        false
    }

    fn is_dynamic(&self) -> bool {
        false
    }

    fn bounding_box(&self) -> Aabb {
        self.state.read().unwrap_or_else(PoisonError::into_inner).bbox
    }

    fn pose_reader(&self) -> PoseReader {
        self.poses.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::collaborator::NullGeometry;
    use crate::params::{PartParams, PoseParams};
    use nalgebra::Point3;
    use sim_types::{JointId, MassProperties};

    fn ground() -> Entity {
        Entity::Static(StaticEntity::new(EntityId(1), Pose::identity(), Arc::new(NullGeometry)))
    }

    #[test]
    fn test_static_entity_protocol() {
        let entity = ground();
        assert_eq!(entity.kind(), "static");
        assert!(!entity.is_awake());
        entity
            .set_params(&Params::Part(PartParams::root(
                PartId(3),
                JointId(0),
                Pose::identity(),
                MassProperties::empty(),
            )))
            .unwrap();
        entity
            .set_params(&Params::Pose(PoseParams {
                position: Some(Point3::new(0.0, -1.0, 0.0)),
                rotation: None,
            }))
            .unwrap();

        match entity.status(&StatusQuery::Pose).unwrap() {
            Status::Pose(p) => assert_eq!(p.pose.position, Point3::new(0.0, -1.0, 0.0)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            entity.status(&StatusQuery::Counts).unwrap(),
            Status::Counts { joints: 0, parts: 1 }
        );
        let err = entity.action(&Action::SetVelocity {
            linear: nalgebra::Vector3::x(),
            angular: nalgebra::Vector3::zeros(),
        });
        assert!(matches!(err, Err(ArticulationError::Unsupported { .. })));
        entity.action(&Action::RemovePart { part: PartId(3) }).unwrap();
        assert!(matches!(
            entity.action(&Action::RemovePart { part: PartId(3) }),
            Err(ArticulationError::UnknownPart(_))
        ));
    }

    #[test]
    fn test_step_is_noop() {
        let entity = ground();
        let awake = HashSet::new();
        let mut ctx = WorkerContext::new(0);
        let report = entity.step(&mut ctx, &StepEnv { awake: &awake }, 0.01);
        assert_eq!(report, StepReport::default());
    }
}
