//! Entity registry and the bounded worker pool stepping it.
//!
//! Entities are independent during a step: each one only touches its own
//! state and the worker context handed to it, so awake entities are
//! stepped in parallel with rayon. Every pool thread owns one
//! [`WorkerContext`], selected by `rayon::current_thread_index`; the
//! calling thread uses one extra slot.
//!
//! # Determinism
//!
//! An entity's step is a function of its own state, the geometry provider
//! and the awake set taken at the start of the frame. Worker scratch
//! carries no state across steps, so results do not depend on thread count
//! or scheduling.

use std::sync::{Arc, Mutex, PoisonError};

use hashbrown::{HashMap, HashSet};
use rayon::prelude::*;

use sim_types::{EntityId, Pose, SimulationConfig};

use crate::articulated::ArticulatedEntity;
use crate::collaborator::{GeometryProvider, LifecycleHooks, ListenerId};
use crate::context::WorkerContext;
use crate::entity::{Entity, PhysicalEntity, StaticEntity, StepEnv, StepReport};
use crate::error::{ArticulationError, Result};
use crate::params::{Action, Params, Status, StatusQuery};
use crate::rigid::RigidEntity;
use crate::snapshot::PoseReader;

/// Totals of one world step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorldStepReport {
    /// Entities that simulated at least one substep.
    pub stepped: usize,
    /// Entities woken this frame.
    pub woke: usize,
    /// Entities that fell asleep this frame.
    pub fell_asleep: usize,
    /// Frames rolled back.
    pub rolled_back: usize,
    /// Failed contact resolves.
    pub resolve_failures: usize,
}

impl WorldStepReport {
    fn add(&mut self, report: &StepReport) {
        self.stepped += usize::from(report.substeps > 0);
        self.woke += usize::from(report.woke);
        self.fell_asleep += usize::from(report.fell_asleep);
        self.rolled_back += usize::from(report.rolled_back);
        self.resolve_failures += report.resolve_failures;
    }
}

/// All entities of a scene plus the pool that steps them.
pub struct PhysicsWorld {
    config: SimulationConfig,
    geometry: Arc<dyn GeometryProvider>,
    hooks: Arc<LifecycleHooks>,
    cache_listener: ListenerId,
    pool: rayon::ThreadPool,
    contexts: Vec<Mutex<WorkerContext>>,
    entities: Vec<Entity>,
    index: HashMap<EntityId, usize>,
    next_id: u64,
    frame: u64,
}

impl std::fmt::Debug for PhysicsWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicsWorld")
            .field("entities", &self.entities.len())
            .field("workers", &self.pool.current_num_threads())
            .field("frame", &self.frame)
            .finish_non_exhaustive()
    }
}

impl PhysicsWorld {
    /// Empty world.
    ///
    /// Registers a listener on `hooks` that clears the geometry cache on
    /// host lifecycle events; it is unregistered when the world is dropped.
    ///
    /// # Errors
    ///
    /// Invalid configuration, or a pool that cannot be started.
    pub fn new(
        config: SimulationConfig,
        geometry: Arc<dyn GeometryProvider>,
        hooks: Arc<LifecycleHooks>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parallel.worker_threads)
            .thread_name(|i| format!("sim-worker-{i}"))
            .build()
            .map_err(|e| ArticulationError::WorkerPool(e.to_string()))?;
        let contexts = (0..=pool.current_num_threads())
            .map(|worker| Mutex::new(WorkerContext::new(worker)))
            .collect();

        let cache = Arc::clone(&geometry);
        let cache_listener = hooks.register(move |event| {
            tracing::debug!(?event, "clearing geometry cache");
            cache.clear_cache();
        });

        Ok(Self {
            config,
            geometry,
            hooks,
            cache_listener,
            pool,
            contexts,
            entities: Vec::new(),
            index: HashMap::new(),
            next_id: 1,
            frame: 0,
        })
    }

    /// Configuration new entities start with.
    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Lifecycle hooks the world listens on.
    #[must_use]
    pub fn hooks(&self) -> &Arc<LifecycleHooks> {
        &self.hooks
    }

    /// Worker threads in the pool.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Frames stepped so far.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Number of entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the world has no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn next_id(&mut self) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        id
    }

    fn push(&mut self, entity: Entity) -> EntityId {
        let id = entity.id();
        self.index.insert(id, self.entities.len());
        self.entities.push(entity);
        id
    }

    // ========== Registry ==========

    /// Add an empty articulated entity.
    ///
    /// # Errors
    ///
    /// Invalid world configuration.
    pub fn add_articulated(&mut self) -> Result<EntityId> {
        let id = self.next_id();
        let entity = ArticulatedEntity::new(id, self.config.clone(), Arc::clone(&self.geometry))?;
        Ok(self.push(Entity::Articulated(entity)))
    }

    /// Add a massless rigid entity at `frame`.
    ///
    /// # Errors
    ///
    /// Invalid world configuration.
    pub fn add_rigid(&mut self, frame: Pose) -> Result<EntityId> {
        let id = self.next_id();
        let entity = RigidEntity::new(id, frame, self.config.clone(), Arc::clone(&self.geometry))?;
        Ok(self.push(Entity::Rigid(entity)))
    }

    /// Add a static entity at `pose`.
    pub fn add_static(&mut self, pose: Pose) -> EntityId {
        let id = self.next_id();
        let entity = StaticEntity::new(id, pose, Arc::clone(&self.geometry));
        self.push(Entity::Static(entity))
    }

    /// Remove an entity.
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        let position = self.index.remove(&id)?;
        let entity = self.entities.swap_remove(position);
        if let Some(moved) = self.entities.get(position) {
            self.index.insert(moved.id(), position);
        }
        Some(entity)
    }

    /// Entity by id.
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.index.get(&id).map(|&i| &self.entities[i])
    }

    fn entity(&self, id: EntityId) -> Result<&Entity> {
        self.get(id).ok_or(ArticulationError::UnknownEntity(id))
    }

    /// All entities.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> + '_ {
        self.entities.iter()
    }

    // ========== Protocol ==========

    /// Forward a parameter block.
    ///
    /// # Errors
    ///
    /// Unknown entity, or whatever the entity rejects.
    pub fn set_params(&self, id: EntityId, params: &Params) -> Result<()> {
        self.entity(id)?.set_params(params)
    }

    /// Forward an action.
    ///
    /// # Errors
    ///
    /// Unknown entity, or whatever the entity rejects.
    pub fn action(&self, id: EntityId, action: &Action) -> Result<()> {
        self.entity(id)?.action(action)
    }

    /// Forward a status query.
    ///
    /// # Errors
    ///
    /// Unknown entity, or whatever the entity rejects.
    pub fn status(&self, id: EntityId, query: &StatusQuery) -> Result<Status> {
        self.entity(id)?.status(query)
    }

    /// Published poses of an entity.
    ///
    /// # Errors
    ///
    /// Unknown entity.
    pub fn pose_reader(&self, id: EntityId) -> Result<PoseReader> {
        Ok(self.entity(id)?.pose_reader())
    }

    // ========== Stepping ==========

    /// Step every dynamic entity by `dt`.
    ///
    /// The awake set is taken once up front, so wake checks see the same
    /// neighbours regardless of stepping order.
    pub fn step(&mut self, dt: f64) -> WorldStepReport {
        let awake: HashSet<EntityId> = self
            .entities
            .iter()
            .filter(|e| e.is_dynamic() && e.is_awake())
            .map(PhysicalEntity::id)
            .collect();
        let env = StepEnv { awake: &awake };
        let dynamic: Vec<&Entity> = self.entities.iter().filter(|e| e.is_dynamic()).collect();
        let contexts = &self.contexts;
        let caller_slot = contexts.len() - 1;

        let step_one = |entity: &Entity| {
            let slot = rayon::current_thread_index().map_or(caller_slot, |i| i.min(caller_slot));
            let mut ctx = contexts[slot].lock().unwrap_or_else(PoisonError::into_inner);
            entity.step(&mut ctx, &env, dt)
        };

        let parallel = awake.len() >= self.config.parallel.min_entities_for_parallel
            && self.pool.current_num_threads() > 1;
        let reports: Vec<StepReport> = if parallel {
            self.pool.install(|| dynamic.par_iter().map(|e| step_one(e)).collect())
        } else {
            dynamic.iter().map(|e| step_one(e)).collect()
        };

        self.frame += 1;
        let mut total = WorldStepReport::default();
        for report in &reports {
            total.add(report);
        }
        if total.rolled_back > 0 {
            tracing::warn!(frame = self.frame, rolled_back = total.rolled_back, "entities rolled back");
        }
        total
    }
}

impl Drop for PhysicsWorld {
    fn drop(&mut self) {
        self.hooks.unregister(self.cache_listener);
    }
}
