//! Articulated rigid-body dynamics.
//!
//! Trees of rigid bodies connected by three-axis rotational joints, stepped
//! with Featherstone's articulated-body algorithm. Joint limits, locked and
//! prescribed axes, external contacts and impulses are all handled as
//! velocity-level constraints resolved by a projected Gauss-Seidel loop over
//! the articulated inverse mass.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       PhysicsWorld                          │
//! │  Entities + rayon pool, one WorkerContext per thread        │
//! └─────────────────────────┬───────────────────────────────────┘
//!                           │ step(dt)
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ArticulatedEntity                        │
//! │  FK → IA/ZA → free velocities → contacts → resolve          │
//! │  → integrate → limits/gimbal → energy guard → sleep         │
//! └─────────────────────────┬───────────────────────────────────┘
//!                           │ publish
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        PoseReader                           │
//! │  Previous and current pose snapshots for render threads     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Geometry is not owned here. Bounding boxes, overlap queries and contact
//! points come from a [`GeometryProvider`] supplied by the host.
//!
//! # Layer 0 Crate
//!
//! No engine or renderer dependencies. The host drives everything through
//! the parameter, action and status protocol in [`params`].
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use sim_articulated::{
//!     LifecycleHooks, NullGeometry, Params, PartParams, PhysicsWorld, StatusQuery,
//! };
//! use sim_types::{JointId, MassProperties, PartId, Point3, Pose, SimulationConfig};
//!
//! let mut world = PhysicsWorld::new(
//!     SimulationConfig::default(),
//!     Arc::new(NullGeometry),
//!     Arc::new(LifecycleHooks::new()),
//! )?;
//! let ragdoll = world.add_articulated()?;
//! world.set_params(
//!     ragdoll,
//!     &Params::Part(PartParams::root(
//!         PartId(0),
//!         JointId(0),
//!         Pose::from_position(Point3::new(0.0, 0.0, 2.0)),
//!         MassProperties::sphere(5.0, 0.3),
//!     )),
//! )?;
//!
//! for _ in 0..10 {
//!     world.step(1.0 / 60.0);
//! }
//! let poses = world.pose_reader(ragdoll)?.latest();
//! assert!(poses.bodies[0].pose.position.z < 2.0);
//! # Ok::<(), sim_articulated::ArticulationError>(())
//! ```

#![doc(html_root_url = "https://docs.rs/sim-articulated/0.1.0")]
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![warn(missing_docs)]
#![allow(
    clippy::missing_const_for_fn,       // Many methods can't be const due to nalgebra
    clippy::suboptimal_flops,           // mul_add style changes aren't always clearer
    clippy::cast_precision_loss,        // usize to f64 is fine for counts
    clippy::missing_errors_doc,         // Error docs added where non-obvious
    clippy::many_single_char_names,     // p, v, w, q follow the physics notation
    clippy::too_many_lines,             // The substep naturally has many stages
    clippy::needless_range_loop,        // Axis loops index three parallel arrays
    clippy::doc_markdown,               // Not all technical terms need backticks
)]

// Joint model and the tree container
pub mod joint;
pub mod tree;

// Angle bookkeeping, limits and gimbal lock
pub mod limits;

// Featherstone passes and impulse propagation
pub mod featherstone;

// Constraint rows and the PGS resolver
pub mod registrar;
pub mod resolver;

// Energy tracking and sleep
pub mod sleep;

// Per-worker scratch
pub mod context;

// Host-side collaborators: geometry and lifecycle events
pub mod collaborator;

// Entity protocol
pub mod params;
pub mod entity;
pub mod articulated;
pub mod rigid;

// Pose publishing and persistence
pub mod snapshot;

// Registry and worker pool
pub mod world;

mod error;

pub use articulated::ArticulatedEntity;
pub use collaborator::{
    Aabb, ContactPoint, GeometryProvider, HostEvent, LifecycleHooks, ListenerId, NullGeometry,
    PartPlacement,
};
pub use context::{ImpulseScratch, WorkerContext};
pub use entity::{Entity, PhysicalEntity, StaticEntity, StepEnv, StepReport};
pub use error::{ArticulationError, ResolveError, Result};
pub use joint::{AttachedPart, AxisConfig, AxisState, Joint, JointLink, LimitSide};
pub use params::{
    Action, ArticulatedParams, DynamicsStatus, ImpulseAction, JointParams, JointStatus, Params,
    ParentRef, PartParams, PoseParams, PoseStatus, SimulationParams, Status, StatusQuery,
};
pub use registrar::{Constraint, ConstraintKind, ConstraintPeer};
pub use resolver::{ImpulseTarget, ResolveStats};
pub use rigid::RigidEntity;
pub use sleep::SleepTracker;
pub use snapshot::{EntitySnapshot, JointSnapshot, PoseReader, PoseSnapshot};
pub use tree::{ArticulationTree, JointHandle};
pub use world::{PhysicsWorld, WorldStepReport};
