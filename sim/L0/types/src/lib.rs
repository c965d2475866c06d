//! Core data and math types for articulated rigid-body simulation.
//!
//! This crate provides the foundational layer the articulated solver builds
//! on:
//!
//! - [`Pose`], [`Twist`], [`MassProperties`] - kinematic and inertial data
//! - [`RigidBody`] - a single 6-DOF body with a momentum integrator
//! - [`spatial`] - 6D spatial vectors, inertias and lever-arm shifts
//! - [`SimulationConfig`] - substeps, gravity, solver, sleep and pool settings
//! - [`SimError`] - configuration and validation errors
//!
//! # Layer 0
//!
//! No engine or renderer dependencies. Everything here is plain data plus
//! the arithmetic that belongs to it.
//!
//! # Coordinate System
//!
//! - X: right
//! - Y: forward
//! - Z: up
//! - Right-handed
//!
//! # Example
//!
//! ```
//! use sim_types::{MassProperties, Pose, RigidBody, Twist};
//! use nalgebra::{Point3, Vector3};
//!
//! let mut body = RigidBody::create(
//!     &Pose::from_position(Point3::new(0.0, 0.0, 1.0)),
//!     &MassProperties::sphere(1.0, 0.5),
//! );
//! body.set_velocity(&Twist::new(Vector3::new(1.0, 0.0, 0.0), Vector3::zeros()));
//! body.step(0.5);
//!
//! assert!((body.pos.x - 0.5).abs() < 1e-12);
//! ```

#![doc(html_root_url = "https://docs.rs/sim-types/0.1.0")]
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![warn(missing_docs)]
#![allow(
    clippy::missing_const_for_fn,     // Many methods can't be const due to nalgebra
    clippy::suboptimal_flops,          // mul_add style changes aren't always clearer
    clippy::cast_precision_loss,       // usize to f64 is fine for counts
    clippy::missing_errors_doc,        // Error docs added where non-obvious
    clippy::many_single_char_names,    // p, l, v, w, q follow the physics notation
)]

mod body;
mod config;
mod dynamics;
mod error;
mod ids;
mod rigid_body;
pub mod spatial;

pub use body::{MassProperties, Pose, Twist};
pub use config::{ParallelConfig, SimulationConfig, SleepConfig, SolverConfig};
pub use dynamics::Gravity;
pub use error::SimError;
pub use ids::{EntityId, JointId, PartId};
pub use rigid_body::RigidBody;
pub use spatial::{SpatialMatrix, SpatialVector};

// Re-export math types for convenience
pub use nalgebra::{Matrix3, Point3, UnitQuaternion, Vector3};

/// Result type for simulation operations.
pub type Result<T> = std::result::Result<T, SimError>;
