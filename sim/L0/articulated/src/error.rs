//! Error types for articulated entities.

use sim_types::{EntityId, JointId, PartId, SimError};
use thiserror::Error;

/// Errors surfaced to callers of the entity protocol.
///
/// Only configuration, structural and snapshot failures are reported here.
/// Numeric trouble inside a step is recovered locally (epsilon floors,
/// resolve fallback, rollback) and shows up in logs, not as an error.
#[derive(Debug, Error)]
pub enum ArticulationError {
    /// Validation failure from the shared types layer.
    #[error(transparent)]
    Sim(#[from] SimError),

    /// No entity with this id in the world.
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),

    /// No joint with this id in the entity.
    #[error("unknown joint {0}")]
    UnknownJoint(JointId),

    /// A joint with this id already exists.
    #[error("joint {0} already exists")]
    DuplicateJoint(JointId),

    /// Joint cannot be removed while it still has children.
    #[error("joint {id} still has {children} children")]
    HasChildren {
        /// Joint that was asked to go away.
        id: JointId,
        /// Number of direct children.
        children: usize,
    },

    /// No part with this id in the entity.
    #[error("unknown part {0}")]
    UnknownPart(PartId),

    /// A part with this id is already attached.
    #[error("part {0} is already attached")]
    DuplicatePart(PartId),

    /// Grounded trees are anchored to the world and cannot change root.
    #[error("cannot reroot grounded tree at {0}")]
    GroundedReroot(JointId),

    /// A joint handle outlived the joint it pointed to.
    #[error("stale joint handle")]
    StaleHandle,

    /// The entity kind does not understand this request.
    #[error("{request} is not supported by {kind} entities")]
    Unsupported {
        /// Entity kind name.
        kind: &'static str,
        /// Request name.
        request: &'static str,
    },

    /// Snapshot stream does not start with the expected magic.
    #[error("invalid snapshot magic: {0:?}")]
    InvalidSnapshotMagic([u8; 4]),

    /// Snapshot written by an incompatible format version.
    #[error("unsupported snapshot version {found} (expected {expected})")]
    UnsupportedSnapshotVersion {
        /// Version in the stream.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },

    /// Snapshot does not match the entity it is applied to.
    #[error("snapshot mismatch: {0}")]
    SnapshotMismatch(String),

    /// Binary snapshot encode/decode failure.
    #[error("binary snapshot: {0}")]
    Binary(#[from] bincode::Error),

    /// Key/value snapshot encode/decode failure.
    #[error("key/value snapshot: {0}")]
    KeyValue(#[from] serde_json::Error),

    /// Snapshot stream I/O failure.
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),

    /// The worker pool could not be created.
    #[error("worker pool: {0}")]
    WorkerPool(String),
}

impl ArticulationError {
    /// Create an unsupported-request error.
    #[must_use]
    pub fn unsupported(kind: &'static str, request: &'static str) -> Self {
        Self::Unsupported { kind, request }
    }

    /// Whether the request was rejected before touching any state.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        match self {
            Self::Sim(e) => e.is_config_error(),
            Self::UnknownEntity(_)
            | Self::UnknownJoint(_)
            | Self::DuplicateJoint(_)
            | Self::HasChildren { .. }
            | Self::UnknownPart(_)
            | Self::DuplicatePart(_)
            | Self::GroundedReroot(_)
            | Self::Unsupported { .. } => true,
            _ => false,
        }
    }
}

/// Micro-contact solver failure.
///
/// Never leaves the step: the orchestrator reverts the resolve, keeps the
/// entity awake and tries again next frame.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolveError {
    /// Residual stayed above the widened tolerance.
    #[error("no convergence after {iterations} sweeps (residual {residual:.3e}, tolerance {tolerance:.3e})")]
    NotConverged {
        /// Sweeps performed over all attempts.
        iterations: usize,
        /// Worst row error in the final sweep.
        residual: f64,
        /// Final widened tolerance.
        tolerance: f64,
    },

    /// A row produced a non-finite impulse.
    #[error("non-finite impulse on row {row}")]
    NonFinite {
        /// Offending row index.
        row: usize,
    },
}

/// Result type for articulated entity operations.
pub type Result<T> = std::result::Result<T, ArticulationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ArticulationError::HasChildren {
            id: JointId(3),
            children: 2,
        };
        assert!(err.to_string().contains("Joint(3)"));
        assert!(err.is_rejection());

        let err: ArticulationError = SimError::invalid_geometry(1, "bad volume").into();
        assert!(err.to_string().contains("part 1"));
        assert!(err.is_rejection());

        let err = ArticulationError::UnsupportedSnapshotVersion {
            found: 9,
            expected: 1,
        };
        assert!(!err.is_rejection());
        assert!(err.to_string().contains('9'));
    }

    #[test]
    fn test_resolve_error_display() {
        let err = ResolveError::NotConverged {
            iterations: 120,
            residual: 0.5,
            tolerance: 1e-3,
        };
        assert!(err.to_string().contains("120"));
    }
}
