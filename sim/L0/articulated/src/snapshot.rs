//! Published poses and persisted entity state.
//!
//! Two unrelated things share the word "snapshot" here:
//!
//! - [`PoseSnapshot`] is what readers (rendering, gameplay) see: body poses
//!   of the last committed frame, swapped in whole under a lock so a reader
//!   never observes half a frame.
//! - [`EntitySnapshot`] is the persisted state of an articulated entity,
//!   written either as a versioned binary stream or as a structured
//!   key/value document.
//!
//! # Binary format
//!
//! 1. **Magic bytes**: `ARTS` (4 bytes)
//! 2. **Version**: `u32` little-endian (4 bytes), currently 1
//! 3. **Flags**: `u32` little-endian (4 bytes), see [`SNAPSHOT_FLAG_CONTACTS`]
//! 4. **Payload**: bincode-encoded [`EntitySnapshot`]
//!
//! The key/value form carries the awake flag, the root pose and velocity
//! and the root joint only; raw contacts are binary-only.

use std::io::{Read, Write};
use std::sync::{Arc, PoisonError, RwLock};

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use sim_types::{JointId, Pose, Twist};

use crate::articulated::ArticulatedEntity;
use crate::collaborator::ContactPoint;
use crate::error::{ArticulationError, Result};

/// Magic bytes identifying a binary entity snapshot.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"ARTS";

/// Current binary snapshot version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Header size in bytes (magic + version + flags).
pub const SNAPSHOT_HEADER_SIZE: usize = 12;

/// Flag bit: the payload carries raw contacts.
pub const SNAPSHOT_FLAG_CONTACTS: u32 = 1;

// ========== Published poses ==========

/// Pose of one body in a published frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BodyPose {
    /// Joint carrying the body, `None` for single-body entities.
    pub joint: Option<JointId>,
    /// Body frame pose.
    pub pose: Pose,
}

/// Body poses of one committed frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseSnapshot {
    /// Frame counter of the entity.
    pub frame: u64,
    /// Simulated time of the entity.
    pub time: f64,
    /// One entry per body, in tree order.
    pub bodies: Vec<BodyPose>,
}

impl PoseSnapshot {
    /// Pose of the body on `joint`.
    #[must_use]
    pub fn pose_of(&self, joint: JointId) -> Option<Pose> {
        self.bodies
            .iter()
            .find(|b| b.joint == Some(joint))
            .map(|b| b.pose)
    }

    /// First body's pose.
    #[must_use]
    pub fn root(&self) -> Option<Pose> {
        self.bodies.first().map(|b| b.pose)
    }

    /// Blend towards `next` by `t` in `[0, 1]`.
    ///
    /// Bodies are matched by position; if the body lists differ (the
    /// structure changed between the frames) `next` is returned unchanged.
    #[must_use]
    pub fn lerp(&self, next: &Self, t: f64) -> Self {
        let same_layout = self.bodies.len() == next.bodies.len()
            && self.bodies.iter().zip(&next.bodies).all(|(a, b)| a.joint == b.joint);
        if !same_layout {
            return next.clone();
        }
        let t = t.clamp(0.0, 1.0);
        Self {
            frame: next.frame,
            time: self.time + (next.time - self.time) * t,
            bodies: self
                .bodies
                .iter()
                .zip(&next.bodies)
                .map(|(a, b)| BodyPose {
                    joint: b.joint,
                    pose: a.pose.lerp(&b.pose, t),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
struct Published {
    previous: PoseSnapshot,
    current: PoseSnapshot,
}

/// Cloneable read handle on an entity's published poses.
#[derive(Debug, Clone, Default)]
pub struct PoseReader {
    inner: Arc<RwLock<Published>>,
}

impl PoseReader {
    /// Reader with nothing published yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame; the old one becomes the previous frame.
    pub(crate) fn publish(&self, snapshot: PoseSnapshot) {
        let mut published = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        published.previous = std::mem::replace(&mut published.current, snapshot);
    }

    /// Latest committed frame.
    #[must_use]
    pub fn latest(&self) -> PoseSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone()
    }

    /// Frame counter of the latest committed frame.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).current.frame
    }

    /// Poses between the previous and the latest frame; `alpha = 1` is the
    /// latest frame.
    #[must_use]
    pub fn interpolated(&self, alpha: f64) -> PoseSnapshot {
        let published = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        published.previous.lerp(&published.current, alpha)
    }
}

// ========== Persisted state ==========

/// Persisted state of one joint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointSnapshot {
    /// Joint id.
    pub id: JointId,
    /// Angles.
    pub angles: Vector3<f64>,
    /// Joint rates.
    pub velocity: Vector3<f64>,
    /// Home orientation, present when it changed since creation.
    pub reference: Option<UnitQuaternion<f64>>,
    /// Body momentum `(p, L)`, present for bodies with mass.
    pub momentum: Option<(Vector3<f64>, Vector3<f64>)>,
}

/// Persisted state of an articulated entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Awake flag.
    pub awake: bool,
    /// Body frame pose of the first root.
    pub root_pose: Pose,
    /// Velocity of the first root.
    pub root_twist: Twist,
    /// Joints in tree order.
    pub joints: Vec<JointSnapshot>,
    /// Contacts of the last step.
    pub contacts: Vec<ContactPoint>,
}

/// Binary snapshot header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    /// Magic bytes (must be `ARTS`).
    pub magic: [u8; 4],
    /// Format version.
    pub version: u32,
    /// Flag bits.
    pub flags: u32,
}

impl SnapshotHeader {
    /// Header for the current version.
    #[must_use]
    pub fn new(flags: u32) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: SNAPSHOT_VERSION,
            flags,
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.flags.to_le_bytes())?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        let mut word = [0u8; 4];
        reader.read_exact(&mut word)?;
        let version = u32::from_le_bytes(word);
        reader.read_exact(&mut word)?;
        let flags = u32::from_le_bytes(word);
        Ok(Self {
            magic,
            version,
            flags,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(ArticulationError::InvalidSnapshotMagic(self.magic));
        }
        if self.version != SNAPSHOT_VERSION {
            tracing::warn!(
                found = self.version,
                expected = SNAPSHOT_VERSION,
                "snapshot version mismatch"
            );
            return Err(ArticulationError::UnsupportedSnapshotVersion {
                found: self.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        Ok(())
    }
}

/// Write `snapshot` as a binary stream.
///
/// # Errors
///
/// I/O and encoding failures.
pub fn write_binary<W: Write>(snapshot: &EntitySnapshot, writer: &mut W) -> Result<()> {
    let flags = if snapshot.contacts.is_empty() {
        0
    } else {
        SNAPSHOT_FLAG_CONTACTS
    };
    SnapshotHeader::new(flags).write_to(writer)?;
    bincode::serialize_into(writer, snapshot)?;
    Ok(())
}

/// Binary stream of `snapshot` as bytes.
///
/// # Errors
///
/// Encoding failures.
pub fn to_binary(snapshot: &EntitySnapshot) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + 64 * snapshot.joints.len());
    write_binary(snapshot, &mut bytes)?;
    Ok(bytes)
}

/// Read a binary stream written by [`write_binary`].
///
/// # Errors
///
/// Bad magic, other versions, truncated or corrupt payloads.
pub fn read_binary<R: Read>(reader: &mut R) -> Result<EntitySnapshot> {
    let header = SnapshotHeader::read_from(reader)?;
    header.validate()?;
    let mut snapshot: EntitySnapshot = bincode::deserialize_from(reader)?;
    if header.flags & SNAPSHOT_FLAG_CONTACTS == 0 {
        snapshot.contacts.clear();
    }
    Ok(snapshot)
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyValueSnapshot {
    awake: bool,
    root_pose: Pose,
    root_velocity: Twist,
    root_joint: Option<JointSnapshot>,
}

/// Structured key/value document of `snapshot` (root joint only).
///
/// # Errors
///
/// Encoding failures.
pub fn to_key_value(snapshot: &EntitySnapshot) -> Result<String> {
    let document = KeyValueSnapshot {
        awake: snapshot.awake,
        root_pose: snapshot.root_pose,
        root_velocity: snapshot.root_twist,
        root_joint: snapshot.joints.first().cloned(),
    };
    Ok(serde_json::to_string_pretty(&document)?)
}

/// Parse a document written by [`to_key_value`].
///
/// # Errors
///
/// Malformed documents.
pub fn from_key_value(text: &str) -> Result<EntitySnapshot> {
    let document: KeyValueSnapshot = serde_json::from_str(text)?;
    Ok(EntitySnapshot {
        awake: document.awake,
        root_pose: document.root_pose,
        root_twist: document.root_velocity,
        joints: document.root_joint.into_iter().collect(),
        contacts: Vec::new(),
    })
}

/// Parse a key/value document and apply it to `entity`.
///
/// # Errors
///
/// Malformed documents, or a root joint the entity does not have.
pub fn apply_key_value(entity: &ArticulatedEntity, text: &str) -> Result<()> {
    entity.restore(&from_key_value(text)?)
}
