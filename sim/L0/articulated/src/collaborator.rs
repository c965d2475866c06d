//! Interfaces to the collision/geometry pipeline and the host application.
//!
//! The dynamics core never looks at shapes. It asks a [`GeometryProvider`]
//! for bounding boxes, overlapping entities and contact points, and it
//! reacts to [`HostEvent`]s through [`LifecycleHooks`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use sim_types::{EntityId, JointId, PartId, Pose};

/// Axis-aligned bounding box in world space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    /// Minimum corner.
    pub min: Point3<f64>,
    /// Maximum corner.
    pub max: Point3<f64>,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::empty()
    }
}

impl Aabb {
    /// Box from corners.
    #[must_use]
    pub const fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        Self { min, max }
    }

    /// Inverted box that any `grow` replaces.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            min: Point3::from(Vector3::repeat(f64::INFINITY)),
            max: Point3::from(Vector3::repeat(f64::NEG_INFINITY)),
        }
    }

    /// Cube of half extent `radius` around `center`.
    #[must_use]
    pub fn around(center: &Point3<f64>, radius: f64) -> Self {
        let r = Vector3::repeat(radius);
        Self::new(center - r, center + r)
    }

    /// Whether the box contains nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Union with another box.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        Self::new(self.min.inf(&other.min), self.max.sup(&other.max))
    }

    /// Grown by `margin` on every side.
    #[must_use]
    pub fn inflate(&self, margin: f64) -> Self {
        let m = Vector3::repeat(margin);
        Self::new(self.min - m, self.max + m)
    }

    /// Volume covering this box and its translation by `delta`.
    #[must_use]
    pub fn swept(&self, delta: &Vector3<f64>) -> Self {
        self.merge(&Self::new(self.min + delta, self.max + delta))
    }

    /// Whether the two boxes intersect (touching counts).
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }
}

/// World placement of one geometry part.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartPlacement {
    /// Part id.
    pub part: PartId,
    /// Joint carrying the part, `None` for non-articulated entities.
    pub joint: Option<JointId>,
    /// World pose of the part.
    pub pose: Pose,
}

/// One contact point reported by the geometry pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContactPoint {
    /// World contact point.
    pub point: Vector3<f64>,
    /// Unit normal pointing out of the peer, into this entity.
    pub normal: Vector3<f64>,
    /// Penetration depth, positive when overlapping.
    pub penetration: f64,
    /// Part of this entity in contact.
    pub part: PartId,
    /// Other entity, `None` for world geometry.
    pub peer: Option<EntityId>,
    /// Whether the peer moves.
    pub peer_dynamic: bool,
}

/// Geometry queries the dynamics core depends on.
///
/// Implementations must be callable from any worker thread.
pub trait GeometryProvider: Send + Sync {
    /// Bounding box of a set of placed parts.
    fn bounding_box(&self, parts: &[PartPlacement]) -> Aabb;

    /// Entities other than `entity` whose bounds overlap `bbox`.
    fn query_overlapping(&self, entity: EntityId, bbox: &Aabb) -> Vec<EntityId>;

    /// Append contacts of `parts` against everything inside `swept`.
    fn detect_contacts(&self, entity: EntityId, parts: &[PartPlacement], swept: &Aabb, out: &mut Vec<ContactPoint>);

    /// Drop cached geometry. Called on host lifecycle events.
    fn clear_cache(&self) {}
}

/// Provider with no geometry: empty boxes, no contacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullGeometry;

impl GeometryProvider for NullGeometry {
    fn bounding_box(&self, parts: &[PartPlacement]) -> Aabb {
        parts.iter().fold(Aabb::empty(), |bbox, p| {
            bbox.merge(&Aabb::around(&p.pose.position, 0.0))
        })
    }

    fn query_overlapping(&self, _entity: EntityId, _bbox: &Aabb) -> Vec<EntityId> {
        Vec::new()
    }

    fn detect_contacts(&self, _: EntityId, _: &[PartPlacement], _: &Aabb, _: &mut Vec<ContactPoint>) {}
}

/// Host application events relevant to cached geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostEvent {
    /// A level finished loading.
    LevelLoadEnd,
    /// The renderer is being torn down.
    RendererTeardown,
}

/// Registration token returned by [`LifecycleHooks::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn Fn(HostEvent) + Send + Sync>;

/// Registry of host-event listeners.
#[derive(Default)]
pub struct LifecycleHooks {
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next: AtomicU64,
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("listeners", &self.len())
            .finish_non_exhaustive()
    }
}

impl LifecycleHooks {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener.
    pub fn register(&self, listener: impl Fn(HostEvent) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    /// Deliver an event to every listener. Returns how many ran.
    pub fn dispatch(&self, event: HostEvent) -> usize {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, listener) in listeners.iter() {
            listener(event);
        }
        tracing::debug!(?event, listeners = listeners.len(), "host event dispatched");
        listeners.len()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
