//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use nalgebra::{Point3, Vector3};
use sim_articulated::{
    Aabb, ArticulatedEntity, ContactPoint, GeometryProvider, JointParams, Params, PartParams,
    PartPlacement, StepEnv, StepReport, WorkerContext,
};
use sim_types::{EntityId, JointId, MassProperties, PartId, Pose};

/// Every part is a sphere of `radius` around its placement; the world is
/// a horizontal plane at `height`.
#[derive(Debug, Default)]
pub struct GroundPlane {
    pub height: f64,
    pub radius: f64,
    pub cache_clears: AtomicUsize,
}

impl GroundPlane {
    pub fn new(height: f64, radius: f64) -> Self {
        Self {
            height,
            radius,
            cache_clears: AtomicUsize::new(0),
        }
    }

    pub fn clears(&self) -> usize {
        self.cache_clears.load(Ordering::SeqCst)
    }
}

impl GeometryProvider for GroundPlane {
    fn bounding_box(&self, parts: &[PartPlacement]) -> Aabb {
        parts.iter().fold(Aabb::empty(), |bbox, p| {
            bbox.merge(&Aabb::around(&p.pose.position, self.radius))
        })
    }

    fn query_overlapping(&self, _entity: EntityId, _bbox: &Aabb) -> Vec<EntityId> {
        Vec::new()
    }

    fn detect_contacts(&self, _entity: EntityId, parts: &[PartPlacement], swept: &Aabb, out: &mut Vec<ContactPoint>) {
        if swept.min.z > self.height {
            return;
        }
        for p in parts {
            let c = p.pose.position;
            out.push(ContactPoint {
                point: Vector3::new(c.x, c.y, self.height),
                normal: Vector3::z(),
                penetration: self.height - (c.z - self.radius),
                part: p.part,
                peer: None,
                peer_dynamic: false,
            });
        }
    }

    fn clear_cache(&self) {
        self.cache_clears.fetch_add(1, Ordering::SeqCst);
    }
}

/// One-frame step outside a world.
pub fn step(entity: &ArticulatedEntity, dt: f64) -> StepReport {
    let awake = hashbrown::HashSet::new();
    let mut ctx = WorkerContext::new(0);
    entity.step(&mut ctx, &StepEnv { awake: &awake }, dt)
}

/// Unit-mass sphere used for every link.
pub fn link_props() -> MassProperties {
    MassProperties::sphere(1.0, 0.1)
}

/// Chain of `n` links along +x starting at `origin`, each hinged halfway
/// to its parent. Joint and part ids are `0..n`.
pub fn build_chain(entity: &ArticulatedEntity, n: i32, origin: Point3<f64>) {
    for i in 0..n {
        let frame = Pose::from_position(origin + Vector3::new(f64::from(i), 0.0, 0.0));
        let params = if i == 0 {
            PartParams::root(PartId(i), JointId(i), frame, link_props())
        } else {
            PartParams::child(
                PartId(i),
                JointId(i),
                JointId(i - 1),
                frame,
                origin + Vector3::new(f64::from(i) - 0.5, 0.0, 0.0),
                link_props(),
            )
        };
        entity
            .set_params(&Params::Part(params))
            .unwrap_or_else(|e| panic!("attach {i}: {e}"));
    }
}

/// Pin joint 0 to the world and lock all its axes.
pub fn fix_root(entity: &ArticulatedEntity) {
    entity
        .set_params(&Params::Joint(JointParams::new(JointId(0)).grounded(true).lock_all()))
        .unwrap_or_else(|e| panic!("fix root: {e}"));
}
