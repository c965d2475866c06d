//! Benchmarks for the articulated-body passes and pooled stepping.
//!
//! Run with: `cargo bench -p sim-articulated`
//!
//! `featherstone_pass` times one free-motion solve of an n-link chain;
//! `world_step` measures throughput of the worker pool for growing entity
//! counts.

#![allow(
    missing_docs,
    clippy::unwrap_used,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use nalgebra::{Point3, Vector3};
use sim_articulated::featherstone::{
    calc_body_ia, calc_body_za, solve_velocities, update_kinematics, update_velocities,
};
use sim_articulated::{
    ArticulationTree, Joint, JointLink, JointParams, LifecycleHooks, NullGeometry, Params,
    PartParams, PhysicsWorld,
};
use sim_types::{JointId, MassProperties, ParallelConfig, PartId, Pose, RigidBody, SimulationConfig};

/// Chain of `n` unit spheres along +x with a little motion on every joint.
fn chain(n: usize) -> ArticulationTree {
    let mut tree = ArticulationTree::new();
    let props = MassProperties::sphere(1.0, 0.1);
    for i in 0..n {
        let frame = Pose::from_position(Point3::new(i as f64, 0.0, 0.0));
        let link = if i == 0 {
            JointLink::floating_root()
        } else {
            let parent = tree.handle_of(JointId(i as i32 - 1)).unwrap();
            let parent_frame = tree.get(parent).unwrap().frame_pose();
            let mut link = JointLink::child_of(Some(parent), &parent_frame, &frame, &Point3::new(i as f64 - 0.5, 0.0, 0.0));
            link.dq = Vector3::new(0.1, -0.2, 0.3);
            link
        };
        tree.insert(Joint::new(JointId(i as i32), RigidBody::create(&frame, &props), link))
            .unwrap();
    }
    tree
}

fn bench_featherstone_pass(c: &mut Criterion) {
    let gravity = Vector3::new(0.0, 0.0, -9.81);
    let mut group = c.benchmark_group("featherstone_pass");

    for &n in &[2, 8, 32, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let mut tree = chain(n);
            b.iter(|| {
                update_kinematics(&mut tree);
                update_velocities(&mut tree);
                calc_body_ia(&mut tree);
                calc_body_za(&mut tree, &gravity);
                solve_velocities(&mut tree, 1.0 / 240.0, 0.0);
            });
        });
    }

    group.finish();
}

fn bench_world_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_step");

    for &n_entities in &[1, 16, 64, 256] {
        group.bench_with_input(
            BenchmarkId::from_parameter(n_entities),
            &n_entities,
            |b, &n_entities| {
                let config = SimulationConfig::default().parallel(ParallelConfig::default());
                let mut world =
                    PhysicsWorld::new(config, Arc::new(NullGeometry), Arc::new(LifecycleHooks::new())).unwrap();
                let props = MassProperties::sphere(1.0, 0.1);
                for k in 0..n_entities {
                    let id = world.add_articulated().unwrap();
                    let origin = Point3::new(0.0, 3.0 * k as f64, 100.0);
                    for i in 0..8 {
                        let frame = Pose::from_position(origin + Vector3::new(f64::from(i), 0.0, 0.0));
                        let params = if i == 0 {
                            PartParams::root(PartId(i), JointId(i), frame, props)
                        } else {
                            PartParams::child(
                                PartId(i),
                                JointId(i),
                                JointId(i - 1),
                                frame,
                                origin + Vector3::new(f64::from(i) - 0.5, 0.0, 0.0),
                                props,
                            )
                        };
                        world.set_params(id, &Params::Part(params)).unwrap();
                    }
                    world
                        .set_params(id, &Params::Joint(JointParams::new(JointId(3)).rate(1, 0.5)))
                        .unwrap();
                }

                b.iter(|| world.step(1.0 / 60.0));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_featherstone_pass, bench_world_step);
criterion_main!(benches);
