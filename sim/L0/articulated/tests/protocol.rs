//! Parameter, action, status and snapshot protocol of articulated entities.

#![allow(
    clippy::unwrap_used,
    clippy::float_cmp,
    clippy::panic,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

mod common;

use std::sync::Arc;

use approx::assert_relative_eq;
use nalgebra::{Matrix3, Point3, UnitQuaternion, Vector3};
use sim_articulated::snapshot::{apply_key_value, read_binary, to_binary, to_key_value};
use sim_articulated::{
    Action, ArticulatedEntity, ArticulatedParams, ArticulationError, JointParams, JointStatus,
    NullGeometry, Params, PartParams, PoseParams, Status, StatusQuery,
};
use sim_types::{EntityId, JointId, MassProperties, PartId, Pose, SimulationConfig, SleepConfig};

use common::{build_chain, fix_root, link_props, step};

fn entity(config: SimulationConfig) -> ArticulatedEntity {
    ArticulatedEntity::new(EntityId(3), config, Arc::new(NullGeometry)).unwrap()
}

fn joint(e: &ArticulatedEntity, id: i32) -> JointStatus {
    match e.status(&StatusQuery::Joint(JointId(id))).unwrap() {
        Status::Joint(j) => j,
        other => panic!("unexpected {other:?}"),
    }
}

fn counts(e: &ArticulatedEntity) -> (usize, usize) {
    match e.status(&StatusQuery::Counts).unwrap() {
        Status::Counts { joints, parts } => (joints, parts),
        other => panic!("unexpected {other:?}"),
    }
}

fn awake(e: &ArticulatedEntity) -> bool {
    match e.status(&StatusQuery::Awake).unwrap() {
        Status::Awake(a) => a,
        other => panic!("unexpected {other:?}"),
    }
}

// ========== Attach ==========

#[test]
fn massive_part_without_volume_is_rejected() {
    let e = entity(SimulationConfig::default());
    build_chain(&e, 2, Point3::origin());
    let before = e.snapshot();
    let flat = MassProperties::new(1.0, 0.0, Vector3::zeros(), Matrix3::identity() * 0.01);

    // On an existing joint.
    let err = e
        .set_params(&Params::Part(PartParams::root(PartId(10), JointId(1), Pose::identity(), flat)))
        .unwrap_err();
    assert!(err.is_rejection());
    // On a joint that would be created for it.
    let err = e
        .set_params(&Params::Part(PartParams::child(
            PartId(11),
            JointId(2),
            JointId(1),
            Pose::from_position(Point3::new(2.0, 0.0, 0.0)),
            Point3::new(1.5, 0.0, 0.0),
            flat,
        )))
        .unwrap_err();
    assert!(matches!(err, ArticulationError::Sim(_)));

    assert_eq!(counts(&e), (2, 2));
    assert_eq!(e.snapshot(), before);
}

#[test]
fn duplicate_part_and_unknown_parent_are_rejected() {
    let e = entity(SimulationConfig::default());
    build_chain(&e, 2, Point3::origin());
    let props = MassProperties::sphere(1.0, 0.1);
    assert!(matches!(
        e.set_params(&Params::Part(PartParams::root(PartId(1), JointId(0), Pose::identity(), props))),
        Err(ArticulationError::DuplicatePart(_))
    ));
    assert!(matches!(
        e.set_params(&Params::Part(PartParams::child(
            PartId(5),
            JointId(5),
            JointId(42),
            Pose::identity(),
            Point3::origin(),
            props,
        ))),
        Err(ArticulationError::UnknownJoint(_))
    ));
    assert_eq!(counts(&e), (2, 2));
}

// ========== Reroot ==========

#[test]
fn reroot_and_back_restores_structure() {
    let e = entity(SimulationConfig::default());
    build_chain(&e, 4, Point3::new(0.0, 0.0, 1.0));
    let before: Vec<_> = (0..4).map(|id| joint(&e, id)).collect();

    e.set_params(&Params::Articulated(ArticulatedParams { reroot: Some(JointId(3)) }))
        .unwrap();
    assert_eq!(joint(&e, 3).parent, None);
    assert_eq!(joint(&e, 2).parent, Some(JointId(3)));
    assert_eq!(joint(&e, 0).parent, Some(JointId(1)));

    e.set_params(&Params::Articulated(ArticulatedParams { reroot: Some(JointId(0)) }))
        .unwrap();
    for (id, b) in before.iter().enumerate() {
        let a = joint(&e, id as i32);
        assert_eq!(a.parent, b.parent);
        assert_relative_eq!(a.pivot, b.pivot, epsilon = 1e-9);
        assert_relative_eq!(a.pose.position, b.pose.position, epsilon = 1e-9);
    }
}

#[test]
fn grounded_tree_cannot_be_rerooted() {
    let e = entity(SimulationConfig::default());
    build_chain(&e, 2, Point3::origin());
    e.set_params(&Params::Joint(JointParams::new(JointId(0)).grounded(true)))
        .unwrap();
    assert!(joint(&e, 0).grounded);
    assert!(matches!(
        e.set_params(&Params::Articulated(ArticulatedParams { reroot: Some(JointId(1)) })),
        Err(ArticulationError::GroundedReroot(_))
    ));
    // Grounding a child is not a thing.
    assert!(e
        .set_params(&Params::Joint(JointParams::new(JointId(1)).grounded(true)))
        .is_err());
}

#[test]
fn massless_joint_cannot_become_root() {
    let e = entity(SimulationConfig::default());
    build_chain(&e, 2, Point3::origin());
    e.set_params(&Params::Part(PartParams::child(
        PartId(9),
        JointId(9),
        JointId(1),
        Pose::from_position(Point3::new(2.0, 0.0, 0.0)),
        Point3::new(1.5, 0.0, 0.0),
        MassProperties::sphere(0.0, 0.1),
    )))
    .unwrap();
    assert!(matches!(
        e.set_params(&Params::Articulated(ArticulatedParams { reroot: Some(JointId(9)) })),
        Err(ArticulationError::Unsupported { .. })
    ));
    assert_eq!(joint(&e, 0).parent, None);
    assert_eq!(joint(&e, 9).parent, Some(JointId(1)));
}

// ========== Actions ==========

#[test]
fn joint_velocity_on_floating_root_is_rejected() {
    let e = entity(SimulationConfig::default().zero_gravity());
    build_chain(&e, 2, Point3::origin());
    let request = |id| Action::SetJointVelocity {
        joint: JointId(id),
        velocity: [None, None, Some(1.5)],
    };
    assert!(matches!(
        e.action(&request(0)),
        Err(ArticulationError::Unsupported { .. })
    ));

    // A hinge below the root takes the request on the next step.
    e.action(&request(1)).unwrap();
    step(&e, 1.0 / 240.0);
    assert!(joint(&e, 1).velocity.z > 1.0);
}

#[test]
fn moving_grounded_tree_keeps_snapshots_in_step() {
    let e = entity(SimulationConfig::default().zero_gravity());
    build_chain(&e, 2, Point3::origin());
    fix_root(&e);
    let turn = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.5);
    e.set_params(&Params::Pose(PoseParams {
        position: None,
        rotation: Some(turn),
    }))
    .unwrap();
    step(&e, 1.0 / 60.0);
    assert_relative_eq!(joint(&e, 0).pose.rotation.angle_to(&turn), 0.0, epsilon = 1e-9);

    let snapshot = e.snapshot();
    assert!(snapshot.joints[0].reference.is_some());

    let copy = entity(SimulationConfig::default().zero_gravity());
    build_chain(&copy, 2, Point3::origin());
    fix_root(&copy);
    copy.restore(&snapshot).unwrap();
    for id in 0..2 {
        let (a, b) = (joint(&e, id), joint(&copy, id));
        assert_relative_eq!(a.pose.rotation.angle_to(&b.pose.rotation), 0.0, epsilon = 1e-9);
        assert_relative_eq!(a.pose.position, b.pose.position, epsilon = 1e-9);
    }
}

// ========== Sleep ==========

#[test]
fn calm_entity_sleeps_and_zeroes_velocities() {
    let config = SimulationConfig::default()
        .zero_gravity()
        .sleep(SleepConfig::default().sleep_frames(5));
    let e = entity(config);
    build_chain(&e, 2, Point3::origin());
    e.action(&Action::SetVelocity {
        linear: Vector3::new(0.01, 0.0, 0.0),
        angular: Vector3::zeros(),
    })
    .unwrap();
    e.set_params(&Params::Joint(JointParams::new(JointId(1)).rate(2, 0.05)))
        .unwrap();
    assert!(awake(&e));

    let mut fell_asleep = false;
    for _ in 0..10 {
        fell_asleep |= step(&e, 0.01).fell_asleep;
    }
    assert!(fell_asleep);
    assert!(!awake(&e));
    assert_eq!(joint(&e, 1).velocity, Vector3::zeros());
    match e.status(&StatusQuery::Dynamics { joint: None }).unwrap() {
        Status::Dynamics(d) => {
            assert_eq!(d.velocity, Vector3::zeros());
            assert_eq!(d.angular_velocity, Vector3::zeros());
            assert_eq!(d.energy, 0.0);
            assert!(!d.awake);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Sleeping entities do not move.
    let pose = joint(&e, 0).pose;
    assert_eq!(step(&e, 0.01).substeps, 0);
    assert_eq!(joint(&e, 0).pose, pose);

    e.action(&Action::Awake { awake: true }).unwrap();
    assert!(awake(&e));
}

#[test]
fn forced_sleep_and_reset() {
    let e = entity(SimulationConfig::default());
    build_chain(&e, 2, Point3::origin());
    e.action(&Action::SetVelocity {
        linear: Vector3::new(3.0, 0.0, 0.0),
        angular: Vector3::new(0.0, 0.0, 1.0),
    })
    .unwrap();
    assert!(e.kinetic_energy() > 0.0);

    e.action(&Action::Awake { awake: false }).unwrap();
    assert!(!awake(&e));
    assert_eq!(e.kinetic_energy(), 0.0);

    e.action(&Action::SetVelocity {
        linear: Vector3::new(3.0, 0.0, 0.0),
        angular: Vector3::zeros(),
    })
    .unwrap();
    assert!(awake(&e));
    e.action(&Action::Reset).unwrap();
    assert_eq!(e.kinetic_energy(), 0.0);
}

// ========== Part removal ==========

#[test]
fn removing_the_root_part_hands_the_tree_to_a_child() {
    let e = entity(SimulationConfig::default());
    build_chain(&e, 3, Point3::new(0.0, 0.0, 5.0));
    e.action(&Action::RemovePart { part: PartId(0) }).unwrap();

    // The emptied root is dropped and its child carries the tree.
    assert_eq!(counts(&e), (2, 2));
    assert!(e.status(&StatusQuery::Joint(JointId(0))).is_err());
    assert_eq!(joint(&e, 1).parent, None);
    assert_eq!(joint(&e, 2).parent, Some(JointId(1)));
}

#[test]
fn massless_root_with_children_is_promoted_on_attach() {
    let e = entity(SimulationConfig::default());
    e.set_params(&Params::Part(PartParams::root(
        PartId(0),
        JointId(0),
        Pose::from_position(Point3::new(0.0, 0.0, 5.0)),
        MassProperties::sphere(0.0, 0.1),
    )))
    .unwrap();
    e.set_params(&Params::Part(PartParams::child(
        PartId(1),
        JointId(1),
        JointId(0),
        Pose::from_position(Point3::new(1.0, 0.0, 5.0)),
        Point3::new(0.5, 0.0, 5.0),
        link_props(),
    )))
    .unwrap();

    // The massless joint keeps its part and hangs from the massive one.
    assert_eq!(counts(&e), (2, 2));
    assert_eq!(joint(&e, 1).parent, None);
    assert_eq!(joint(&e, 0).parent, Some(JointId(1)));
    assert_relative_eq!(joint(&e, 0).pose.position, Point3::new(0.0, 0.0, 5.0), epsilon = 1e-9);
}

// ========== Snapshots ==========

fn moving_chain() -> ArticulatedEntity {
    let e = entity(SimulationConfig::default().sleep(SleepConfig::disabled()));
    build_chain(&e, 3, Point3::new(0.0, 0.0, 5.0));
    e.set_params(&Params::Joint(JointParams::new(JointId(1)).rate(1, 0.8)))
        .unwrap();
    e.set_params(&Params::Joint(JointParams::new(JointId(2)).rate(2, -0.6)))
        .unwrap();
    for _ in 0..10 {
        step(&e, 1.0 / 60.0);
    }
    e
}

#[test]
fn binary_snapshot_restores_another_entity() {
    let source = moving_chain();
    let snapshot = source.snapshot();
    let bytes = to_binary(&snapshot).unwrap();
    let decoded = read_binary(&mut bytes.as_slice()).unwrap();
    assert_eq!(decoded, snapshot);

    let target = entity(SimulationConfig::default().sleep(SleepConfig::disabled()));
    build_chain(&target, 3, Point3::new(0.0, 0.0, 5.0));
    target.restore(&decoded).unwrap();

    for id in 0..3 {
        let (a, b) = (joint(&source, id), joint(&target, id));
        assert_eq!(a.angles, b.angles);
        assert_eq!(a.velocity, b.velocity);
        assert_relative_eq!(a.pose.position, b.pose.position, epsilon = 1e-9);
    }
    assert_relative_eq!(source.kinetic_energy(), target.kinetic_energy(), epsilon = 1e-9);
}

#[test]
fn key_value_snapshot_carries_root_only() {
    let source = moving_chain();
    let text = to_key_value(&source.snapshot()).unwrap();

    let target = entity(SimulationConfig::default());
    build_chain(&target, 3, Point3::new(0.0, 0.0, 5.0));
    apply_key_value(&target, &text).unwrap();

    let (a, b) = (joint(&source, 0), joint(&target, 0));
    assert_relative_eq!(a.pose.position, b.pose.position, epsilon = 1e-9);
    assert_eq!(a.angles, b.angles);
    // Child joints are not part of the document.
    assert_eq!(joint(&target, 1).angles, Vector3::zeros());
    assert_eq!(joint(&target, 1).velocity, Vector3::zeros());
}

#[test]
fn snapshot_for_other_layout_is_rejected() {
    let source = moving_chain();
    let target = entity(SimulationConfig::default());
    build_chain(&target, 2, Point3::origin());
    let before = target.snapshot();
    assert!(matches!(
        target.restore(&source.snapshot()),
        Err(ArticulationError::SnapshotMismatch(_))
    ));
    assert_eq!(target.snapshot(), before);
}
