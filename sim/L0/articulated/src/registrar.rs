//! Constraint registration: pivots, locked axes, limits and contacts as one
//! list of scalar velocity rows.
//!
//! Every row measures one velocity `v` and asks for `v ≥ vreq`
//! (unilateral) or `v = vreq` (bilateral). Rows are built per joint,
//! measured against the current factorisation, and dropped when the
//! mechanism cannot move along them. In reduced coordinates pivot and
//! locked-axis rows are satisfied by construction: their response is zero
//! without measuring, so they cost nothing beyond registration.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use sim_types::{EntityId, SolverConfig};

use crate::collaborator::ContactPoint;
use crate::joint::{AxisState, LimitSide};
use crate::resolver::ImpulseTarget;
use crate::tree::ArticulationTree;

/// Rows with a unit-impulse response below this are never solved.
pub const MIN_ROW_RESPONSE: f64 = 1e-12;

/// What a contact row pushes against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintPeer {
    /// Static world geometry.
    World,
    /// Another entity.
    Entity {
        /// Peer id.
        id: EntityId,
        /// Whether the peer moves.
        dynamic: bool,
    },
}

impl ConstraintPeer {
    /// Whether the peer is a moving entity.
    #[must_use]
    pub fn is_dynamic(self) -> bool {
        matches!(self, Self::Entity { dynamic: true, .. })
    }
}

/// Row classification and the data to measure it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ConstraintKind {
    /// Non-penetration at a contact point along the normal.
    Contact {
        /// Contact partner.
        peer: ConstraintPeer,
        /// Penetration depth at registration.
        penetration: f64,
    },
    /// Relative velocity of body and parent at the pivot along one world
    /// direction.
    Pivot,
    /// Joint rate on a locked axis.
    LockedAxis {
        /// Axis index.
        axis: usize,
    },
    /// Joint rate on an axis resting at a bound, measured inward.
    Limit {
        /// Axis index.
        axis: usize,
        /// Bound being held.
        side: LimitSide,
    },
}

/// One scalar constraint row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// Row kind.
    pub kind: ConstraintKind,
    /// Order position of the joint the row acts on.
    pub pos: usize,
    /// Order position of the parent joint for pivot rows.
    pub parent: Option<usize>,
    /// Application point minus the body's centre of mass.
    pub arm: Vector3<f64>,
    /// Application point minus the parent's centre of mass.
    pub parent_arm: Vector3<f64>,
    /// Unit row direction (linear rows).
    pub direction: Vector3<f64>,
    /// Required row velocity.
    pub vreq: f64,
    /// Velocity change per unit impulse on this row.
    pub response: f64,
    /// Accumulated impulse.
    pub impulse: f64,
}

impl Constraint {
    fn new(kind: ConstraintKind, pos: usize) -> Self {
        Self {
            kind,
            pos,
            parent: None,
            arm: Vector3::zeros(),
            parent_arm: Vector3::zeros(),
            direction: Vector3::zeros(),
            vreq: 0.0,
            response: 0.0,
            impulse: 0.0,
        }
    }

    /// Contact row at `arm` from the body's centre of mass.
    #[must_use]
    pub fn contact(pos: usize, contact: &ContactPoint, arm: Vector3<f64>, cfg: &SolverConfig, dt: f64) -> Self {
        let peer = match contact.peer {
            Some(id) => ConstraintPeer::Entity {
                id,
                dynamic: contact.peer_dynamic,
            },
            None => ConstraintPeer::World,
        };
        let unproject = if contact.penetration > 0.0 && dt > 0.0 {
            (contact.penetration * cfg.penetration_rate / dt).min(cfg.max_unproj_vel)
        } else {
            0.0
        };
        Self {
            arm,
            direction: contact.normal,
            vreq: unproject,
            ..Self::new(
                ConstraintKind::Contact {
                    peer,
                    penetration: contact.penetration,
                },
                pos,
            )
        }
    }

    /// Whether the row only pushes (`impulse ≥ 0`).
    #[must_use]
    pub fn is_unilateral(&self) -> bool {
        matches!(self.kind, ConstraintKind::Contact { .. } | ConstraintKind::Limit { .. })
    }

    /// Whether the row acts on joint rotation rather than a point.
    #[must_use]
    pub fn is_angular(&self) -> bool {
        matches!(self.kind, ConstraintKind::LockedAxis { .. } | ConstraintKind::Limit { .. })
    }

    /// Whether the joint parameterisation already holds the row exactly,
    /// so no impulse can change its velocity.
    #[must_use]
    pub fn is_held_by_joint(&self) -> bool {
        matches!(self.kind, ConstraintKind::Pivot | ConstraintKind::LockedAxis { .. })
    }

    /// Joint axis and sign for joint-space rows.
    #[must_use]
    pub fn joint_axis(&self) -> Option<(usize, f64)> {
        match self.kind {
            ConstraintKind::LockedAxis { axis } => Some((axis, 1.0)),
            ConstraintKind::Limit { axis, side } => Some((axis, -side.outward_sign())),
            _ => None,
        }
    }
}

/// A contact mapped to the joint whose body carries the touching part.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssignedContact {
    /// Order position of the joint.
    pub pos: usize,
    /// The contact.
    pub contact: ContactPoint,
}

/// Map contacts to joints by part id and refresh per-joint contact counts.
///
/// Contacts on parts no joint carries are dropped.
pub fn assign_contacts_to_joints(
    tree: &mut ArticulationTree,
    contacts: &[ContactPoint],
    out: &mut Vec<AssignedContact>,
) {
    for joint in tree.iter_mut() {
        joint.contacts = 0;
    }
    for contact in contacts {
        let found = (0..tree.len()).find(|&pos| tree.at(pos).part(contact.part).is_some());
        match found {
            Some(pos) => {
                tree.at_mut(pos).contacts += 1;
                out.push(AssignedContact {
                    pos,
                    contact: *contact,
                });
            }
            None => tracing::debug!(part = %contact.part, "contact on unknown part dropped"),
        }
    }
}

/// Build the rows of one step into `out`.
///
/// Per non-floating joint: three pivot rows and one row per locked axis;
/// per limit-reached axis a unilateral limit row whose required velocity
/// bounces the current outward rate by the axis bounciness; per assigned
/// contact a unilateral contact row that pushes penetration out at
/// `penetration · rate / dt`, capped at `max_unproj_vel`. Contacts
/// separated by more than `contact_tolerance` are ignored.
///
/// Rows are unmeasured; run [`prune_rows`] before solving.
pub fn register_constraints(
    tree: &ArticulationTree,
    assigned: &[AssignedContact],
    cfg: &SolverConfig,
    dt: f64,
    out: &mut Vec<Constraint>,
) {
    for pos in 0..tree.len() {
        let joint = tree.at(pos);
        if joint.link.is_floating_root() {
            continue;
        }

        let parent = tree.parent_pos(pos);
        let pivot = joint.pivot_world;
        let arm = pivot - joint.body.pos;
        let parent_arm = parent.map_or_else(Vector3::zeros, |p| pivot - tree.at(p).body.pos);
        for direction in [Vector3::x(), Vector3::y(), Vector3::z()] {
            out.push(Constraint {
                parent,
                arm,
                parent_arm,
                direction,
                ..Constraint::new(ConstraintKind::Pivot, pos)
            });
        }

        for (axis, cfg_axis) in joint.link.axes.iter().enumerate() {
            match cfg_axis.state {
                AxisState::Locked => out.push(Constraint::new(ConstraintKind::LockedAxis { axis }, pos)),
                AxisState::LimitReached(side) => {
                    let outward = joint.link.dq[axis] * side.outward_sign();
                    out.push(Constraint {
                        vreq: cfg_axis.bounciness * outward.max(0.0),
                        ..Constraint::new(ConstraintKind::Limit { axis, side }, pos)
                    });
                }
                AxisState::Free | AxisState::GimbalLocked => {}
            }
        }
    }

    for assigned in assigned {
        if assigned.contact.penetration < -cfg.contact_tolerance {
            continue;
        }
        let joint = tree.at(assigned.pos);
        let arm = assigned.contact.point - joint.body.pos;
        out.push(Constraint::contact(assigned.pos, &assigned.contact, arm, cfg, dt));
    }
}

/// Measure the response of `rows[start..]` and drop rows that cannot be
/// solved: responses below [`MIN_ROW_RESPONSE`], and angular rows whose
/// response is below `min_response_ratio` times the body's inverse mass.
/// Rows held by the joint are dropped without a measurement, so only limit
/// and contact rows pay for an impulse propagation. Returns the number of
/// rows dropped.
pub fn prune_rows<T: ImpulseTarget>(target: &mut T, rows: &mut Vec<Constraint>, start: usize, cfg: &SolverConfig) -> usize {
    let before = rows.len();
    for row in &mut rows[start..] {
        row.response = if row.is_held_by_joint() { 0.0 } else { target.response(row) };
    }
    let mut index = 0;
    rows.retain(|row| {
        let keep = index < start || {
            let floor = if row.is_angular() {
                MIN_ROW_RESPONSE.max(cfg.min_response_ratio * target.inv_mass(row))
            } else {
                MIN_ROW_RESPONSE
            };
            row.response.is_finite() && row.response >= floor
        };
        index += 1;
        keep
    });
    let dropped = before - rows.len();
    if dropped > 0 {
        tracing::trace!(dropped, kept = rows.len() - start, "constraint rows pruned");
    }
    dropped
}
