//! Joint limit and gimbal-lock state transitions.

use std::f64::consts::{PI, TAU};

use nalgebra::Vector3;

use crate::joint::{AxisState, JointLink, LimitSide};

/// `|axis_x · axis_z|` above which the joint enters gimbal lock.
pub const GIMBAL_ENTER: f64 = 0.995;

/// `|axis_x · axis_z|` below which a gimbal-locked joint is released.
pub const GIMBAL_EXIT: f64 = 0.99;

/// Wrap an angle into `[-π, π]`.
#[must_use]
pub fn normalize_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped == -PI && angle > 0.0 {
        PI
    } else {
        wrapped
    }
}

/// Set an axis angle from outside the simulation.
///
/// On a limited axis the angle is normalised first; if it still falls
/// outside the interval, the nearer bound is moved onto it rather than
/// clamping the request. Returns the angle actually stored.
///
/// Limits are an interval on the normalised angle and never span the ±π
/// seam, so "nearer" is plain numeric distance: an angle below `lo` can
/// only be taken in by lowering `lo`, even when `hi` is closer across the
/// seam.
pub fn set_angle(link: &mut JointLink, axis: usize, angle: f64) -> f64 {
    let cfg = &mut link.axes[axis];
    let angle = if cfg.is_limited() {
        normalize_angle(angle)
    } else {
        angle
    };
    if angle < cfg.lo {
        cfg.lo = angle;
    } else if angle > cfg.hi {
        cfg.hi = angle;
    }
    link.angles[axis] = angle;
    link.prev_angles[axis] = angle;
    angle
}

/// Which bound an angle is within `tol` of, preferring the nearer one
/// when a narrow interval puts it within reach of both.
#[must_use]
pub fn nearby_bound(angle: f64, lo: f64, hi: f64, tol: f64) -> Option<LimitSide> {
    let near_lo = angle <= lo + tol;
    let near_hi = angle >= hi - tol;
    match (near_lo, near_hi) {
        (true, true) => Some(if angle - lo <= hi - angle {
            LimitSide::Lower
        } else {
            LimitSide::Upper
        }),
        (true, false) => Some(LimitSide::Lower),
        (false, true) => Some(LimitSide::Upper),
        (false, false) => None,
    }
}

/// Update the free/limit-reached state of every mobile axis.
///
/// An axis is at its limit while it sits within `tol` of a bound and is
/// not moving back inside. Returns the number of axes at a limit.
pub fn update_limit_states(link: &mut JointLink, tol: f64) -> usize {
    let mut reached = 0;
    for k in 0..3 {
        let (angle, velocity) = (link.angles[k], link.dq[k]);
        let cfg = &mut link.axes[k];
        if matches!(cfg.state, AxisState::Locked | AxisState::GimbalLocked) {
            continue;
        }
        cfg.state = match nearby_bound(angle, cfg.lo, cfg.hi, tol) {
            Some(side) if velocity * side.outward_sign() >= 0.0 => {
                reached += 1;
                AxisState::LimitReached(side)
            }
            _ => AxisState::Free,
        };
    }
    reached
}

/// Enter or leave gimbal lock from the current world axes.
///
/// On entry the limited one of x/z is frozen (z if both or neither are)
/// and its rate is folded into the other axis so the angular velocity is
/// preserved. Returns `true` when the state changed.
pub fn update_gimbal_lock(link: &mut JointLink, axes: &[Vector3<f64>; 3]) -> bool {
    let dot = axes[0].dot(&axes[2]);
    let locked = link.axes[0].state == AxisState::GimbalLocked
        || link.axes[2].state == AxisState::GimbalLocked;

    if locked {
        if dot.abs() < GIMBAL_EXIT {
            for k in [0, 2] {
                if link.axes[k].state == AxisState::GimbalLocked {
                    link.axes[k].state = AxisState::Free;
                }
            }
            return true;
        }
        return false;
    }

    if dot.abs() <= GIMBAL_ENTER || link.axes[0].is_locked() || link.axes[2].is_locked() {
        return false;
    }
    let x_limited = matches!(link.axes[0].state, AxisState::LimitReached(_));
    let z_limited = matches!(link.axes[2].state, AxisState::LimitReached(_));
    let frozen = if x_limited && !z_limited { 0 } else { 2 };
    let kept = 2 - frozen;

    link.dq[kept] += dot.signum() * link.dq[frozen];
    link.dq[frozen] = 0.0;
    link.axes[frozen].state = AxisState::GimbalLocked;
    link.axes[frozen].requested_velocity = None;
    tracing::trace!(frozen, dot, "joint entered gimbal lock");
    true
}

/// Integrate angles over `dt` and keep them within `tol` of their bounds.
///
/// Immobile axes keep their angle. An axis pushed past `bound ± tol` is
/// put back and loses its outward rate.
pub fn integrate_angles(link: &mut JointLink, dt: f64, tol: f64) {
    link.prev_angles = link.angles;
    for k in 0..3 {
        if !link.axes[k].state.is_mobile() {
            link.dq[k] = 0.0;
            continue;
        }
        link.angles[k] += link.dq[k] * dt;
    }
    clamp_to_limits(link, tol);
}

/// Clamp angles to `[lo - tol, hi + tol]`, zeroing outward rates.
pub fn clamp_to_limits(link: &mut JointLink, tol: f64) {
    for k in 0..3 {
        let cfg = &link.axes[k];
        if cfg.is_locked() {
            continue;
        }
        if link.angles[k] < cfg.lo - tol {
            link.angles[k] = cfg.lo - tol;
            link.dq[k] = link.dq[k].max(0.0);
        } else if link.angles[k] > cfg.hi + tol {
            link.angles[k] = cfg.hi + tol;
            link.dq[k] = link.dq[k].min(0.0);
        }
    }
}

/// Largest distance any axis sits beyond its interval.
#[must_use]
pub fn limit_overshoot(link: &JointLink) -> f64 {
    (0..3)
        .map(|k| {
            let cfg = &link.axes[k];
            (cfg.lo - link.angles[k]).max(link.angles[k] - cfg.hi).max(0.0)
        })
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use sim_types::Pose;

    fn limited_link() -> JointLink {
        let mut link = JointLink::floating_root();
        for axis in &mut link.axes {
            axis.lo = -0.5;
            axis.hi = 0.5;
        }
        link
    }

    #[test]
    fn test_normalize_angle() {
        assert_relative_eq!(normalize_angle(3.0 * PI / 2.0), -PI / 2.0, epsilon = 1e-12);
        assert_relative_eq!(normalize_angle(-3.0 * PI / 2.0), PI / 2.0, epsilon = 1e-12);
        assert_relative_eq!(normalize_angle(0.25), 0.25);
    }

    #[test]
    fn test_set_angle_moves_nearer_bound() {
        let mut link = limited_link();
        let stored = set_angle(&mut link, 0, 0.8);
        assert_relative_eq!(stored, 0.8);
        assert_relative_eq!(link.axes[0].hi, 0.8);
        assert_relative_eq!(link.axes[0].lo, -0.5);

        // 2π - 0.7 wraps to -0.7, so the lower bound moves.
        set_angle(&mut link, 1, TAU - 0.7);
        assert_relative_eq!(link.angles[1], -0.7, epsilon = 1e-12);
        assert_relative_eq!(link.axes[1].lo, -0.7, epsilon = 1e-12);
        assert_relative_eq!(link.axes[1].hi, 0.5);
    }

    #[test]
    fn test_set_angle_does_not_wrap_bounds_across_seam() {
        let mut link = limited_link();
        link.axes[2].lo = -1.0;
        link.axes[2].hi = 2.9;
        // Closer to hi across ±π, but the interval can only grow downward.
        set_angle(&mut link, 2, -3.1);
        assert_relative_eq!(link.axes[2].lo, -3.1);
        assert_relative_eq!(link.axes[2].hi, 2.9);
        assert!(link.axes[2].lo <= link.angles[2] && link.angles[2] <= link.axes[2].hi);
    }

    #[test]
    fn test_limit_state_enter_and_leave() {
        let mut link = limited_link();
        link.angles.x = 0.499;
        link.dq.x = 1.0;
        assert_eq!(update_limit_states(&mut link, 0.01), 1);
        assert_eq!(link.axes[0].state, AxisState::LimitReached(LimitSide::Upper));

        // Velocity reverses: back to free while still in the band.
        link.dq.x = -0.2;
        update_limit_states(&mut link, 0.01);
        assert_eq!(link.axes[0].state, AxisState::Free);
    }

    #[test]
    fn test_narrow_interval_prefers_nearer_bound() {
        assert_eq!(nearby_bound(0.009, 0.0, 0.02, 0.05), Some(LimitSide::Lower));
        assert_eq!(nearby_bound(0.011, 0.0, 0.02, 0.05), Some(LimitSide::Upper));
        assert_eq!(nearby_bound(0.2, 0.0, 1.0, 0.05), None);
    }

    #[test]
    fn test_integrate_respects_tolerance_and_locks() {
        let mut link = limited_link();
        link.axes[1].state = AxisState::Locked;
        link.angles.y = 0.3;
        link.dq = Vector3::new(10.0, 10.0, -10.0);
        integrate_angles(&mut link, 0.1, 0.01);

        assert_relative_eq!(link.angles.x, 0.51);
        assert_relative_eq!(link.dq.x, 0.0);
        assert_relative_eq!(link.angles.y, 0.3);
        assert_relative_eq!(link.angles.z, -0.51);
        assert!(limit_overshoot(&link) <= 0.01 + 1e-12);
    }

    #[test]
    fn test_gimbal_lock_folds_velocity() {
        let mut link = JointLink::floating_root();
        link.angles.y = PI / 2.0 - 0.01;
        link.dq = Vector3::new(0.5, 0.0, 0.25);
        let frame = link.frame(&Pose::identity());
        let omega_before = frame.axes[0] * link.dq.x + frame.axes[2] * link.dq.z;

        assert!(update_gimbal_lock(&mut link, &frame.axes));
        assert_eq!(link.axes[2].state, AxisState::GimbalLocked);
        assert_relative_eq!(link.dq.x, 0.75);
        assert_relative_eq!(link.dq.z, 0.0);
        let omega_after = frame.axes[0] * link.dq.x;
        assert_relative_eq!(omega_after, omega_before, epsilon = 0.01);

        // Released once the axes separate again.
        link.angles.y = 0.5;
        let frame = link.frame(&Pose::identity());
        assert!(update_gimbal_lock(&mut link, &frame.axes));
        assert_eq!(link.axes[2].state, AxisState::Free);
    }

    #[test]
    fn test_gimbal_freezes_limited_axis() {
        let mut link = JointLink::floating_root();
        link.angles.y = PI / 2.0;
        link.axes[0].state = AxisState::LimitReached(LimitSide::Upper);
        link.dq = Vector3::new(0.1, 0.0, 0.4);
        let frame = link.frame(&Pose::identity());
        assert!(update_gimbal_lock(&mut link, &frame.axes));
        assert_eq!(link.axes[0].state, AxisState::GimbalLocked);
        assert_relative_eq!(link.dq.z, 0.5);
    }
}
