//! Closed-form inverse kinematics for the three-joint arm.
//!
//! Joint order is base yaw `q0`, shoulder pitch `q1` (from horizontal) and
//! elbow pitch `q2` (relative to the upper arm).  Forward kinematics:
//!
//! ```text
//! r = l1·cos q1 + l2·cos(q1 + q2)
//! p = (r·cos q0, r·sin q0, h + l1·sin q1 + l2·sin(q1 + q2))
//! ```
//!
//! Targets outside the reachable shell saturate the law-of-cosines term, so
//! the arm points at the target at full (or minimum) extension and the
//! result is flagged `limited`.

use teleop_perception::transform::Vec3;

use crate::model::{ArmChain, JointLimit};

#[derive(Debug, Clone, PartialEq)]
pub struct ArmSolution {
    pub joints: [f64; 3],
    /// Reach or joint limits were hit.
    pub limited: bool,
    /// Distance between the achieved wrist position and the target.
    pub residual: f64,
}

pub fn forward(chain: &ArmChain, q: [f64; 3]) -> Vec3 {
    let (l1, l2) = (chain.upper_arm, chain.forearm);
    let r = l1 * q[1].cos() + l2 * (q[1] + q[2]).cos();
    let z = chain.base_height + l1 * q[1].sin() + l2 * (q[1] + q[2]).sin();
    Vec3::new(r * q[0].cos(), r * q[0].sin(), z)
}

/// Solve for the wrist position `target` (robot base frame).
///
/// `limits` must hold exactly three entries (checked by model validation).
pub fn solve(chain: &ArmChain, limits: &[JointLimit], target: Vec3) -> ArmSolution {
    let (l1, l2) = (chain.upper_arm, chain.forearm);
    let mut limited = false;

    let q0 = target.y.atan2(target.x);
    let r = target.x.hypot(target.y);
    let z = target.z - chain.base_height;

    let mut cos_elbow = (r * r + z * z - l1 * l1 - l2 * l2) / (2.0 * l1 * l2);
    if !(-1.0..=1.0).contains(&cos_elbow) {
        cos_elbow = cos_elbow.clamp(-1.0, 1.0);
        limited = true;
    }
    let q2 = if chain.elbow_up {
        -cos_elbow.acos()
    } else {
        cos_elbow.acos()
    };
    let q1 = z.atan2(r) - (l2 * q2.sin()).atan2(l1 + l2 * q2.cos());

    let mut joints = [q0, q1, q2];
    for (q, limit) in joints.iter_mut().zip(limits) {
        let clamped = limit.clamp(*q);
        if clamped != *q {
            limited = true;
            *q = clamped;
        }
    }

    let residual = forward(chain, joints).distance(target);
    ArmSolution {
        joints,
        limited,
        residual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Embodiment, RetargetModel};

    fn demo() -> (ArmChain, Vec<JointLimit>) {
        let model = RetargetModel::demo_arm("arm");
        match model.embodiment {
            Embodiment::Arm(chain) => (chain, model.joints),
            _ => unreachable!(),
        }
    }

    #[test]
    fn reachable_targets_roundtrip_through_forward_kinematics() {
        let (chain, limits) = demo();
        for target in [
            Vec3::new(0.3, 0.1, 0.3),
            Vec3::new(-0.2, 0.25, 0.05),
            Vec3::new(0.0, -0.35, 0.4),
            Vec3::new(0.45, 0.0, 0.1),
        ] {
            let sol = solve(&chain, &limits, target);
            assert!(!sol.limited, "target {target:?} should be reachable");
            assert!(sol.residual < 1e-9, "residual {} for {target:?}", sol.residual);
            assert!(forward(&chain, sol.joints).distance(target) < 1e-9);
        }
    }

    #[test]
    fn elbow_up_and_down_reach_the_same_point() {
        let (mut chain, limits) = demo();
        let target = Vec3::new(0.3, 0.0, 0.2);
        let up = solve(&chain, &limits, target);
        chain.elbow_up = false;
        let down = solve(&chain, &limits, target);
        assert!(up.joints[2] < 0.0 && down.joints[2] > 0.0);
        assert!(up.residual < 1e-9 && down.residual < 1e-9);
    }

    #[test]
    fn out_of_reach_saturates_toward_target() {
        let (chain, limits) = demo();
        let target = Vec3::new(2.0, 0.0, chain.base_height);
        let sol = solve(&chain, &limits, target);
        assert!(sol.limited);
        // Fully stretched, pointing straight at the target.
        assert!(sol.joints[2].abs() < 1e-9);
        let wrist = forward(&chain, sol.joints);
        assert!((wrist.x - chain.reach()).abs() < 1e-9);
        assert!((sol.residual - (2.0 - chain.reach())).abs() < 1e-9);
    }

    #[test]
    fn joint_limits_clamp_and_flag() {
        let (chain, mut limits) = demo();
        limits[0].min = -0.5;
        limits[0].max = 0.5;
        // Needs ~90° of base yaw.
        let sol = solve(&chain, &limits, Vec3::new(0.0, 0.3, 0.2));
        assert!(sol.limited);
        assert_eq!(sol.joints[0], 0.5);
        assert!(sol.residual > 0.0);
    }
}
