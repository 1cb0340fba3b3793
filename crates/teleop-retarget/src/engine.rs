//! Pose-to-command retargeting.
//!
//! [`retarget`] is a pure function of the model and one pose sample.  It
//! never passes an unvalidated numeric result through: every produced joint
//! vector is checked finite, and limit saturation is reported through
//! [`Retargeted::limited`] instead of an error.
//!
//! | Embodiment | Method | Payload |
//! |---|---|---|
//! | arm | closed-form IK | joints + gripper |
//! | hand | damped least squares per finger | joints |
//! | cartesian | calibrated wrist pose, clamped to the workspace box | end effector + gripper |

use teleop_perception::transform::{Quaternion, Vec3};
use teleop_types::{CommandPayload, Pose6D, RetargetFailure};
use tracing::trace;

use crate::model::{ArmChain, CartesianChain, Embodiment, GripperMapping, HandChain, RetargetModel};
use crate::{arm, hand};

/// Residual (m) at which confidence drops to one half.
pub const CONFIDENCE_SCALE: f64 = 0.05;

#[derive(Debug, Clone, PartialEq)]
pub struct Retargeted {
    pub payload: CommandPayload,
    /// Reach, joint or solver limits were hit.
    pub limited: bool,
    /// Task-space error of the solution (m); worst finger for hands.
    pub residual: f64,
    pub iterations: u32,
    /// `1 / (1 + residual / CONFIDENCE_SCALE)`.
    pub confidence: f64,
}

fn confidence(residual: f64) -> f64 {
    (1.0 / (1.0 + residual / CONFIDENCE_SCALE)).clamp(0.0, 1.0)
}

/// Convert `pose` into a robot command payload.
///
/// # Errors
///
/// * [`RetargetFailure::InvalidInput`] – non-finite or non-unit pose, or a
///   hand model fed a pose without the keypoints it tracks.
/// * [`RetargetFailure::NonConvergence`] – the solver could not reach
///   tolerance.
pub fn retarget(model: &RetargetModel, pose: &Pose6D) -> Result<Retargeted, RetargetFailure> {
    pose.validate()?;

    let out = match &model.embodiment {
        Embodiment::Arm(chain) => retarget_arm(model, chain, pose)?,
        Embodiment::Hand(chain) => retarget_hand(model, chain, pose)?,
        Embodiment::Cartesian(chain) => retarget_cartesian(model, chain, pose),
    };

    if !out.payload.is_finite() || !out.residual.is_finite() {
        return Err(RetargetFailure::InvalidInput(
            "solver produced a non-finite result".to_string(),
        ));
    }
    trace!(
        robot = %model.robot_id,
        seq = pose.seq,
        residual = out.residual,
        limited = out.limited,
        "retargeted"
    );
    Ok(out)
}

fn retarget_arm(
    model: &RetargetModel,
    chain: &ArmChain,
    pose: &Pose6D,
) -> Result<Retargeted, RetargetFailure> {
    let target = model.calibration.apply(Vec3::from(pose.translation));
    let solution = arm::solve(chain, &model.joints, target);
    if !solution.limited && solution.residual > model.tolerance() {
        return Err(RetargetFailure::NonConvergence {
            iterations: 1,
            residual: solution.residual,
        });
    }

    let gripper = chain.gripper.as_ref().and_then(|g| pinch(model, g, pose));

    Ok(Retargeted {
        payload: CommandPayload::Joints {
            positions: solution.joints.to_vec(),
            gripper,
        },
        limited: solution.limited,
        residual: solution.residual,
        iterations: 1,
        confidence: confidence(solution.residual),
    })
}

/// Gripper aperture from the thumb–index distance, when both are tracked.
fn pinch(model: &RetargetModel, mapping: &GripperMapping, pose: &Pose6D) -> Option<f64> {
    let thumb = pose.keypoints.get(mapping.thumb_tip)?;
    let index = pose.keypoints.get(mapping.index_tip)?;
    let d = Vec3::from(*thumb).distance(Vec3::from(*index)) * model.calibration.scale;
    Some(mapping.aperture(d))
}

fn retarget_cartesian(model: &RetargetModel, chain: &CartesianChain, pose: &Pose6D) -> Retargeted {
    let target = model.calibration.apply(Vec3::from(pose.translation));
    let reachable = chain.clamp(target);
    let residual = reachable.distance(target);
    let rotation = model
        .calibration
        .apply_rotation(Quaternion::from_array(pose.rotation));
    Retargeted {
        payload: CommandPayload::EndEffector {
            translation: reachable.to_array(),
            rotation: rotation.to_array(),
            gripper: chain.gripper.as_ref().and_then(|g| pinch(model, g, pose)),
        },
        limited: residual > 0.0,
        residual,
        iterations: 0,
        confidence: confidence(residual),
    }
}

fn retarget_hand(
    model: &RetargetModel,
    chain: &HandChain,
    pose: &Pose6D,
) -> Result<Retargeted, RetargetFailure> {
    let tolerance = model.tolerance();
    let mut positions = Vec::with_capacity(model.joints.len());
    let mut limited = false;
    let mut residual: f64 = 0.0;
    let mut iterations = 0;

    for (i, finger) in chain.fingers.iter().enumerate() {
        let tip = pose.keypoints.get(finger.tip_keypoint).ok_or_else(|| {
            RetargetFailure::InvalidInput(format!(
                "finger '{}' tracks keypoint {} but the pose carries {}",
                finger.name,
                finger.tip_keypoint,
                pose.keypoints.len()
            ))
        })?;
        let target = model.calibration.apply(Vec3::from(*tip));
        let limits = model.joints.get(3 * i..3 * i + 3).ok_or_else(|| {
            RetargetFailure::InvalidInput(format!(
                "finger '{}' has no joint limits ({} joints for {} fingers)",
                finger.name,
                model.joints.len(),
                chain.fingers.len()
            ))
        })?;
        let solution = hand::solve_finger(finger, limits, target, tolerance, &model.solver)?;

        positions.extend_from_slice(&solution.joints);
        limited |= solution.limited;
        residual = residual.max(solution.residual);
        iterations = iterations.max(solution.iterations);
    }

    Ok(Retargeted {
        payload: CommandPayload::Joints {
            positions,
            gripper: None,
        },
        limited,
        residual,
        iterations,
        confidence: confidence(residual),
    })
}
