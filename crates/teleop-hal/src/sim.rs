//! In-process simulated robots and cameras for tests and demos.
//!
//! [`SimSink`] tracks commanded joint targets with a first-order lag and
//! checks them against the model's joint limits, like a controller that
//! refuses out-of-range setpoints.  A task-space sink checks end-effector
//! targets against its workspace box instead.  Rejects can also be scripted by command
//! sequence number.  [`SimCamera`] produces a moving greyscale gradient.
//!
//! # Example
//!
//! ```rust
//! use teleop_hal::sim::SimSink;
//! use teleop_hal::RobotSink;
//! use teleop_retarget::RetargetModel;
//!
//! let sink = SimSink::for_model(&RetargetModel::demo_arm("arm")).rejecting([4, 5]);
//! assert_eq!(sink.id(), "arm");
//! assert_eq!(sink.state().positions.len(), 3);
//! ```

use std::collections::HashSet;

use chrono::Utc;
use teleop_retarget::model::{ArmChain, CartesianChain, Embodiment};
use teleop_retarget::{JointLimit, RetargetModel, arm};
use teleop_types::{CameraFrame, Command, CommandPayload, RobotState, StateStatus, TeleopError};

use crate::camera::Camera;
use crate::sink::{RobotSink, SinkResponse};

// ────────────────────────────────────────────────────────────────────────────
// SimSink
// ────────────────────────────────────────────────────────────────────────────

/// Kinds of simulated robot.
#[derive(Debug, Clone, PartialEq)]
pub enum SimKind {
    /// Three-joint arm; the state carries the wrist position.
    Arm(ArmChain),
    /// Multi-finger hand; joint positions only.
    Hand,
    /// Task-space end effector; the state carries the last accepted target.
    Cartesian(CartesianChain),
}

/// A simulated robot sink.
pub struct SimSink {
    id: String,
    kind: SimKind,
    limits: Vec<JointLimit>,
    /// Fraction of the remaining error closed per accepted command.
    tracking_gain: f64,
    positions: Vec<f64>,
    target: Vec<f64>,
    end_effector_target: Option<[f64; 3]>,
    gripper: Option<f64>,
    reject_seqs: HashSet<u64>,
    last_accepted: Option<u64>,
    accepted: u64,
    rejected: u64,
}

impl SimSink {
    /// Simulate the robot described by `model`, starting at the joint
    /// midpoints.
    pub fn for_model(model: &RetargetModel) -> Self {
        let kind = match &model.embodiment {
            Embodiment::Arm(chain) => SimKind::Arm(chain.clone()),
            Embodiment::Hand(_) => SimKind::Hand,
            Embodiment::Cartesian(chain) => SimKind::Cartesian(chain.clone()),
        };
        let start: Vec<f64> = model.joints.iter().map(JointLimit::midpoint).collect();
        Self {
            id: model.robot_id.clone(),
            kind,
            limits: model.joints.clone(),
            tracking_gain: 1.0,
            positions: start.clone(),
            target: start,
            end_effector_target: None,
            gripper: None,
            reject_seqs: HashSet::new(),
            last_accepted: None,
            accepted: 0,
            rejected: 0,
        }
    }

    /// Reject the commands with these sequence numbers.
    pub fn rejecting(mut self, seqs: impl IntoIterator<Item = u64>) -> Self {
        self.reject_seqs.extend(seqs);
        self
    }

    /// Follow targets with a first-order lag of `gain` in `(0, 1]`.
    pub fn with_tracking_gain(mut self, gain: f64) -> Self {
        self.tracking_gain = gain.clamp(f64::EPSILON, 1.0);
        self
    }

    pub fn kind(&self) -> &SimKind {
        &self.kind
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn gripper(&self) -> Option<f64> {
        self.gripper
    }

    fn check(&self, command: &Command) -> Result<(), String> {
        if command.robot_id != self.id {
            return Err(format!("command addressed to '{}'", command.robot_id));
        }
        if self.reject_seqs.contains(&command.seq) {
            return Err(format!("scripted reject of seq {}", command.seq));
        }
        if !command.payload.is_finite() {
            return Err("non-finite setpoint".to_string());
        }
        match (&command.payload, &self.kind) {
            (CommandPayload::Joints { .. }, SimKind::Cartesian(_)) => {
                Err("joint setpoint sent to a task-space robot".to_string())
            }
            (CommandPayload::Joints { positions, .. }, _) => {
                if positions.len() != self.limits.len() {
                    return Err(format!(
                        "expected {} joints, got {}",
                        self.limits.len(),
                        positions.len()
                    ));
                }
                for (q, limit) in positions.iter().zip(&self.limits) {
                    if *q < limit.min || *q > limit.max {
                        return Err(format!("joint '{}' setpoint {q:.4} out of range", limit.name));
                    }
                }
                Ok(())
            }
            (CommandPayload::EndEffector { translation, .. }, SimKind::Cartesian(chain)) => {
                if !chain.contains(*translation) {
                    return Err(format!("end-effector target {translation:?} outside the workspace"));
                }
                Ok(())
            }
            (CommandPayload::EndEffector { .. }, _) => {
                Err("end-effector target sent to a joint-space robot".to_string())
            }
        }
    }

    fn step(&mut self) {
        if self.tracking_gain >= 1.0 {
            self.positions.clone_from(&self.target);
            return;
        }
        for (q, t) in self.positions.iter_mut().zip(&self.target) {
            *q += self.tracking_gain * (t - *q);
        }
    }
}

impl RobotSink for SimSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&mut self, command: &Command) -> SinkResponse {
        if let Err(reason) = self.check(command) {
            self.rejected += 1;
            return SinkResponse::Reject(reason);
        }
        match &command.payload {
            CommandPayload::Joints { positions, gripper } => {
                self.target.clone_from(positions);
                self.end_effector_target = None;
                self.gripper = *gripper;
            }
            CommandPayload::EndEffector {
                translation,
                gripper,
                ..
            } => {
                self.end_effector_target = Some(*translation);
                self.gripper = *gripper;
            }
        }
        self.step();
        self.last_accepted = Some(command.seq);
        self.accepted += 1;
        SinkResponse::Ack
    }

    fn state(&self) -> RobotState {
        let end_effector = match (&self.kind, self.end_effector_target) {
            (_, Some(target)) => Some(target),
            (SimKind::Arm(chain), None) if self.positions.len() == 3 => Some(
                arm::forward(chain, [self.positions[0], self.positions[1], self.positions[2]])
                    .to_array(),
            ),
            _ => None,
        };
        RobotState {
            robot_id: self.id.clone(),
            positions: self.positions.clone(),
            end_effector,
            hw_timestamp: Utc::now(),
            command_seq: self.last_accepted,
            status: StateStatus::Accepted,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimCamera
// ────────────────────────────────────────────────────────────────────────────

/// A simulated `mono8` camera producing a diagonal gradient that shifts by
/// one pixel per frame.
pub struct SimCamera {
    id: String,
    width: u32,
    height: u32,
    frame_index: u64,
    fail_every: Option<u64>,
}

impl SimCamera {
    pub fn new(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            width,
            height,
            frame_index: 0,
            fail_every: None,
        }
    }

    /// Fail every `n`-th capture with a hardware fault.
    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }
}

impl Camera for SimCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn capture(&mut self) -> Result<CameraFrame, TeleopError> {
        self.frame_index += 1;
        if self.fail_every.is_some_and(|n| self.frame_index % n == 0) {
            return Err(TeleopError::HardwareFault {
                component: format!("camera/{}", self.id),
                details: format!("simulated dropout at frame {}", self.frame_index),
            });
        }
        let shift = self.frame_index as u32;
        let mut data = Vec::with_capacity((self.width * self.height) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push(((x + y + shift) % 256) as u8);
            }
        }
        Ok(CameraFrame {
            camera_id: self.id.clone(),
            frame_index: self.frame_index,
            width: self.width,
            height: self.height,
            encoding: "mono8".to_string(),
            data,
            captured_at: Utc::now(),
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use teleop_types::CommandFlags;

    fn command(robot: &str, seq: u64, positions: Vec<f64>) -> Command {
        Command {
            robot_id: robot.into(),
            operator_instance: Default::default(),
            seq,
            payload: CommandPayload::Joints {
                positions,
                gripper: Some(0.5),
            },
            flags: CommandFlags::default(),
            confidence: 1.0,
            pose_seq: Some(seq),
            issued_at: Utc::now(),
        }
    }

    #[test]
    fn arm_accepts_in_range_setpoints_and_reports_wrist() {
        let model = RetargetModel::demo_arm("arm");
        let mut sink = SimSink::for_model(&model);
        assert!(sink.send(&command("arm", 1, vec![0.0, 0.5, -0.5])).is_ack());
        let state = sink.state();
        assert_eq!(state.positions, vec![0.0, 0.5, -0.5]);
        assert_eq!(state.command_seq, Some(1));
        assert!(state.end_effector.is_some());
        assert_eq!(sink.gripper(), Some(0.5));
    }

    #[test]
    fn out_of_range_and_misaddressed_commands_are_rejected() {
        let mut sink = SimSink::for_model(&RetargetModel::demo_arm("arm"));
        assert!(!sink.send(&command("arm", 1, vec![0.0, 9.0, 0.0])).is_ack());
        assert!(!sink.send(&command("other", 2, vec![0.0, 0.0, 0.0])).is_ack());
        assert!(!sink.send(&command("arm", 3, vec![0.0])).is_ack());
        assert_eq!(sink.rejected(), 3);
        assert_eq!(sink.state().command_seq, None);
    }

    #[test]
    fn scripted_rejects_keep_previous_target() {
        let mut sink = SimSink::for_model(&RetargetModel::demo_arm("arm")).rejecting([2]);
        assert!(sink.send(&command("arm", 1, vec![0.1, 0.1, 0.1])).is_ack());
        assert!(matches!(
            sink.send(&command("arm", 2, vec![0.2, 0.2, 0.2])),
            SinkResponse::Reject(_)
        ));
        let state = sink.state();
        assert_eq!(state.positions, vec![0.1, 0.1, 0.1]);
        assert_eq!(state.command_seq, Some(1));
    }

    #[test]
    fn cartesian_sink_checks_the_workspace() {
        let model = RetargetModel::demo_cartesian("ee");
        let mut sink = SimSink::for_model(&model);
        let target = |seq: u64, translation: [f64; 3]| Command {
            payload: CommandPayload::EndEffector {
                translation,
                rotation: [1.0, 0.0, 0.0, 0.0],
                gripper: Some(0.2),
            },
            ..command("ee", seq, Vec::new())
        };
        assert!(sink.send(&target(1, [0.3, 0.0, 0.3])).is_ack());
        assert_eq!(sink.state().end_effector, Some([0.3, 0.0, 0.3]));
        assert_eq!(sink.gripper(), Some(0.2));

        assert!(!sink.send(&target(2, [2.0, 0.0, 0.3])).is_ack());
        assert!(!sink.send(&command("ee", 3, vec![0.0; 6])).is_ack());
        let state = sink.state();
        assert_eq!(state.end_effector, Some([0.3, 0.0, 0.3]));
        assert_eq!(state.command_seq, Some(1));
    }

    #[test]
    fn tracking_gain_lags_the_target() {
        let model = RetargetModel::demo_hand("hand");
        let n = model.joints.len();
        let mut sink = SimSink::for_model(&model).with_tracking_gain(0.5);
        let start = sink.state().positions;
        let target: Vec<f64> = model.joints.iter().map(|j| j.max).collect();
        assert!(sink.send(&command("hand", 1, target.clone())).is_ack());
        let after = sink.state().positions;
        for i in 0..n {
            let expected = start[i] + 0.5 * (target[i] - start[i]);
            assert!((after[i] - expected).abs() < 1e-12);
        }
        assert!(sink.state().end_effector.is_none());
    }

    #[test]
    fn sim_camera_frames_advance_and_fail_on_schedule() {
        let mut cam = SimCamera::new("wrist", 4, 2).failing_every(3);
        let a = cam.capture().unwrap();
        let b = cam.capture().unwrap();
        assert_eq!((a.frame_index, b.frame_index), (1, 2));
        assert_eq!(a.data.len(), 8);
        assert_ne!(a.data, b.data);
        assert!(matches!(cam.capture(), Err(TeleopError::HardwareFault { .. })));
        assert_eq!(cam.capture().unwrap().frame_index, 4);
    }
}
