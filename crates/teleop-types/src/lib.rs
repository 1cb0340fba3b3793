use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Maximum tolerated deviation of a quaternion norm from 1.
pub const QUATERNION_NORM_TOLERANCE: f64 = 1e-3;

/// The body part (or controller) a pose sample was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TrackedPart {
    LeftHand,
    RightHand,
    Head,
    Torso,
}

impl TrackedPart {
    /// Stable name used in topic names, e.g. `"right_hand"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackedPart::LeftHand => "left_hand",
            TrackedPart::RightHand => "right_hand",
            TrackedPart::Head => "head",
            TrackedPart::Torso => "torso",
        }
    }
}

impl std::fmt::Display for TrackedPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TrackedPart {
    type Err = TeleopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "left_hand" | "left" => Ok(TrackedPart::LeftHand),
            "right_hand" | "right" => Ok(TrackedPart::RightHand),
            "head" => Ok(TrackedPart::Head),
            "torso" | "body" => Ok(TrackedPart::Torso),
            other => Err(TeleopError::FatalConfig(format!("unknown tracked part '{other}'"))),
        }
    }
}

/// One 6-DoF pose sample from the VR input (or any tracker).
///
/// `seq` increases strictly per source and is the only freshness key the
/// operator trusts; `captured_at` is advisory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Pose6D {
    /// Translation in metres.
    pub translation: [f64; 3],
    /// Unit quaternion `(w, x, y, z)`.
    pub rotation: [f64; 4],
    pub captured_at: DateTime<Utc>,
    pub seq: u64,
    pub source: TrackedPart,
    /// Hand keypoints expressed in the canonical hand frame. Empty for
    /// controllers and trackers that only report a rigid pose.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keypoints: Vec<[f64; 3]>,
}

impl Pose6D {
    /// A rigid pose without keypoints.
    pub fn new(source: TrackedPart, seq: u64, translation: [f64; 3], rotation: [f64; 4]) -> Self {
        Self {
            translation,
            rotation,
            captured_at: Utc::now(),
            seq,
            source,
            keypoints: Vec::new(),
        }
    }

    /// Attach hand keypoints (builder-style).
    pub fn with_keypoints(mut self, keypoints: Vec<[f64; 3]>) -> Self {
        self.keypoints = keypoints;
        self
    }

    /// Reject samples carrying NaN/infinite values or a non-unit rotation.
    pub fn validate(&self) -> Result<(), RetargetFailure> {
        if !self.translation.iter().all(|v| v.is_finite()) {
            return Err(RetargetFailure::InvalidInput(format!(
                "non-finite translation {:?}",
                self.translation
            )));
        }
        if !self.rotation.iter().all(|v| v.is_finite()) {
            return Err(RetargetFailure::InvalidInput(format!(
                "non-finite rotation {:?}",
                self.rotation
            )));
        }
        let norm = self.rotation.iter().map(|v| v * v).sum::<f64>().sqrt();
        if (norm - 1.0).abs() > QUATERNION_NORM_TOLERANCE {
            return Err(RetargetFailure::InvalidInput(format!(
                "rotation is not a unit quaternion (|q| = {norm})"
            )));
        }
        if let Some(bad) = self
            .keypoints
            .iter()
            .position(|k| !k.iter().all(|v| v.is_finite()))
        {
            return Err(RetargetFailure::InvalidInput(format!("non-finite keypoint {bad}")));
        }
        Ok(())
    }
}

/// Raw hand keypoints as streamed by the headset, before the hand-frame
/// transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HandKeypoints {
    pub side: TrackedPart,
    pub seq: u64,
    /// Keypoints in headset world coordinates, in the headset's joint order.
    pub keypoints: Vec<[f64; 3]>,
    /// `true` when the headset reports positions relative to a reference
    /// pose instead of absolute positions.
    #[serde(default)]
    pub is_relative: bool,
    pub captured_at: DateTime<Utc>,
}

/// Robot-typed command payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandPayload {
    /// Joint-space target (radians), plus an optional gripper aperture in `[0, 1]`.
    Joints {
        positions: Vec<f64>,
        #[serde(default)]
        gripper: Option<f64>,
    },
    /// Task-space end-effector target.
    EndEffector {
        translation: [f64; 3],
        rotation: [f64; 4],
        #[serde(default)]
        gripper: Option<f64>,
    },
}

impl CommandPayload {
    /// `true` when every numeric component is finite.
    pub fn is_finite(&self) -> bool {
        match self {
            CommandPayload::Joints { positions, gripper } => {
                positions.iter().all(|v| v.is_finite()) && gripper.is_none_or(f64::is_finite)
            }
            CommandPayload::EndEffector {
                translation,
                rotation,
                gripper,
            } => {
                translation.iter().all(|v| v.is_finite())
                    && rotation.iter().all(|v| v.is_finite())
                    && gripper.is_none_or(f64::is_finite)
            }
        }
    }
}

/// Degradation flags carried by every [`Command`] and mirrored on the
/// diagnostics stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CommandFlags {
    /// Saturated to a joint, velocity or per-tick displacement limit.
    pub limited: bool,
    /// Solver did not converge; the last valid payload is being held.
    pub stale: bool,
    /// No pose newer than the previous tick; the last payload is repeated.
    pub repeated: bool,
}

impl CommandFlags {
    pub fn any(&self) -> bool {
        self.limited || self.stale || self.repeated
    }
}

/// A command produced by one operator tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Command {
    pub robot_id: String,
    /// Identifies the operator instance; `seq` is monotonic per instance.
    pub operator_instance: Uuid,
    pub seq: u64,
    pub payload: CommandPayload,
    pub flags: CommandFlags,
    /// Retargeting confidence in `[0, 1]`.
    pub confidence: f64,
    /// Sequence number of the pose sample this command was derived from.
    pub pose_seq: Option<u64>,
    /// Advisory wall-clock time.
    pub issued_at: DateTime<Utc>,
}

/// Whether a reported state reflects an accepted command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StateStatus {
    Accepted,
    /// The sink rejected command `rejected_seq` and holds its previous state.
    Held { reason: String, rejected_seq: u64 },
}

/// Measured robot state reported by a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RobotState {
    pub robot_id: String,
    pub positions: Vec<f64>,
    #[serde(default)]
    pub end_effector: Option<[f64; 3]>,
    pub hw_timestamp: DateTime<Utc>,
    /// Seq of the command whose target the robot is holding, if any.
    #[serde(default)]
    pub command_seq: Option<u64>,
    pub status: StateStatus,
}

impl RobotState {
    /// Seq of the command this report was produced for: the rejected one
    /// for a held state, otherwise the accepted one.
    pub fn answers(&self) -> Option<u64> {
        match self.status {
            StateStatus::Held { rejected_seq, .. } => Some(rejected_seq),
            StateStatus::Accepted => self.command_seq,
        }
    }
}

/// A raw image frame published by a camera driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraFrame {
    pub camera_id: String,
    pub frame_index: u64,
    pub width: u32,
    pub height: u32,
    /// e.g. `"rgb8"` or `"mono8"`.
    pub encoding: String,
    pub data: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

/// Control-plane request handled by operators and recorders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    StartRecording { episode_id: String },
    StopRecording,
    PauseOperator { robot_id: String },
    ResumeOperator { robot_id: String },
    Shutdown,
}

/// Summary returned when an episode is sealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub episode_id: String,
    pub steps: usize,
    pub incomplete: bool,
    pub missing_states: usize,
    pub missing_frames: usize,
}

/// Control-plane reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    Recording { episode_id: String },
    EpisodeSealed(EpisodeSummary),
    Rejected { reason: String },
}

/// Retargeting failures. Both variants are absorbed by the operator.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetargetFailure {
    #[error("solver did not converge after {iterations} iterations (residual {residual:.6})")]
    NonConvergence { iterations: u32, residual: f64 },

    #[error("invalid input pose: {0}")]
    InvalidInput(String),
}

/// Error taxonomy spanning sample loss, retargeting, the control plane,
/// recording and configuration.
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum TeleopError {
    #[error("Transient sample loss on {topic}")]
    TransientSampleLoss { topic: String },

    #[error("Retarget failure: {0}")]
    RetargetFailure(#[from] RetargetFailure),

    /// The request may or may not have taken effect on the server side.
    #[error("Control request to {endpoint} timed out after {timeout_ms} ms (outcome unknown)")]
    ChannelTimeout { endpoint: String, timeout_ms: u64 },

    #[error("Episode {episode_id} sealed incomplete: {details}")]
    EpisodeIncomplete { episode_id: String, details: String },

    #[error("Fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },
}

impl TeleopError {
    /// Only configuration and startup failures are fatal; everything else is
    /// absorbed by the component that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TeleopError::FatalConfig(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_pose(seq: u64) -> Pose6D {
        Pose6D::new(TrackedPart::RightHand, seq, [0.1, 0.2, 0.3], [1.0, 0.0, 0.0, 0.0])
    }

    #[test]
    fn tracked_part_parses_and_displays() {
        let part: TrackedPart = "right".parse().unwrap();
        assert_eq!(part, TrackedPart::RightHand);
        assert_eq!(part.to_string(), "right_hand");
        assert!("elbow".parse::<TrackedPart>().is_err());
    }

    #[test]
    fn valid_pose_passes_validation() {
        assert!(identity_pose(1).validate().is_ok());
    }

    #[test]
    fn nan_translation_is_rejected() {
        let mut pose = identity_pose(1);
        pose.translation[1] = f64::NAN;
        assert!(matches!(pose.validate(), Err(RetargetFailure::InvalidInput(_))));
    }

    #[test]
    fn non_unit_quaternion_is_rejected() {
        let mut pose = identity_pose(1);
        pose.rotation = [0.5, 0.0, 0.0, 0.0];
        assert!(pose.validate().is_err());
    }

    #[test]
    fn infinite_keypoint_is_rejected() {
        let pose = identity_pose(1).with_keypoints(vec![[0.0; 3], [f64::INFINITY, 0.0, 0.0]]);
        let err = pose.validate().unwrap_err();
        assert!(err.to_string().contains("keypoint 1"));
    }

    #[test]
    fn payload_finiteness_checks_gripper() {
        let ok = CommandPayload::Joints {
            positions: vec![0.0, 1.0],
            gripper: Some(0.5),
        };
        assert!(ok.is_finite());
        let bad = CommandPayload::Joints {
            positions: vec![0.0, 1.0],
            gripper: Some(f64::NAN),
        };
        assert!(!bad.is_finite());
    }

    #[test]
    fn command_json_shape_is_tagged() {
        let cmd = Command {
            robot_id: "arm".to_string(),
            operator_instance: Uuid::new_v4(),
            seq: 7,
            payload: CommandPayload::Joints {
                positions: vec![0.1, 0.2, 0.3],
                gripper: None,
            },
            flags: CommandFlags {
                limited: true,
                ..Default::default()
            },
            confidence: 1.0,
            pose_seq: Some(3),
            issued_at: Utc::now(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["payload"]["kind"], "joints");
        assert_eq!(json["flags"]["limited"], true);
        let back: Command = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn held_state_answers_the_rejected_command() {
        let mut state = RobotState {
            robot_id: "arm".to_string(),
            positions: vec![0.0; 3],
            end_effector: None,
            hw_timestamp: Utc::now(),
            command_seq: Some(4),
            status: StateStatus::Accepted,
        };
        assert_eq!(state.answers(), Some(4));
        state.status = StateStatus::Held {
            reason: "out of range".to_string(),
            rejected_seq: 6,
        };
        assert_eq!(state.answers(), Some(6));
        assert_eq!(state.command_seq, Some(4));
    }

    #[test]
    fn control_request_roundtrip() {
        let req = ControlRequest::StartRecording {
            episode_id: "ep-1".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("start_recording"));
        let back: ControlRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn only_config_errors_are_fatal() {
        assert!(TeleopError::FatalConfig("bad model".into()).is_fatal());
        let timeout = TeleopError::ChannelTimeout {
            endpoint: "control/recorder".into(),
            timeout_ms: 500,
        };
        assert!(!timeout.is_fatal());
        assert!(timeout.to_string().contains("outcome unknown"));
    }
}
