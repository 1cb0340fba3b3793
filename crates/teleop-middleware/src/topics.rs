//! Canonical topic and endpoint names.
//!
//! | Name | Carries |
//! |---|---|
//! | `pose/<part>` | [`Pose6D`] from the pose source |
//! | `hand/raw/<part>` | [`HandKeypoints`] before the hand-frame transform |
//! | `command/<robot>` | [`Command`] from the operator |
//! | `state/<robot>` | [`RobotState`] from the sink driver |
//! | `camera/<id>` | [`CameraFrame`] from a camera driver |
//! | `diagnostics/<robot>` | per-tick operator diagnostics |
//! | `diagnostics/recorder` | live recorder progress |
//! | `control/operator/<robot>` | operator control endpoint |
//! | `control/recorder` | recorder control endpoint |

use teleop_types::{
    CameraFrame, Command, ControlRequest, ControlResponse, HandKeypoints, Pose6D, RobotState,
    TrackedPart,
};

use crate::bus::Topic;
use crate::rpc::Endpoint;

pub const RECORDER_CONTROL: &str = "control/recorder";
/// Reserved: no robot may use this id.
pub const RECORDER_DIAGNOSTICS: &str = "diagnostics/recorder";

pub fn pose(part: TrackedPart) -> Topic<Pose6D> {
    Topic::new(format!("pose/{part}"))
}

pub fn raw_hand(part: TrackedPart) -> Topic<HandKeypoints> {
    Topic::new(format!("hand/raw/{part}"))
}

pub fn command(robot_id: &str) -> Topic<Command> {
    Topic::new(format!("command/{robot_id}"))
}

pub fn state(robot_id: &str) -> Topic<RobotState> {
    Topic::new(format!("state/{robot_id}"))
}

pub fn camera(camera_id: &str) -> Topic<CameraFrame> {
    Topic::new(format!("camera/{camera_id}"))
}

/// Diagnostics topic name for `robot_id`. The value type is owned by the
/// operator crate, so only the name lives here.
pub fn diagnostics_name(robot_id: &str) -> String {
    format!("diagnostics/{robot_id}")
}

pub fn operator_control(robot_id: &str) -> Endpoint<ControlRequest, ControlResponse> {
    Endpoint::new(format!("control/operator/{robot_id}"))
}

pub fn recorder_control() -> Endpoint<ControlRequest, ControlResponse> {
    Endpoint::new(RECORDER_CONTROL)
}

/// Endpoint responsible for `request`, or `None` for requests that have no
/// single owner (`Shutdown` fans out to every component).
pub fn control_route(request: &ControlRequest) -> Option<Endpoint<ControlRequest, ControlResponse>> {
    match request {
        ControlRequest::StartRecording { .. } | ControlRequest::StopRecording => {
            Some(recorder_control())
        }
        ControlRequest::PauseOperator { robot_id } | ControlRequest::ResumeOperator { robot_id } => {
            Some(operator_control(robot_id))
        }
        ControlRequest::Shutdown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_convention() {
        assert_eq!(pose(TrackedPart::RightHand).name(), "pose/right_hand");
        assert_eq!(raw_hand(TrackedPart::LeftHand).name(), "hand/raw/left_hand");
        assert_eq!(command("arm").name(), "command/arm");
        assert_eq!(state("arm").name(), "state/arm");
        assert_eq!(camera("wrist").name(), "camera/wrist");
        assert_eq!(diagnostics_name("arm"), "diagnostics/arm");
        assert_eq!(diagnostics_name("recorder"), RECORDER_DIAGNOSTICS);
        assert_eq!(operator_control("arm").name(), "control/operator/arm");
    }

    #[test]
    fn control_requests_route_to_owner() {
        let start = ControlRequest::StartRecording {
            episode_id: "ep".to_string(),
        };
        assert_eq!(control_route(&start).unwrap().name(), RECORDER_CONTROL);
        let pause = ControlRequest::PauseOperator {
            robot_id: "hand".to_string(),
        };
        assert_eq!(control_route(&pause).unwrap().name(), "control/operator/hand");
        assert!(control_route(&ControlRequest::Shutdown).is_none());
    }
}
