//! The robot command sink contract.
//!
//! A sink is the last stop before hardware (or a simulator).  It answers each
//! [`Command`] synchronously with [`SinkResponse::Ack`] or
//! [`SinkResponse::Reject`] and reports the robot's measured state on demand.

use std::fmt;

use teleop_types::{Command, RobotState};

/// Outcome of [`RobotSink::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkResponse {
    Ack,
    /// The command was refused; the robot keeps its previous target.
    Reject(String),
}

impl SinkResponse {
    pub fn is_ack(&self) -> bool {
        matches!(self, SinkResponse::Ack)
    }
}

impl fmt::Display for SinkResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkResponse::Ack => write!(f, "ack"),
            SinkResponse::Reject(reason) => write!(f, "reject: {reason}"),
        }
    }
}

/// A robot (or robot simulator) that executes commands.
///
/// Implementations must not block for long inside [`send`][Self::send]: the
/// driver task calls it once per received command.
pub trait RobotSink: Send {
    /// Stable robot identifier, e.g. `"arm"`.  Matches the command topic.
    fn id(&self) -> &str;

    /// Hand one command to the robot.
    fn send(&mut self, command: &Command) -> SinkResponse;

    /// Current measured state.
    fn state(&self) -> RobotState;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use teleop_types::{CommandFlags, CommandPayload, StateStatus};

    fn command(seq: u64) -> Command {
        Command {
            robot_id: "mock".into(),
            operator_instance: Default::default(),
            seq,
            payload: CommandPayload::Joints {
                positions: vec![seq as f64],
                gripper: None,
            },
            flags: CommandFlags::default(),
            confidence: 1.0,
            pose_seq: None,
            issued_at: Utc::now(),
        }
    }

    struct EvenOnly {
        last: Option<u64>,
    }

    impl RobotSink for EvenOnly {
        fn id(&self) -> &str {
            "mock"
        }

        fn send(&mut self, command: &Command) -> SinkResponse {
            if command.seq % 2 == 0 {
                self.last = Some(command.seq);
                SinkResponse::Ack
            } else {
                SinkResponse::Reject("odd".into())
            }
        }

        fn state(&self) -> RobotState {
            RobotState {
                robot_id: "mock".into(),
                positions: vec![self.last.unwrap_or(0) as f64],
                end_effector: None,
                hw_timestamp: Utc::now(),
                command_seq: self.last,
                status: StateStatus::Accepted,
            }
        }
    }

    #[test]
    fn trait_object_dispatch() {
        let mut sink: Box<dyn RobotSink> = Box::new(EvenOnly { last: None });
        assert!(sink.send(&command(2)).is_ack());
        assert_eq!(sink.send(&command(3)), SinkResponse::Reject("odd".into()));
        assert_eq!(sink.state().command_seq, Some(2));
        assert_eq!(SinkResponse::Reject("odd".into()).to_string(), "reject: odd");
    }
}
