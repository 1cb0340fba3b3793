//! [`Recorder`] – multi-rate stream alignment.
//!
//! The recorder owns no clock.  Commands are the only strictly periodic
//! stream, so each accepted command closes one step.  Every other stream has
//! a single *fresh* slot:
//!
//! 1. a state, pose or frame sample overwrites its stream's slot;
//! 2. a command takes every slot's content (or `Missing` when the slot is
//!    empty) into a new step, then empties the slots.
//!
//! A sample is therefore attached to at most one step and never back-filled.
//!
//! Robot states name the command they answer ([`RobotState::answers`]), and
//! the answer to command `N - 1` belongs to step `N`.  A state still in the
//! slot when a later command closes the step is late: the step records it as
//! `Missing` and the state is dropped.  Samples must be fed in arrival order
//! by a single consumer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use teleop_types::{CameraFrame, Command, Pose6D, RobotState, TrackedPart};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::episode::{
    Aligned, CameraSlot, EPISODE_SCHEMA_VERSION, Episode, EpisodeIssue, EpisodeParts, FrameBlob,
    FrameRef, PoseRef, Step,
};

/// Default step limit: ten minutes at 30 Hz.
pub const DEFAULT_MAX_STEPS: usize = 18_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecorderError {
    #[error("already recording episode '{0}'")]
    AlreadyRecording(String),
    #[error("not recording")]
    NotRecording,
    #[error("episode id must not be empty")]
    EmptyEpisodeId,
}

/// Which streams one recorder aligns.
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderConfig {
    pub robot_id: String,
    pub pose_source: TrackedPart,
    pub cameras: Vec<String>,
    pub max_steps: usize,
}

impl RecorderConfig {
    pub fn new(robot_id: impl Into<String>, pose_source: TrackedPart) -> Self {
        Self {
            robot_id: robot_id.into(),
            pose_source,
            cameras: Vec::new(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_camera(mut self, camera_id: impl Into<String>) -> Self {
        self.cameras.push(camera_id.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }
}

/// Live progress of a recorder, published while it records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecorderStatus {
    pub robot_id: String,
    /// `None` when idle.
    pub episode_id: Option<String>,
    pub steps: usize,
    pub gaps: usize,
    pub discarded: u64,
    pub truncated: u64,
    pub missing_states: usize,
    pub missing_frames: usize,
    /// States dropped because they answered an older command.
    pub late_states: u64,
    /// Samples the bus dropped on the recorder's queue.
    pub dropped_samples: u64,
    /// The episode would be sealed incomplete if stopped now.
    pub incomplete: bool,
}

struct ActiveEpisode {
    episode_id: String,
    started_at: DateTime<Utc>,
    steps: Vec<Step>,
    frame_data: Vec<FrameBlob>,
    state: Option<RobotState>,
    pose: Option<PoseRef>,
    frames: HashMap<String, CameraFrame>,
    /// `(operator instance, seq)` of the last recorded command.
    last: Option<(Uuid, u64)>,
    gaps: Vec<EpisodeIssue>,
    discarded: u64,
    truncated: u64,
    late_states: u64,
    missing_states: usize,
    missing_frames: usize,
}

/// Aligns pose, state, camera and command samples into an [`Episode`].
///
/// # Example
///
/// ```
/// use teleop_recorder::recorder::{Recorder, RecorderConfig};
/// use teleop_types::TrackedPart;
///
/// let mut rec = Recorder::new(RecorderConfig::new("arm", TrackedPart::RightHand));
/// rec.start("demo").unwrap();
/// let episode = rec.stop().unwrap();
/// assert!(episode.is_empty());
/// assert!(!episode.incomplete());
/// ```
pub struct Recorder {
    config: RecorderConfig,
    active: Option<ActiveEpisode>,
}

impl Recorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            active: None,
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn episode_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.episode_id.as_str())
    }

    /// Steps recorded so far in the active episode.
    pub fn step_count(&self) -> usize {
        self.active.as_ref().map_or(0, |a| a.steps.len())
    }

    /// Progress of the active episode, or an idle status.
    pub fn status(&self) -> RecorderStatus {
        let Some(active) = &self.active else {
            return RecorderStatus {
                robot_id: self.config.robot_id.clone(),
                ..RecorderStatus::default()
            };
        };
        RecorderStatus {
            robot_id: self.config.robot_id.clone(),
            episode_id: Some(active.episode_id.clone()),
            steps: active.steps.len(),
            gaps: active.gaps.len(),
            discarded: active.discarded,
            truncated: active.truncated,
            missing_states: active.missing_states,
            missing_frames: active.missing_frames,
            late_states: active.late_states,
            dropped_samples: 0,
            incomplete: !active.gaps.is_empty() || active.discarded > 0 || active.truncated > 0,
        }
    }

    /// Begin a new episode.  Slots start empty: samples seen before `start`
    /// are not attached.
    pub fn start(&mut self, episode_id: &str) -> Result<(), RecorderError> {
        if let Some(active) = &self.active {
            return Err(RecorderError::AlreadyRecording(active.episode_id.clone()));
        }
        if episode_id.trim().is_empty() {
            return Err(RecorderError::EmptyEpisodeId);
        }
        info!(episode = episode_id, robot = %self.config.robot_id, "recording started");
        self.active = Some(ActiveEpisode {
            episode_id: episode_id.to_string(),
            started_at: Utc::now(),
            steps: Vec::new(),
            frame_data: Vec::new(),
            state: None,
            pose: None,
            frames: HashMap::new(),
            last: None,
            gaps: Vec::new(),
            discarded: 0,
            truncated: 0,
            late_states: 0,
            missing_states: 0,
            missing_frames: 0,
        });
        Ok(())
    }

    pub fn ingest_state(&mut self, state: &RobotState) {
        if state.robot_id != self.config.robot_id {
            return;
        }
        if let Some(active) = self.active.as_mut() {
            active.state = Some(state.clone());
        }
    }

    pub fn ingest_pose(&mut self, pose: &Pose6D) {
        if pose.source != self.config.pose_source {
            return;
        }
        if let Some(active) = self.active.as_mut() {
            active.pose = Some(PoseRef::from(pose));
        }
    }

    pub fn ingest_frame(&mut self, frame: &CameraFrame) {
        if !self.config.cameras.contains(&frame.camera_id) {
            return;
        }
        if let Some(active) = self.active.as_mut() {
            active.frames.insert(frame.camera_id.clone(), frame.clone());
        }
    }

    /// Close one step with `command`.  Returns `true` when a step was
    /// appended.
    pub fn ingest_command(&mut self, command: &Command) -> bool {
        if command.robot_id != self.config.robot_id {
            return false;
        }
        let Some(active) = self.active.as_mut() else {
            return false;
        };

        if let Some((instance, last_seq)) = active.last {
            if instance != command.operator_instance || command.seq <= last_seq {
                active.discarded += 1;
                debug!(seq = command.seq, last_seq, "command discarded");
                return false;
            }
            if command.seq != last_seq + 1 {
                warn!(after = last_seq, next = command.seq, "command seq gap");
                active.gaps.push(EpisodeIssue::SequenceGap {
                    after: last_seq,
                    next: command.seq,
                });
            }
        }
        active.last = Some((command.operator_instance, command.seq));

        if active.steps.len() >= self.config.max_steps {
            active.truncated += 1;
            return false;
        }

        let mut frames = Vec::with_capacity(self.config.cameras.len());
        for camera_id in &self.config.cameras {
            let frame = active.frames.remove(camera_id).map(|f| {
                let reference = FrameRef::from(&f);
                active.frame_data.push(FrameBlob {
                    camera_id: f.camera_id,
                    frame_index: f.frame_index,
                    data: f.data,
                });
                reference
            });
            frames.push(CameraSlot {
                camera_id: camera_id.clone(),
                frame: frame.into(),
            });
        }

        let state = match active.state.take() {
            Some(state) if state.answers().is_some_and(|seq| seq + 1 < command.seq) => {
                active.late_states += 1;
                debug!(answers = ?state.answers(), seq = command.seq, "late state dropped");
                None
            }
            other => other,
        };
        if state.is_none() {
            active.missing_states += 1;
        }
        active.missing_frames += frames.iter().filter(|slot| !slot.frame.is_present()).count();

        let step = Step {
            index: active.steps.len() as u64,
            command: command.clone(),
            state: Aligned::from(state),
            pose: Aligned::from(active.pose.take()),
            frames,
        };
        active.steps.push(step);
        true
    }

    /// Seal the active episode.
    ///
    /// Gaps, discarded commands and truncation mark the episode incomplete
    /// but never drop recorded steps.
    pub fn stop(&mut self) -> Result<Episode, RecorderError> {
        let active = self.active.take().ok_or(RecorderError::NotRecording)?;
        let mut issues = active.gaps;
        if active.discarded > 0 {
            issues.push(EpisodeIssue::DiscardedCommands {
                count: active.discarded,
            });
        }
        if active.truncated > 0 {
            issues.push(EpisodeIssue::Truncated {
                max_steps: self.config.max_steps,
                dropped: active.truncated,
            });
        }

        let episode = Episode::from_parts(EpisodeParts {
            schema_version: EPISODE_SCHEMA_VERSION,
            episode_id: active.episode_id,
            robot_id: self.config.robot_id.clone(),
            cameras: self.config.cameras.clone(),
            started_at: active.started_at,
            sealed_at: Utc::now(),
            issues,
            steps: active.steps,
            frame_data: active.frame_data,
        });
        let summary = episode.summary();
        info!(
            episode = %summary.episode_id,
            steps = summary.steps,
            incomplete = summary.incomplete,
            missing_states = summary.missing_states,
            missing_frames = summary.missing_frames,
            late_states = active.late_states,
            "episode sealed"
        );
        Ok(episode)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use teleop_types::{CommandFlags, CommandPayload, StateStatus};

    pub(crate) fn command(seq: u64) -> Command {
        Command {
            robot_id: "arm".into(),
            operator_instance: Uuid::nil(),
            seq,
            payload: CommandPayload::Joints {
                positions: vec![0.1 * seq as f64, 0.2, 0.3],
                gripper: Some(0.5),
            },
            flags: CommandFlags::default(),
            confidence: 0.9,
            pose_seq: Some(seq * 3),
            issued_at: Utc::now(),
        }
    }

    pub(crate) fn state(command_seq: Option<u64>) -> RobotState {
        RobotState {
            robot_id: "arm".into(),
            positions: vec![0.0, 0.5, -0.25],
            end_effector: Some([0.3, 0.0, 0.2]),
            hw_timestamp: Utc::now(),
            command_seq,
            status: StateStatus::Accepted,
        }
    }

    pub(crate) fn frame(camera_id: &str, frame_index: u64) -> CameraFrame {
        CameraFrame {
            camera_id: camera_id.into(),
            frame_index,
            width: 2,
            height: 1,
            encoding: "mono8".into(),
            data: vec![frame_index as u8, 7],
            captured_at: Utc::now(),
        }
    }

    fn recorder() -> Recorder {
        Recorder::new(RecorderConfig::new("arm", TrackedPart::RightHand).with_camera("wrist"))
    }

    #[test]
    fn k_commands_make_k_gap_free_steps() {
        let mut rec = recorder();
        rec.start("ep").unwrap();
        for seq in 1..=5 {
            rec.ingest_state(&state(Some(seq - 1)));
            assert!(rec.ingest_command(&command(seq)));
        }
        let episode = rec.stop().unwrap();
        assert_eq!(episode.len(), 5);
        assert!(!episode.incomplete());
        for (i, step) in episode.steps().iter().enumerate() {
            assert_eq!(step.index, i as u64);
            assert_eq!(step.command.seq, i as u64 + 1);
        }
    }

    #[test]
    fn empty_slots_are_missing_and_never_back_filled() {
        let mut rec = recorder();
        rec.start("ep").unwrap();
        rec.ingest_state(&state(Some(0)));
        rec.ingest_frame(&frame("wrist", 1));
        rec.ingest_command(&command(1));
        // Nothing fresh before command 2.
        rec.ingest_command(&command(2));
        // The answer to command 2 arrives before command 3.
        rec.ingest_state(&state(Some(2)));
        rec.ingest_command(&command(3));
        let episode = rec.stop().unwrap();

        let steps = episode.steps();
        assert!(steps[0].state.is_present());
        assert!(steps[0].frames[0].frame.is_present());
        assert_eq!(steps[1].state, Aligned::Missing);
        assert_eq!(steps[1].frames[0].frame, Aligned::Missing);
        assert_eq!(steps[2].state.as_option().unwrap().command_seq, Some(2));

        let summary = episode.summary();
        assert_eq!(summary.missing_states, 1);
        assert_eq!(summary.missing_frames, 2);
        assert_eq!(episode.frame_blob("wrist", 1).unwrap().data, vec![1, 7]);
    }

    #[test]
    fn state_answering_an_older_command_is_dropped_as_late() {
        let mut rec = recorder();
        rec.start("ep").unwrap();
        rec.ingest_state(&state(Some(0)));
        rec.ingest_command(&command(1));
        rec.ingest_command(&command(2));
        // The answer to command 1 only shows up after command 2.
        rec.ingest_state(&state(Some(1)));
        rec.ingest_command(&command(3));

        let status = rec.status();
        assert_eq!(status.late_states, 1);
        assert_eq!(status.missing_states, 2);
        assert!(!status.incomplete);

        let episode = rec.stop().unwrap();
        let steps = episode.steps();
        assert_eq!(steps[0].state.as_option().unwrap().command_seq, Some(0));
        assert_eq!(steps[1].state, Aligned::Missing);
        assert_eq!(steps[2].state, Aligned::Missing);
        assert_eq!(episode.summary().missing_states, 2);
    }

    #[test]
    fn held_state_answers_the_rejected_command() {
        let mut rec = recorder();
        rec.start("ep").unwrap();
        rec.ingest_command(&command(1));
        rec.ingest_command(&command(2));
        // Command 2 was refused: the robot still holds command 1's target.
        let mut held = state(Some(1));
        held.status = StateStatus::Held {
            reason: "out of range".into(),
            rejected_seq: 2,
        };
        rec.ingest_state(&held);
        rec.ingest_command(&command(3));
        let episode = rec.stop().unwrap();
        let attached = episode.steps()[2].state.as_option().unwrap();
        assert!(matches!(attached.status, StateStatus::Held { .. }));
        assert_eq!(attached.command_seq, Some(1));
    }

    #[test]
    fn status_tracks_progress_while_recording() {
        let mut rec = recorder();
        assert_eq!(rec.status().episode_id, None);
        rec.start("ep").unwrap();
        rec.ingest_frame(&frame("wrist", 1));
        rec.ingest_command(&command(1));
        let status = rec.status();
        assert_eq!(status.episode_id.as_deref(), Some("ep"));
        assert_eq!((status.steps, status.missing_states, status.missing_frames), (1, 1, 0));
        assert!(!status.incomplete);

        rec.ingest_command(&command(3));
        let status = rec.status();
        assert_eq!(status.gaps, 1);
        assert_eq!(status.missing_frames, 1);
        assert!(status.incomplete);
    }

    #[test]
    fn a_sample_is_attached_at_most_once() {
        let mut rec = recorder();
        rec.start("ep").unwrap();
        rec.ingest_pose(&Pose6D::new(TrackedPart::RightHand, 9, [0.0; 3], [1.0, 0.0, 0.0, 0.0]));
        rec.ingest_command(&command(1));
        rec.ingest_command(&command(2));
        let episode = rec.stop().unwrap();
        assert_eq!(episode.steps()[0].pose.as_option().unwrap().seq, 9);
        assert!(!episode.steps()[1].pose.is_present());
    }

    #[test]
    fn stale_and_duplicate_commands_are_discarded_and_flagged() {
        let mut rec = recorder();
        rec.start("ep").unwrap();
        assert!(rec.ingest_command(&command(1)));
        assert!(rec.ingest_command(&command(2)));
        assert!(!rec.ingest_command(&command(2)));
        assert!(!rec.ingest_command(&command(1)));
        let episode = rec.stop().unwrap();
        assert_eq!(episode.len(), 2);
        assert!(episode.incomplete());
        assert_eq!(episode.issues(), &[EpisodeIssue::DiscardedCommands { count: 2 }]);
    }

    #[test]
    fn sequence_gap_keeps_data_but_marks_incomplete() {
        let mut rec = recorder();
        rec.start("ep").unwrap();
        rec.ingest_command(&command(1));
        rec.ingest_command(&command(4));
        let episode = rec.stop().unwrap();
        assert_eq!(episode.len(), 2);
        assert_eq!(episode.steps()[1].index, 1);
        assert_eq!(episode.issues(), &[EpisodeIssue::SequenceGap { after: 1, next: 4 }]);
        assert!(matches!(
            episode.check_complete(),
            Err(teleop_types::TeleopError::EpisodeIncomplete { .. })
        ));
    }

    #[test]
    fn max_steps_truncates() {
        let mut rec = Recorder::new(RecorderConfig::new("arm", TrackedPart::RightHand).with_max_steps(2));
        rec.start("ep").unwrap();
        for seq in 1..=4 {
            rec.ingest_command(&command(seq));
        }
        let episode = rec.stop().unwrap();
        assert_eq!(episode.len(), 2);
        assert_eq!(
            episode.issues(),
            &[EpisodeIssue::Truncated {
                max_steps: 2,
                dropped: 2
            }]
        );
    }

    #[test]
    fn other_robots_and_idle_samples_are_ignored() {
        let mut rec = recorder();
        rec.ingest_command(&command(1));
        assert_eq!(rec.stop(), Err(RecorderError::NotRecording));

        rec.start("ep").unwrap();
        assert_eq!(rec.start("again"), Err(RecorderError::AlreadyRecording("ep".into())));
        let mut other = command(1);
        other.robot_id = "hand".into();
        assert!(!rec.ingest_command(&other));
        rec.ingest_frame(&frame("unconfigured", 1));
        assert!(rec.ingest_command(&command(1)));
        let episode = rec.stop().unwrap();
        assert_eq!(episode.len(), 1);
        assert!(episode.frame_data().is_empty());
    }

    #[test]
    fn empty_episode_id_is_rejected() {
        let mut rec = recorder();
        assert_eq!(rec.start("  "), Err(RecorderError::EmptyEpisodeId));
    }
}
