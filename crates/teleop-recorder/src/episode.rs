//! The episode data model.
//!
//! An [`Episode`] is the unit of persistence: an ordered, gap-checked list of
//! [`Step`]s, each holding one [`Command`] together with the robot state,
//! pose and camera frames that were fresh when the command was published.
//! Episodes are built only by the [`Recorder`][crate::recorder::Recorder] or
//! loaded from an [`EpisodeStore`][crate::store::EpisodeStore]; once sealed
//! they are read-only.
//!
//! # Schema (version 1)
//!
//! | field | type | description |
//! |---|---|---|
//! | `schema_version` | u32 | [`EPISODE_SCHEMA_VERSION`] |
//! | `episode_id` | string | caller-chosen, unique per store |
//! | `robot_id` | string | the robot whose command stream defines the steps |
//! | `cameras` | string[] | camera ids with a frame slot in every step |
//! | `started_at` / `sealed_at` | RFC 3339 | advisory wall-clock bounds |
//! | `incomplete` | bool | `true` when `issues` is non-empty |
//! | `issues` | [`EpisodeIssue`][] | validation findings |
//! | `steps` | [`Step`][] | index `0..K-1` |
//!
//! Camera pixel data is not part of the JSON document; frames are referenced
//! by `(camera_id, frame_index)` and stored separately.
//! [`episode_json_schema`] emits the JSON Schema of this document.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use schemars::schema::RootSchema;
use serde::{Deserialize, Serialize};
use teleop_types::{CameraFrame, Command, EpisodeSummary, Pose6D, RobotState, TeleopError, TrackedPart};

pub const EPISODE_SCHEMA_VERSION: u32 = 1;

// ────────────────────────────────────────────────────────────────────────────
// Aligned samples
// ────────────────────────────────────────────────────────────────────────────

/// A stream sample attached to a step, or an explicit marker that none was
/// fresh when the step's command arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Aligned<T> {
    Present(T),
    Missing,
}

impl<T> Aligned<T> {
    pub fn is_present(&self) -> bool {
        matches!(self, Aligned::Present(_))
    }

    pub fn as_option(&self) -> Option<&T> {
        match self {
            Aligned::Present(v) => Some(v),
            Aligned::Missing => None,
        }
    }
}

impl<T> From<Option<T>> for Aligned<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Aligned::Missing, Aligned::Present)
    }
}

/// The pose sample a step was recorded with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PoseRef {
    pub source: TrackedPart,
    pub seq: u64,
    pub translation: [f64; 3],
    pub rotation: [f64; 4],
    #[serde(default)]
    pub keypoints: Vec<[f64; 3]>,
    pub captured_at: DateTime<Utc>,
}

impl From<&Pose6D> for PoseRef {
    fn from(pose: &Pose6D) -> Self {
        Self {
            source: pose.source,
            seq: pose.seq,
            translation: pose.translation,
            rotation: pose.rotation,
            keypoints: pose.keypoints.clone(),
            captured_at: pose.captured_at,
        }
    }
}

/// Reference to a camera frame; pixel data lives in [`FrameBlob`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FrameRef {
    pub camera_id: String,
    pub frame_index: u64,
    pub width: u32,
    pub height: u32,
    pub encoding: String,
    pub captured_at: DateTime<Utc>,
}

impl From<&CameraFrame> for FrameRef {
    fn from(frame: &CameraFrame) -> Self {
        Self {
            camera_id: frame.camera_id.clone(),
            frame_index: frame.frame_index,
            width: frame.width,
            height: frame.height,
            encoding: frame.encoding.clone(),
            captured_at: frame.captured_at,
        }
    }
}

/// Pixel data of a referenced frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBlob {
    pub camera_id: String,
    pub frame_index: u64,
    pub data: Vec<u8>,
}

/// One camera's slot in a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CameraSlot {
    pub camera_id: String,
    pub frame: Aligned<FrameRef>,
}

// ────────────────────────────────────────────────────────────────────────────
// Step & issues
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    pub index: u64,
    pub command: Command,
    pub state: Aligned<RobotState>,
    pub pose: Aligned<PoseRef>,
    /// One slot per configured camera, in configuration order.
    pub frames: Vec<CameraSlot>,
}

impl Step {
    pub fn missing_frames(&self) -> usize {
        self.frames.iter().filter(|s| !s.frame.is_present()).count()
    }
}

/// Findings that mark an episode incomplete.  The data is kept regardless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EpisodeIssue {
    /// Command seqs jump from `after` to `next`: commands were lost before
    /// reaching the recorder.
    SequenceGap { after: u64, next: u64 },
    /// Commands with a seq not above the last recorded one (or from another
    /// operator instance) were discarded.
    DiscardedCommands { count: u64 },
    /// The step limit was reached; `dropped` further commands were not
    /// recorded.
    Truncated { max_steps: usize, dropped: u64 },
}

impl std::fmt::Display for EpisodeIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EpisodeIssue::SequenceGap { after, next } => {
                write!(f, "command seq gap {after} -> {next}")
            }
            EpisodeIssue::DiscardedCommands { count } => {
                write!(f, "{count} out-of-order command(s) discarded")
            }
            EpisodeIssue::Truncated { max_steps, dropped } => {
                write!(f, "truncated at {max_steps} steps ({dropped} command(s) dropped)")
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Episode
// ────────────────────────────────────────────────────────────────────────────

/// A sealed recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Episode {
    schema_version: u32,
    episode_id: String,
    robot_id: String,
    cameras: Vec<String>,
    started_at: DateTime<Utc>,
    sealed_at: DateTime<Utc>,
    incomplete: bool,
    issues: Vec<EpisodeIssue>,
    steps: Vec<Step>,
    #[serde(skip)]
    frame_data: Vec<FrameBlob>,
}

/// Parts of an episode as read back from storage.
pub(crate) struct EpisodeParts {
    pub schema_version: u32,
    pub episode_id: String,
    pub robot_id: String,
    pub cameras: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub sealed_at: DateTime<Utc>,
    pub issues: Vec<EpisodeIssue>,
    pub steps: Vec<Step>,
    pub frame_data: Vec<FrameBlob>,
}

impl Episode {
    pub(crate) fn from_parts(parts: EpisodeParts) -> Self {
        Self {
            schema_version: parts.schema_version,
            episode_id: parts.episode_id,
            robot_id: parts.robot_id,
            cameras: parts.cameras,
            started_at: parts.started_at,
            sealed_at: parts.sealed_at,
            incomplete: !parts.issues.is_empty(),
            issues: parts.issues,
            steps: parts.steps,
            frame_data: parts.frame_data,
        }
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn episode_id(&self) -> &str {
        &self.episode_id
    }

    pub fn robot_id(&self) -> &str {
        &self.robot_id
    }

    pub fn cameras(&self) -> &[String] {
        &self.cameras
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn sealed_at(&self) -> DateTime<Utc> {
        self.sealed_at
    }

    pub fn incomplete(&self) -> bool {
        self.incomplete
    }

    pub fn issues(&self) -> &[EpisodeIssue] {
        &self.issues
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Pixel data of every referenced frame.
    pub fn frame_data(&self) -> &[FrameBlob] {
        &self.frame_data
    }

    pub fn frame_blob(&self, camera_id: &str, frame_index: u64) -> Option<&FrameBlob> {
        self.frame_data
            .iter()
            .find(|b| b.camera_id == camera_id && b.frame_index == frame_index)
    }

    pub fn summary(&self) -> EpisodeSummary {
        EpisodeSummary {
            episode_id: self.episode_id.clone(),
            steps: self.steps.len(),
            incomplete: self.incomplete,
            missing_states: self.steps.iter().filter(|s| !s.state.is_present()).count(),
            missing_frames: self.steps.iter().map(Step::missing_frames).sum(),
        }
    }

    /// `Err(EpisodeIncomplete)` listing the issues when the episode is
    /// incomplete.
    pub fn check_complete(&self) -> Result<(), TeleopError> {
        if !self.incomplete {
            return Ok(());
        }
        let details = self
            .issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(TeleopError::EpisodeIncomplete {
            episode_id: self.episode_id.clone(),
            details,
        })
    }

    /// Pretty-printed JSON document (without pixel data).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// JSON Schema of the episode document.
pub fn episode_json_schema() -> RootSchema {
    schemars::schema_for!(Episode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_serializes_with_explicit_missing_marker() {
        let missing: Aligned<u32> = None.into();
        assert_eq!(serde_json::to_value(&missing).unwrap(), serde_json::json!({"status": "missing"}));
        let present: Aligned<u32> = Some(3).into();
        assert_eq!(
            serde_json::to_value(&present).unwrap(),
            serde_json::json!({"status": "present", "value": 3})
        );
        assert_eq!(present.as_option(), Some(&3));
    }

    #[test]
    fn schema_documents_steps_and_version() {
        let schema = serde_json::to_value(episode_json_schema()).unwrap();
        let props = &schema["properties"];
        assert!(props.get("schema_version").is_some());
        assert!(props.get("steps").is_some());
        assert!(props.get("frame_data").is_none());
        assert!(schema["definitions"].get("Step").is_some());
    }

    #[test]
    fn issues_render_for_diagnostics() {
        let issue = EpisodeIssue::SequenceGap { after: 3, next: 6 };
        assert_eq!(issue.to_string(), "command seq gap 3 -> 6");
        let json = serde_json::to_value(&issue).unwrap();
        assert_eq!(json["kind"], "sequence_gap");
    }
}
