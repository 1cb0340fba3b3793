//! Pose source adapters.
//!
//! The VR runtime is opaque: whatever produces poses only has to satisfy
//! [`PoseSource`].  Reads never block; a missing part is reported as
//! [`PoseUnavailable`] and the caller decides what that means.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use teleop_middleware::{ChannelError, MessageBus, Subscription, topics};
use teleop_types::{Pose6D, TeleopError, TrackedPart};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoseUnavailable {
    /// The source was not configured to track this part.
    #[error("{0} is not tracked by this source")]
    NotTracked(TrackedPart),

    /// Tracked, but no sample has arrived yet.
    #[error("no {0} sample received yet")]
    NoSample(TrackedPart),
}

impl From<PoseUnavailable> for TeleopError {
    fn from(err: PoseUnavailable) -> Self {
        let part = match &err {
            PoseUnavailable::NotTracked(p) | PoseUnavailable::NoSample(p) => *p,
        };
        TeleopError::TransientSampleLoss {
            topic: topics::pose(part).name().to_string(),
        }
    }
}

/// Non-blocking access to the most recent pose of each tracked part.
pub trait PoseSource: Send + Sync {
    fn latest_pose(&self, part: TrackedPart) -> Result<Arc<Pose6D>, PoseUnavailable>;
}

// ────────────────────────────────────────────────────────────────────────────
// Bus-backed source
// ────────────────────────────────────────────────────────────────────────────

/// Reads `pose/<part>` topics through latest-value subscriptions.
pub struct BusPoseSource {
    subscriptions: HashMap<TrackedPart, Subscription<Pose6D>>,
}

impl BusPoseSource {
    /// Subscribe to every part in `parts`.
    pub fn new(bus: &MessageBus, parts: &[TrackedPart]) -> Result<Self, ChannelError> {
        let mut subscriptions = HashMap::new();
        for part in parts {
            subscriptions.insert(*part, bus.subscribe(&topics::pose(*part))?);
        }
        Ok(Self { subscriptions })
    }
}

impl PoseSource for BusPoseSource {
    fn latest_pose(&self, part: TrackedPart) -> Result<Arc<Pose6D>, PoseUnavailable> {
        self.subscriptions
            .get(&part)
            .ok_or(PoseUnavailable::NotTracked(part))?
            .latest()
            .ok_or(PoseUnavailable::NoSample(part))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory source
// ────────────────────────────────────────────────────────────────────────────

/// A source whose poses are set directly; used by replay and tests.
#[derive(Default)]
pub struct StaticPoseSource {
    poses: Mutex<HashMap<TrackedPart, Arc<Pose6D>>>,
}

impl StaticPoseSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current pose for `pose.source`.
    pub fn set(&self, pose: Pose6D) {
        self.poses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pose.source, Arc::new(pose));
    }

    pub fn clear(&self, part: TrackedPart) {
        self.poses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&part);
    }
}

impl PoseSource for StaticPoseSource {
    fn latest_pose(&self, part: TrackedPart) -> Result<Arc<Pose6D>, PoseUnavailable> {
        self.poses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&part)
            .cloned()
            .ok_or(PoseUnavailable::NoSample(part))
    }
}
