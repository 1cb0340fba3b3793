//! `teleop-perception` – from headset samples to poses.
//!
//! Turns raw VR tracking data into the [`Pose6D`][teleop_types::Pose6D]
//! samples the operators retarget.
//!
//! # Modules
//!
//! - [`transform`] – [`Vec3`][transform::Vec3],
//!   [`Quaternion`][transform::Quaternion] and
//!   [`Transform3D`][transform::Transform3D] rigid-body math.
//! - [`keypoints`] – [`HandKeypointTransformer`][keypoints::HandKeypointTransformer]:
//!   canonical hand frame from wrist and knuckles, with moving-average
//!   smoothing.
//! - [`keypoint_log`] – [`KeypointLogger`][keypoint_log::KeypointLogger]: JSON
//!   log of transformed frames with periodic auto-save.
//! - [`pose_source`] – the [`PoseSource`][pose_source::PoseSource] contract and
//!   its bus-backed and in-memory implementations.
//! - [`service`] – task publishing hand poses from raw keypoints.

pub mod keypoint_log;
pub mod keypoints;
pub mod pose_source;
pub mod service;
pub mod transform;

pub use pose_source::{BusPoseSource, PoseSource, PoseUnavailable, StaticPoseSource};
