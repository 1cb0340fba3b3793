//! `teleop-retarget` – the retargeting engine.
//!
//! Maps a VR pose onto a robot's joint space, or onto an end-effector
//! target for task-space robots, through a per-robot
//! [`RetargetModel`][model::RetargetModel].
//!
//! # Modules
//!
//! - [`model`] – model types, TOML loading and validation, built-in demo
//!   models.
//! - [`arm`] – closed-form IK for the three-joint arm.
//! - [`hand`] – damped least-squares fingertip IK.
//! - [`engine`] – [`retarget`][engine::retarget], dispatching on the
//!   embodiment; the task-space mapping lives here.

pub mod arm;
pub mod engine;
pub mod hand;
pub mod model;

pub use engine::{Retargeted, retarget};
pub use model::{Embodiment, JointLimit, ModelError, RetargetModel};
