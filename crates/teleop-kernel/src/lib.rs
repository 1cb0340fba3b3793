//! `teleop-kernel` – safety and supervision.
//!
//! Sits between the retargeting engine and the robot: nothing reaches a sink
//! without passing the limiter, and every running component is watched.
//!
//! # Modules
//!
//! - [`limiter`] – [`SafetyLimiter`][limiter::SafetyLimiter]: an ordered
//!   chain of [`LimitRule`][limiter::LimitRule]s that saturate each command
//!   against the previously published one (joint range, joint velocity,
//!   end-effector translation, gripper).
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: heartbeat deadlines
//!   per component with edge-triggered timeout reporting.

pub mod limiter;
pub mod watchdog;

pub use limiter::{LimitOutcome, LimitRule, SafetyLimiter};
pub use watchdog::{ComponentHealth, HealthChange, Watchdog};
