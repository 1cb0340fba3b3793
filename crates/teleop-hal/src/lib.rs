//! `teleop-hal` – Hardware Abstraction Layer.
//!
//! Everything on the far side of the command topic: robots that execute
//! commands, cameras that produce frames, and the tasks that wire them to the
//! bus.
//!
//! # Modules
//!
//! - [`sink`] – the [`RobotSink`] contract and [`SinkResponse`].
//! - [`camera`] – the [`Camera`] trait.
//! - [`sim`] – [`SimSink`][sim::SimSink] (arm or hand, built from a
//!   retarget model, scripted rejects) and [`SimCamera`][sim::SimCamera].
//! - [`driver`] – [`SinkDriver`][driver::SinkDriver] and
//!   [`CameraDriver`][driver::CameraDriver] tasks.

pub mod camera;
pub mod driver;
pub mod sim;
pub mod sink;

pub use camera::Camera;
pub use driver::{CameraDriver, CameraStats, SinkDriver, SinkStats};
pub use sim::{SimCamera, SimSink};
pub use sink::{RobotSink, SinkResponse};
