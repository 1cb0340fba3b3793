//! Generic `Camera` trait for image-capture hardware.

use teleop_types::{CameraFrame, TeleopError};

/// A camera or image-capture device.
///
/// [`CameraDriver`][crate::driver::CameraDriver] polls it at a fixed rate
/// and publishes every frame on `camera/<id>`.
pub trait Camera: Send {
    /// Stable identifier for this camera, e.g. `"wrist_rgb"`.
    fn id(&self) -> &str;

    /// Capture and return the next available frame.
    ///
    /// # Errors
    ///
    /// [`TeleopError::HardwareFault`] when no frame is available; the driver
    /// counts it and keeps polling.
    fn capture(&mut self) -> Result<CameraFrame, TeleopError>;
}
