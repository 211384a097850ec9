//! rollcall-hw — V4L2 color camera capture.
//!
//! Negotiates a color format with the driver, converts each buffer to
//! packed RGB and exposes the camera as a pipeline frame source.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraOpener, DeviceInfo, PixelFormat};
pub use frame::FrameError;
