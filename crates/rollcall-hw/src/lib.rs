//! rollcall-hw — Webcam capture for the attendance loop.
//!
//! Provides V4L2-based camera access and conversion of raw YUYV or MJPEG
//! buffers into RGB frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameStream, PixelFormat};
pub use frame::{Frame, FrameError};
