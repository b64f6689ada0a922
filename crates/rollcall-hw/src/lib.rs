//! rollcall-hw — Exclusive video source access for the capture loop.
//!
//! Provides V4L2-based camera access producing grayscale frames.

pub mod camera;
pub mod frame;

pub use camera::{
    Camera, CameraError, DeviceInfo, PixelFormat, SourceOpener, V4lOpener, VideoSource,
};
pub use frame::Frame;
