//! touchguard-hw: hardware abstraction for webcam capture and alert sound.
//!
//! Provides V4L2-based camera access with RGB conversion and `cpal`-based
//! playback of the warning tone.

pub mod audio;
pub mod camera;
pub mod frame;

pub use audio::{AlertTone, AudioError};
pub use camera::{Camera, CameraError, CaptureSource, DeviceInfo, PixelFormat};
pub use frame::Frame;
