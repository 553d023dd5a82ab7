//! V4L2 webcam capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// A live source of video frames.
pub trait CaptureSource: Send {
    /// Dequeue the most recent frame from the stream.
    fn current_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion-JPEG, one JPEG image per buffer.
    Mjpg,
    /// Packed RGB24, passed through as-is.
    Rgb3,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"MJPG") {
            Some(Self::Mjpg)
        } else if fourcc == FourCC::new(b"RGB3") {
            Some(Self::Rgb3)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else {
            None
        }
    }
}

/// Buffers requested for the mmap stream. Kept small: every buffer is a
/// frame that can be waiting, already old, when a capture is requested.
const STREAM_BUFFERS: u32 = 2;

/// V4L2 camera device handle with a persistent mmap capture stream.
pub struct Camera {
    /// Created on first capture and kept for the camera's lifetime.
    stream: Option<MmapStream<'static>>,
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0") and
    /// negotiate the requested resolution.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV; most webcams also offer MJPG, and some only GREY or RGB3.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;

        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, MJPG, RGB3, or GREY)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            stream: None,
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Negotiated pixel format.
    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Capture a single frame, converting it to RGB24.
    ///
    /// The returned frame was exposed after this call began: buffers the
    /// driver filled while nobody was asking are dequeued and dropped.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        if self.stream.is_none() {
            let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| {
                    CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
                })?;
            self.stream = Some(stream);
        }

        let (width, height, pixel_format) = (self.width, self.height, self.pixel_format);
        let Some(stream) = self.stream.as_mut() else {
            return Err(CameraError::CaptureFailed("capture stream not started".into()));
        };

        skip_queued(STREAM_BUFFERS as usize, || stream.next().map(|_| ()))
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;

        let (rgb, width, height) = buf_to_rgb(pixel_format, buf, width, height)?;
        let is_dark = frame::is_dark_frame(&rgb, 0.95);

        Ok(Frame {
            data: rgb,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
            is_dark,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl CaptureSource for Camera {
    fn current_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

/// Drain the frames that were already waiting in the queue.
///
/// A V4L2 mmap stream hands out the oldest filled buffer and re-queues the
/// previous one on each `advance`. After `depth - 1` advances every stale
/// buffer is gone, so the next dequeue waits for a frame exposed after the
/// caller started.
fn skip_queued<E>(depth: usize, mut advance: impl FnMut() -> Result<(), E>) -> Result<(), E> {
    for _ in 1..depth {
        advance()?;
    }
    Ok(())
}

/// Convert a raw buffer to RGB24 based on the negotiated format.
///
/// Returns the pixel data with its actual dimensions (MJPG carries its own).
fn buf_to_rgb(
    pixel_format: PixelFormat,
    buf: &[u8],
    width: u32,
    height: u32,
) -> Result<(Vec<u8>, u32, u32), CameraError> {
    let converted = match pixel_format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height).map(|rgb| (rgb, width, height)),
        PixelFormat::Grey => frame::grey_to_rgb(buf, width, height).map(|rgb| (rgb, width, height)),
        PixelFormat::Mjpg => frame::mjpeg_to_rgb(buf),
        PixelFormat::Rgb3 => {
            let expected = frame::buffer_len(width, height, 3).ok_or_else(|| {
                CameraError::CaptureFailed(format!("frame dimensions {width}x{height} overflow"))
            })?;
            if buf.len() < expected {
                return Err(CameraError::CaptureFailed(format!(
                    "RGB3 buffer too short: expected {expected}, got {}",
                    buf.len()
                )));
            }
            Ok((buf[..expected].to_vec(), width, height))
        }
    };
    converted.map_err(|e| CameraError::CaptureFailed(format!("{pixel_format:?} conversion failed: {e}")))
}
