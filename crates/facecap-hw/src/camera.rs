//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{Frame, PixelFormat};
use bytes::Bytes;
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// `EBUSY` on Linux.
const EBUSY: i32 = 16;

/// Why the camera could not be acquired. The session treats every variant
/// as "camera unavailable".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("device busy: {0}")]
    Busy(String),
    #[error("unsupported device: {0}")]
    Unsupported(String),
    #[error("device I/O failed: {0}")]
    Io(String),
}

impl DeviceError {
    /// Map an OS error from opening or streaming `device_path`.
    pub fn from_io(device_path: &str, err: &io::Error) -> Self {
        let detail = format!("{device_path}: {err}");
        match err.kind() {
            io::ErrorKind::PermissionDenied => DeviceError::PermissionDenied(detail),
            io::ErrorKind::NotFound => DeviceError::NotFound(detail),
            _ if err.raw_os_error() == Some(EBUSY) => DeviceError::Busy(detail),
            _ => DeviceError::Io(detail),
        }
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Requested capture resolution. The driver may pick something close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub width: u32,
    pub height: u32,
}

impl Default for FormatRequest {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    ///
    /// Asks for MJPG first and accepts YUYV when the driver refuses it.
    pub fn open(device_path: &str, request: FormatRequest) -> Result<Self, DeviceError> {
        if !Path::new(device_path).exists() {
            return Err(DeviceError::NotFound(device_path.to_string()));
        }

        let device =
            Device::with_path(device_path).map_err(|e| DeviceError::from_io(device_path, &e))?;

        let caps = device
            .query_caps()
            .map_err(|e| DeviceError::from_io(device_path, &e))?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(DeviceError::Unsupported(format!(
                "{device_path} is not a video capture device"
            )));
        }

        let mut fmt = device
            .format()
            .map_err(|e| DeviceError::from_io(device_path, &e))?;
        fmt.width = request.width;
        fmt.height = request.height;

        let mut negotiated = None;
        for (fourcc, pixel_format) in [
            (FourCC::new(b"MJPG"), PixelFormat::Mjpeg),
            (FourCC::new(b"YUYV"), PixelFormat::Yuyv),
        ] {
            fmt.fourcc = fourcc;
            match device.set_format(&fmt) {
                Ok(got) if got.fourcc == fourcc => {
                    negotiated = Some((got, pixel_format));
                    break;
                }
                Ok(got) => {
                    tracing::debug!(wanted = ?fourcc, got = ?got.fourcc, "driver substituted format")
                }
                Err(e) => {
                    // Another process holding the stream shows up here, not at open().
                    if e.raw_os_error() == Some(EBUSY) {
                        return Err(DeviceError::from_io(device_path, &e));
                    }
                    tracing::debug!(wanted = ?fourcc, error = %e, "set_format rejected");
                }
            }
        }

        let Some((negotiated, pixel_format)) = negotiated else {
            return Err(DeviceError::Unsupported(format!(
                "{device_path}: driver offers neither MJPG nor YUYV"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc: negotiated.fourcc,
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Start streaming. Frames are pulled with [`FrameReader::next_frame`].
    pub fn frames(&self) -> Result<FrameReader<'_>, DeviceError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(|e| DeviceError::from_io(&self.device_path, &e))?;
        Ok(FrameReader {
            camera: self,
            stream,
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

/// Memory-mapped frame stream borrowed from a [`Camera`].
pub struct FrameReader<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl FrameReader<'_> {
    /// Block until the next frame is dequeued.
    pub fn next_frame(&mut self) -> Result<Frame, DeviceError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| DeviceError::from_io(&self.camera.device_path, &e))?;

        // MJPG buffers are sized for the worst case; only `bytesused` is payload.
        let used = (meta.bytesused as usize).min(buf.len());
        Ok(Frame {
            data: Bytes::copy_from_slice(&buf[..used]),
            width: self.camera.width,
            height: self.camera.height,
            format: self.camera.pixel_format,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        })
    }
}
