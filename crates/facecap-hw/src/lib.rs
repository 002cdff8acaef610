//! facecap-hw: Camera acquisition and the shared live media stream.
//!
//! Only this crate starts or stops the underlying capture device. Everyone
//! else sees frames through a read-only [`MediaStream`] handle.

pub mod camera;
pub mod device;
pub mod encoder;
pub mod frame;
pub mod stream;

pub use camera::{Camera, DeviceError, DeviceInfo, FormatRequest};
pub use device::{CaptureDevice, V4lDevice};
pub use encoder::{EncodePass, MediaEncoder, PassthroughEncoder, MOTION_JPEG, RAW_YUYV};
pub use frame::{preview_image, Frame, FrameError, PixelFormat};
pub use stream::{media_stream, FrameFeed, MediaStream, StreamInfo};
