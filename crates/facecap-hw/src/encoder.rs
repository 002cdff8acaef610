//! Recording encoders: turn stream frames into data fragments.

use crate::frame::{Frame, PixelFormat};
use crate::stream::StreamInfo;
use bytes::Bytes;

/// Motion-JPEG: concatenated JPEG frames.
pub const MOTION_JPEG: &str = "video/x-motion-jpeg";
/// Raw packed YUYV frames.
pub const RAW_YUYV: &str = "video/x-raw;format=yuyv";

/// Factory for recording passes over a particular kind of stream.
pub trait MediaEncoder: Send + Sync {
    /// Whether a pass over `stream` can produce `media_type`.
    fn supports(&self, media_type: &str, stream: &StreamInfo) -> bool;

    /// Begin one recording pass. A fresh pass is opened for every start.
    ///
    /// Returns `None` when `supports` would reject the pair; a pass never
    /// labels its output with a type it cannot produce.
    fn open(&self, media_type: &str, stream: &StreamInfo) -> Option<Box<dyn EncodePass>>;
}

/// Encoder state for a single recording pass.
pub trait EncodePass: Send {
    /// Fragment for one frame. An empty fragment means "nothing to emit".
    fn encode(&mut self, frame: &Frame) -> Bytes;

    /// Trailing fragment emitted once, when the pass stops.
    fn finish(&mut self) -> Bytes;
}

/// Emits the driver's frame payloads unchanged.
///
/// An MJPG camera yields a valid Motion-JPEG file; a YUYV camera yields raw
/// frames. Frames whose format differs from the first frame of the pass are
/// dropped so the artifact stays homogeneous.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEncoder;

impl MediaEncoder for PassthroughEncoder {
    fn supports(&self, media_type: &str, stream: &StreamInfo) -> bool {
        matches!(
            (media_type, stream.format),
            (MOTION_JPEG, PixelFormat::Mjpeg) | (RAW_YUYV, PixelFormat::Yuyv)
        )
    }

    fn open(&self, media_type: &str, stream: &StreamInfo) -> Option<Box<dyn EncodePass>> {
        if !self.supports(media_type, stream) {
            return None;
        }
        tracing::debug!(media_type, format = ?stream.format, "opening passthrough pass");
        Some(Box::new(PassthroughPass {
            format: stream.format,
            dropped: 0,
        }))
    }
}

struct PassthroughPass {
    format: PixelFormat,
    dropped: u64,
}

impl EncodePass for PassthroughPass {
    fn encode(&mut self, frame: &Frame) -> Bytes {
        if frame.format != self.format {
            self.dropped += 1;
            return Bytes::new();
        }
        frame.data.clone()
    }

    fn finish(&mut self) -> Bytes {
        if self.dropped > 0 {
            tracing::warn!(dropped = self.dropped, "dropped frames with mismatched format");
        }
        Bytes::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(format: PixelFormat) -> StreamInfo {
        StreamInfo {
            device: "test".into(),
            width: 2,
            height: 1,
            format,
        }
    }

    fn frame(format: PixelFormat, data: &'static [u8]) -> Frame {
        Frame {
            data: Bytes::from_static(data),
            width: 2,
            height: 1,
            format,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        }
    }

    #[test]
    fn test_supports_matches_stream_format() {
        let enc = PassthroughEncoder;
        assert!(enc.supports(MOTION_JPEG, &info(PixelFormat::Mjpeg)));
        assert!(!enc.supports(MOTION_JPEG, &info(PixelFormat::Yuyv)));
        assert!(enc.supports(RAW_YUYV, &info(PixelFormat::Yuyv)));
        assert!(!enc.supports("video/webm;codecs=vp9", &info(PixelFormat::Mjpeg)));
    }

    #[test]
    fn test_passthrough_emits_payload() {
        let mut pass = PassthroughEncoder
            .open(MOTION_JPEG, &info(PixelFormat::Mjpeg))
            .unwrap();
        assert_eq!(&pass.encode(&frame(PixelFormat::Mjpeg, b"jpeg"))[..], b"jpeg");
        assert!(pass.finish().is_empty());
    }

    #[test]
    fn test_passthrough_drops_mismatched_frames() {
        let mut pass = PassthroughEncoder
            .open(MOTION_JPEG, &info(PixelFormat::Mjpeg))
            .unwrap();
        assert!(pass.encode(&frame(PixelFormat::Yuyv, b"yuyv")).is_empty());
        assert!(pass.finish().is_empty());
    }

    #[test]
    fn test_open_refuses_unsupported_type() {
        let enc = PassthroughEncoder;
        assert!(enc.open("video/webm", &info(PixelFormat::Yuyv)).is_none());
        assert!(enc.open(MOTION_JPEG, &info(PixelFormat::Yuyv)).is_none());
        assert!(enc.open(RAW_YUYV, &info(PixelFormat::Yuyv)).is_some());
    }
}
