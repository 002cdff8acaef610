//! Frame type and preview conversion (YUYV to RGB, JPEG decode, mirroring).

use bytes::Bytes;
use image::{imageops, ImageFormat, RgbImage};

/// Pixel layout of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// One JPEG image per frame.
    Mjpeg,
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
}

/// A captured camera frame as delivered by the driver.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("JPEG decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// Convert packed YUYV (4:2:2) to interleaved RGB using BT.601 limited range.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (u, v) = (quad[1] as i32 - 128, quad[3] as i32 - 128);
        for y in [quad[0], quad[2]] {
            let c = 298 * (y as i32 - 16);
            rgb.push(clamp_u8((c + 409 * v + 128) >> 8));
            rgb.push(clamp_u8((c - 100 * u - 208 * v + 128) >> 8));
            rgb.push(clamp_u8((c + 516 * u + 128) >> 8));
        }
    }
    Ok(rgb)
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Decode a frame into an RGB image mirrored horizontally, the way the
/// subject expects to see themselves.
pub fn preview_image(frame: &Frame) -> Result<RgbImage, FrameError> {
    let image = match frame.format {
        PixelFormat::Mjpeg => {
            image::load_from_memory_with_format(&frame.data, ImageFormat::Jpeg)?.to_rgb8()
        }
        PixelFormat::Yuyv => {
            let rgb = yuyv_to_rgb(&frame.data, frame.width, frame.height)?;
            let actual = rgb.len();
            RgbImage::from_raw(frame.width, frame.height, rgb).ok_or(
                FrameError::InvalidLength {
                    expected: (frame.width * frame.height * 3) as usize,
                    actual,
                },
            )?
        }
    };
    Ok(imageops::flip_horizontal(&image))
}
