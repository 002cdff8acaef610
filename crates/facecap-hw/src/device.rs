//! Device session: acquire a camera, pump its frames into a [`MediaStream`],
//! release it again.

use crate::camera::{Camera, DeviceError, FormatRequest};
use crate::stream::{media_stream, MediaStream, StreamInfo};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Frames a slow subscriber may fall behind by (about one second at 30 fps).
const STREAM_CAPACITY: usize = 32;

/// A video-only capture device.
///
/// `acquire` makes the device busy and returns the live stream. Acquiring
/// again releases the previous stream first. Only the device may stop the
/// underlying hardware.
#[async_trait]
pub trait CaptureDevice: Send {
    async fn acquire(&mut self) -> Result<MediaStream, DeviceError>;

    /// Stop the device and end the stream. Idempotent.
    fn release(&mut self);
}

struct Running {
    stop: Arc<AtomicBool>,
    stream: MediaStream,
}

/// V4L2 camera driven by a dedicated capture thread.
pub struct V4lDevice {
    device_path: String,
    request: FormatRequest,
    running: Option<Running>,
}

impl V4lDevice {
    pub fn new(device_path: impl Into<String>, request: FormatRequest) -> Self {
        Self {
            device_path: device_path.into(),
            request,
            running: None,
        }
    }
}

#[async_trait]
impl CaptureDevice for V4lDevice {
    async fn acquire(&mut self) -> Result<MediaStream, DeviceError> {
        self.release();

        let (ready_tx, ready_rx) = oneshot::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let path = self.device_path.clone();
        let request = self.request;

        std::thread::Builder::new()
            .name("facecap-camera".into())
            .spawn(move || capture_thread(path, request, thread_stop, ready_tx))
            .map_err(|e| DeviceError::Io(format!("failed to spawn capture thread: {e}")))?;

        let stream = ready_rx
            .await
            .map_err(|_| DeviceError::Io("capture thread exited during open".into()))??;

        tracing::info!(device = %self.device_path, info = ?stream.info(), "camera acquired");
        self.running = Some(Running {
            stop,
            stream: stream.clone(),
        });
        Ok(stream)
    }

    fn release(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop.store(true, Ordering::Release);
            tracing::info!(
                device = %self.device_path,
                was_live = running.stream.is_live(),
                "camera released"
            );
        }
    }
}

impl Drop for V4lDevice {
    fn drop(&mut self) {
        self.release();
    }
}

/// Opens the camera on this thread, reports the outcome, then publishes
/// frames until `stop` is set or the driver fails. The camera closes when
/// the thread returns.
fn capture_thread(
    path: String,
    request: FormatRequest,
    stop: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<MediaStream, DeviceError>>,
) {
    let camera = match Camera::open(&path, request) {
        Ok(camera) => camera,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let mut reader = match camera.frames() {
        Ok(reader) => reader,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let (feed, stream) = media_stream(
        StreamInfo {
            device: path.clone(),
            width: camera.width,
            height: camera.height,
            format: camera.pixel_format(),
        },
        STREAM_CAPACITY,
    );
    if ready.send(Ok(stream)).is_err() {
        return;
    }

    let mut delivered = 0u64;
    while !stop.load(Ordering::Acquire) {
        match reader.next_frame() {
            Ok(frame) => {
                feed.push(frame);
                delivered += 1;
            }
            Err(e) => {
                tracing::warn!(device = %path, error = %e, "frame dequeue failed; ending stream");
                break;
            }
        }
    }
    feed.end();
    tracing::debug!(device = %path, delivered, "capture thread exiting");
}
