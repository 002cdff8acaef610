//! Capture recorder: buffers one recording pass and finalizes it into a
//! single [`CaptureArtifact`].
//!
//! The recorder's only output is the artifact channel given to
//! [`CaptureRecorder::new`]. Each pass sends exactly one artifact, after
//! `stop()`, or earlier if the stream ends underneath it.

use bytes::Bytes;
use facecap_core::{negotiate, CaptureArtifact, ChunkBuffer, Negotiated};
use facecap_hw::{EncodePass, Frame, MediaEncoder, MediaStream};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecorderError {
    #[error("recorder is not armed with a stream")]
    NotArmed,
    #[error("cannot re-arm while a recording pass is active")]
    Busy,
    #[error("media stream has ended")]
    StreamClosed,
    #[error("recording produced no data")]
    Empty,
    #[error("encoder cannot produce {0}")]
    Unsupported(String),
}

struct Armed {
    stream: MediaStream,
    media_type: String,
}

struct RecordingPass {
    /// `None` once stop has been requested.
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

pub struct CaptureRecorder {
    encoder: Arc<dyn MediaEncoder>,
    preferences: Vec<String>,
    default_type: String,
    artifacts: mpsc::UnboundedSender<CaptureArtifact>,
    armed: Option<Armed>,
    pass: Option<RecordingPass>,
}

impl CaptureRecorder {
    pub fn new(
        encoder: Arc<dyn MediaEncoder>,
        preferences: Vec<String>,
        default_type: impl Into<String>,
        artifacts: mpsc::UnboundedSender<CaptureArtifact>,
    ) -> Self {
        Self {
            encoder,
            preferences,
            default_type: default_type.into(),
            artifacts,
            armed: None,
            pass: None,
        }
    }

    /// Bind to `stream` and negotiate the recording media type.
    pub fn arm(&mut self, stream: MediaStream) -> Result<Negotiated, RecorderError> {
        if self.is_recording() {
            return Err(RecorderError::Busy);
        }
        let info = stream.info();
        let negotiated = negotiate(self.preferences.as_slice(), &self.default_type, &|t: &str| {
            self.encoder.supports(t, info)
        });

        tracing::info!(
            device = %info.device,
            media_type = %negotiated.media_type,
            fell_back = negotiated.fell_back,
            "recorder armed"
        );
        self.armed = Some(Armed {
            stream,
            media_type: negotiated.media_type.clone(),
        });
        Ok(negotiated)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// A pass is active: recording, or finalizing after a stop request.
    pub fn is_recording(&self) -> bool {
        self.pass.as_ref().is_some_and(|p| !p.task.is_finished())
    }

    pub fn media_type(&self) -> Option<&str> {
        self.armed.as_ref().map(|a| a.media_type.as_str())
    }

    /// Begin a recording pass. Ignored while a previous pass is still
    /// active, including one that is finalizing after `stop()`.
    pub fn start(&mut self) -> Result<(), RecorderError> {
        let armed = self.armed.as_ref().ok_or(RecorderError::NotArmed)?;
        if self.is_recording() {
            tracing::debug!("start ignored: already recording");
            return Ok(());
        }
        if !armed.stream.is_live() {
            return Err(RecorderError::StreamClosed);
        }

        let Some(pass) = self.encoder.open(&armed.media_type, armed.stream.info()) else {
            tracing::warn!(media_type = %armed.media_type, "encoder refused recording type");
            return Err(RecorderError::Unsupported(armed.media_type.clone()));
        };
        // Subscribe before spawning so no frame after start() is missed.
        let frames = armed.stream.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(record_pass(
            frames,
            stop_rx,
            pass,
            armed.media_type.clone(),
            self.artifacts.clone(),
        ));

        tracing::info!(media_type = %armed.media_type, "recording started");
        self.pass = Some(RecordingPass {
            stop: Some(stop_tx),
            task,
        });
        Ok(())
    }

    /// Request the active pass to finalize. No-op without one.
    pub fn stop(&mut self) {
        match self.pass.as_mut().and_then(|p| p.stop.take()) {
            Some(stop) => {
                let _ = stop.send(());
                tracing::info!("recording stop requested");
            }
            None => tracing::debug!("stop ignored: not recording"),
        }
    }

    /// Abort any pass and throw its data away. No artifact is sent.
    pub fn discard(&mut self) {
        if let Some(pass) = self.pass.take() {
            pass.task.abort();
            tracing::debug!("recording pass discarded");
        }
        self.armed = None;
    }
}

impl Drop for CaptureRecorder {
    fn drop(&mut self) {
        if let Some(pass) = self.pass.take() {
            pass.task.abort();
        }
    }
}

async fn record_pass(
    mut frames: broadcast::Receiver<Frame>,
    mut stop: oneshot::Receiver<()>,
    mut pass: Box<dyn EncodePass>,
    media_type: String,
    artifacts: mpsc::UnboundedSender<CaptureArtifact>,
) {
    let mut buffer = ChunkBuffer::new();
    let mut truncated = false;

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => {
                drain_pending(&mut frames, pass.as_mut(), &mut buffer);
                break;
            }
            frame = frames.recv() => match frame {
                Ok(frame) => buffer.append(pass.encode(&frame)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "recorder fell behind the stream; frames skipped");
                }
                Err(RecvError::Closed) => {
                    truncated = true;
                    break;
                }
            },
        }
    }

    buffer.append(pass.finish());
    let chunks = buffer.chunk_count();
    let data: Bytes = buffer.finalize();
    if truncated {
        tracing::warn!(bytes = data.len(), "stream ended during recording");
    } else {
        tracing::info!(bytes = data.len(), chunks, %media_type, "recording finalized");
    }
    let _ = artifacts.send(CaptureArtifact::new(data, media_type));
}

/// Encode the frames already queued when the stop request was observed.
fn drain_pending(
    frames: &mut broadcast::Receiver<Frame>,
    pass: &mut dyn EncodePass,
    buffer: &mut ChunkBuffer,
) {
    loop {
        match frames.try_recv() {
            Ok(frame) => buffer.append(pass.encode(&frame)),
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "recorder fell behind the stream; frames skipped");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
}
