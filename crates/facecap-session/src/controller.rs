//! Session controller: owns one [`CaptureSession`] and drives it through
//! `Idle → CameraReady → Recording → Uploading → Done`, or into `Error`.
//!
//! Recording stops when the guidance sequence completes. The artifact is
//! uploaded once, after the recorder has finalized it. Teardown (explicit,
//! via the cancel token, or on drop) aborts and discards whatever is in
//! progress and releases the camera.

use crate::config::Config;
use crate::guidance::{GuidanceEvent, GuidanceSequencer};
use crate::recorder::{CaptureRecorder, RecorderError};
use crate::upload::{RegistrationClient, UploadError, UploadPipeline};
use facecap_core::{
    CaptureArtifact, CaptureSession, FailureKind, GuidanceSequence, GuidanceStep,
    InvalidTransition, ServerReply, SessionFailure, SessionStatus,
};
use facecap_hw::{CaptureDevice, DeviceError, MediaEncoder, MediaStream};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("camera unavailable: {0}")]
    Device(#[from] DeviceError),
    #[error("recording failed: {0}")]
    Recorder(#[from] RecorderError),
    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("session cancelled")]
    Cancelled,
    #[error("session already finished ({0})")]
    Terminal(SessionStatus),
}

/// Per-session behavior, usually built with [`Config::session_options`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub encoding_preferences: Vec<String>,
    pub default_media_type: String,
    pub sequence: GuidanceSequence,
    /// Start recording as soon as the camera is ready instead of waiting
    /// for a trigger.
    pub auto_start: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Config::default().session_options()
    }
}

/// What a presentation layer needs to render the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub status: SessionStatus,
    pub step_index: Option<usize>,
    pub step: Option<GuidanceStep>,
    /// Server message once done, kind-specific failure text on error.
    pub message: Option<String>,
}

impl SessionView {
    fn idle() -> Self {
        Self {
            status: SessionStatus::Idle,
            step_index: None,
            step: None,
            message: None,
        }
    }
}

enum Wake {
    Cancelled,
    Guidance(Option<GuidanceEvent>),
    Artifact(Option<CaptureArtifact>),
}

pub struct SessionController {
    session: CaptureSession,
    options: SessionOptions,
    device: Box<dyn CaptureDevice>,
    recorder: CaptureRecorder,
    artifacts: mpsc::UnboundedReceiver<CaptureArtifact>,
    guidance: GuidanceSequencer,
    guidance_events: mpsc::UnboundedReceiver<GuidanceEvent>,
    upload: UploadPipeline,
    view: watch::Sender<SessionView>,
    cancel: CancellationToken,
}

impl SessionController {
    pub fn new(
        subject_id: impl Into<String>,
        options: SessionOptions,
        device: Box<dyn CaptureDevice>,
        encoder: Arc<dyn MediaEncoder>,
        client: Arc<dyn RegistrationClient>,
    ) -> Self {
        let (artifact_tx, artifacts) = mpsc::unbounded_channel();
        let (guidance_tx, guidance_events) = mpsc::unbounded_channel();
        let recorder = CaptureRecorder::new(
            encoder,
            options.encoding_preferences.clone(),
            options.default_media_type.clone(),
            artifact_tx,
        );
        let (view, _) = watch::channel(SessionView::idle());
        let session = CaptureSession::new(subject_id);
        tracing::info!(session = %session.id, subject = %session.subject_id, "capture session created");

        Self {
            session,
            options,
            device,
            recorder,
            artifacts,
            guidance: GuidanceSequencer::new(guidance_tx),
            guidance_events,
            upload: UploadPipeline::new(client),
            view,
            cancel: CancellationToken::new(),
        }
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.subscribe()
    }

    /// Cancelling the token tears the session down at its next suspension
    /// point.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Acquire the camera and arm the recorder on its stream.
    pub async fn open_camera(&mut self) -> Result<MediaStream, SessionError> {
        self.expect_status(SessionStatus::Idle, SessionStatus::CameraReady)?;

        let cancel = self.cancel.clone();
        let acquired = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.device.acquire() => Some(result),
        };
        let stream = match acquired {
            None => return Err(self.cancelled()),
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                tracing::warn!(session = %self.session.id, error = %e, "camera acquisition failed");
                self.fail(FailureKind::CameraUnavailable, e.to_string());
                return Err(e.into());
            }
        };

        self.recorder.arm(stream.clone())?;
        self.session.transition(SessionStatus::CameraReady)?;
        self.publish_status(None);
        Ok(stream)
    }

    /// Record for the length of the guidance sequence, then upload.
    pub async fn record(&mut self) -> Result<ServerReply, SessionError> {
        self.expect_status(SessionStatus::CameraReady, SessionStatus::Recording)?;

        if let Err(e) = self.recorder.start() {
            self.fail(FailureKind::RecordingFailed, e.to_string());
            return Err(e.into());
        }
        let started_at = Instant::now();
        self.session.transition(SessionStatus::Recording)?;
        self.guidance.begin(self.options.sequence.clone(), started_at);
        self.publish_status(None);

        let artifact = self.await_artifact().await?;
        self.upload_artifact(artifact).await
    }

    /// Open the camera and record straight away.
    pub async fn run(&mut self) -> Result<ServerReply, SessionError> {
        self.run_with_trigger(std::future::ready(())).await
    }

    /// Open the camera, then start recording immediately when `auto_start`
    /// is set, otherwise once `trigger` resolves.
    pub async fn run_with_trigger<F>(&mut self, trigger: F) -> Result<ServerReply, SessionError>
    where
        F: Future<Output = ()>,
    {
        self.open_camera().await?;

        if !self.options.auto_start {
            tracing::info!(session = %self.session.id, "waiting for start trigger");
            let cancel = self.cancel.clone();
            tokio::select! {
                _ = cancel.cancelled() => return Err(self.cancelled()),
                _ = trigger => {}
            }
        }
        self.record().await
    }

    /// Abort guidance, discard any recording, drop any in-flight upload and
    /// release the camera. A session that had not finished ends as
    /// cancelled. Idempotent.
    pub fn teardown(&mut self) {
        self.cancel.cancel();
        if self.session.status.is_terminal() {
            self.shutdown();
        } else {
            self.fail(FailureKind::Cancelled, "session torn down");
        }
    }

    async fn await_artifact(&mut self) -> Result<CaptureArtifact, SessionError> {
        let cancel = self.cancel.clone();
        let mut guidance_done = false;

        loop {
            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled() => Wake::Cancelled,
                event = self.guidance_events.recv() => Wake::Guidance(event),
                artifact = self.artifacts.recv() => Wake::Artifact(artifact),
            };

            match wake {
                Wake::Cancelled => return Err(self.cancelled()),
                Wake::Guidance(Some(GuidanceEvent::StepChanged { index, step })) => {
                    tracing::info!(session = %self.session.id, index, pose = ?step.pose, "guidance step");
                    self.view.send_modify(|view| {
                        view.step_index = Some(index);
                        view.step = Some(step);
                    });
                }
                Wake::Guidance(Some(GuidanceEvent::SequenceComplete)) => {
                    guidance_done = true;
                    self.recorder.stop();
                }
                Wake::Artifact(Some(artifact)) if guidance_done => {
                    self.guidance.cancel();
                    if artifact.is_empty() {
                        self.fail(FailureKind::RecordingFailed, RecorderError::Empty.to_string());
                        return Err(RecorderError::Empty.into());
                    }
                    return Ok(artifact);
                }
                Wake::Artifact(_) => {
                    tracing::warn!(session = %self.session.id, "recording ended before guidance completed");
                    self.fail(
                        FailureKind::RecordingFailed,
                        "camera stream ended before the capture sequence completed",
                    );
                    return Err(RecorderError::StreamClosed.into());
                }
                Wake::Guidance(None) => return Err(self.cancelled()),
            }
        }
    }

    async fn upload_artifact(&mut self, artifact: CaptureArtifact) -> Result<ServerReply, SessionError> {
        self.session.transition(SessionStatus::Uploading)?;
        self.publish_status(None);

        let cancel = self.cancel.clone();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.upload.send(artifact, &self.session.subject_id) => Some(result),
        };

        match outcome {
            None => Err(self.cancelled()),
            Some(Ok(reply)) => {
                self.session.transition(SessionStatus::Done)?;
                self.shutdown();
                self.publish_status(Some(reply.message.clone()));
                tracing::info!(session = %self.session.id, message = %reply.message, "capture registered");
                Ok(reply)
            }
            Some(Err(e)) => {
                let cause = match &e {
                    UploadError::Failed(failed) => failed.cause.clone(),
                    UploadError::InFlight => e.to_string(),
                };
                self.fail(FailureKind::UploadFailed, cause);
                Err(e.into())
            }
        }
    }

    fn expect_status(&self, expected: SessionStatus, next: SessionStatus) -> Result<(), SessionError> {
        let status = self.session.status;
        if status.is_terminal() {
            return Err(SessionError::Terminal(status));
        }
        if status != expected {
            return Err(InvalidTransition {
                from: status,
                to: next,
            }
            .into());
        }
        Ok(())
    }

    fn cancelled(&mut self) -> SessionError {
        tracing::info!(session = %self.session.id, status = %self.session.status, "session cancelled");
        self.fail(FailureKind::Cancelled, "session cancelled");
        SessionError::Cancelled
    }

    /// Move to `Error` with `kind` and stop everything. A session that is
    /// already terminal keeps its outcome.
    fn fail(&mut self, kind: FailureKind, cause: impl Into<String>) {
        let failure = SessionFailure::new(kind, cause);
        let message = failure.user_message();
        match self.session.fail(failure) {
            Ok(()) => {
                tracing::warn!(session = %self.session.id, ?kind, %message, "session failed");
                self.shutdown();
                self.publish_status(Some(message));
            }
            Err(e) => {
                tracing::debug!(session = %self.session.id, error = %e, "failure ignored");
                self.shutdown();
            }
        }
    }

    fn shutdown(&mut self) {
        self.guidance.cancel();
        self.recorder.discard();
        self.device.release();
    }

    fn publish_status(&self, message: Option<String>) {
        let status = self.session.status;
        self.view.send_modify(|view| {
            view.status = status;
            view.message = message;
        });
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.teardown();
    }
}
