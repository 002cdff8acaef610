use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle of one capture session.
///
/// `Idle → CameraReady → Recording → Uploading → Done`, with `Error`
/// reachable from every non-terminal state. `Done` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    CameraReady,
    Recording,
    Uploading,
    Done,
    Error,
}

impl SessionStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Idle, CameraReady)
                | (CameraReady, Recording)
                | (Recording, Uploading)
                | (Uploading, Done)
                | (Idle | CameraReady | Recording | Uploading, Error)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Done | SessionStatus::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::CameraReady => "camera-ready",
            SessionStatus::Recording => "recording",
            SessionStatus::Uploading => "uploading",
            SessionStatus::Done => "done",
            SessionStatus::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid session transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// Which part of the session failed. Drives the user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Permission denied, no device, or device busy.
    CameraUnavailable,
    /// The recording pass could not produce an artifact.
    RecordingFailed,
    /// Network, server status, or response body failure.
    UploadFailed,
    /// The session was torn down before it finished.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub kind: FailureKind,
    /// Human-readable cause from the failing component.
    pub cause: String,
}

impl SessionFailure {
    pub fn new(kind: FailureKind, cause: impl Into<String>) -> Self {
        Self {
            kind,
            cause: cause.into(),
        }
    }

    /// Message suitable for showing to the person in front of the camera.
    pub fn user_message(&self) -> String {
        match self.kind {
            FailureKind::CameraUnavailable => format!("Camera unavailable: {}", self.cause),
            FailureKind::RecordingFailed => format!("Recording failed: {}", self.cause),
            FailureKind::UploadFailed => format!("Upload failed: {}", self.cause),
            FailureKind::Cancelled => "Capture cancelled".to_string(),
        }
    }
}

/// One end-to-end acquire → record → upload lifecycle for one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSession {
    /// Log correlation id.
    pub id: Uuid,
    /// Opaque identifier the artifact is registered against.
    pub subject_id: String,
    pub status: SessionStatus,
    /// Set when recording begins.
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<SessionFailure>,
}

impl CaptureSession {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_id: subject_id.into(),
            status: SessionStatus::Idle,
            started_at: None,
            error: None,
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: SessionStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        tracing::debug!(session = %self.id, from = %self.status, to = %next, "session transition");
        if next == SessionStatus::Recording {
            self.started_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    /// Enter the terminal `Error` state. A session that is already terminal
    /// keeps its outcome and the failure is returned back as rejected.
    pub fn fail(&mut self, failure: SessionFailure) -> Result<(), InvalidTransition> {
        self.transition(SessionStatus::Error)?;
        self.error = Some(failure);
        Ok(())
    }
}

/// The finalized video payload of one recording pass.
///
/// Not `Clone`: an artifact moves from the recorder to the upload
/// pipeline and is consumed at most once.
#[derive(Debug)]
pub struct CaptureArtifact {
    data: Bytes,
    media_type: String,
}

impl CaptureArtifact {
    pub fn new(data: Bytes, media_type: impl Into<String>) -> Self {
        Self {
            data,
            media_type: media_type.into(),
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Filename for the multipart part, derived from the media type.
    pub fn file_name(&self) -> &'static str {
        let essence = self
            .media_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        match essence {
            "video/webm" => "video.webm",
            "video/x-motion-jpeg" => "video.mjpeg",
            "video/mp4" => "video.mp4",
            "video/x-raw" => "video.yuv",
            _ => "video.bin",
        }
    }
}

/// Successful registration response.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerReply {
    /// `message`, else `status`, else the raw JSON text.
    pub message: String,
    pub body: serde_json::Value,
}

impl ServerReply {
    pub fn from_json(body: serde_json::Value) -> Self {
        let message = ["message", "status"]
            .iter()
            .find_map(|key| body.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string());
        Self { message, body }
    }
}
