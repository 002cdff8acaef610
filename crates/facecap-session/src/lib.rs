//! facecap-session: One face-capture session, end to end.
//!
//! The [`SessionController`] acquires the camera, runs the
//! [`CaptureRecorder`] and the [`GuidanceSequencer`] side by side from a
//! shared start instant, and hands the finished artifact to the
//! [`UploadPipeline`] exactly once.

pub mod config;
pub mod controller;
pub mod guidance;
pub mod recorder;
pub mod upload;

pub use config::{Config, ConfigError};
pub use controller::{SessionController, SessionError, SessionOptions, SessionView};
pub use guidance::{GuidanceEvent, GuidanceSequencer};
pub use recorder::{CaptureRecorder, RecorderError};
pub use upload::{
    FailureStage, HttpRegistrationClient, RegistrationClient, UploadError, UploadFailed,
    UploadPipeline, UploadResult,
};
