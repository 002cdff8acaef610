//! facecap-core: Data model and pure logic for face-capture sessions.
//!
//! Nothing in this crate touches a device, a timer or the network:
//! encoding negotiation, chunk buffering and the guidance sequence are
//! plain functions over plain data so they can be table-tested.

pub mod chunks;
pub mod guidance;
pub mod negotiate;
pub mod types;

pub use chunks::ChunkBuffer;
pub use guidance::{GuidanceSequence, GuidanceStep, Pose};
pub use negotiate::{negotiate, CapabilityQuery, Negotiated};
pub use types::{
    CaptureArtifact, CaptureSession, FailureKind, InvalidTransition, ServerReply, SessionFailure,
    SessionStatus,
};
