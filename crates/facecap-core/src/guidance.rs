//! Pose-guidance sequence data.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Head pose the subject is asked to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pose {
    Front,
    Left,
    Right,
    Smile,
}

impl Pose {
    pub fn instruction(self) -> &'static str {
        match self {
            Pose::Front => "Look straight at the camera",
            Pose::Left => "Slowly turn your head to the left",
            Pose::Right => "Slowly turn your head to the right",
            Pose::Smile => "Look at the camera and smile",
        }
    }
}

/// One scheduled instruction, fired at `offset` from the session start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuidanceStep {
    pub pose: Pose,
    pub instruction: String,
    #[serde(rename = "offset_ms", serialize_with = "serialize_millis")]
    pub offset: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// A fixed, ordered list of steps plus the total capture duration.
///
/// Steps are sorted by offset and every offset is strictly below
/// `total`, so the completion event is always the last one to fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidanceSequence {
    steps: Vec<GuidanceStep>,
    total: Duration,
}

/// Poses of the registration capture: front, left, front, right, smile.
pub const REGISTRATION_POSES: [Pose; 5] =
    [Pose::Front, Pose::Left, Pose::Front, Pose::Right, Pose::Smile];

impl GuidanceSequence {
    /// Step `i` at `i * interval`; completion at `poses.len() * interval`.
    pub fn evenly_spaced(poses: &[Pose], interval: Duration) -> Self {
        let steps = poses
            .iter()
            .enumerate()
            .map(|(i, &pose)| GuidanceStep {
                pose,
                instruction: pose.instruction().to_string(),
                offset: interval * i as u32,
            })
            .collect();
        Self {
            steps,
            total: interval * poses.len() as u32,
        }
    }

    /// The standard five-pose registration sequence.
    pub fn registration(interval: Duration) -> Self {
        Self::evenly_spaced(&REGISTRATION_POSES, interval)
    }

    pub fn steps(&self) -> &[GuidanceStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Time from start at which the sequence completes and recording stops.
    pub fn total(&self) -> Duration {
        self.total
    }
}
