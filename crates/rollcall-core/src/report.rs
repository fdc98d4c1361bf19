//! Wire-facing result shapes.

use crate::config::AttendanceMode;
use crate::types::{AttendanceRecord, BoundingBox, IdentityKind};
use serde::{Deserialize, Serialize};

/// Per-face result of `recognize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceReport {
    pub recognized: bool,
    pub identity_kind: IdentityKind,
    /// `None` while the face is pending.
    pub identity_id: Option<String>,
    /// `1 - distance`, rounded to 4 decimals; `None` while pending.
    pub confidence: Option<f32>,
    pub bbox: BoundingBox,
}

/// Outcome of marking attendance from a frame or an identity reference.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkOutcome {
    Marked(AttendanceRecord),
    Duplicate,
    NoFace,
    /// The face has not been observed often enough yet.
    Pending,
}

impl MarkOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            MarkOutcome::Marked(_) => "marked",
            MarkOutcome::Duplicate => "duplicate",
            MarkOutcome::NoFace => "no_face",
            MarkOutcome::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MarkResponse {
    Marked {
        attendance_id: i64,
        identity_kind: IdentityKind,
        identity_id: String,
    },
    Duplicate,
    NoFace,
    Pending,
}

impl From<&MarkOutcome> for MarkResponse {
    fn from(outcome: &MarkOutcome) -> Self {
        match outcome {
            MarkOutcome::Marked(record) => MarkResponse::Marked {
                attendance_id: record.attendance_id,
                identity_kind: record.identity.kind(),
                identity_id: record.identity.id_string(),
            },
            MarkOutcome::Duplicate => MarkResponse::Duplicate,
            MarkOutcome::NoFace => MarkResponse::NoFace,
            MarkOutcome::Pending => MarkResponse::Pending,
        }
    }
}

/// Engine health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub registered: usize,
    pub visitors: usize,
    /// Faces currently tracked by the confirmation cache.
    pub cached_faces: usize,
    pub attendance_mode: AttendanceMode,
}
