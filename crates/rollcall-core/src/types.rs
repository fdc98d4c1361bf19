use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Query and stored vectors have different lengths.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("dimension mismatch: query has {query} components, candidate has {candidate}")]
pub struct DimensionMismatch {
    pub query: usize,
    pub candidate: usize,
}

/// Face embedding vector (128 or 512 components depending on the provider model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceVector {
    pub values: Vec<f32>,
}

impl FaceVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// True when the vector is non-empty and every component is finite.
    pub fn is_usable(&self) -> bool {
        !self.values.is_empty() && self.values.iter().all(|v| v.is_finite())
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// A zero-norm vector has similarity 0.0 to everything.
    pub fn similarity(&self, other: &FaceVector) -> Result<f32, DimensionMismatch> {
        if self.values.len() != other.values.len() {
            return Err(DimensionMismatch {
                query: self.values.len(),
                candidate: other.values.len(),
            });
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        Ok(if denom > 0.0 { dot / denom } else { 0.0 })
    }

    /// Cosine distance in [0, 2]. Lower = more similar.
    pub fn cosine_distance(&self, other: &FaceVector) -> Result<f32, DimensionMismatch> {
        self.similarity(other).map(|sim| (1.0 - sim).clamp(0.0, 2.0))
    }
}

impl From<Vec<f32>> for FaceVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Face bounding box as reported by the detection provider: `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoundingBox(pub [i32; 4]);

/// One detected face in a frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub vector: FaceVector,
}

/// A registered person's reference embedding. Owned by identity management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredIdentity {
    pub identity_id: i64,
    pub vector: FaceVector,
}

/// An unregistered person tracked only by embedding similarity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitorIdentity {
    /// Insertion sequence, strictly increasing per store.
    pub seq: i64,
    pub visitor_id: Uuid,
    /// Human-facing handle, e.g. `visitor_3fa81c0e`.
    pub handle: String,
    pub vector: FaceVector,
    pub appearance_count: u32,
    pub created_at: DateTime<Utc>,
    /// Set once the visitor has been claimed by a registered account.
    pub claimed: bool,
}

/// Which kind of identity a face resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Registered,
    Visitor,
    Pending,
}

impl IdentityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Registered => "registered",
            IdentityKind::Visitor => "visitor",
            IdentityKind::Pending => "pending",
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseIdentityError {
    #[error("unknown identity kind {0:?} (expected \"registered\" or \"visitor\")")]
    Kind(String),
    #[error("invalid identity id {0:?}")]
    Id(String),
}

/// Reference to the identity an attendance record belongs to.
///
/// Exactly one of registered or visitor, by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum IdentityRef {
    Registered(i64),
    Visitor(Uuid),
}

impl IdentityRef {
    pub fn kind(&self) -> IdentityKind {
        match self {
            IdentityRef::Registered(_) => IdentityKind::Registered,
            IdentityRef::Visitor(_) => IdentityKind::Visitor,
        }
    }

    pub fn id_string(&self) -> String {
        match self {
            IdentityRef::Registered(id) => id.to_string(),
            IdentityRef::Visitor(id) => id.to_string(),
        }
    }

    /// Parse a `(kind, id)` pair as received from a client.
    pub fn parse(kind: &str, id: &str) -> Result<Self, ParseIdentityError> {
        let id = id.trim();
        match kind.trim() {
            "registered" => id
                .parse::<i64>()
                .map(IdentityRef::Registered)
                .map_err(|_| ParseIdentityError::Id(id.to_string())),
            "visitor" => Uuid::parse_str(id)
                .map(IdentityRef::Visitor)
                .map_err(|_| ParseIdentityError::Id(id.to_string())),
            other => Err(ParseIdentityError::Kind(other.to_string())),
        }
    }
}

impl fmt::Display for IdentityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind().as_str(), self.id_string())
    }
}

/// A persisted attendance mark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub attendance_id: i64,
    pub identity: IdentityRef,
    pub marked_at: DateTime<Utc>,
    /// Calendar date in the deployment's local offset.
    pub date: NaiveDate,
    /// Wall-clock time in the deployment's local offset.
    pub time: NaiveTime,
    /// Same-day detections folded into this record (daily policy); 1 otherwise.
    pub detection_count: u32,
    /// Distance of the match that produced the mark, if any.
    pub distance: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_distance_identical() {
        let a = FaceVector::new(vec![1.0, 0.0, 0.0]);
        let b = FaceVector::new(vec![1.0, 0.0, 0.0]);
        assert!(a.cosine_distance(&b).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_orthogonal() {
        let a = FaceVector::new(vec![1.0, 0.0]);
        let b = FaceVector::new(vec![0.0, 1.0]);
        assert!((a.cosine_distance(&b).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_opposite() {
        let a = FaceVector::new(vec![1.0, 0.0]);
        let b = FaceVector::new(vec![-1.0, 0.0]);
        assert!((a.cosine_distance(&b).unwrap() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_zero_vector() {
        let a = FaceVector::new(vec![0.0, 0.0]);
        let b = FaceVector::new(vec![1.0, 0.0]);
        assert_eq!(a.cosine_distance(&b).unwrap(), 1.0);
    }

    #[test]
    fn test_cosine_distance_dimension_mismatch() {
        let a = FaceVector::new(vec![1.0, 0.0, 0.0]);
        let b = FaceVector::new(vec![1.0, 0.0]);
        assert_eq!(
            a.cosine_distance(&b),
            Err(DimensionMismatch { query: 3, candidate: 2 })
        );
    }

    #[test]
    fn test_is_usable() {
        assert!(FaceVector::new(vec![0.1, 0.2]).is_usable());
        assert!(!FaceVector::new(vec![]).is_usable());
        assert!(!FaceVector::new(vec![0.1, f32::NAN]).is_usable());
        assert!(!FaceVector::new(vec![f32::INFINITY]).is_usable());
    }

    #[test]
    fn test_identity_parse() {
        assert_eq!(
            IdentityRef::parse("registered", "42"),
            Ok(IdentityRef::Registered(42))
        );
        let id = Uuid::new_v4();
        assert_eq!(
            IdentityRef::parse("visitor", &id.to_string()),
            Ok(IdentityRef::Visitor(id))
        );
        assert!(matches!(
            IdentityRef::parse("user", "42"),
            Err(ParseIdentityError::Kind(_))
        ));
        assert!(matches!(
            IdentityRef::parse("registered", "abc"),
            Err(ParseIdentityError::Id(_))
        ));
        assert!(matches!(
            IdentityRef::parse("visitor", "not-a-uuid"),
            Err(ParseIdentityError::Id(_))
        ));
    }

    #[test]
    fn test_identity_json_shape() {
        let json = serde_json::to_value(IdentityRef::Registered(7)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "registered", "id": 7}));
    }

    #[test]
    fn test_detection_json_shape() {
        let det: Detection =
            serde_json::from_str(r#"{"bbox":[1,2,30,40],"vector":[0.5,-0.25]}"#).unwrap();
        assert_eq!(det.bbox, BoundingBox([1, 2, 30, 40]));
        assert_eq!(det.vector.values, vec![0.5, -0.25]);
    }
}
