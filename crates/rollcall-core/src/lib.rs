//! rollcall-core: face identity resolution and attendance engine.
//!
//! Turns per-frame face embeddings into stable identity decisions (a
//! registered person or a recurring anonymous visitor) and gates attendance
//! marks behind a cooldown window. Storage and face detection are pluggable
//! through the traits in [`store`] and [`provider`].

pub mod attendance;
pub mod clock;
pub mod config;
pub mod matcher;
pub mod memory;
pub mod provider;
pub mod report;
pub mod service;
pub mod stability;
pub mod store;
pub mod types;
pub mod visitor;

pub use attendance::{AttendanceGate, AttendanceQuery, MarkResult};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AttendanceMode, ConfigError, EngineConfig};
pub use matcher::{CosineMatcher, Match, Matcher};
pub use memory::MemoryStore;
pub use provider::{detect_with_timeout, DetectionProvider, ProviderError};
pub use report::{EngineStatus, FaceReport, MarkOutcome, MarkResponse};
pub use service::{AttendanceService, EngineError, Stores};
pub use store::{AttendanceLedger, RegisteredStore, StoreError, VisitorStore};
pub use types::{
    AttendanceRecord, BoundingBox, Detection, FaceVector, IdentityKind, IdentityRef,
    RegisteredIdentity, VisitorIdentity,
};
