//! Storage seams consumed by the engine.
//!
//! Implementations must be safe for concurrent use. The check-then-write
//! operations (`insert_visitor`, `insert_unless_recent`, `upsert_daily`) must
//! each be atomic: two callers can never both pass the check.

use crate::types::{
    AttendanceRecord, FaceVector, IdentityKind, IdentityRef, RegisteredIdentity, VisitorIdentity,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("storage busy: {0}")]
    Busy(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("gave up after {0} contended attempts")]
    Contention(usize),
}

/// Read access to registered identities.
pub trait RegisteredStore: Send + Sync {
    /// Consistent snapshot of every registered identity, ascending by id.
    ///
    /// Concurrent registrations never affect a snapshot already taken.
    fn snapshot(&self) -> Result<Arc<Vec<RegisteredIdentity>>, StoreError>;

    /// Insert or replace the vector for an identity (1:1).
    ///
    /// Used by identity management, never by the recognition path.
    fn register(&self, identity: RegisteredIdentity) -> Result<(), StoreError>;

    fn contains(&self, identity_id: i64) -> Result<bool, StoreError> {
        Ok(self
            .snapshot()?
            .iter()
            .any(|r| r.identity_id == identity_id))
    }
}

/// A visitor about to be created.
#[derive(Debug, Clone)]
pub struct NewVisitor {
    pub visitor_id: Uuid,
    pub handle: String,
    pub vector: FaceVector,
    pub created_at: DateTime<Utc>,
}

/// Result of a guarded visitor insert.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(VisitorIdentity),
    /// Visitors newer than the caller's watermark exist; nothing was written.
    Stale,
    /// The id or handle is already in use; nothing was written.
    HandleTaken,
}

pub trait VisitorStore: Send + Sync {
    /// All visitors, ascending by `seq`.
    fn visitors(&self) -> Result<Vec<VisitorIdentity>, StoreError>;

    /// Visitors with `seq > after`, ascending.
    fn visitors_after(&self, after: i64) -> Result<Vec<VisitorIdentity>, StoreError>;

    fn visitor(&self, visitor_id: Uuid) -> Result<Option<VisitorIdentity>, StoreError>;

    fn visitor_count(&self) -> Result<usize, StoreError>;

    /// Insert `visitor` only if no visitor with `seq > watermark` exists and
    /// its id and handle are unused. Check and insert are one atomic step.
    fn insert_visitor(
        &self,
        visitor: &NewVisitor,
        watermark: i64,
    ) -> Result<InsertOutcome, StoreError>;

    /// Atomically increment a visitor's appearance count and return the row.
    fn record_appearance(&self, visitor_id: Uuid) -> Result<VisitorIdentity, StoreError>;
}

/// An attendance mark about to be written.
#[derive(Debug, Clone)]
pub struct NewAttendance {
    pub identity: IdentityRef,
    pub marked_at: DateTime<Utc>,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub distance: Option<f32>,
}

#[derive(Debug, Clone)]
pub enum DailyMark {
    Created(AttendanceRecord),
    Incremented(AttendanceRecord),
}

/// Resolved listing filter; every set field must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerFilter {
    /// `Registered` or `Visitor`.
    pub kind: Option<IdentityKind>,
    pub identity: Option<IdentityRef>,
    /// Inclusive local date bounds.
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    /// Inclusive local time-of-day bounds.
    pub time_from: Option<NaiveTime>,
    pub time_to: Option<NaiveTime>,
    pub oldest_first: bool,
    pub limit: Option<usize>,
}

impl LedgerFilter {
    pub fn matches(&self, record: &AttendanceRecord) -> bool {
        if let Some(kind) = self.kind {
            if record.identity.kind() != kind {
                return false;
            }
        }
        if let Some(identity) = self.identity {
            if record.identity != identity {
                return false;
            }
        }
        if self.date_from.is_some_and(|d| record.date < d)
            || self.date_to.is_some_and(|d| record.date > d)
        {
            return false;
        }
        if self.time_from.is_some_and(|t| record.time < t)
            || self.time_to.is_some_and(|t| record.time > t)
        {
            return false;
        }
        true
    }
}

/// Append/increment-only attendance ledger.
pub trait AttendanceLedger: Send + Sync {
    /// Insert `entry` unless the identity already has a record with
    /// `marked_at >= since`. Returns `None` for a duplicate.
    fn insert_unless_recent(
        &self,
        entry: &NewAttendance,
        since: DateTime<Utc>,
    ) -> Result<Option<AttendanceRecord>, StoreError>;

    /// Increment the identity's record for `entry.date`, or create it with a
    /// detection count of 1.
    fn upsert_daily(&self, entry: &NewAttendance) -> Result<DailyMark, StoreError>;

    /// Records matching `filter`, newest first unless `oldest_first`.
    fn query(&self, filter: &LedgerFilter) -> Result<Vec<AttendanceRecord>, StoreError>;
}
