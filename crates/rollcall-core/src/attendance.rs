//! Attendance cooldown gate and ledger queries.

use crate::config::{AttendanceMode, EngineConfig};
use crate::store::{AttendanceLedger, DailyMark, LedgerFilter, NewAttendance, StoreError};
use crate::types::{AttendanceRecord, IdentityKind, IdentityRef};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Timelike, Utc};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

/// Outcome of an attendance attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkResult {
    /// A new record was written.
    Marked(AttendanceRecord),
    /// The identity was already marked inside the current window.
    Duplicate,
    /// Nothing to mark (the face is not yet confirmed).
    NoOp,
}

/// Enforces at most one attendance record per identity per window.
pub struct AttendanceGate {
    ledger: Arc<dyn AttendanceLedger>,
    mode: AttendanceMode,
    cooldown: Duration,
    offset: FixedOffset,
}

impl AttendanceGate {
    pub fn new(config: &EngineConfig, ledger: Arc<dyn AttendanceLedger>) -> Self {
        Self {
            ledger,
            mode: config.attendance_mode,
            cooldown: config.cooldown,
            offset: config.utc_offset,
        }
    }

    pub fn mode(&self) -> AttendanceMode {
        self.mode
    }

    /// Local calendar date for `now`.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    /// Mark `identity` at `now` unless it is inside its cooldown window.
    ///
    /// The window check and the write happen in one atomic ledger call.
    pub fn try_mark(
        &self,
        identity: IdentityRef,
        distance: Option<f32>,
        now: DateTime<Utc>,
    ) -> Result<MarkResult, StoreError> {
        let local = now.with_timezone(&self.offset);
        let time = local.time();
        let entry = NewAttendance {
            identity,
            marked_at: now,
            date: local.date_naive(),
            time: time.with_nanosecond(0).unwrap_or(time),
            distance,
        };

        match self.mode {
            AttendanceMode::Rolling => {
                match self.ledger.insert_unless_recent(&entry, now - self.cooldown)? {
                    Some(record) => {
                        tracing::info!(
                            identity = %identity,
                            attendance_id = record.attendance_id,
                            "attendance: marked"
                        );
                        Ok(MarkResult::Marked(record))
                    }
                    None => {
                        tracing::debug!(identity = %identity, "attendance: inside cooldown");
                        Ok(MarkResult::Duplicate)
                    }
                }
            }
            AttendanceMode::Daily => match self.ledger.upsert_daily(&entry)? {
                DailyMark::Created(record) => {
                    tracing::info!(
                        identity = %identity,
                        attendance_id = record.attendance_id,
                        date = %record.date,
                        "attendance: marked for day"
                    );
                    Ok(MarkResult::Marked(record))
                }
                DailyMark::Incremented(record) => {
                    tracing::debug!(
                        identity = %identity,
                        detections = record.detection_count,
                        "attendance: already marked today"
                    );
                    Ok(MarkResult::Duplicate)
                }
            },
        }
    }

    pub fn list(
        &self,
        query: &AttendanceQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<AttendanceRecord>, ListError> {
        let filter = query.to_filter(self.local_date(now))?;
        Ok(self.ledger.query(&filter)?)
    }
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("invalid time {0:?} (expected HH:MM)")]
    Time(String),
    #[error("pending is not a listable identity kind")]
    Kind,
    #[error("date range out of bounds")]
    Range,
}

#[derive(Error, Debug)]
pub enum ListError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Preset date windows relative to the local "today".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DateRange {
    #[serde(rename = "last_7_days")]
    Last7Days,
    /// The previous calendar month.
    #[serde(rename = "last_month")]
    LastMonth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
    Recent,
}

/// Client-facing attendance listing request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AttendanceQuery {
    pub kind: Option<IdentityKind>,
    pub identity: Option<IdentityRef>,
    /// Exact local date.
    pub date: Option<NaiveDate>,
    /// `HH:MM`; matches the whole minute, on any date unless `date` is set.
    pub time: Option<String>,
    pub range: Option<DateRange>,
    pub sort: Option<SortOrder>,
    pub limit: Option<usize>,
}

impl AttendanceQuery {
    pub fn to_filter(&self, today: NaiveDate) -> Result<LedgerFilter, QueryError> {
        if self.kind == Some(IdentityKind::Pending) {
            return Err(QueryError::Kind);
        }

        let mut filter = LedgerFilter {
            kind: self.kind,
            identity: self.identity,
            date_from: self.date,
            date_to: self.date,
            oldest_first: self.sort == Some(SortOrder::Asc),
            limit: self.limit,
            ..LedgerFilter::default()
        };

        if let Some(raw) = &self.time {
            let minute = NaiveTime::parse_from_str(raw.trim(), "%H:%M")
                .map_err(|_| QueryError::Time(raw.clone()))?;
            filter.time_from = Some(minute);
            filter.time_to = Some(minute + Duration::seconds(59));
        }

        if let Some(range) = self.range {
            let (from, to) = match range {
                DateRange::Last7Days => (today - Duration::days(7), today),
                DateRange::LastMonth => {
                    let first_this = today.with_day(1).ok_or(QueryError::Range)?;
                    let last_prev = first_this.pred_opt().ok_or(QueryError::Range)?;
                    let first_prev = last_prev.with_day(1).ok_or(QueryError::Range)?;
                    (first_prev, last_prev)
                }
            };
            filter.date_from = Some(filter.date_from.map_or(from, |d| d.max(from)));
            filter.date_to = Some(filter.date_to.map_or(to, |d| d.min(to)));
        }

        Ok(filter)
    }
}
