//! rollcall-store: SQLite persistence for the rollcall engine.
//!
//! One connection per store, guarded by a mutex. Every check-then-write runs
//! inside a `BEGIN IMMEDIATE` transaction so the write lock is taken before
//! the check, which keeps the guarantees intact when several processes share
//! one database file.

mod schema;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use parking_lot::Mutex;
use rollcall_core::store::{
    AttendanceLedger, DailyMark, InsertOutcome, LedgerFilter, NewAttendance, NewVisitor,
    RegisteredStore, StoreError, VisitorStore,
};
use rollcall_core::types::{
    AttendanceRecord, FaceVector, IdentityKind, IdentityRef, RegisteredIdentity, VisitorIdentity,
};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

const VISITOR_COLUMNS: &str =
    "seq, visitor_id, handle, vector, appearance_count, created_at, claimed";
const ATTENDANCE_COLUMNS: &str =
    "id, registered_id, visitor_id, marked_at, date, time, detection_count, distance";

#[derive(Error, Debug)]
pub enum SqliteError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("vector encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Corrupt(String),
}

impl From<SqliteError> for StoreError {
    fn from(err: SqliteError) -> Self {
        match err {
            SqliteError::Sqlite(rusqlite::Error::SqliteFailure(e, msg))
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                StoreError::Busy(msg.unwrap_or_else(|| e.to_string()))
            }
            SqliteError::Sqlite(e) => StoreError::Backend(e.to_string()),
            SqliteError::Json(e) => StoreError::Corrupt(e.to_string()),
            SqliteError::Corrupt(msg) => StoreError::Corrupt(msg),
        }
    }
}

type Result<T> = std::result::Result<T, SqliteError>;

/// SQLite implementation of every store trait.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    /// Last registered snapshot, tagged with the `data_version` it was read at.
    registered: Mutex<Option<(i64, Arc<Vec<RegisteredIdentity>>)>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// `busy_timeout` bounds how long a call waits for another writer.
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SqliteError::Corrupt(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        schema::init(&conn)?;

        tracing::info!(path = %path.display(), ?busy_timeout, "sqlite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            registered: Mutex::new(None),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            registered: Mutex::new(None),
        })
    }

    /// Run `f` inside an IMMEDIATE transaction, committing on success.
    fn write<T>(&self, f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Registered vectors, re-read only when the database changed.
    ///
    /// `data_version` moves on commits from other connections; commits made
    /// through this one clear the cache in `register`.
    fn registered_snapshot(&self) -> Result<Arc<Vec<RegisteredIdentity>>> {
        let conn = self.conn.lock();
        let version: i64 = conn.query_row("PRAGMA data_version", [], |row| row.get(0))?;
        let mut cached = self.registered.lock();
        if let Some((at, snapshot)) = cached.as_ref() {
            if *at == version {
                return Ok(snapshot.clone());
            }
        }

        let mut stmt = conn
            .prepare("SELECT identity_id, vector FROM registered_embeddings ORDER BY identity_id")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let vector: String = row.get(1)?;
            out.push(RegisteredIdentity {
                identity_id: row.get(0)?,
                vector: serde_json::from_str(&vector)?,
            });
        }
        tracing::debug!(identities = out.len(), version, "registered snapshot reloaded");
        let snapshot = Arc::new(out);
        *cached = Some((version, snapshot.clone()));
        Ok(snapshot)
    }

    fn load_visitors(&self, after: i64) -> Result<Vec<VisitorIdentity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {VISITOR_COLUMNS} FROM visitors WHERE seq > ?1 ORDER BY seq"
        ))?;
        let mut rows = stmt.query(params![after])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(visitor_from_row(row)?);
        }
        Ok(out)
    }

    fn insert_visitor_tx(&self, visitor: &NewVisitor, watermark: i64) -> Result<InsertOutcome> {
        self.write(|tx| {
            let stale: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM visitors WHERE seq > ?1)",
                params![watermark],
                |row| row.get(0),
            )?;
            if stale {
                return Ok(InsertOutcome::Stale);
            }

            let visitor_id = visitor.visitor_id.to_string();
            let taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM visitors WHERE visitor_id = ?1 OR handle = ?2)",
                params![visitor_id, visitor.handle],
                |row| row.get(0),
            )?;
            if taken {
                return Ok(InsertOutcome::HandleTaken);
            }

            tx.execute(
                "INSERT INTO visitors (visitor_id, handle, vector, appearance_count, created_at, claimed)
                 VALUES (?1, ?2, ?3, 1, ?4, 0)",
                params![
                    visitor_id,
                    visitor.handle,
                    serde_json::to_string(&visitor.vector)?,
                    visitor.created_at.timestamp_millis(),
                ],
            )?;

            Ok(InsertOutcome::Inserted(VisitorIdentity {
                seq: tx.last_insert_rowid(),
                visitor_id: visitor.visitor_id,
                handle: visitor.handle.clone(),
                vector: visitor.vector.clone(),
                appearance_count: 1,
                created_at: visitor.created_at,
                claimed: false,
            }))
        })
    }

    fn record_appearance_tx(&self, visitor_id: Uuid) -> Result<Option<VisitorIdentity>> {
        self.write(|tx| {
            let mut stmt = tx.prepare(&format!(
                "UPDATE visitors SET appearance_count = appearance_count + 1
                 WHERE visitor_id = ?1 RETURNING {VISITOR_COLUMNS}"
            ))?;
            let mut rows = stmt.query(params![visitor_id.to_string()])?;
            match rows.next()? {
                Some(row) => Ok(Some(visitor_from_row(row)?)),
                None => Ok(None),
            }
        })
    }

    fn insert_unless_recent_tx(
        &self,
        entry: &NewAttendance,
        since: DateTime<Utc>,
    ) -> Result<Option<AttendanceRecord>> {
        let (column, key) = identity_key(&entry.identity);
        self.write(|tx| {
            let recent: bool = tx.query_row(
                &format!(
                    "SELECT EXISTS(SELECT 1 FROM attendance WHERE {column} = ?1 AND marked_at >= ?2)"
                ),
                params![key, since.timestamp_millis()],
                |row| row.get(0),
            )?;
            if recent {
                return Ok(None);
            }
            insert_attendance(tx, entry).map(Some)
        })
    }

    fn upsert_daily_tx(&self, entry: &NewAttendance) -> Result<DailyMark> {
        let (column, key) = identity_key(&entry.identity);
        let date = entry.date.format(DATE_FORMAT).to_string();
        self.write(|tx| {
            let existing: Option<i64> = tx
                .query_row(
                    &format!(
                        "SELECT id FROM attendance WHERE {column} = ?1 AND date = ?2
                         ORDER BY id LIMIT 1"
                    ),
                    params![key, date],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(id) = existing else {
                return insert_attendance(tx, entry).map(DailyMark::Created);
            };

            let mut stmt = tx.prepare(&format!(
                "UPDATE attendance SET detection_count = detection_count + 1
                 WHERE id = ?1 RETURNING {ATTENDANCE_COLUMNS}"
            ))?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => Ok(DailyMark::Incremented(attendance_from_row(row)?)),
                None => Err(SqliteError::Corrupt(format!("attendance row {id} vanished"))),
            }
        })
    }

    fn query_ledger(&self, filter: &LedgerFilter) -> Result<Vec<AttendanceRecord>> {
        let mut clauses: Vec<String> = match filter.kind {
            Some(IdentityKind::Registered) => vec!["registered_id IS NOT NULL".into()],
            Some(IdentityKind::Visitor) => vec!["visitor_id IS NOT NULL".into()],
            Some(IdentityKind::Pending) => vec!["0".into()],
            None => Vec::new(),
        };
        let mut values: Vec<Value> = Vec::new();
        let mut bind = |clause: &str, value: Value| {
            values.push(value);
            clauses.push(clause.replace('?', &format!("?{}", values.len())));
        };

        if let Some(identity) = &filter.identity {
            let (column, key) = identity_key(identity);
            bind(&format!("{column} = ?"), key);
        }
        if let Some(d) = filter.date_from {
            bind("date >= ?", Value::Text(d.format(DATE_FORMAT).to_string()));
        }
        if let Some(d) = filter.date_to {
            bind("date <= ?", Value::Text(d.format(DATE_FORMAT).to_string()));
        }
        if let Some(t) = filter.time_from {
            bind("time >= ?", Value::Text(t.format(TIME_FORMAT).to_string()));
        }
        if let Some(t) = filter.time_to {
            bind("time <= ?", Value::Text(t.format(TIME_FORMAT).to_string()));
        }

        let mut sql = format!("SELECT {ATTENDANCE_COLUMNS} FROM attendance");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        let order = if filter.oldest_first { "ASC" } else { "DESC" };
        sql.push_str(&format!(" ORDER BY marked_at {order}, id {order}"));
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(attendance_from_row(row)?);
        }
        Ok(out)
    }
}

fn identity_key(identity: &IdentityRef) -> (&'static str, Value) {
    match identity {
        IdentityRef::Registered(id) => ("registered_id", Value::Integer(*id)),
        IdentityRef::Visitor(id) => ("visitor_id", Value::Text(id.to_string())),
    }
}

fn insert_attendance(tx: &rusqlite::Transaction<'_>, entry: &NewAttendance) -> Result<AttendanceRecord> {
    let (registered_id, visitor_id) = match entry.identity {
        IdentityRef::Registered(id) => (Some(id), None),
        IdentityRef::Visitor(id) => (None, Some(id.to_string())),
    };
    tx.execute(
        "INSERT INTO attendance (registered_id, visitor_id, marked_at, date, time, detection_count, distance)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
        params![
            registered_id,
            visitor_id,
            entry.marked_at.timestamp_millis(),
            entry.date.format(DATE_FORMAT).to_string(),
            entry.time.format(TIME_FORMAT).to_string(),
            entry.distance.map(f64::from),
        ],
    )?;

    Ok(AttendanceRecord {
        attendance_id: tx.last_insert_rowid(),
        identity: entry.identity,
        marked_at: entry.marked_at,
        date: entry.date,
        time: entry.time,
        detection_count: 1,
        distance: entry.distance,
    })
}

fn millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| SqliteError::Corrupt(format!("timestamp {ms} out of range")))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| SqliteError::Corrupt(format!("bad visitor id {raw:?}")))
}

fn visitor_from_row(row: &Row<'_>) -> Result<VisitorIdentity> {
    let visitor_id: String = row.get(1)?;
    let vector: String = row.get(3)?;
    Ok(VisitorIdentity {
        seq: row.get(0)?,
        visitor_id: parse_uuid(&visitor_id)?,
        handle: row.get(2)?,
        vector: serde_json::from_str::<FaceVector>(&vector)?,
        appearance_count: row.get(4)?,
        created_at: millis(row.get(5)?)?,
        claimed: row.get(6)?,
    })
}

fn attendance_from_row(row: &Row<'_>) -> Result<AttendanceRecord> {
    let id: i64 = row.get(0)?;
    let registered_id: Option<i64> = row.get(1)?;
    let visitor_id: Option<String> = row.get(2)?;
    let identity = match (registered_id, visitor_id) {
        (Some(rid), None) => IdentityRef::Registered(rid),
        (None, Some(vid)) => IdentityRef::Visitor(parse_uuid(&vid)?),
        _ => {
            return Err(SqliteError::Corrupt(format!(
                "attendance row {id} must reference exactly one identity"
            )))
        }
    };
    let date: String = row.get(4)?;
    let time: String = row.get(5)?;
    let distance: Option<f64> = row.get(7)?;

    Ok(AttendanceRecord {
        attendance_id: id,
        identity,
        marked_at: millis(row.get(3)?)?,
        date: NaiveDate::parse_from_str(&date, DATE_FORMAT)
            .map_err(|_| SqliteError::Corrupt(format!("bad date {date:?} on row {id}")))?,
        time: NaiveTime::parse_from_str(&time, TIME_FORMAT)
            .map_err(|_| SqliteError::Corrupt(format!("bad time {time:?} on row {id}")))?,
        detection_count: row.get(6)?,
        distance: distance.map(|d| d as f32),
    })
}

impl RegisteredStore for SqliteStore {
    fn snapshot(&self) -> std::result::Result<Arc<Vec<RegisteredIdentity>>, StoreError> {
        Ok(self.registered_snapshot()?)
    }

    fn register(&self, identity: RegisteredIdentity) -> std::result::Result<(), StoreError> {
        let vector = serde_json::to_string(&identity.vector).map_err(SqliteError::from)?;
        self.write(|tx| {
            tx.execute(
                "INSERT INTO registered_embeddings (identity_id, vector, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(identity_id) DO UPDATE SET
                     vector = excluded.vector,
                     updated_at = excluded.updated_at",
                params![identity.identity_id, vector, Utc::now().timestamp_millis()],
            )?;
            *self.registered.lock() = None;
            Ok(())
        })?;
        tracing::debug!(identity_id = identity.identity_id, "registered embedding stored");
        Ok(())
    }

    fn contains(&self, identity_id: i64) -> std::result::Result<bool, StoreError> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM registered_embeddings WHERE identity_id = ?1)",
                params![identity_id],
                |row| row.get(0),
            )
            .map_err(SqliteError::from)?;
        Ok(found)
    }
}

impl VisitorStore for SqliteStore {
    fn visitors(&self) -> std::result::Result<Vec<VisitorIdentity>, StoreError> {
        Ok(self.load_visitors(0)?)
    }

    fn visitors_after(&self, after: i64) -> std::result::Result<Vec<VisitorIdentity>, StoreError> {
        Ok(self.load_visitors(after)?)
    }

    fn visitor(&self, visitor_id: Uuid) -> std::result::Result<Option<VisitorIdentity>, StoreError> {
        let lookup = || -> Result<Option<VisitorIdentity>> {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {VISITOR_COLUMNS} FROM visitors WHERE visitor_id = ?1"
            ))?;
            let mut rows = stmt.query(params![visitor_id.to_string()])?;
            match rows.next()? {
                Some(row) => Ok(Some(visitor_from_row(row)?)),
                None => Ok(None),
            }
        };
        Ok(lookup()?)
    }

    fn visitor_count(&self) -> std::result::Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM visitors", [], |row| row.get(0))
            .map_err(SqliteError::from)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn insert_visitor(
        &self,
        visitor: &NewVisitor,
        watermark: i64,
    ) -> std::result::Result<InsertOutcome, StoreError> {
        Ok(self.insert_visitor_tx(visitor, watermark)?)
    }

    fn record_appearance(&self, visitor_id: Uuid) -> std::result::Result<VisitorIdentity, StoreError> {
        self.record_appearance_tx(visitor_id)?
            .ok_or_else(|| StoreError::NotFound(format!("visitor {visitor_id}")))
    }
}

impl AttendanceLedger for SqliteStore {
    fn insert_unless_recent(
        &self,
        entry: &NewAttendance,
        since: DateTime<Utc>,
    ) -> std::result::Result<Option<AttendanceRecord>, StoreError> {
        Ok(self.insert_unless_recent_tx(entry, since)?)
    }

    fn upsert_daily(&self, entry: &NewAttendance) -> std::result::Result<DailyMark, StoreError> {
        Ok(self.upsert_daily_tx(entry)?)
    }

    fn query(&self, filter: &LedgerFilter) -> std::result::Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self.query_ledger(filter)?)
    }
}
