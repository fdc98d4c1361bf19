use crate::store::{
    AttendanceLedger, DailyMark, InsertOutcome, LedgerFilter, NewAttendance, NewVisitor,
    RegisteredStore, StoreError, VisitorStore,
};
use crate::types::{AttendanceRecord, RegisteredIdentity, VisitorIdentity};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use uuid::Uuid;

/// In-memory implementation of every store trait.
/// Data is lost on restart. Suitable for testing or ephemeral deployments.
pub struct MemoryStore {
    registered: RwLock<Arc<Vec<RegisteredIdentity>>>,
    visitors: Mutex<VisitorTable>,
    ledger: Mutex<LedgerTable>,
}

struct VisitorTable {
    rows: Vec<VisitorIdentity>,
    next_seq: i64,
}

struct LedgerTable {
    rows: Vec<AttendanceRecord>,
    next_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            registered: RwLock::new(Arc::new(Vec::new())),
            visitors: Mutex::new(VisitorTable {
                rows: Vec::new(),
                next_seq: 1,
            }),
            ledger: Mutex::new(LedgerTable {
                rows: Vec::new(),
                next_id: 1,
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisteredStore for MemoryStore {
    fn snapshot(&self) -> Result<Arc<Vec<RegisteredIdentity>>, StoreError> {
        Ok(self.registered.read().clone())
    }

    fn register(&self, identity: RegisteredIdentity) -> Result<(), StoreError> {
        // Copy-on-write: readers holding the old Arc keep a stable view.
        let mut guard = self.registered.write();
        let mut next: Vec<RegisteredIdentity> = (**guard).clone();
        match next.binary_search_by_key(&identity.identity_id, |r| r.identity_id) {
            Ok(idx) => next[idx] = identity,
            Err(idx) => next.insert(idx, identity),
        }
        *guard = Arc::new(next);
        Ok(())
    }
}

impl VisitorStore for MemoryStore {
    fn visitors(&self) -> Result<Vec<VisitorIdentity>, StoreError> {
        Ok(self.visitors.lock().rows.clone())
    }

    fn visitors_after(&self, after: i64) -> Result<Vec<VisitorIdentity>, StoreError> {
        Ok(self
            .visitors
            .lock()
            .rows
            .iter()
            .filter(|v| v.seq > after)
            .cloned()
            .collect())
    }

    fn visitor(&self, visitor_id: Uuid) -> Result<Option<VisitorIdentity>, StoreError> {
        Ok(self
            .visitors
            .lock()
            .rows
            .iter()
            .find(|v| v.visitor_id == visitor_id)
            .cloned())
    }

    fn visitor_count(&self) -> Result<usize, StoreError> {
        Ok(self.visitors.lock().rows.len())
    }

    fn insert_visitor(
        &self,
        visitor: &NewVisitor,
        watermark: i64,
    ) -> Result<InsertOutcome, StoreError> {
        let mut table = self.visitors.lock();
        if table.rows.iter().any(|v| v.seq > watermark) {
            return Ok(InsertOutcome::Stale);
        }
        if table
            .rows
            .iter()
            .any(|v| v.visitor_id == visitor.visitor_id || v.handle == visitor.handle)
        {
            return Ok(InsertOutcome::HandleTaken);
        }

        let row = VisitorIdentity {
            seq: table.next_seq,
            visitor_id: visitor.visitor_id,
            handle: visitor.handle.clone(),
            vector: visitor.vector.clone(),
            appearance_count: 1,
            created_at: visitor.created_at,
            claimed: false,
        };
        table.next_seq += 1;
        table.rows.push(row.clone());
        Ok(InsertOutcome::Inserted(row))
    }

    fn record_appearance(&self, visitor_id: Uuid) -> Result<VisitorIdentity, StoreError> {
        let mut table = self.visitors.lock();
        let row = table
            .rows
            .iter_mut()
            .find(|v| v.visitor_id == visitor_id)
            .ok_or_else(|| StoreError::NotFound(format!("visitor {visitor_id}")))?;
        row.appearance_count += 1;
        Ok(row.clone())
    }
}

impl LedgerTable {
    fn push(&mut self, entry: &NewAttendance) -> AttendanceRecord {
        let record = AttendanceRecord {
            attendance_id: self.next_id,
            identity: entry.identity,
            marked_at: entry.marked_at,
            date: entry.date,
            time: entry.time,
            detection_count: 1,
            distance: entry.distance,
        };
        self.next_id += 1;
        self.rows.push(record.clone());
        record
    }
}

impl AttendanceLedger for MemoryStore {
    fn insert_unless_recent(
        &self,
        entry: &NewAttendance,
        since: DateTime<Utc>,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let mut ledger = self.ledger.lock();
        let recent = ledger
            .rows
            .iter()
            .any(|r| r.identity == entry.identity && r.marked_at >= since);
        if recent {
            return Ok(None);
        }
        Ok(Some(ledger.push(entry)))
    }

    fn upsert_daily(&self, entry: &NewAttendance) -> Result<DailyMark, StoreError> {
        let mut ledger = self.ledger.lock();
        if let Some(existing) = ledger
            .rows
            .iter_mut()
            .find(|r| r.identity == entry.identity && r.date == entry.date)
        {
            existing.detection_count += 1;
            return Ok(DailyMark::Incremented(existing.clone()));
        }
        Ok(DailyMark::Created(ledger.push(entry)))
    }

    fn query(&self, filter: &LedgerFilter) -> Result<Vec<AttendanceRecord>, StoreError> {
        let ledger = self.ledger.lock();
        let mut rows: Vec<AttendanceRecord> = ledger
            .rows
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.marked_at, a.attendance_id).cmp(&(b.marked_at, b.attendance_id))
        });
        if !filter.oldest_first {
            rows.reverse();
        }
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FaceVector, IdentityRef};
    use chrono::TimeZone;

    fn registered(id: i64, values: &[f32]) -> RegisteredIdentity {
        RegisteredIdentity {
            identity_id: id,
            vector: FaceVector::new(values.to_vec()),
        }
    }

    fn new_visitor(handle: &str) -> NewVisitor {
        NewVisitor {
            visitor_id: Uuid::new_v4(),
            handle: handle.to_string(),
            vector: FaceVector::new(vec![1.0, 0.0]),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_snapshot_is_sorted_and_isolated() {
        let store = MemoryStore::new();
        store.register(registered(5, &[1.0])).unwrap();
        store.register(registered(2, &[0.5])).unwrap();

        let snap = store.snapshot().unwrap();
        assert_eq!(
            snap.iter().map(|r| r.identity_id).collect::<Vec<_>>(),
            vec![2, 5]
        );

        // Re-registration replaces 1:1 and leaves the old snapshot untouched.
        store.register(registered(5, &[0.25])).unwrap();
        store.register(registered(9, &[0.75])).unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[1].vector.values, vec![1.0]);

        let fresh = store.snapshot().unwrap();
        assert_eq!(fresh.len(), 3);
        assert_eq!(fresh[1].vector.values, vec![0.25]);
        assert!(store.contains(9).unwrap());
        assert!(!store.contains(3).unwrap());
    }

    #[test]
    fn test_insert_visitor_guards() {
        let store = MemoryStore::new();
        let first = match store.insert_visitor(&new_visitor("visitor_a"), 0).unwrap() {
            InsertOutcome::Inserted(v) => v,
            other => panic!("expected insert, got {other:?}"),
        };
        assert_eq!(first.seq, 1);
        assert_eq!(first.appearance_count, 1);

        // A caller that scanned before the first insert is stale.
        assert!(matches!(
            store.insert_visitor(&new_visitor("visitor_b"), 0).unwrap(),
            InsertOutcome::Stale
        ));
        assert!(matches!(
            store.insert_visitor(&new_visitor("visitor_a"), 1).unwrap(),
            InsertOutcome::HandleTaken
        ));
        assert!(matches!(
            store.insert_visitor(&new_visitor("visitor_b"), 1).unwrap(),
            InsertOutcome::Inserted(_)
        ));

        assert_eq!(store.visitors_after(1).unwrap().len(), 1);
        assert_eq!(store.visitor_count().unwrap(), 2);

        let bumped = store.record_appearance(first.visitor_id).unwrap();
        assert_eq!(bumped.appearance_count, 2);
        assert!(matches!(
            store.record_appearance(Uuid::new_v4()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_ledger_query_order_and_filters() {
        let store = MemoryStore::new();
        let base = Utc.with_ymd_and_hms(2026, 5, 4, 8, 30, 0).unwrap();
        for (i, identity) in [
            IdentityRef::Registered(1),
            IdentityRef::Visitor(Uuid::new_v4()),
            IdentityRef::Registered(2),
        ]
        .into_iter()
        .enumerate()
        {
            let at = base + chrono::Duration::minutes(i as i64);
            let entry = NewAttendance {
                identity,
                marked_at: at,
                date: at.date_naive(),
                time: at.time(),
                distance: None,
            };
            store.insert_unless_recent(&entry, at).unwrap().unwrap();
        }

        let all = store.query(&LedgerFilter::default()).unwrap();
        assert_eq!(
            all.iter().map(|r| r.attendance_id).collect::<Vec<_>>(),
            vec![3, 2, 1]
        );

        let registered_only = store
            .query(&LedgerFilter {
                kind: Some(crate::types::IdentityKind::Registered),
                oldest_first: true,
                limit: Some(1),
                ..LedgerFilter::default()
            })
            .unwrap();
        assert_eq!(registered_only.len(), 1);
        assert_eq!(registered_only[0].attendance_id, 1);
    }
}
