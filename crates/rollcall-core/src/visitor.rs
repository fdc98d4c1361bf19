//! Visitor deduplication.
//!
//! Confirmed-unknown faces are matched against previously seen visitors with
//! a looser threshold than registered identities. A genuinely new face mints
//! exactly one visitor even when several requests race to create it: the
//! insert only succeeds against an up-to-date scan, and a loser re-scans the
//! rows it missed and increments the winner instead.

use crate::matcher::{CosineMatcher, Matcher};
use crate::store::{InsertOutcome, NewVisitor, StoreError, VisitorStore};
use crate::types::{FaceVector, VisitorIdentity};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

const MAX_INSERT_ATTEMPTS: usize = 8;
const HANDLE_PREFIX: &str = "visitor_";
const HANDLE_TOKEN_LEN: usize = 8;

/// Build a new visitor with a fresh id and random handle.
pub fn mint_visitor(vector: &FaceVector, now: DateTime<Utc>) -> NewVisitor {
    let token = Uuid::new_v4().simple().to_string();
    NewVisitor {
        visitor_id: Uuid::new_v4(),
        handle: format!("{HANDLE_PREFIX}{}", &token[..HANDLE_TOKEN_LEN]),
        vector: vector.clone(),
        created_at: now,
    }
}

/// Outcome of [`VisitorRegistry::resolve`].
#[derive(Debug, Clone)]
pub struct VisitorResolution {
    pub visitor: VisitorIdentity,
    /// Distance from the query to the visitor's stored vector.
    pub distance: f32,
    pub created: bool,
}

/// Local copy of every visitor up to `watermark`.
///
/// Visitor vectors never change after insertion, so only rows past the
/// watermark need reading. Appearance counts in here go stale and are not used.
#[derive(Default)]
struct VisitorCache {
    visitors: Arc<Vec<VisitorIdentity>>,
    watermark: i64,
}

pub struct VisitorRegistry<M = CosineMatcher> {
    store: Arc<dyn VisitorStore>,
    matcher: M,
    threshold: f32,
    cache: Mutex<VisitorCache>,
}

impl<M: Matcher> VisitorRegistry<M> {
    pub fn new(store: Arc<dyn VisitorStore>, matcher: M, threshold: f32) -> Self {
        Self {
            store,
            matcher,
            threshold,
            cache: Mutex::new(VisitorCache::default()),
        }
    }

    /// Pull visitors inserted since the last call into the cache.
    fn refresh(&self) -> Result<(Arc<Vec<VisitorIdentity>>, i64), StoreError> {
        let mut cache = self.cache.lock();
        let newer = self.store.visitors_after(cache.watermark)?;
        if let Some(last) = newer.iter().map(|v| v.seq).max() {
            Arc::make_mut(&mut cache.visitors).extend(newer);
            cache.watermark = last;
        }
        Ok((cache.visitors.clone(), cache.watermark))
    }

    pub fn store(&self) -> &Arc<dyn VisitorStore> {
        &self.store
    }

    /// Return the visitor this vector belongs to, creating one if none is
    /// within the threshold.
    pub fn resolve(
        &self,
        vector: &FaceVector,
        now: DateTime<Utc>,
    ) -> Result<VisitorResolution, StoreError> {
        let (mut scan, mut watermark) = self.refresh()?;
        let mut candidate = mint_visitor(vector, now);

        for attempt in 1..=MAX_INSERT_ATTEMPTS {
            let found = self.matcher.find_match(
                vector,
                scan.iter().map(|v| (v.visitor_id, &v.vector)),
                self.threshold,
            );
            if let Some(m) = found {
                let visitor = self.store.record_appearance(m.id)?;
                tracing::debug!(
                    visitor = %visitor.handle,
                    distance = m.distance,
                    appearances = visitor.appearance_count,
                    "visitor: recognized returning visitor"
                );
                return Ok(VisitorResolution {
                    visitor,
                    distance: m.distance,
                    created: false,
                });
            }

            match self.store.insert_visitor(&candidate, watermark)? {
                InsertOutcome::Inserted(visitor) => {
                    tracing::info!(
                        visitor = %visitor.handle,
                        visitor_id = %visitor.visitor_id,
                        "visitor: created"
                    );
                    return Ok(VisitorResolution {
                        visitor,
                        distance: 0.0,
                        created: true,
                    });
                }
                InsertOutcome::Stale => {
                    // Only rows inserted since our scan still need checking.
                    scan = Arc::new(self.store.visitors_after(watermark)?);
                    watermark = scan.iter().map(|v| v.seq).max().unwrap_or(watermark);
                    tracing::debug!(attempt, newer = scan.len(), "visitor: scan stale, rechecking");
                }
                InsertOutcome::HandleTaken => {
                    scan = Arc::default();
                    candidate = mint_visitor(vector, now);
                    tracing::debug!(attempt, "visitor: handle collision, regenerating");
                }
            }
        }

        Err(StoreError::Contention(MAX_INSERT_ATTEMPTS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;

    fn registry(store: Arc<MemoryStore>, threshold: f32) -> VisitorRegistry {
        VisitorRegistry::new(store, CosineMatcher, threshold)
    }

    fn v(values: &[f32]) -> FaceVector {
        FaceVector::new(values.to_vec())
    }

    #[test]
    fn test_mint_handle_shape() {
        let minted = mint_visitor(&v(&[1.0]), Utc::now());
        assert!(minted.handle.starts_with("visitor_"));
        assert_eq!(minted.handle.len(), HANDLE_PREFIX.len() + HANDLE_TOKEN_LEN);
    }

    #[test]
    fn test_close_vectors_share_a_visitor() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone(), 0.65);

        let first = reg.resolve(&v(&[1.0, 0.0, 0.1]), Utc::now()).unwrap();
        assert!(first.created);
        assert_eq!(first.distance, 0.0);
        assert_eq!(first.visitor.appearance_count, 1);

        let second = reg.resolve(&v(&[0.9, 0.1, 0.1]), Utc::now()).unwrap();
        assert!(!second.created);
        assert!(second.distance > 0.0 && second.distance < 0.65);
        assert_eq!(second.visitor.visitor_id, first.visitor.visitor_id);
        assert_eq!(second.visitor.appearance_count, 2);
        assert_eq!(store.visitor_count().unwrap(), 1);
    }

    #[test]
    fn test_distance_at_threshold_creates_distinct_visitors() {
        let store = Arc::new(MemoryStore::new());
        // Orthogonal vectors are exactly 1.0 apart.
        let reg = registry(store.clone(), 1.0);

        let a = reg.resolve(&v(&[1.0, 0.0]), Utc::now()).unwrap();
        let b = reg.resolve(&v(&[0.0, 1.0]), Utc::now()).unwrap();
        assert!(a.created && b.created);
        assert_ne!(a.visitor.visitor_id, b.visitor.visitor_id);
        assert_eq!(store.visitor_count().unwrap(), 2);
    }

    #[test]
    fn test_closest_visitor_wins() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone(), 0.65);
        let left = reg.resolve(&v(&[1.0, 0.0]), Utc::now()).unwrap().visitor;
        let orthogonal = registry(store.clone(), 0.01);
        let right = orthogonal.resolve(&v(&[0.0, 1.0]), Utc::now()).unwrap().visitor;
        assert_ne!(left.visitor_id, right.visitor_id);

        let hit = reg.resolve(&v(&[0.2, 1.0]), Utc::now()).unwrap();
        assert!(!hit.created);
        assert_eq!(hit.visitor.visitor_id, right.visitor_id);
    }

    /// Store wrapper that lets a competitor insert the same face between the
    /// registry's scan and its insert.
    struct RacingStore {
        inner: MemoryStore,
        raced: AtomicBool,
        rival: FaceVector,
    }

    impl VisitorStore for RacingStore {
        fn visitors(&self) -> Result<Vec<VisitorIdentity>, StoreError> {
            self.inner.visitors()
        }
        fn visitors_after(&self, after: i64) -> Result<Vec<VisitorIdentity>, StoreError> {
            self.inner.visitors_after(after)
        }
        fn visitor(&self, id: Uuid) -> Result<Option<VisitorIdentity>, StoreError> {
            self.inner.visitor(id)
        }
        fn visitor_count(&self) -> Result<usize, StoreError> {
            self.inner.visitor_count()
        }
        fn insert_visitor(
            &self,
            visitor: &NewVisitor,
            watermark: i64,
        ) -> Result<InsertOutcome, StoreError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                let rival = mint_visitor(&self.rival, Utc::now());
                self.inner.insert_visitor(&rival, watermark)?;
            }
            self.inner.insert_visitor(visitor, watermark)
        }
        fn record_appearance(&self, id: Uuid) -> Result<VisitorIdentity, StoreError> {
            self.inner.record_appearance(id)
        }
    }

    #[test]
    fn test_losing_creator_increments_winner() {
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            raced: AtomicBool::new(false),
            rival: v(&[1.0, 0.0]),
        });
        let reg = VisitorRegistry::new(store.clone(), CosineMatcher, 0.65);

        let resolved = reg.resolve(&v(&[1.0, 0.01]), Utc::now()).unwrap();
        assert!(!resolved.created);
        assert_eq!(resolved.visitor.appearance_count, 2);
        assert_eq!(store.visitor_count().unwrap(), 1);
    }

    #[test]
    fn test_losing_creator_of_different_face_still_inserts() {
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            raced: AtomicBool::new(false),
            rival: v(&[0.0, 1.0]),
        });
        let reg = VisitorRegistry::new(store.clone(), CosineMatcher, 0.65);

        let resolved = reg.resolve(&v(&[1.0, 0.0]), Utc::now()).unwrap();
        assert!(resolved.created);
        assert_eq!(resolved.visitor.seq, 2);
        assert_eq!(store.visitor_count().unwrap(), 2);
    }

    /// Records the watermark of every incremental read.
    struct CountingStore {
        inner: MemoryStore,
        reads: parking_lot::Mutex<Vec<i64>>,
    }

    impl VisitorStore for CountingStore {
        fn visitors(&self) -> Result<Vec<VisitorIdentity>, StoreError> {
            panic!("full scans go through the cache");
        }
        fn visitors_after(&self, after: i64) -> Result<Vec<VisitorIdentity>, StoreError> {
            self.reads.lock().push(after);
            self.inner.visitors_after(after)
        }
        fn visitor(&self, id: Uuid) -> Result<Option<VisitorIdentity>, StoreError> {
            self.inner.visitor(id)
        }
        fn visitor_count(&self) -> Result<usize, StoreError> {
            self.inner.visitor_count()
        }
        fn insert_visitor(
            &self,
            visitor: &NewVisitor,
            watermark: i64,
        ) -> Result<InsertOutcome, StoreError> {
            self.inner.insert_visitor(visitor, watermark)
        }
        fn record_appearance(&self, id: Uuid) -> Result<VisitorIdentity, StoreError> {
            self.inner.record_appearance(id)
        }
    }

    #[test]
    fn test_only_new_rows_are_read() {
        let store = Arc::new(CountingStore {
            inner: MemoryStore::new(),
            reads: parking_lot::Mutex::new(Vec::new()),
        });
        let reg = VisitorRegistry::new(store.clone(), CosineMatcher, 0.65);

        let created = reg.resolve(&v(&[1.0, 0.0]), Utc::now()).unwrap();
        assert!(created.created);
        let again = reg.resolve(&v(&[0.99, 0.05]), Utc::now()).unwrap();
        assert_eq!(again.visitor.visitor_id, created.visitor.visitor_id);
        assert_eq!(again.visitor.appearance_count, 2);
        let other = reg.resolve(&v(&[0.0, 1.0]), Utc::now()).unwrap();
        assert!(other.created);

        assert_eq!(*store.reads.lock(), vec![0, 0, 1]);
    }

    #[test]
    fn test_concurrent_resolves_create_one_visitor() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone(), 0.65);
        let threads = 8;
        let barrier = Barrier::new(threads);

        let created: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        let resolved = reg.resolve(&v(&[0.3, 0.4, 0.5]), Utc::now()).unwrap();
                        usize::from(resolved.created)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(created, 1);
        let all = store.visitors().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].appearance_count, threads as u32);
    }
}
