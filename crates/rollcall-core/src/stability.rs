//! Temporal confirmation cache.
//!
//! A face must be observed `confirmation_frames` times, each within the TTL
//! of the previous observation, before a match or no-match decision is
//! trusted. Faces are keyed by a quantized copy of their embedding since
//! frames carry no track identifier.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::matcher::Match;
use crate::types::FaceVector;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Quantized embedding used as a short-lived cache key.
///
/// Each component is rounded to a fixed number of decimal places and stored
/// as an integer, so equality and hashing are exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(Box<[i32]>);

impl Fingerprint {
    pub fn quantize(vector: &FaceVector, precision: u32) -> Self {
        let scale = 10f32.powi(precision as i32);
        Self(
            vector
                .values
                .iter()
                .map(|v| (v * scale).round() as i32)
                .collect(),
        )
    }
}

/// Outcome of one observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Not yet observed often enough.
    Pending,
    /// Confirmed as the given registered identity.
    ConfirmedMatch(Match<i64>),
    /// Confirmed as nobody registered.
    ConfirmedUnknown,
}

/// Visitor resolved for a confirmed-unknown episode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisitorBinding {
    pub visitor_id: Uuid,
    /// Distance between the resolving frame and the visitor's stored vector.
    pub distance: f32,
}

impl Decision {
    pub fn is_confirmed(&self) -> bool {
        !matches!(self, Decision::Pending)
    }
}

#[derive(Debug, Clone)]
struct StabilityRecord {
    observation_count: u32,
    last_seen: DateTime<Utc>,
    best: Option<Match<i64>>,
    /// Frozen once reached; terminal for the episode.
    confirmed: Option<Decision>,
    visitor: Option<VisitorBinding>,
    /// Identifies this record's lifetime between creation and eviction.
    episode: u64,
    /// Bumped by every observation that touches the record.
    revision: u64,
}

/// What the tracker decided for one observation, plus what it needs to undo it.
#[derive(Debug, Clone)]
pub struct Observation {
    pub fingerprint: Fingerprint,
    pub decision: Decision,
    pub observation_count: u32,
    /// True only for the observation that reached confirmation.
    pub newly_confirmed: bool,
    /// Visitor already resolved for this episode.
    pub visitor: Option<VisitorBinding>,
    episode: u64,
    revision: u64,
    prior: Option<StabilityRecord>,
}

struct TrackerInner {
    records: HashMap<Fingerprint, StabilityRecord>,
    next_revision: u64,
}

impl TrackerInner {
    fn evict_expired(&mut self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| now - r.last_seen <= ttl);
        before - self.records.len()
    }
}

/// Shared confirmation cache. One lock guards the whole map, so each
/// observation's increment, best-match update and confirmation check is atomic.
pub struct StabilityTracker {
    confirmation_frames: u32,
    ttl: Duration,
    match_threshold: f32,
    precision: u32,
    clock: Arc<dyn Clock>,
    inner: Mutex<TrackerInner>,
}

impl StabilityTracker {
    pub fn new(config: &EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            confirmation_frames: config.confirmation_frames.max(1),
            ttl: config.cache_ttl,
            match_threshold: config.match_threshold,
            precision: config.fingerprint_precision,
            clock,
            inner: Mutex::new(TrackerInner {
                records: HashMap::new(),
                next_revision: 0,
            }),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn fingerprint(&self, vector: &FaceVector) -> Fingerprint {
        Fingerprint::quantize(vector, self.precision)
    }

    /// Record one sighting of `fingerprint` with this frame's closest
    /// registered candidate (threshold not yet applied).
    pub fn observe(
        &self,
        fingerprint: Fingerprint,
        candidate: Option<Match<i64>>,
        now: DateTime<Utc>,
    ) -> Observation {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let evicted = inner.evict_expired(now, self.ttl);
        if evicted > 0 {
            tracing::debug!(evicted, "stability: evicted expired fingerprints");
        }

        inner.next_revision += 1;
        let revision = inner.next_revision;
        let prior = inner.records.get(&fingerprint).cloned();

        let record = match inner.records.entry(fingerprint.clone()) {
            Entry::Occupied(e) => {
                let r = e.into_mut();
                r.observation_count += 1;
                // Out-of-order arrivals never move last_seen backwards.
                if now > r.last_seen {
                    r.last_seen = now;
                }
                let improves = match (&candidate, &r.best) {
                    (Some(c), Some(best)) => c.distance < best.distance,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if improves {
                    r.best = candidate;
                }
                r
            }
            Entry::Vacant(e) => e.insert(StabilityRecord {
                observation_count: 1,
                last_seen: now,
                best: candidate,
                confirmed: None,
                visitor: None,
                episode: revision,
                revision,
            }),
        };
        record.revision = revision;

        let mut newly_confirmed = false;
        let decision = match record.confirmed {
            Some(frozen) => frozen,
            None if record.observation_count >= self.confirmation_frames => {
                let decided = match record.best {
                    Some(m) if m.distance < self.match_threshold => Decision::ConfirmedMatch(m),
                    _ => Decision::ConfirmedUnknown,
                };
                record.confirmed = Some(decided);
                newly_confirmed = true;
                tracing::info!(
                    observations = record.observation_count,
                    decision = ?decided,
                    "stability: face confirmed"
                );
                decided
            }
            None => Decision::Pending,
        };

        Observation {
            fingerprint,
            decision,
            observation_count: record.observation_count,
            newly_confirmed,
            visitor: record.visitor,
            episode: record.episode,
            revision,
            prior,
        }
    }

    /// Remember the visitor resolved for a confirmed-unknown episode so later
    /// frames of the same episode reuse it.
    pub fn bind_visitor(&self, observation: &Observation, binding: VisitorBinding) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(&observation.fingerprint) {
            if record.episode == observation.episode {
                record.visitor = Some(binding);
            }
        }
    }

    /// Undo `observation` after a downstream failure.
    ///
    /// Only applies if no later observation has touched the record; returns
    /// whether the rollback happened.
    ///
    /// A visitor bound during the undone observation stays bound: its row is
    /// already committed, so the retried frame must reuse it rather than
    /// count a second appearance.
    pub fn rollback(&self, observation: &Observation) -> bool {
        let mut inner = self.inner.lock();
        let Some(current) = inner.records.get_mut(&observation.fingerprint) else {
            tracing::debug!("stability: rollback skipped, record already evicted");
            return false;
        };
        if current.revision != observation.revision {
            tracing::debug!("stability: rollback skipped, record changed since observation");
            return false;
        }

        let bound = current.visitor;
        match (&observation.prior, bound) {
            (Some(prior), _) => {
                let visitor = prior.visitor.or(bound);
                *current = prior.clone();
                current.visitor = visitor;
            }
            (None, Some(_)) => {
                // Keep an empty record so the binding survives the undo.
                current.observation_count = 0;
                current.best = None;
                current.confirmed = None;
            }
            (None, None) => {
                inner.records.remove(&observation.fingerprint);
            }
        }
        true
    }

    /// Evict expired records without observing anything.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        self.inner.lock().evict_expired(now, self.ttl)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
