//! Request-level orchestration: matcher, confirmation cache, visitor
//! registry and attendance gate behind one service.
//!
//! Every request takes its registered snapshot before touching shared state.
//! When a store call fails partway through, the confirmation cache is rolled
//! back to where it was before the request and no attendance row is written.

use crate::attendance::{AttendanceGate, AttendanceQuery, ListError, MarkResult};
use crate::clock::Clock;
use crate::config::{ConfigError, EngineConfig};
use crate::matcher::{confidence, CosineMatcher, Match, Matcher};
use crate::provider::ProviderError;
use crate::report::{EngineStatus, FaceReport, MarkOutcome};
use crate::stability::{Decision, Fingerprint, Observation, StabilityTracker, VisitorBinding};
use crate::store::{AttendanceLedger, RegisteredStore, StoreError, VisitorStore};
use crate::types::{
    AttendanceRecord, Detection, IdentityKind, IdentityRef, RegisteredIdentity, VisitorIdentity,
};
use crate::visitor::VisitorRegistry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error("unknown identity {0}")]
    UnknownIdentity(IdentityRef),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ListError> for EngineError {
    fn from(err: ListError) -> Self {
        match err {
            ListError::Query(e) => EngineError::Input(e.to_string()),
            ListError::Store(e) => EngineError::Store(e),
        }
    }
}

/// The three stores the engine reads and writes.
#[derive(Clone)]
pub struct Stores {
    pub registered: Arc<dyn RegisteredStore>,
    pub visitors: Arc<dyn VisitorStore>,
    pub ledger: Arc<dyn AttendanceLedger>,
}

impl Stores {
    /// Use one backend for all three roles.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: RegisteredStore + VisitorStore + AttendanceLedger + 'static,
    {
        Self {
            registered: store.clone(),
            visitors: store.clone(),
            ledger: store,
        }
    }
}

/// What one face resolved to in this request.
#[derive(Debug, Clone, Copy)]
enum Resolved {
    Pending,
    Registered(Match<i64>),
    Visitor(VisitorBinding),
}

impl Resolved {
    fn identity(&self) -> Option<(IdentityRef, f32)> {
        match *self {
            Resolved::Pending => None,
            Resolved::Registered(m) => Some((IdentityRef::Registered(m.id), m.distance)),
            Resolved::Visitor(b) => Some((IdentityRef::Visitor(b.visitor_id), b.distance)),
        }
    }

    fn report(&self, detection: &Detection) -> FaceReport {
        let (kind, identity) = match self.identity() {
            None => (IdentityKind::Pending, None),
            Some((identity, distance)) => (identity.kind(), Some((identity, distance))),
        };
        FaceReport {
            recognized: matches!(self, Resolved::Registered(_)),
            identity_kind: kind,
            identity_id: identity.map(|(i, _)| i.id_string()),
            confidence: identity.map(|(_, d)| confidence(d)),
            bbox: detection.bbox,
        }
    }
}

pub struct AttendanceService<M = CosineMatcher> {
    config: EngineConfig,
    registered: Arc<dyn RegisteredStore>,
    matcher: M,
    tracker: StabilityTracker,
    visitors: VisitorRegistry<M>,
    gate: AttendanceGate,
    clock: Arc<dyn Clock>,
}

impl AttendanceService<CosineMatcher> {
    pub fn new(
        config: EngineConfig,
        stores: Stores,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        Self::with_matcher(config, stores, clock, CosineMatcher)
    }
}

impl<M: Matcher + Clone> AttendanceService<M> {
    pub fn with_matcher(
        config: EngineConfig,
        stores: Stores,
        clock: Arc<dyn Clock>,
        matcher: M,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        tracing::info!(
            match_threshold = config.match_threshold,
            visitor_threshold = config.visitor_threshold,
            confirmation_frames = config.confirmation_frames,
            mode = config.attendance_mode.as_str(),
            "attendance service configured"
        );
        Ok(Self {
            tracker: StabilityTracker::new(&config, clock.clone()),
            visitors: VisitorRegistry::new(
                stores.visitors,
                matcher.clone(),
                config.visitor_threshold,
            ),
            gate: AttendanceGate::new(&config, stores.ledger),
            registered: stores.registered,
            matcher,
            clock,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Resolve every detected face in a frame.
    pub fn recognize(&self, detections: &[Detection]) -> Result<Vec<FaceReport>, EngineError> {
        validate(detections)?;
        if detections.is_empty() {
            return Ok(Vec::new());
        }

        let snapshot = self.registered.snapshot()?;
        let now = self.clock.now();
        let mut observations: Vec<Observation> = Vec::with_capacity(detections.len());
        let mut seen: HashMap<Fingerprint, Resolved> = HashMap::new();
        let mut reports = Vec::with_capacity(detections.len());

        for detection in detections {
            let fingerprint = self.tracker.fingerprint(&detection.vector);
            // Duplicate detections in one frame count as one sighting.
            if let Some(resolved) = seen.get(&fingerprint) {
                reports.push(resolved.report(detection));
                continue;
            }
            match self.resolve_face(detection, fingerprint, &snapshot, now) {
                Ok((observation, resolved)) => {
                    reports.push(resolved.report(detection));
                    seen.insert(observation.fingerprint.clone(), resolved);
                    observations.push(observation);
                }
                Err(err) => {
                    for observation in observations.iter().rev() {
                        self.tracker.rollback(observation);
                    }
                    return Err(err);
                }
            }
        }

        tracing::debug!(faces = reports.len(), "recognize complete");
        Ok(reports)
    }

    /// Mark attendance for the first face in a frame.
    pub fn mark_frame(&self, detections: &[Detection]) -> Result<MarkOutcome, EngineError> {
        let Some(first) = detections.first() else {
            return Ok(MarkOutcome::NoFace);
        };
        validate(std::slice::from_ref(first))?;

        let snapshot = self.registered.snapshot()?;
        let now = self.clock.now();
        let fingerprint = self.tracker.fingerprint(&first.vector);
        let (observation, resolved) = self.resolve_face(first, fingerprint, &snapshot, now)?;

        let Some((identity, distance)) = resolved.identity() else {
            return Ok(MarkOutcome::Pending);
        };

        match self.gate.try_mark(identity, Some(distance), now) {
            Ok(result) => Ok(outcome(result)),
            Err(err) => {
                self.tracker.rollback(&observation);
                Err(err.into())
            }
        }
    }

    /// Mark attendance for an already-known identity, bypassing recognition.
    pub fn mark_identity(&self, identity: IdentityRef) -> Result<MarkOutcome, EngineError> {
        let known = match identity {
            IdentityRef::Registered(id) => self.registered.contains(id)?,
            IdentityRef::Visitor(id) => self.visitors.store().visitor(id)?.is_some(),
        };
        if !known {
            return Err(EngineError::UnknownIdentity(identity));
        }
        Ok(outcome(self.gate.try_mark(identity, None, self.clock.now())?))
    }

    pub fn list_attendance(
        &self,
        query: &AttendanceQuery,
    ) -> Result<Vec<AttendanceRecord>, EngineError> {
        Ok(self.gate.list(query, self.clock.now())?)
    }

    pub fn visitor(&self, visitor_id: Uuid) -> Result<Option<VisitorIdentity>, EngineError> {
        Ok(self.visitors.store().visitor(visitor_id)?)
    }

    pub fn status(&self) -> Result<EngineStatus, EngineError> {
        Ok(EngineStatus {
            registered: self.registered.snapshot()?.len(),
            visitors: self.visitors.store().visitor_count()?,
            cached_faces: self.tracker.len(),
            attendance_mode: self.gate.mode(),
        })
    }

    /// Evict idle faces from the confirmation cache.
    pub fn sweep(&self) -> usize {
        self.tracker.sweep()
    }

    fn resolve_face(
        &self,
        detection: &Detection,
        fingerprint: Fingerprint,
        snapshot: &[RegisteredIdentity],
        now: DateTime<Utc>,
    ) -> Result<(Observation, Resolved), EngineError> {
        let candidate = self.matcher.nearest(
            &detection.vector,
            snapshot.iter().map(|r| (r.identity_id, &r.vector)),
        );
        let observation = self.tracker.observe(fingerprint, candidate, now);

        let resolved = match observation.decision {
            Decision::Pending => Resolved::Pending,
            Decision::ConfirmedMatch(m) => Resolved::Registered(m),
            Decision::ConfirmedUnknown => match observation.visitor {
                Some(binding) => Resolved::Visitor(binding),
                None => match self.visitors.resolve(&detection.vector, now) {
                    Ok(resolution) => {
                        let binding = VisitorBinding {
                            visitor_id: resolution.visitor.visitor_id,
                            distance: resolution.distance,
                        };
                        self.tracker.bind_visitor(&observation, binding);
                        Resolved::Visitor(binding)
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "visitor resolution failed, rolling back");
                        self.tracker.rollback(&observation);
                        return Err(err.into());
                    }
                },
            },
        };
        Ok((observation, resolved))
    }
}

fn validate(detections: &[Detection]) -> Result<(), EngineError> {
    for (index, detection) in detections.iter().enumerate() {
        if !detection.vector.is_usable() {
            return Err(EngineError::Input(format!(
                "detection {index} has an empty or non-finite vector"
            )));
        }
    }
    Ok(())
}

fn outcome(result: MarkResult) -> MarkOutcome {
    match result {
        MarkResult::Marked(record) => MarkOutcome::Marked(record),
        MarkResult::Duplicate => MarkOutcome::Duplicate,
        MarkResult::NoOp => MarkOutcome::Pending,
    }
}
