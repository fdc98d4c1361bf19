use crate::extractor::ExtractorProvider;
use rollcall_core::attendance::AttendanceQuery;
use rollcall_core::provider::{detect_with_timeout, DetectionProvider, ProviderError};
use rollcall_core::report::{EngineStatus, FaceReport, MarkResponse};
use rollcall_core::types::{AttendanceRecord, IdentityRef};
use rollcall_core::{AttendanceService, EngineError, MarkOutcome, StoreError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "io.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/io/rollcall/Rollcall1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: io.rollcall.Rollcall1
/// Object path: /io/rollcall/Rollcall1
pub struct RollcallService {
    engine: Arc<AttendanceService>,
    provider: ExtractorProvider,
    provider_timeout: Duration,
}

impl RollcallService {
    pub fn new(
        engine: Arc<AttendanceService>,
        provider: ExtractorProvider,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            provider,
            provider_timeout,
        }
    }
}

#[interface(name = "io.rollcall.Rollcall1")]
impl RollcallService {
    /// Resolve every face in an encoded frame. Returns a JSON array of face reports.
    async fn recognize(&self, frame: Vec<u8>) -> fdo::Result<String> {
        tracing::debug!(frame_bytes = frame.len(), "recognize requested");
        let reports = recognize_frame(
            self.engine.clone(),
            &self.provider,
            &frame,
            self.provider_timeout,
        )
        .await
        .map_err(to_fdo)?;
        to_json(&reports)
    }

    /// Mark attendance for the first face in an encoded frame.
    async fn mark_attendance(&self, frame: Vec<u8>) -> fdo::Result<String> {
        tracing::debug!(frame_bytes = frame.len(), "mark_attendance requested");
        let outcome = mark_frame(
            self.engine.clone(),
            &self.provider,
            &frame,
            self.provider_timeout,
        )
        .await
        .map_err(to_fdo)?;
        to_json(&MarkResponse::from(&outcome))
    }

    /// Mark attendance for a known identity (`kind` is "registered" or "visitor").
    async fn mark_identity(&self, kind: &str, id: &str) -> fdo::Result<String> {
        tracing::info!(kind, id, "mark_identity requested");
        let identity =
            IdentityRef::parse(kind, id).map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?;
        let outcome = mark_identity(self.engine.clone(), identity)
            .await
            .map_err(to_fdo)?;
        to_json(&MarkResponse::from(&outcome))
    }

    /// List attendance records. `query_json` may be empty for the default listing.
    async fn list_attendance(&self, query_json: &str) -> fdo::Result<String> {
        let records = list_attendance(self.engine.clone(), query_json)
            .await
            .map_err(to_fdo)?;
        to_json(&records)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let engine = status(self.engine.clone()).await.map_err(to_fdo)?;
        to_json(&StatusReply {
            version: env!("CARGO_PKG_VERSION"),
            extractor: self.provider.program(),
            engine,
        })
    }
}

#[derive(Serialize)]
struct StatusReply<'a> {
    version: &'static str,
    extractor: &'a str,
    #[serde(flatten)]
    engine: EngineStatus,
}

/// Run blocking engine work off the async executor.
async fn blocking<T, F>(engine: Arc<AttendanceService>, f: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce(&AttendanceService) -> Result<T, EngineError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(|e| EngineError::Store(StoreError::Backend(format!("worker task: {e}"))))?
}

pub async fn recognize_frame<P: DetectionProvider>(
    engine: Arc<AttendanceService>,
    provider: &P,
    frame: &[u8],
    timeout: Duration,
) -> Result<Vec<FaceReport>, EngineError> {
    let detections = detect_with_timeout(provider, frame, timeout).await?;
    blocking(engine, move |e| e.recognize(&detections)).await
}

pub async fn mark_frame<P: DetectionProvider>(
    engine: Arc<AttendanceService>,
    provider: &P,
    frame: &[u8],
    timeout: Duration,
) -> Result<MarkOutcome, EngineError> {
    let detections = detect_with_timeout(provider, frame, timeout).await?;
    let outcome = blocking(engine, move |e| e.mark_frame(&detections)).await?;
    tracing::info!(status = outcome.status(), "mark_attendance complete");
    Ok(outcome)
}

pub async fn mark_identity(
    engine: Arc<AttendanceService>,
    identity: IdentityRef,
) -> Result<MarkOutcome, EngineError> {
    blocking(engine, move |e| e.mark_identity(identity)).await
}

pub async fn list_attendance(
    engine: Arc<AttendanceService>,
    query_json: &str,
) -> Result<Vec<AttendanceRecord>, EngineError> {
    let query: AttendanceQuery = if query_json.trim().is_empty() {
        AttendanceQuery::default()
    } else {
        serde_json::from_str(query_json)
            .map_err(|e| EngineError::Input(format!("invalid attendance query: {e}")))?
    };
    blocking(engine, move |e| e.list_attendance(&query)).await
}

pub async fn status(engine: Arc<AttendanceService>) -> Result<EngineStatus, EngineError> {
    blocking(engine, |e| e.status()).await
}

fn to_fdo(err: EngineError) -> fdo::Error {
    match &err {
        EngineError::Input(_) | EngineError::UnknownIdentity(_) => {
            fdo::Error::InvalidArgs(err.to_string())
        }
        EngineError::Provider(ProviderError::Timeout(_)) => {
            tracing::warn!(error = %err, "request timed out");
            fdo::Error::TimedOut(err.to_string())
        }
        EngineError::Provider(_) | EngineError::Store(_) => {
            tracing::error!(error = %err, "request failed");
            fdo::Error::Failed(err.to_string())
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}
