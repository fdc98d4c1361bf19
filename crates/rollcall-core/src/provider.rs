//! Face detection/embedding provider seam.

use crate::service::EngineError;
use crate::types::Detection;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("detection provider timed out after {0:?}")]
    Timeout(Duration),
    #[error("detection provider failed: {0}")]
    Failed(String),
    #[error("detection provider returned malformed output: {0}")]
    Malformed(String),
}

/// Opaque model that turns an encoded frame into face detections.
pub trait DetectionProvider: Send + Sync {
    fn detect(
        &self,
        frame: &[u8],
    ) -> impl Future<Output = Result<Vec<Detection>, ProviderError>> + Send;
}

/// Run `provider` on `frame`, bounded by `timeout`.
///
/// Dropping the provider future on timeout must release whatever it holds
/// (the extractor process is killed on drop).
pub async fn detect_with_timeout<P: DetectionProvider>(
    provider: &P,
    frame: &[u8],
    timeout: Duration,
) -> Result<Vec<Detection>, EngineError> {
    if frame.is_empty() {
        return Err(EngineError::Input("empty frame".into()));
    }

    let detections = tokio::time::timeout(timeout, provider.detect(frame))
        .await
        .map_err(|_| ProviderError::Timeout(timeout))??;

    if let Some((index, _)) = detections
        .iter()
        .enumerate()
        .find(|(_, d)| !d.vector.is_usable())
    {
        return Err(ProviderError::Malformed(format!(
            "detection {index} has an empty or non-finite vector"
        ))
        .into());
    }

    tracing::debug!(faces = detections.len(), frame_bytes = frame.len(), "provider: detections");
    Ok(detections)
}
