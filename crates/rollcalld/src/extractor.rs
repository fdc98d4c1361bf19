use rollcall_core::provider::{DetectionProvider, ProviderError};
use rollcall_core::types::Detection;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const STDERR_TAIL: usize = 512;

/// Detection provider backed by an external extractor process.
///
/// Each call spawns the command, writes the encoded frame to its stdin and
/// parses a JSON array of `{bbox, vector}` objects from its stdout. The child
/// is killed if the call is dropped (timeout or client disconnect).
#[derive(Debug, Clone)]
pub struct ExtractorProvider {
    program: String,
    args: Vec<String>,
}

impl ExtractorProvider {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line. `None` if it is blank.
    pub fn from_command_line(cmd: &str) -> Option<Self> {
        let mut parts = cmd.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl DetectionProvider for ExtractorProvider {
    async fn detect(&self, frame: &[u8]) -> Result<Vec<Detection>, ProviderError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::Failed(format!("cannot start {}: {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::Failed("extractor stdin unavailable".into()))?;

        let feed = async move {
            let written = stdin.write_all(frame).await;
            drop(stdin);
            written
        };
        let (written, output) = tokio::join!(feed, child.wait_with_output());
        let output =
            output.map_err(|e| ProviderError::Failed(format!("extractor did not finish: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let start = (stderr.len().saturating_sub(STDERR_TAIL)..stderr.len())
                .find(|&i| stderr.is_char_boundary(i))
                .unwrap_or(stderr.len());
            let tail = &stderr[start..];
            return Err(ProviderError::Failed(format!(
                "extractor exited with {}: {tail}",
                output.status
            )));
        }
        // A child that exits successfully without reading the whole frame is
        // fine; only its output matters.
        if let Err(e) = written {
            tracing::debug!(error = %e, "extractor closed stdin early");
        }

        parse_detections(&output.stdout)
    }
}

/// Parse the extractor's stdout.
pub fn parse_detections(stdout: &[u8]) -> Result<Vec<Detection>, ProviderError> {
    serde_json::from_slice(stdout).map_err(|e| ProviderError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::provider::detect_with_timeout;
    use rollcall_core::EngineError;
    use std::time::Duration;

    fn shell(script: &str) -> ExtractorProvider {
        ExtractorProvider::new("sh", vec!["-c".into(), script.into()])
    }

    #[test]
    fn test_parse_detections() {
        let out = parse_detections(br#"[{"bbox":[4,5,60,70],"vector":[0.1,0.2,0.3]}]"#).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bbox.0, [4, 5, 60, 70]);
        assert_eq!(out[0].vector.dim(), 3);

        assert!(parse_detections(b"[]").unwrap().is_empty());
        assert!(matches!(
            parse_detections(b"no faces"),
            Err(ProviderError::Malformed(_))
        ));
        assert!(matches!(
            parse_detections(br#"[{"bbox":[1,2,3],"vector":[]}]"#),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[test]
    fn test_from_command_line() {
        let p = ExtractorProvider::from_command_line("  python3 extract.py --gpu ").unwrap();
        assert_eq!(p.program(), "python3");
        assert_eq!(p.args, vec!["extract.py", "--gpu"]);
        assert!(ExtractorProvider::from_command_line("   ").is_none());
    }

    #[tokio::test]
    async fn test_runs_extractor_process() {
        let provider = shell(
            r#"cat >/dev/null; echo '[{"bbox":[0,0,8,8],"vector":[0.5,0.5]}]'"#,
        );
        let out = provider.detect(b"frame-bytes").await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].vector.values, vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let provider = shell("echo 'model missing' >&2; exit 3");
        let err = provider.detect(b"frame").await.unwrap_err();
        match err {
            ProviderError::Failed(msg) => assert!(msg.contains("model missing")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_failure() {
        let provider = ExtractorProvider::new("/nonexistent/rollcall-extract", vec![]);
        assert!(matches!(
            provider.detect(b"frame").await,
            Err(ProviderError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_extractor_times_out() {
        let provider = shell("sleep 10");
        let err = detect_with_timeout(&provider, b"frame", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Provider(ProviderError::Timeout(_))));
    }
}
