//! Image Transfer Orchestrator - pull, retag and push one image into the mirror.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info, trace};

use super::{ContainerEngine, EngineError, ProgressStream, RegistryAuth};
use crate::context::RequestContext;
use crate::error::{Error, Result, TransferError, TransferStage};
use crate::reference::ImageReference;
use crate::registry::Credential;

/// Terminal error line of an engine progress stream.
#[derive(Debug, Default, Deserialize)]
struct ErrorLine {
    #[serde(default)]
    error: String,
    #[serde(default, rename = "errorDetail")]
    error_detail: Option<ErrorDetail>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

/// What was read from one drained progress stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// Bytes of log text read, newlines included.
    pub bytes: u64,
    pub lines: u64,
    /// Last non-empty line.
    pub last_line: Option<String>,
}

impl StreamSummary {
    fn record(&mut self, line: String) {
        self.bytes += line.len() as u64 + 1;
        self.lines += 1;
        if !line.trim().is_empty() {
            self.last_line = Some(line);
        }
    }

    /// Engine-reported failure carried by the last line, if any.
    ///
    /// Only a JSON object with a non-empty `error` field counts; any other
    /// last line (progress, status text, garbage) means success.
    pub fn error_message(&self) -> Option<String> {
        let line = self.last_line.as_deref()?;
        let parsed: ErrorLine = serde_json::from_str(line).ok()?;
        if parsed.error.is_empty() {
            return None;
        }
        let detail = parsed
            .error_detail
            .map(|d| d.message)
            .filter(|m| !m.is_empty());
        Some(detail.unwrap_or(parsed.error))
    }
}

/// Read `stream` to its end, keeping only the last line.
///
/// A broken stream stops the drain; what was read so far is still returned.
pub async fn drain(mut stream: ProgressStream) -> (StreamSummary, Option<EngineError>) {
    let mut summary = StreamSummary::default();
    while let Some(item) = stream.next().await {
        match item {
            Ok(line) => {
                trace!(line = %line, "Engine progress");
                summary.record(line);
            }
            Err(e) => return (summary, Some(e)),
        }
    }
    (summary, None)
}

/// Result of a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub destination: ImageReference,
    /// Bytes of progress-log text read from the pull and push streams.
    /// This is not the image size.
    pub log_bytes: u64,
    /// Last line of the push stream.
    pub last_log_line: Option<String>,
}

pub struct TransferOrchestrator {
    engine: Arc<dyn ContainerEngine>,
}

impl TransferOrchestrator {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Copy `source` to `destination` through the local engine.
    ///
    /// Single attempt, no retries. Each stage fails with its own stage tag,
    /// and an expired or cancelled `ctx` drops the in-flight engine call.
    pub async fn transfer(
        &self,
        ctx: &RequestContext,
        source: &ImageReference,
        destination: &ImageReference,
        credential: &Credential,
    ) -> Result<TransferOutcome> {
        info!(source = %source, destination = %destination, "Pulling image");
        let pulled = self
            .streamed(ctx, TransferStage::Pull, source, self.engine.pull(source))
            .await?;
        debug!(source = %source, lines = pulled.lines, "Pull finished");

        let tag = async {
            self.engine
                .tag(source, destination)
                .await
                .map_err(|e| stage_error(TransferStage::Tag, destination, &e, None))
        };
        ctx.run(tag).await.map_err(|reason| Error::Cancelled {
            stage: TransferStage::Tag.into(),
            reason,
        })??;

        info!(destination = %destination, "Pushing image");
        let auth = RegistryAuth::new(credential, destination.registry());
        let pushed = self
            .streamed(
                ctx,
                TransferStage::Push,
                destination,
                self.engine.push(destination, &auth),
            )
            .await?;

        info!(
            destination = %destination,
            log_bytes = pulled.bytes + pushed.bytes,
            "Image transferred"
        );
        Ok(TransferOutcome {
            destination: destination.clone(),
            log_bytes: pulled.bytes + pushed.bytes,
            last_log_line: pushed.last_line,
        })
    }

    /// Start a streaming stage and drain it, honouring the last-line error convention.
    async fn streamed<F>(
        &self,
        ctx: &RequestContext,
        stage: TransferStage,
        reference: &ImageReference,
        start: F,
    ) -> Result<StreamSummary>
    where
        F: Future<Output = std::result::Result<ProgressStream, EngineError>>,
    {
        let work = async {
            let stream = start
                .await
                .map_err(|e| stage_error(stage, reference, &e, None))?;

            let (summary, broken) = drain(stream).await;
            if let Some(e) = broken {
                return Err(stage_error(stage, reference, &e, summary.last_line.clone()));
            }
            if let Some(message) = summary.error_message() {
                return Err(TransferError {
                    stage,
                    reference: reference.to_string(),
                    message,
                    last_log_line: summary.last_line.clone(),
                });
            }
            Ok::<_, TransferError>(summary)
        };

        let summary = ctx.run(work).await.map_err(|reason| Error::Cancelled {
            stage: stage.into(),
            reason,
        })??;
        Ok(summary)
    }
}

fn stage_error(
    stage: TransferStage,
    reference: &ImageReference,
    err: &EngineError,
    last_log_line: Option<String>,
) -> TransferError {
    TransferError {
        stage,
        reference: reference.to_string(),
        message: err.to_string(),
        last_log_line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CancelReason, Stage};
    use crate::test_util::FakeEngine;
    use chrono::{Duration, Utc};

    const DENIED: &str = r#"{"error":"denied","errorDetail":{"message":"access denied"}}"#;

    fn credential() -> Credential {
        Credential {
            username: "AWS".to_string(),
            password: "secret".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    fn refs() -> (ImageReference, ImageReference) {
        (
            ImageReference::parse("nginx:1.25").unwrap(),
            ImageReference::parse("cache.example.com/nginx:1.25").unwrap(),
        )
    }

    fn summary_of(last: &str) -> StreamSummary {
        StreamSummary {
            bytes: 0,
            lines: 1,
            last_line: Some(last.to_string()),
        }
    }

    #[test]
    fn test_error_message_prefers_detail() {
        assert_eq!(summary_of(DENIED).error_message().as_deref(), Some("access denied"));
        assert_eq!(
            summary_of(r#"{"error":"manifest unknown"}"#).error_message().as_deref(),
            Some("manifest unknown")
        );
    }

    #[test]
    fn test_non_error_last_lines_are_success() {
        assert!(summary_of(r#"{"status":"1.25: digest: sha256:abc size: 1570"}"#)
            .error_message()
            .is_none());
        assert!(summary_of(r#"{"error":""}"#).error_message().is_none());
        assert!(summary_of("not json at all").error_message().is_none());
        assert!(StreamSummary::default().error_message().is_none());
    }

    #[tokio::test]
    async fn test_drain_keeps_last_non_empty_line() {
        let stream = futures::stream::iter(vec![
            Ok(r#"{"status":"Pulling"}"#.to_string()),
            Ok(DENIED.to_string()),
            Ok(String::new()),
        ])
        .boxed();

        let (summary, broken) = drain(stream).await;
        assert!(broken.is_none());
        assert_eq!(summary.lines, 3);
        assert_eq!(summary.last_line.as_deref(), Some(DENIED));
    }

    #[tokio::test]
    async fn test_successful_transfer() {
        let engine = Arc::new(FakeEngine::new());
        let orchestrator = TransferOrchestrator::new(engine.clone());
        let (source, destination) = refs();

        let outcome = orchestrator
            .transfer(&RequestContext::background(), &source, &destination, &credential())
            .await
            .unwrap();

        assert_eq!(outcome.destination, destination);
        assert!(outcome.log_bytes > 0);
        assert!(outcome.last_log_line.is_some());
        assert_eq!(engine.pulls(), vec![source.to_string()]);
        assert_eq!(
            engine.tags(),
            vec![(source.to_string(), destination.to_string())]
        );

        let pushes = engine.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, destination.to_string());
        assert_eq!(pushes[0].1.username, "AWS");
        assert_eq!(pushes[0].1.server_address, "cache.example.com");
    }

    #[tokio::test]
    async fn test_streamed_push_error_is_failure() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_push_lines(&[r#"{"status":"Preparing"}"#, DENIED]);
        let orchestrator = TransferOrchestrator::new(engine.clone());
        let (source, destination) = refs();

        let err = orchestrator
            .transfer(&RequestContext::background(), &source, &destination, &credential())
            .await
            .unwrap_err();

        match err {
            Error::Transfer(e) => {
                assert_eq!(e.stage, TransferStage::Push);
                assert_eq!(e.message, "access denied");
                assert_eq!(e.last_log_line.as_deref(), Some(DENIED));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pull_failure_stops_before_push() {
        let engine = Arc::new(FakeEngine::new());
        engine.fail_pull(EngineError::Api {
            status: 404,
            message: "manifest unknown".to_string(),
        });
        let orchestrator = TransferOrchestrator::new(engine.clone());
        let (source, destination) = refs();

        let err = orchestrator
            .transfer(&RequestContext::background(), &source, &destination, &credential())
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::Transfer(TransferStage::Pull));
        assert!(engine.tags().is_empty());
        assert!(engine.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_streamed_pull_error_is_pull_stage() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_pull_lines(&[r#"{"error":"pull access denied for nginx"}"#]);
        let orchestrator = TransferOrchestrator::new(engine.clone());
        let (source, destination) = refs();

        let err = orchestrator
            .transfer(&RequestContext::background(), &source, &destination, &credential())
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::Transfer(TransferStage::Pull));
        assert!(engine.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_tag_failure_is_tag_stage() {
        let engine = Arc::new(FakeEngine::new());
        engine.fail_tag(EngineError::Api {
            status: 500,
            message: "no such image".to_string(),
        });
        let orchestrator = TransferOrchestrator::new(engine.clone());
        let (source, destination) = refs();

        let err = orchestrator
            .transfer(&RequestContext::background(), &source, &destination, &credential())
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::Transfer(TransferStage::Tag));
        assert!(engine.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_broken_push_stream_is_push_stage() {
        let engine = Arc::new(FakeEngine::new());
        engine.fail_push(EngineError::Stream("connection reset".to_string()));
        let orchestrator = TransferOrchestrator::new(engine.clone());
        let (source, destination) = refs();

        let err = orchestrator
            .transfer(&RequestContext::background(), &source, &destination, &credential())
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::Transfer(TransferStage::Push));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_push_is_cancelled_by_deadline() {
        let engine = Arc::new(FakeEngine::new());
        engine.hang_push();
        let orchestrator = TransferOrchestrator::new(engine.clone());
        let (source, destination) = refs();

        let root = tokio_util::sync::CancellationToken::new();
        let ctx = RequestContext::with_timeout(&root, std::time::Duration::from_secs(25));
        let err = orchestrator
            .transfer(&ctx, &source, &destination, &credential())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Cancelled {
                stage: Stage::Transfer(TransferStage::Push),
                reason: CancelReason::DeadlineExceeded
            }
        ));
    }
}
