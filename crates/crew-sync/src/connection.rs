//! Push subscription for one resource, with its own reconnect loop.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::remote::{PushStream, RemoteService};
use crate::report::{ReportKind, Reporter, TaskGuard};
use crew_core::stream_protocol::{NdjsonFrameDecoder, StreamEnvelope};
use crew_core::Resource;
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Live push subscription. Dropping it closes the transport.
#[derive(Debug)]
pub(crate) struct StreamConnection {
    epoch: u64,
    _task: TaskGuard,
}

impl StreamConnection {
    /// Start the subscription. `handed_over` is a stream that is already
    /// open, e.g. from a successful promotion probe.
    pub fn open<R: RemoteService>(
        remote: Arc<R>,
        config: Arc<SyncConfig>,
        reporter: Reporter,
        cursor: Option<String>,
        handed_over: Option<PushStream>,
    ) -> Self {
        let epoch = reporter.epoch();
        let task = tokio::spawn(run_stream(remote, config, reporter, cursor, handed_over));
        Self {
            epoch,
            _task: TaskGuard::new(task),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

enum PumpEnd {
    Failed(SyncError),
    EngineGone,
}

async fn run_stream<R: RemoteService>(
    remote: Arc<R>,
    config: Arc<SyncConfig>,
    reporter: Reporter,
    mut cursor: Option<String>,
    mut handed_over: Option<PushStream>,
) {
    let resource = reporter.resource();
    let mut failures: u32 = 0;

    loop {
        let opened = match handed_over.take() {
            Some(stream) => Ok(stream),
            None => connect(remote.as_ref(), &config, resource, cursor.clone()).await,
        };

        let error = match opened {
            Ok(stream) => {
                failures = 0;
                info!(resource = %resource, resumed = cursor.is_some(), "stream_open");
                if !reporter.send(ReportKind::Opened).await {
                    return;
                }
                match pump(stream, &reporter, &mut cursor, config.max_frame_bytes).await {
                    PumpEnd::Failed(err) => err,
                    PumpEnd::EngineGone => return,
                }
            }
            Err(err) => err,
        };

        failures = failures.saturating_add(1);
        if failures >= config.failure_threshold {
            warn!(resource = %resource, failures, "stream_demote: {error}");
            let _ = reporter
                .send(ReportKind::StreamFailed {
                    error,
                    failures,
                    retry_in: None,
                })
                .await;
            return;
        }

        let delay = config.backoff.delay_for(failures);
        warn!(
            resource = %resource,
            failures,
            retry_ms = delay.as_millis() as u64,
            "stream_connect_error: {error}"
        );
        let delivered = reporter
            .send(ReportKind::StreamFailed {
                error,
                failures,
                retry_in: Some(delay),
            })
            .await;
        if !delivered {
            return;
        }
        tokio::time::sleep(delay).await;
    }
}

pub(crate) async fn connect<R: RemoteService>(
    remote: &R,
    config: &SyncConfig,
    resource: Resource,
    cursor: Option<String>,
) -> Result<PushStream, SyncError> {
    match tokio::time::timeout(config.connect_timeout, remote.open_stream(resource, cursor)).await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(SyncError::Transport(reason))) => Err(SyncError::Transport(reason)),
        Ok(Err(other)) => Err(SyncError::Transport(other.to_string())),
        Err(_) => Err(SyncError::Transport(format!(
            "connect timed out after {}ms",
            config.connect_timeout.as_millis()
        ))),
    }
}

async fn pump(
    mut stream: PushStream,
    reporter: &Reporter,
    cursor: &mut Option<String>,
    max_frame_bytes: usize,
) -> PumpEnd {
    let resource = reporter.resource();
    let mut decoder = NdjsonFrameDecoder::<StreamEnvelope>::new(max_frame_bytes);

    while let Some(item) = stream.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(SyncError::MalformedEvent(reason)) => {
                warn!(resource = %resource, "stream_decode_error: {reason}");
                if !reporter.send(ReportKind::Malformed(reason)).await {
                    return PumpEnd::EngineGone;
                }
                continue;
            }
            Err(err) => return PumpEnd::Failed(err),
        };

        let report = decoder.decode_message(chunk.as_bytes());
        for err in report.errors {
            warn!(resource = %resource, "stream_decode_error: {err}");
            if !reporter.send(ReportKind::Malformed(err.to_string())).await {
                return PumpEnd::EngineGone;
            }
        }
        for envelope in report.frames {
            if envelope.resource != resource {
                warn!(
                    resource = %resource,
                    "stream_foreign_event: got {} event",
                    envelope.resource
                );
                continue;
            }
            if !envelope.version.is_supported() {
                debug!(resource = %resource, version = envelope.version.0, "stream_version_skip");
                continue;
            }
            if let Some(event_id) = &envelope.event_id {
                *cursor = Some(event_id.clone());
            }
            if !reporter.send(ReportKind::Event(envelope)).await {
                return PumpEnd::EngineGone;
            }
        }
    }

    PumpEnd::Failed(SyncError::Transport("stream closed".to_string()))
}
