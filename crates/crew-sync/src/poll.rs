//! Periodic snapshot fetch for a resource whose push stream is down.

use crate::config::SyncConfig;
use crate::connection::connect;
use crate::error::SyncError;
use crate::remote::RemoteService;
use crate::report::{ReportKind, Reporter, TaskGuard};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

#[derive(Debug)]
pub(crate) struct PollFallback {
    _task: TaskGuard,
    probe: Arc<Notify>,
}

impl PollFallback {
    /// Start polling immediately. With `allow_promotion` the task also
    /// probes the push endpoint every `promote_every` cycles and hands an
    /// opened stream back to the engine.
    pub fn start<R: RemoteService>(
        remote: Arc<R>,
        config: Arc<SyncConfig>,
        reporter: Reporter,
        cursor: Option<String>,
        allow_promotion: bool,
    ) -> Self {
        let probe = Arc::new(Notify::new());
        let task = tokio::spawn(run_poll(
            remote,
            config,
            reporter,
            cursor,
            allow_promotion,
            Arc::clone(&probe),
        ));
        Self {
            _task: TaskGuard::new(task),
            probe,
        }
    }

    /// Ask for a promotion probe now instead of at the next due cycle.
    pub fn request_probe(&self) {
        self.probe.notify_one();
    }
}

async fn run_poll<R: RemoteService>(
    remote: Arc<R>,
    config: Arc<SyncConfig>,
    reporter: Reporter,
    cursor: Option<String>,
    allow_promotion: bool,
    probe: Arc<Notify>,
) {
    let resource = reporter.resource();
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycles: u64 = 0;

    loop {
        let probe_requested = tokio::select! {
            _ = ticker.tick() => false,
            _ = probe.notified() => true,
        };

        if !probe_requested {
            cycles += 1;
            let kind = match tokio::time::timeout(
                config.request_timeout,
                remote.fetch_snapshot(resource),
            )
            .await
            {
                Ok(Ok(rows)) => ReportKind::PollSnapshot(rows),
                Ok(Err(SyncError::Poll(reason))) => ReportKind::PollFailed(SyncError::Poll(reason)),
                Ok(Err(other)) => ReportKind::PollFailed(SyncError::Poll(other.to_string())),
                Err(_) => ReportKind::PollFailed(SyncError::Poll(format!(
                    "snapshot timed out after {}ms",
                    config.request_timeout.as_millis()
                ))),
            };
            if !reporter.send(kind).await {
                return;
            }
        }

        if !allow_promotion {
            continue;
        }
        let due = config.promote_every > 0 && cycles % u64::from(config.promote_every) == 0;
        if !(probe_requested || due) {
            continue;
        }
        match connect(remote.as_ref(), &config, resource, cursor.clone()).await {
            Ok(stream) => {
                info!(resource = %resource, cycles, "stream_promote");
                let _ = reporter.send(ReportKind::Promoted(stream)).await;
                return;
            }
            Err(err) => debug!(resource = %resource, "stream_probe_failed: {err}"),
        }
    }
}
