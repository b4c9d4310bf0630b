//! Messages from worker tasks to the engine task.

use crate::error::{SyncError, SyncResult};
use crate::remote::{ConfigStatus, PushStream};
use crew_core::stream_protocol::StreamEnvelope;
use crew_core::Resource;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) enum EngineMsg {
    Gate {
        generation: u64,
        status: ConfigStatus,
        error: Option<SyncError>,
    },
    Report(Report),
    RefreshSnapshot {
        refresh_id: u64,
        resource: Resource,
        epoch: u64,
        result: SyncResult<Vec<Value>>,
    },
    /// Snapshot fetched right after a stream opened; `open_seq` names that
    /// open within the epoch.
    OpenSnapshot {
        resource: Resource,
        epoch: u64,
        open_seq: u64,
        result: SyncResult<Vec<Value>>,
    },
}

/// A transport report, tagged with the epoch of the transport that sent it.
pub(crate) struct Report {
    pub resource: Resource,
    pub epoch: u64,
    pub kind: ReportKind,
}

pub(crate) enum ReportKind {
    Opened,
    Event(StreamEnvelope),
    Malformed(String),
    StreamFailed {
        error: SyncError,
        failures: u32,
        /// `None` means the connection gave up and asks for demotion.
        retry_in: Option<Duration>,
    },
    PollSnapshot(Vec<Value>),
    PollFailed(SyncError),
    Promoted(PushStream),
}

impl ReportKind {
    pub fn label(&self) -> &'static str {
        match self {
            ReportKind::Opened => "opened",
            ReportKind::Event(_) => "event",
            ReportKind::Malformed(_) => "malformed",
            ReportKind::StreamFailed { .. } => "stream_failed",
            ReportKind::PollSnapshot(_) => "poll_snapshot",
            ReportKind::PollFailed(_) => "poll_failed",
            ReportKind::Promoted(_) => "promoted",
        }
    }
}

/// Sending side handed to a transport task.
#[derive(Clone)]
pub(crate) struct Reporter {
    tx: mpsc::Sender<EngineMsg>,
    resource: Resource,
    epoch: u64,
}

impl Reporter {
    pub fn new(tx: mpsc::Sender<EngineMsg>, resource: Resource, epoch: u64) -> Self {
        Self {
            tx,
            resource,
            epoch,
        }
    }

    pub fn resource(&self) -> Resource {
        self.resource
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns false once the engine is gone.
    pub async fn send(&self, kind: ReportKind) -> bool {
        self.tx
            .send(EngineMsg::Report(Report {
                resource: self.resource,
                epoch: self.epoch,
                kind,
            }))
            .await
            .is_ok()
    }
}

/// Owns a spawned task and aborts it when dropped, so replacing or dropping
/// a transport always releases it and cancels any pending sleep.
#[derive(Debug)]
pub(crate) struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self(handle)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}
