//! Consumer interface: a read-only view of the mirror plus `refresh()`.

use crate::coordinator::{aggregate_mode, ConnectionState, ResourcePhase, SyncMode};
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use crew_core::{
    AgentRecord, AgentStatus, ChannelRecord, MessageRecord, Resource, StatusThresholds, SyncRecord,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

pub(crate) enum Command {
    Refresh(oneshot::Sender<SyncResult<()>>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceView {
    pub resource: Resource,
    #[serde(flatten)]
    pub state: ConnectionState,
    pub last_error: Option<SyncError>,
}

impl ResourceView {
    pub(crate) fn new(resource: Resource, failure_threshold: u32, backoff_floor: Duration) -> Self {
        Self {
            resource,
            state: ConnectionState::new(failure_threshold, backoff_floor),
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub active: usize,
    pub idle: usize,
    pub offline: usize,
}

/// Immutable snapshot of everything the engine mirrors. Collections are
/// shared; a new `Arc` is handed out only when a collection changed.
#[derive(Debug, Clone)]
pub struct SyncView {
    pub configured: bool,
    pub config_loading: bool,
    /// Display-only host reported by the configuration check.
    pub api_host: Option<String>,
    pub config_error: Option<SyncError>,
    pub refreshing: bool,
    pub agents: Arc<Vec<AgentRecord>>,
    pub channels: Arc<Vec<ChannelRecord>>,
    pub messages: Arc<Vec<MessageRecord>>,
    pub resources: [ResourceView; 3],
}

impl SyncView {
    pub(crate) fn initial(failure_threshold: u32, backoff_floor: Duration) -> Self {
        Self {
            configured: false,
            config_loading: true,
            api_host: None,
            config_error: None,
            refreshing: false,
            agents: Arc::default(),
            channels: Arc::default(),
            messages: Arc::default(),
            resources: Resource::ALL
                .map(|resource| ResourceView::new(resource, failure_threshold, backoff_floor)),
        }
    }

    /// Aggregate mode, derived on every call.
    pub fn mode(&self) -> SyncMode {
        aggregate_mode(
            self.configured,
            self.resources
                .iter()
                .map(|view| (&view.state, view.last_error.is_some())),
        )
    }

    pub fn agents(&self) -> &[AgentRecord] {
        &self.agents
    }

    pub fn channels(&self) -> &[ChannelRecord] {
        &self.channels
    }

    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }

    pub fn resource(&self, resource: Resource) -> &ResourceView {
        &self.resources[resource.index()]
    }

    pub fn connected(&self, resource: Resource) -> bool {
        self.resource(resource).state.connected()
    }

    pub fn phase(&self, resource: Resource) -> ResourcePhase {
        self.resource(resource).state.phase()
    }

    pub fn last_error(&self, resource: Resource) -> Option<&SyncError> {
        self.resource(resource).last_error.as_ref()
    }

    pub fn len(&self, resource: Resource) -> usize {
        match resource {
            Resource::Agents => self.agents.len(),
            Resource::Channels => self.channels.len(),
            Resource::Messages => self.messages.len(),
        }
    }

    pub fn has_data(&self) -> bool {
        Resource::ALL.iter().any(|resource| self.len(*resource) > 0)
    }

    /// Every resource has applied a snapshot or event at least once. An
    /// open stream alone does not count.
    pub fn fully_synced(&self) -> bool {
        self.resources.iter().all(|view| view.state.ever_synced)
    }

    pub fn channel(&self, id: &str) -> Option<&ChannelRecord> {
        self.channels.iter().find(|channel| channel.id == id)
    }

    /// Messages of one channel by timestamp. Ties keep arrival order;
    /// messages without a timestamp follow, also in arrival order.
    pub fn messages_in_channel(&self, channel_id: &str) -> Vec<&MessageRecord> {
        let mut messages: Vec<&MessageRecord> = self
            .messages
            .iter()
            .filter(|message| message.channel_id == channel_id)
            .collect();
        messages.sort_by_key(|message| (message.timestamp.is_none(), message.timestamp));
        messages
    }

    pub fn agents_sorted(&self) -> Vec<&AgentRecord> {
        let mut agents: Vec<&AgentRecord> = self.agents.iter().collect();
        agents.sort_by(|left, right| left.record_id().cmp(&right.record_id()));
        agents
    }

    pub fn agent_status_counts(
        &self,
        now: DateTime<Utc>,
        thresholds: &StatusThresholds,
    ) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for agent in self.agents.iter() {
            match agent.status_at(now, thresholds) {
                AgentStatus::Active => counts.active += 1,
                AgentStatus::Idle => counts.idle += 1,
                AgentStatus::Offline => counts.offline += 1,
            }
        }
        counts
    }

    pub fn status_label(&self) -> &'static str {
        match self.mode() {
            SyncMode::Live => "live",
            SyncMode::Polling => "polling",
            SyncMode::Offline if self.configured && self.has_data() => {
                "reconnecting; holding last snapshot"
            }
            SyncMode::Offline => "offline",
        }
    }

    /// Equality used to suppress no-op publications. Collections compare by
    /// identity since the engine only swaps them on change.
    pub(crate) fn same_as(&self, other: &SyncView) -> bool {
        self.configured == other.configured
            && self.config_loading == other.config_loading
            && self.api_host == other.api_host
            && self.config_error == other.config_error
            && self.refreshing == other.refreshing
            && Arc::ptr_eq(&self.agents, &other.agents)
            && Arc::ptr_eq(&self.channels, &other.channels)
            && Arc::ptr_eq(&self.messages, &other.messages)
            && self.resources == other.resources
    }
}

/// Cheap, cloneable access to a running engine.
#[derive(Clone, Debug)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<SyncView>,
}

impl SyncHandle {
    pub(crate) fn new(commands: mpsc::Sender<Command>, view: watch::Receiver<SyncView>) -> Self {
        Self { commands, view }
    }

    /// Current state. Never blocks on the network.
    pub fn view(&self) -> SyncView {
        self.view.borrow().clone()
    }

    /// Change notifications; a new value is published only on real change.
    pub fn subscribe(&self) -> watch::Receiver<SyncView> {
        self.view.clone()
    }

    /// Re-run the configuration check, reconnect push resources, probe
    /// polling ones and fetch fresh snapshots. Calls made while a refresh is
    /// in flight join it instead of starting another.
    pub async fn refresh(&self) -> SyncResult<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Refresh(reply))
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        done.await.map_err(|_| SyncError::EngineStopped)?
    }

    pub(crate) async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).await.is_ok() {
            let _ = done.await;
        }
    }
}
