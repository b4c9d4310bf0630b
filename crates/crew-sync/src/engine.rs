//! The sync engine task. It owns the collections and every per-resource
//! state; connection, poll and fetch tasks only report to it.

use crate::config::SyncConfig;
use crate::connection::StreamConnection;
use crate::coordinator::{ConnectionState, TransportMode};
use crate::error::{SyncError, SyncResult};
use crate::gate;
use crate::handle::{Command, ResourceView, SyncHandle, SyncView};
use crate::poll::PollFallback;
use crate::remote::{PushStream, RemoteService};
use crate::report::{EngineMsg, Report, ReportKind, Reporter};
use crate::store::CollectionStore;
use chrono::Utc;
use crew_core::stream_protocol::StreamEvent;
use crew_core::{parse_record, AgentRecord, ChannelRecord, MessageRecord, Resource, SyncRecord};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

const COMMAND_CAPACITY: usize = 32;

/// A running mirror. Dropping it aborts the engine task, which in turn
/// releases every transport; prefer [`SyncEngine::shutdown`] for a clean stop.
#[derive(Debug)]
pub struct SyncEngine {
    handle: SyncHandle,
    task: Option<JoinHandle<()>>,
}

impl SyncEngine {
    /// Validate the configuration and start the engine task. The first
    /// configuration check starts right away.
    pub fn spawn<R: RemoteService>(config: SyncConfig, remote: R) -> SyncResult<Self> {
        config.validate()?;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (report_tx, report_rx) = mpsc::channel(config.report_capacity);
        let (view_tx, view_rx) = watch::channel(SyncView::initial(
            config.failure_threshold,
            config.backoff.floor(),
        ));
        let engine = Engine::new(Arc::new(config), Arc::new(remote), report_tx, view_tx);
        let task = tokio::spawn(engine.run(command_rx, report_rx));
        Ok(Self {
            handle: SyncHandle::new(command_tx, view_rx),
            task: Some(task),
        })
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Close every connection, cancel every timer and wait for the engine
    /// task to finish. Pending refreshes resolve with `EngineStopped`.
    pub async fn shutdown(mut self) {
        self.handle.shutdown().await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum Transport {
    Idle,
    Push(StreamConnection),
    Poll(PollFallback),
}

struct ResourceSlot {
    resource: Resource,
    state: ConnectionState,
    transport: Transport,
    last_error: Option<SyncError>,
    /// Bumped whenever the transport is replaced; reports carrying an older
    /// epoch are dropped.
    epoch: u64,
    /// Counts stream opens within the current epoch.
    open_seq: u64,
    /// Open during which the stream itself delivered a snapshot.
    stream_snapshot_seq: Option<u64>,
}

struct RefreshRound {
    id: u64,
    waiters: Vec<oneshot::Sender<SyncResult<()>>>,
    pending: HashSet<Resource>,
}

/// Published copy of a collection, rebuilt only when the store revision moves.
struct Published<T> {
    revision: u64,
    items: Arc<Vec<T>>,
}

impl<T> Default for Published<T> {
    fn default() -> Self {
        Self {
            revision: 0,
            items: Arc::default(),
        }
    }
}

impl<T: SyncRecord> Published<T> {
    fn sync(&mut self, store: &CollectionStore<T>) -> Arc<Vec<T>> {
        if self.revision != store.revision() {
            self.revision = store.revision();
            self.items = Arc::new(store.read());
        }
        Arc::clone(&self.items)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Applied {
    changed: bool,
    rejected: Vec<String>,
}

struct Engine<R> {
    config: Arc<SyncConfig>,
    remote: Arc<R>,
    report_tx: mpsc::Sender<EngineMsg>,
    view_tx: watch::Sender<SyncView>,
    agents: CollectionStore<AgentRecord>,
    channels: CollectionStore<ChannelRecord>,
    messages: CollectionStore<MessageRecord>,
    published_agents: Published<AgentRecord>,
    published_channels: Published<ChannelRecord>,
    published_messages: Published<MessageRecord>,
    slots: [ResourceSlot; 3],
    configured: bool,
    config_loading: bool,
    api_host: Option<String>,
    config_error: Option<SyncError>,
    gate_generation: u64,
    refresh: Option<RefreshRound>,
    next_refresh_id: u64,
    aux: JoinSet<()>,
    dirty: bool,
}

impl<R: RemoteService> Engine<R> {
    fn new(
        config: Arc<SyncConfig>,
        remote: Arc<R>,
        report_tx: mpsc::Sender<EngineMsg>,
        view_tx: watch::Sender<SyncView>,
    ) -> Self {
        let threshold = config.failure_threshold;
        let floor = config.backoff.floor();
        let slots = Resource::ALL.map(|resource| ResourceSlot {
            resource,
            state: ConnectionState::new(threshold, floor),
            transport: Transport::Idle,
            last_error: None,
            epoch: 0,
            open_seq: 0,
            stream_snapshot_seq: None,
        });
        Self {
            config,
            remote,
            report_tx,
            view_tx,
            agents: CollectionStore::new(),
            channels: CollectionStore::new(),
            messages: CollectionStore::new(),
            published_agents: Published::default(),
            published_channels: Published::default(),
            published_messages: Published::default(),
            slots,
            configured: false,
            config_loading: true,
            api_host: None,
            config_error: None,
            gate_generation: 0,
            refresh: None,
            next_refresh_id: 0,
            aux: JoinSet::new(),
            dirty: false,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut reports: mpsc::Receiver<EngineMsg>,
    ) {
        info!(
            api_url = %self.config.api_url,
            push_enabled = self.config.push_enabled,
            "sync_engine_start"
        );
        self.begin_gate_check();
        self.publish();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Refresh(reply)) => self.request_refresh(reply),
                    Some(Command::Shutdown(ack)) => {
                        self.teardown();
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        self.teardown();
                        return;
                    }
                },
                Some(msg) = reports.recv() => self.handle_msg(msg),
                Some(joined) = self.aux.join_next(), if !self.aux.is_empty() => {
                    if let Err(err) = joined {
                        if !err.is_cancelled() {
                            warn!("sync_task_error: {err}");
                        }
                    }
                }
            }
            if self.dirty {
                self.publish();
            }
        }
    }

    fn handle_msg(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::Gate {
                generation,
                status,
                error,
            } => {
                if generation != self.gate_generation {
                    debug!(generation, "config_check_stale");
                    return;
                }
                self.on_gate(status.configured, status.api_host, error);
            }
            EngineMsg::Report(report) => self.on_report(report),
            EngineMsg::RefreshSnapshot {
                refresh_id,
                resource,
                epoch,
                result,
            } => self.on_refresh_snapshot(refresh_id, resource, epoch, result),
            EngineMsg::OpenSnapshot {
                resource,
                epoch,
                open_seq,
                result,
            } => self.on_open_snapshot(resource, epoch, open_seq, result),
        }
    }

    fn begin_gate_check(&mut self) {
        self.gate_generation += 1;
        self.config_loading = true;
        self.dirty = true;
        let generation = self.gate_generation;
        let remote = Arc::clone(&self.remote);
        let tx = self.report_tx.clone();
        let timeout = self.config.request_timeout;
        self.aux.spawn(async move {
            let outcome = gate::check_configured(remote.as_ref(), timeout).await;
            let _ = tx
                .send(EngineMsg::Gate {
                    generation,
                    status: outcome.status,
                    error: outcome.error,
                })
                .await;
        });
    }

    fn on_gate(&mut self, configured: bool, api_host: Option<String>, error: Option<SyncError>) {
        self.config_loading = false;
        self.configured = configured;
        self.api_host = if configured { api_host } else { None };
        self.config_error = error.clone();
        self.dirty = true;

        if !configured {
            info!("sync_not_configured");
            for resource in Resource::ALL {
                self.stop(resource);
            }
            self.finish_refresh(match error {
                Some(err) => Err(err),
                None => Ok(()),
            });
            return;
        }

        let refreshing = self.refresh.is_some();
        for resource in Resource::ALL {
            let slot = &self.slots[resource.index()];
            let restart_push = match &slot.transport {
                Transport::Idle => {
                    self.start_transport(resource);
                    continue;
                }
                Transport::Push(connection) => {
                    if refreshing {
                        debug!(resource = %resource, epoch = connection.epoch(), "stream_restart");
                    }
                    refreshing
                }
                Transport::Poll(poll) => {
                    if refreshing {
                        poll.request_probe();
                    }
                    false
                }
            };
            if restart_push {
                self.start_push(resource, None);
            }
        }

        if let Some(round) = self.refresh.as_mut() {
            round.pending = Resource::ALL.into_iter().collect();
            let refresh_id = round.id;
            for resource in Resource::ALL {
                self.spawn_refresh_snapshot(refresh_id, resource);
            }
        }
    }

    fn start_transport(&mut self, resource: Resource) {
        if self.config.push_enabled {
            self.start_push(resource, None);
        } else {
            self.start_poll(resource);
        }
    }

    fn reporter(&mut self, resource: Resource) -> Reporter {
        let slot = &mut self.slots[resource.index()];
        slot.epoch += 1;
        slot.open_seq = 0;
        slot.stream_snapshot_seq = None;
        Reporter::new(self.report_tx.clone(), resource, slot.epoch)
    }

    fn start_push(&mut self, resource: Resource, handed_over: Option<PushStream>) {
        let reporter = self.reporter(resource);
        let slot = &mut self.slots[resource.index()];
        // Drop the old transport before the new one starts talking.
        slot.transport = Transport::Idle;
        slot.state.transport = TransportMode::Push;
        slot.state.live = false;
        slot.state.consecutive_failures = 0;
        slot.state.current_backoff = self.config.backoff.floor();
        slot.transport = Transport::Push(StreamConnection::open(
            Arc::clone(&self.remote),
            Arc::clone(&self.config),
            reporter,
            slot.state.cursor.clone(),
            handed_over,
        ));
        self.dirty = true;
    }

    fn start_poll(&mut self, resource: Resource) {
        let reporter = self.reporter(resource);
        let slot = &mut self.slots[resource.index()];
        slot.transport = Transport::Idle;
        slot.state.transport = TransportMode::Poll;
        slot.state.live = false;
        slot.state.consecutive_failures = 0;
        slot.state.current_backoff = self.config.backoff.floor();
        slot.transport = Transport::Poll(PollFallback::start(
            Arc::clone(&self.remote),
            Arc::clone(&self.config),
            reporter,
            slot.state.cursor.clone(),
            self.config.push_enabled,
        ));
        self.dirty = true;
    }

    fn stop(&mut self, resource: Resource) {
        let slot = &mut self.slots[resource.index()];
        slot.epoch += 1;
        slot.transport = Transport::Idle;
        slot.state.transport = TransportMode::Idle;
        slot.state.live = false;
        self.dirty = true;
    }

    fn on_report(&mut self, report: Report) {
        let resource = report.resource;
        if report.epoch != self.slots[resource.index()].epoch {
            debug!(
                resource = %resource,
                report = report.kind.label(),
                "sync_report_stale"
            );
            return;
        }

        match report.kind {
            ReportKind::Opened => {
                let slot = &mut self.slots[resource.index()];
                slot.state.live = true;
                slot.state.connection_established = true;
                slot.state.consecutive_failures = 0;
                slot.state.current_backoff = self.config.backoff.floor();
                slot.last_error = None;
                slot.open_seq += 1;
                let open_seq = slot.open_seq;
                self.dirty = true;
                // The stream may not replay what happened while it was down.
                self.spawn_open_snapshot(resource, open_seq);
            }
            ReportKind::Event(envelope) => {
                let slot = &mut self.slots[resource.index()];
                if let Some(event_id) = envelope.event_id {
                    slot.state.cursor = Some(event_id);
                }
                if matches!(envelope.event, StreamEvent::Snapshot(_)) {
                    slot.stream_snapshot_seq = Some(slot.open_seq);
                }
                if self.apply(resource, envelope.event) {
                    self.mark_synced(resource);
                }
            }
            ReportKind::Malformed(reason) => {
                self.slots[resource.index()].last_error = Some(SyncError::MalformedEvent(reason));
                self.dirty = true;
            }
            ReportKind::StreamFailed {
                error,
                failures,
                retry_in,
            } => {
                let slot = &mut self.slots[resource.index()];
                slot.state.live = false;
                slot.state.consecutive_failures = failures;
                slot.last_error = Some(error);
                self.dirty = true;
                match retry_in {
                    Some(delay) => slot.state.current_backoff = delay,
                    None => {
                        info!(resource = %resource, failures, "sync_demote_to_poll");
                        self.start_poll(resource);
                    }
                }
            }
            ReportKind::PollSnapshot(rows) => {
                let clean = self.apply(resource, StreamEvent::Snapshot(rows));
                self.mark_synced(resource);
                let slot = &mut self.slots[resource.index()];
                if slot.state.consecutive_failures != 0 {
                    slot.state.consecutive_failures = 0;
                    slot.state.last_synced_at = Some(Utc::now());
                    self.dirty = true;
                }
                if clean && slot.last_error.is_some() {
                    slot.last_error = None;
                    self.dirty = true;
                }
            }
            ReportKind::PollFailed(error) => {
                warn!(resource = %resource, "poll_error: {error}");
                let slot = &mut self.slots[resource.index()];
                slot.state.consecutive_failures = slot.state.consecutive_failures.saturating_add(1);
                slot.last_error = Some(error);
                self.dirty = true;
            }
            ReportKind::Promoted(stream) => {
                info!(resource = %resource, "sync_promote_to_push");
                self.start_push(resource, Some(stream));
            }
        }
    }

    /// Apply one event to its collection. Returns false if anything in it
    /// had to be rejected.
    fn apply(&mut self, resource: Resource, event: StreamEvent) -> bool {
        let kind = event.kind();
        let applied = match resource {
            Resource::Agents => apply_event(&mut self.agents, event),
            Resource::Channels => apply_event(&mut self.channels, event),
            Resource::Messages => apply_event(&mut self.messages, event),
        };
        let slot = &mut self.slots[resource.index()];
        if applied.changed {
            slot.state.last_synced_at = Some(Utc::now());
            self.dirty = true;
        }
        if applied.rejected.is_empty() {
            return true;
        }
        warn!(
            resource = %resource,
            event = kind,
            rejected = applied.rejected.len(),
            "sync_malformed_rows: {}",
            applied.rejected[0]
        );
        slot.last_error = Some(SyncError::MalformedEvent(format!(
            "{} {kind} row(s) rejected: {}",
            applied.rejected.len(),
            applied.rejected[0]
        )));
        self.dirty = true;
        false
    }

    /// First successful data for a resource. Later calls are no-ops.
    fn mark_synced(&mut self, resource: Resource) {
        let state = &mut self.slots[resource.index()].state;
        if state.ever_synced && state.connection_established {
            return;
        }
        state.connection_established = true;
        if !state.ever_synced {
            state.ever_synced = true;
            state.last_synced_at = Some(Utc::now());
        }
        self.dirty = true;
    }

    fn request_refresh(&mut self, reply: oneshot::Sender<SyncResult<()>>) {
        if let Some(round) = self.refresh.as_mut() {
            debug!(refresh_id = round.id, "sync_refresh_joined");
            round.waiters.push(reply);
            return;
        }
        self.next_refresh_id += 1;
        info!(refresh_id = self.next_refresh_id, "sync_refresh");
        self.refresh = Some(RefreshRound {
            id: self.next_refresh_id,
            waiters: vec![reply],
            pending: HashSet::new(),
        });
        self.begin_gate_check();
    }

    fn spawn_refresh_snapshot(&mut self, refresh_id: u64, resource: Resource) {
        let epoch = self.slots[resource.index()].epoch;
        self.spawn_snapshot(resource, move |result| EngineMsg::RefreshSnapshot {
            refresh_id,
            resource,
            epoch,
            result,
        });
    }

    fn spawn_open_snapshot(&mut self, resource: Resource, open_seq: u64) {
        let epoch = self.slots[resource.index()].epoch;
        self.spawn_snapshot(resource, move |result| EngineMsg::OpenSnapshot {
            resource,
            epoch,
            open_seq,
            result,
        });
    }

    fn spawn_snapshot<F>(&mut self, resource: Resource, into_msg: F)
    where
        F: FnOnce(SyncResult<Vec<Value>>) -> EngineMsg + Send + 'static,
    {
        let remote = Arc::clone(&self.remote);
        let tx = self.report_tx.clone();
        let timeout = self.config.request_timeout;
        self.aux.spawn(async move {
            let result = match tokio::time::timeout(timeout, remote.fetch_snapshot(resource)).await {
                Ok(Ok(rows)) => Ok(rows),
                Ok(Err(SyncError::Poll(reason))) => Err(SyncError::Poll(reason)),
                Ok(Err(other)) => Err(SyncError::Poll(other.to_string())),
                Err(_) => Err(SyncError::Poll(format!(
                    "snapshot timed out after {}ms",
                    timeout.as_millis()
                ))),
            };
            let _ = tx.send(into_msg(result)).await;
        });
    }

    /// Reconcile a freshly opened stream, unless the stream already sent its
    /// own snapshot for this open.
    fn on_open_snapshot(
        &mut self,
        resource: Resource,
        epoch: u64,
        open_seq: u64,
        result: SyncResult<Vec<Value>>,
    ) {
        let slot = &self.slots[resource.index()];
        if epoch != slot.epoch || open_seq != slot.open_seq {
            debug!(resource = %resource, "sync_open_snapshot_stale");
            return;
        }
        if slot.stream_snapshot_seq == Some(open_seq) {
            debug!(resource = %resource, "sync_open_snapshot_superseded");
            return;
        }
        match result {
            Ok(rows) => {
                self.apply(resource, StreamEvent::Snapshot(rows));
                self.mark_synced(resource);
            }
            Err(err) => {
                warn!(resource = %resource, "sync_open_snapshot_error: {err}");
                self.slots[resource.index()].last_error = Some(err);
                self.dirty = true;
            }
        }
    }

    fn on_refresh_snapshot(
        &mut self,
        refresh_id: u64,
        resource: Resource,
        epoch: u64,
        result: SyncResult<Vec<Value>>,
    ) {
        let done = match self.refresh.as_mut() {
            Some(round) if round.id == refresh_id => {
                round.pending.remove(&resource);
                round.pending.is_empty()
            }
            _ => return,
        };

        if epoch == self.slots[resource.index()].epoch {
            match result {
                Ok(rows) => {
                    self.apply(resource, StreamEvent::Snapshot(rows));
                    self.mark_synced(resource);
                }
                Err(err) => {
                    warn!(resource = %resource, "sync_refresh_error: {err}");
                    self.slots[resource.index()].last_error = Some(err);
                    self.dirty = true;
                }
            }
        } else {
            debug!(resource = %resource, "sync_refresh_result_stale");
        }

        if done {
            self.finish_refresh(Ok(()));
        }
    }

    fn finish_refresh(&mut self, result: SyncResult<()>) {
        let Some(round) = self.refresh.take() else {
            return;
        };
        debug!(refresh_id = round.id, waiters = round.waiters.len(), "sync_refresh_done");
        for waiter in round.waiters {
            let _ = waiter.send(result.clone());
        }
        self.dirty = true;
    }

    fn teardown(&mut self) {
        info!("sync_engine_stop");
        for resource in Resource::ALL {
            self.stop(resource);
        }
        self.aux.abort_all();
        self.finish_refresh(Err(SyncError::EngineStopped));
        self.publish();
    }

    fn publish(&mut self) {
        let view = SyncView {
            configured: self.configured,
            config_loading: self.config_loading,
            api_host: self.api_host.clone(),
            config_error: self.config_error.clone(),
            refreshing: self.refresh.is_some(),
            agents: self.published_agents.sync(&self.agents),
            channels: self.published_channels.sync(&self.channels),
            messages: self.published_messages.sync(&self.messages),
            resources: std::array::from_fn(|idx| {
                let slot = &self.slots[idx];
                ResourceView {
                    resource: slot.resource,
                    state: slot.state.clone(),
                    last_error: slot.last_error.clone(),
                }
            }),
        };
        self.view_tx.send_if_modified(|current| {
            if current.same_as(&view) {
                false
            } else {
                *current = view;
                true
            }
        });
        self.dirty = false;
    }
}

fn apply_event<T: SyncRecord>(store: &mut CollectionStore<T>, event: StreamEvent) -> Applied {
    let mut applied = Applied::default();
    match event {
        StreamEvent::Upsert(payload) => match parse_record::<T>(payload) {
            Ok(record) => applied.changed = store.apply_upsert(record),
            Err(err) => applied.rejected.push(err.to_string()),
        },
        StreamEvent::Delete(target) => applied.changed = store.apply_delete(&target.id),
        StreamEvent::Snapshot(rows) => {
            let mut records = Vec::with_capacity(rows.len());
            for row in rows {
                match parse_record::<T>(row) {
                    Ok(record) => records.push(record),
                    Err(err) => applied.rejected.push(err.to_string()),
                }
            }
            applied.changed = store.apply_snapshot(records);
        }
    }
    applied
}
