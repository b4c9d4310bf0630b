//! Scriptable in-memory remote for engine tests.

use crate::error::{SyncError, SyncResult};
use crate::remote::{ConfigStatus, PushStream, RemoteService};
use crew_core::stream_protocol::{StreamEnvelope, StreamEvent};
use crew_core::Resource;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) struct FakeState {
    pub configured: bool,
    pub api_host: Option<String>,
    pub config_error: Option<SyncError>,
    pub config_delay: Duration,
    pub config_calls: usize,
    pub snapshots: HashMap<Resource, Vec<Value>>,
    pub snapshot_delay: Duration,
    pub poll_down: HashSet<Resource>,
    pub snapshot_calls: HashMap<Resource, usize>,
    pub push_down: HashSet<Resource>,
    /// Opens for these resources hang this long before answering.
    pub open_delay: HashMap<Resource, Duration>,
    /// Sent as the first frame of every stream opened for the resource.
    pub stream_snapshots: HashMap<Resource, Vec<Value>>,
    pub open_calls: HashMap<Resource, usize>,
    pub cursors: Vec<(Resource, Option<String>)>,
    feeds: HashMap<Resource, mpsc::UnboundedSender<SyncResult<String>>>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            configured: true,
            api_host: None,
            config_error: None,
            config_delay: Duration::ZERO,
            config_calls: 0,
            snapshots: HashMap::new(),
            snapshot_delay: Duration::ZERO,
            poll_down: HashSet::new(),
            snapshot_calls: HashMap::new(),
            push_down: HashSet::new(),
            open_delay: HashMap::new(),
            stream_snapshots: HashMap::new(),
            open_calls: HashMap::new(),
            cursors: Vec::new(),
            feeds: HashMap::new(),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().expect("fake remote lock");
        f(&mut state)
    }

    pub fn opens(&self, resource: Resource) -> usize {
        self.with(|state| state.open_calls.get(&resource).copied().unwrap_or(0))
    }

    pub fn total_opens(&self) -> usize {
        self.with(|state| state.open_calls.values().sum())
    }

    pub fn snapshots(&self, resource: Resource) -> usize {
        self.with(|state| state.snapshot_calls.get(&resource).copied().unwrap_or(0))
    }

    pub fn total_snapshots(&self) -> usize {
        self.with(|state| state.snapshot_calls.values().sum())
    }

    pub fn config_calls(&self) -> usize {
        self.with(|state| state.config_calls)
    }

    pub fn last_cursor(&self, resource: Resource) -> Option<Option<String>> {
        self.with(|state| {
            state
                .cursors
                .iter()
                .rev()
                .find(|(r, _)| *r == resource)
                .map(|(_, cursor)| cursor.clone())
        })
    }

    /// Deliver one raw text message on the open stream for `resource`.
    pub fn send_raw(&self, resource: Resource, text: &str) -> bool {
        self.with(|state| {
            state
                .feeds
                .get(&resource)
                .map(|feed| feed.send(Ok(text.to_string())).is_ok())
                .unwrap_or(false)
        })
    }

    pub fn send(&self, envelope: &StreamEnvelope) -> bool {
        let text = serde_json::to_string(envelope).expect("encode envelope");
        self.send_raw(envelope.resource, &text)
    }

    /// Close the open stream for `resource` from the server side.
    pub fn drop_stream(&self, resource: Resource) {
        self.with(|state| {
            state.feeds.remove(&resource);
        });
    }
}

impl RemoteService for FakeRemote {
    async fn check_configured(&self) -> SyncResult<ConfigStatus> {
        let (delay, result) = self.with(|state| {
            state.config_calls += 1;
            let result = match &state.config_error {
                Some(err) => Err(err.clone()),
                None => Ok(ConfigStatus {
                    configured: state.configured,
                    api_host: state.api_host.clone(),
                }),
            };
            (state.config_delay, result)
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn fetch_snapshot(&self, resource: Resource) -> SyncResult<Vec<Value>> {
        let (delay, result) = self.with(|state| {
            *state.snapshot_calls.entry(resource).or_default() += 1;
            let result = if state.poll_down.contains(&resource) {
                Err(SyncError::Poll(format!("{resource} unavailable")))
            } else {
                Ok(state.snapshots.get(&resource).cloned().unwrap_or_default())
            };
            (state.snapshot_delay, result)
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn open_stream(
        &self,
        resource: Resource,
        cursor: Option<String>,
    ) -> SyncResult<PushStream> {
        let delay = self.with(|state| {
            *state.open_calls.entry(resource).or_default() += 1;
            state.cursors.push((resource, cursor));
            state.open_delay.get(&resource).copied()
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let rx = self.with(|state| {
            if state.push_down.contains(&resource) {
                return Err(SyncError::Transport("connection refused".to_string()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            if let Some(rows) = state.stream_snapshots.get(&resource) {
                let envelope = StreamEnvelope::new(resource, StreamEvent::Snapshot(rows.clone()));
                let text = serde_json::to_string(&envelope).expect("encode snapshot");
                let _ = tx.send(Ok(text));
            }
            state.feeds.insert(resource, tx);
            Ok(rx)
        })?;
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}
