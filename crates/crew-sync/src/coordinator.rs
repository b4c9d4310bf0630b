//! Per-resource connection state and the aggregate mode derived from it.
//! Everything here is pure: transitions are applied by the engine, timers
//! belong to the connection and poll tasks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Idle,
    Push,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourcePhase {
    Idle,
    PushConnecting,
    PushLive,
    PollActive,
    PollFailing,
}

impl ResourcePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourcePhase::Idle => "idle",
            ResourcePhase::PushConnecting => "push-connecting",
            ResourcePhase::PushLive => "push-live",
            ResourcePhase::PollActive => "poll-active",
            ResourcePhase::PollFailing => "poll-failing",
        }
    }

    pub fn is_polling(&self) -> bool {
        matches!(self, ResourcePhase::PollActive | ResourcePhase::PollFailing)
    }
}

impl fmt::Display for ResourcePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Live,
    Polling,
    Offline,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Live => "live",
            SyncMode::Polling => "polling",
            SyncMode::Offline => "offline",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub transport: TransportMode,
    /// Push stream currently open.
    pub live: bool,
    /// Last event id seen; sent when reconnecting to resume the stream.
    pub cursor: Option<String>,
    pub consecutive_failures: u32,
    #[serde(with = "duration_ms")]
    pub current_backoff: Duration,
    /// A stream opened or a snapshot fetch succeeded at least once.
    pub connection_established: bool,
    /// A snapshot or event was applied to the collection at least once.
    pub ever_synced: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
}

impl ConnectionState {
    pub fn new(failure_threshold: u32, backoff_floor: Duration) -> Self {
        Self {
            transport: TransportMode::Idle,
            live: false,
            cursor: None,
            consecutive_failures: 0,
            current_backoff: backoff_floor,
            connection_established: false,
            ever_synced: false,
            last_synced_at: None,
            failure_threshold,
        }
    }

    pub fn phase(&self) -> ResourcePhase {
        match self.transport {
            TransportMode::Idle => ResourcePhase::Idle,
            TransportMode::Push if self.live => ResourcePhase::PushLive,
            TransportMode::Push => ResourcePhase::PushConnecting,
            TransportMode::Poll if self.consecutive_failures >= self.failure_threshold => {
                ResourcePhase::PollFailing
            }
            TransportMode::Poll => ResourcePhase::PollActive,
        }
    }

    /// True only while a push stream is open.
    pub fn connected(&self) -> bool {
        self.phase() == ResourcePhase::PushLive
    }
}

/// Fold per-resource states into one mode. Each item pairs a state with
/// whether that resource currently carries a last error.
pub fn aggregate_mode<'a, I>(configured: bool, resources: I) -> SyncMode
where
    I: IntoIterator<Item = (&'a ConnectionState, bool)>,
{
    if !configured {
        return SyncMode::Offline;
    }
    let mut all_live = true;
    let mut all_dead = true;
    let mut any = false;
    for (state, has_error) in resources {
        any = true;
        if state.phase() != ResourcePhase::PushLive {
            all_live = false;
        }
        if state.connection_established || !has_error {
            all_dead = false;
        }
    }
    if !any || all_dead {
        SyncMode::Offline
    } else if all_live {
        SyncMode::Live
    } else {
        SyncMode::Polling
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(transport: TransportMode, live: bool) -> ConnectionState {
        ConnectionState {
            transport,
            live,
            connection_established: live,
            ever_synced: live,
            ..ConnectionState::new(3, Duration::from_secs(1))
        }
    }

    #[test]
    fn phase_follows_transport_and_failures() {
        let mut poll = state(TransportMode::Poll, false);
        assert_eq!(poll.phase(), ResourcePhase::PollActive);
        poll.consecutive_failures = 3;
        assert_eq!(poll.phase(), ResourcePhase::PollFailing);
        assert!(!poll.connected());

        assert_eq!(state(TransportMode::Push, false).phase(), ResourcePhase::PushConnecting);
        assert_eq!(state(TransportMode::Push, true).phase(), ResourcePhase::PushLive);
        assert_eq!(state(TransportMode::Idle, false).phase(), ResourcePhase::Idle);
    }

    #[test]
    fn live_requires_every_resource_connected() {
        let live = state(TransportMode::Push, true);
        let down = state(TransportMode::Push, false);
        assert_eq!(
            aggregate_mode(true, [(&live, false), (&live, false), (&live, false)]),
            SyncMode::Live
        );
        assert_eq!(
            aggregate_mode(true, [(&live, false), (&live, false), (&down, true)]),
            SyncMode::Polling
        );
    }

    #[test]
    fn offline_when_unconfigured_or_nothing_ever_connected() {
        let live = state(TransportMode::Push, true);
        assert_eq!(
            aggregate_mode(false, [(&live, false), (&live, false), (&live, false)]),
            SyncMode::Offline
        );

        let failed = state(TransportMode::Poll, false);
        assert_eq!(
            aggregate_mode(true, [(&failed, true), (&failed, true), (&failed, true)]),
            SyncMode::Offline
        );

        // Still connecting, nothing has failed yet.
        let connecting = state(TransportMode::Push, false);
        assert_eq!(
            aggregate_mode(true, [(&connecting, false), (&failed, true), (&failed, true)]),
            SyncMode::Polling
        );
    }

    #[test]
    fn open_stream_without_data_is_connected_but_not_synced() {
        let mut opened = ConnectionState::new(3, Duration::from_secs(1));
        opened.transport = TransportMode::Push;
        opened.live = true;
        opened.connection_established = true;
        assert!(opened.connected());
        assert!(!opened.ever_synced);

        let failed = state(TransportMode::Poll, false);
        assert_eq!(
            aggregate_mode(true, [(&opened, true), (&failed, true), (&failed, true)]),
            SyncMode::Polling
        );
    }

    #[test]
    fn state_serializes_with_camel_case_fields() {
        let mut state = state(TransportMode::Poll, false);
        state.consecutive_failures = 2;
        let value = serde_json::to_value(&state).expect("serialize");
        assert_eq!(value["transport"], "poll");
        assert_eq!(value["consecutiveFailures"], 2);
        assert_eq!(value["currentBackoff"], 1000);
        assert_eq!(value["connectionEstablished"], false);
        assert_eq!(
            serde_json::to_value(ResourcePhase::PollFailing).expect("phase"),
            "poll-failing"
        );
    }

    #[test]
    fn stale_data_keeps_polling_mode_after_failures() {
        let mut synced_then_failed = state(TransportMode::Poll, false);
        synced_then_failed.connection_established = true;
        synced_then_failed.consecutive_failures = 5;
        let failed = state(TransportMode::Poll, false);
        assert_eq!(
            aggregate_mode(
                true,
                [(&synced_then_failed, true), (&failed, true), (&failed, true)]
            ),
            SyncMode::Polling
        );
    }
}
