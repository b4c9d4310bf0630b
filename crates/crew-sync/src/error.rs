//! Sync engine error types.

use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;

/// Everything that can go wrong while mirroring. Runtime variants are
/// absorbed by the engine and surface only as per-resource state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The configuration check could not determine service status.
    #[error("configuration unavailable: {0}")]
    ConfigUnavailable(String),

    /// Push connection failed, timed out or closed unexpectedly.
    #[error("transport error: {0}")]
    Transport(String),

    /// Snapshot fetch failed.
    #[error("poll failed: {0}")]
    Poll(String),

    /// A single event or snapshot row could not be decoded.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Startup configuration could not be built.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The engine has been torn down.
    #[error("sync engine stopped")]
    EngineStopped,
}

impl SyncError {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::ConfigUnavailable(_) => "config_unavailable",
            SyncError::Transport(_) => "transport",
            SyncError::Poll(_) => "poll",
            SyncError::MalformedEvent(_) => "malformed_event",
            SyncError::InvalidConfig(_) => "invalid_config",
            SyncError::EngineStopped => "engine_stopped",
        }
    }
}

/// Serialized as `{ "kind": ..., "message": ... }` for status output.
impl Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("SyncError", 2)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Result type alias using SyncError.
pub type SyncResult<T> = Result<T, SyncError>;
