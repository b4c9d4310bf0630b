//! Client-side mirror of the crew coordination service.
//!
//! [`SyncEngine`] keeps agents, channels and messages in memory, preferring a
//! push stream per resource and falling back to polling when a stream keeps
//! failing. Consumers read a [`SyncView`] through a [`SyncHandle`].

pub mod backoff;
pub mod config;
mod connection;
pub mod coordinator;
mod engine;
pub mod error;
pub mod gate;
mod handle;
mod poll;
pub mod remote;
mod report;
pub mod store;

#[cfg(test)]
mod testing;

pub use backoff::BackoffPolicy;
pub use config::{parse_bool_flag, SyncConfig, DEFAULT_API_URL};
pub use coordinator::{aggregate_mode, ConnectionState, ResourcePhase, SyncMode, TransportMode};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use handle::{ResourceView, StatusCounts, SyncHandle, SyncView};
pub use remote::{ConfigStatus, HttpRemote, PushStream, RemoteService};
pub use store::CollectionStore;
