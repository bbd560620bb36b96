//! # Nestlog Sync
//!
//! The async client runtime that moves records from the local replica to
//! the remote authority and back.
//!
//! ## Components
//!
//! - [`RecordSyncEngine`]: one record's trip `Local -> Syncing -> Synced`,
//!   with create fallback, last-write-wins conflict resolution and
//!   per-record retry timers
//! - [`BatchSyncController`]: full passes that push every pending record in
//!   bounded chunks, pull the remote listing page by page, link or insert
//!   what is new, and prune what was deleted remotely
//! - [`ConnectivityMonitor`]: turns connectivity, foreground and timer
//!   signals into batch passes
//! - [`EventBus`]: typed [`SyncEvent`]s for UI subscribers
//! - [`SyncService`]: the composition root tying them together
//!
//! ## Failure model
//!
//! Local writes never wait for the network. Network failures stay inside
//! the engine and surface only as record status and events; errors returned
//! to callers are local store failures, configuration errors, or use after
//! [`SyncService::dispose`].

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod monitor;
pub mod remote;
pub mod service;
pub mod store;

pub use batch::{BatchReport, BatchSyncController};
pub use config::{normalize_endpoint, ConfigError, SyncConfig};
pub use engine::{RecordSyncEngine, RetryReceiver, SyncOutcome};
pub use error::{RemoteError, Result, SyncError};
pub use events::{EventBus, SyncEvent, SyncTrigger};
pub use monitor::{
    AppEvent, Connectivity, ConnectivityMonitor, ConnectivityObserver, ManualConnectivity,
    MonitorHandle, MonitorSettings,
};
pub use remote::{HttpRemote, RemoteApi};
pub use service::SyncService;
pub use store::SharedStore;
