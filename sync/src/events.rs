//! Typed sync events for UI subscribers.
//!
//! Events go out on a `tokio::sync::broadcast` channel: every subscriber
//! gets its own copy, and a subscriber that falls too far behind sees
//! `RecvError::Lagged` instead of blocking the engine.

use nestlog_engine::{ConflictResolution, RecordId, ServerId, Timestamp, Version};
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;

/// What started a batch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// Connectivity came back
    Recovery,
    /// The app returned to the foreground
    Foreground,
    /// The periodic timer fired with pending work
    Periodic,
    /// The caregiver asked for it
    Manual,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncTrigger::Recovery => "recovery",
            SyncTrigger::Foreground => "foreground",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Manual => "manual",
        })
    }
}

/// An immutable notification about sync progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStart {
        record_id: RecordId,
        /// 1 for the first attempt, counting automatic retries
        attempt: u32,
    },
    SyncSuccess {
        record_id: RecordId,
        server_id: ServerId,
        version: Version,
    },
    SyncError {
        record_id: RecordId,
        error: String,
        /// Delay before the scheduled retry, if one was scheduled
        retry_in_ms: Option<u64>,
    },
    BatchSyncStart {
        trigger: SyncTrigger,
        /// Records queued for the push phase
        total: usize,
    },
    BatchSyncComplete {
        trigger: SyncTrigger,
        synced: usize,
        errors: usize,
        pulled: usize,
        removed: usize,
    },
    ConflictResolved {
        record_id: RecordId,
        resolution: ConflictResolution,
        local_modified: Timestamp,
        remote_modified: Timestamp,
    },
    CleanupCompleted {
        removed: Vec<RecordId>,
    },
}

impl SyncEvent {
    /// Stable event name, e.g. `"sync_start"`.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::SyncStart { .. } => "sync_start",
            SyncEvent::SyncSuccess { .. } => "sync_success",
            SyncEvent::SyncError { .. } => "sync_error",
            SyncEvent::BatchSyncStart { .. } => "batch_sync_start",
            SyncEvent::BatchSyncComplete { .. } => "batch_sync_complete",
            SyncEvent::ConflictResolved { .. } => "conflict_resolved",
            SyncEvent::CleanupCompleted { .. } => "cleanup_completed",
        }
    }
}

/// Publish side of the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Add a subscriber. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Returns the number of subscribers reached.
    pub fn emit(&self, event: SyncEvent) -> usize {
        tracing::trace!(event = event.name(), "emit");
        // No subscribers is not an error.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
