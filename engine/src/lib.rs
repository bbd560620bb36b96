//! # Nestlog Engine
//!
//! The offline-first core of nestlog: a local replica of caregiver activity
//! records that accepts writes instantly and tracks what still has to reach
//! the remote authority.
//!
//! This crate is pure logic. It knows nothing about the network or the
//! async runtime; the `nestlog-sync` crate drives it.
//!
//! ## Design Principles
//!
//! - **Local first**: every caregiver write lands in the [`LocalStore`]
//!   before any network attempt is made
//! - **Typed records**: [`ActivityRecord`] is validated at the store boundary
//! - **Atomic snapshots**: a mutation is persisted as a whole or not at all
//! - **Testable**: time comes from a [`Clock`], storage from a
//!   [`StorageBackend`]
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! Each [`ActivityRecord`] carries:
//! - A sortable client-generated id ([`create_identifier`])
//! - An optional server id, set once the remote confirms it
//! - A version bumped on every local mutation
//! - A [`SyncStatus`]: `Local -> Syncing -> {Synced | SyncFailed}`
//! - A content hash over the business fields ([`compute_content_hash`])
//!
//! ### Reconciliation
//!
//! The [`reconcile`] module decides, without doing IO, how a remote listing
//! maps onto local records, which local records were deleted remotely, and
//! who wins a version conflict (last write wins by modification time).
//!
//! ## Quick Start
//!
//! ```rust
//! use nestlog_engine::{ActivityFields, ActivityType, LocalStore, SyncStatus};
//!
//! let mut store = LocalStore::in_memory(1706745600000).unwrap();
//!
//! let fields = ActivityFields::new("baby-1", ActivityType::Feeding, 1706745600000)
//!     .with_subtype("bottle")
//!     .with_amount(120.0, "ml");
//! let record = store.create(fields, 1706745600000).unwrap();
//!
//! assert_eq!(record.version, 1);
//! assert_eq!(record.status, SyncStatus::Local);
//! assert_eq!(store.pending_ids(), vec![record.id]);
//! ```
//!
//! ## Persistence
//!
//! [`LocalStore::open`] loads the snapshot from a [`StorageBackend`]
//! ([`FileBackend`] or [`MemoryBackend`]), migrating older documents on the
//! way. Snapshots serialize to JSON with deterministic ordering.

pub mod clock;
pub mod error;
pub mod identity;
pub mod migrate;
pub mod reconcile;
pub mod record;
pub mod retry;
pub mod snapshot;
pub mod store;
pub mod wire;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use identity::{compute_content_hash, create_identifier};
pub use migrate::{migrate, DroppedRecord, MigrationReport, RepairedRecord};
pub use reconcile::{PullAction, PullPlan};
pub use record::{ActivityFields, ActivityRecord, ActivityType, SyncStatus};
pub use retry::{RetryDecision, RetryPolicy, RetryTracker};
pub use snapshot::{
    ConflictEntry, ConflictResolution, SnapshotMetadata, StorageSnapshot, SCHEMA_VERSION,
};
pub use store::{
    FileBackend, LocalStore, MemoryBackend, PullSummary, StorageBackend, DEFAULT_STORAGE_KEY,
};

/// Type aliases for clarity
pub type RecordId = String;
pub type ServerId = String;
pub type Version = u64;
/// Milliseconds since the Unix epoch
pub type Timestamp = u64;
pub type SchemaVersion = u32;
