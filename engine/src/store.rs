//! The Local Store: the durable replica of every activity.
//!
//! All state lives in one [`StorageSnapshot`] persisted as a single JSON
//! document under one key. Every mutation is applied to a copy, written
//! through the [`StorageBackend`], and only then swapped in, so a failed
//! write never leaves a half-applied change visible.

use crate::identity::create_identifier;
use crate::migrate::{detect_schema_version, migrate, MigrationReport};
use crate::reconcile::PullAction;
use crate::snapshot::{ConflictEntry, SnapshotMetadata, SCHEMA_VERSION};
use crate::{
    error::Result, ActivityFields, ActivityRecord, Error, RecordId, StorageSnapshot, SyncStatus,
    Timestamp,
};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Key the snapshot is stored under unless configured otherwise.
pub const DEFAULT_STORAGE_KEY: &str = "nestlog_activities";

/// Durable key/value persistence for snapshot documents.
pub trait StorageBackend: Send {
    /// Read the document stored under `key`, if any.
    fn load(&self, key: &str) -> Result<Option<String>>;

    /// Replace the document stored under `key`.
    fn save(&mut self, key: &str, document: &str) -> Result<()>;
}

/// In-memory backend. Clones share the same documents, so a test can keep a
/// handle and reopen a store over it.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    documents: Arc<Mutex<HashMap<String, String>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document, e.g. a legacy snapshot.
    pub fn with_document(self, key: &str, document: impl Into<String>) -> Self {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), document.into());
        self
    }

    /// The raw document currently stored under `key`.
    pub fn document(&self, key: &str) -> Option<String> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Make every following save fail (simulates a full disk).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl StorageBackend for MemoryBackend {
    fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.document(key))
    }

    fn save(&mut self, key: &str, document: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("write rejected by backend".into()));
        }
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), document.to_string());
        Ok(())
    }
}

/// One JSON file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Use `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(Error::Storage(format!("invalid storage key '{key}'")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl StorageBackend for FileBackend {
    fn load(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)?) {
            Ok(document) => Ok(Some(document)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&mut self, key: &str, document: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, document)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Counts of what a pull application changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub inserted: usize,
    pub linked: usize,
    pub refreshed: usize,
    /// Actions dropped because the store changed since planning
    pub skipped: usize,
}

/// The local replica.
pub struct LocalStore {
    backend: Box<dyn StorageBackend>,
    key: String,
    snapshot: StorageSnapshot,
    migration: Option<MigrationReport>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("key", &self.key)
            .field("activities", &self.snapshot.activities.len())
            .field("queued", &self.snapshot.sync_queue.len())
            .finish()
    }
}

impl LocalStore {
    /// Open the store persisted under `key`, creating an empty one if
    /// nothing is stored yet.
    ///
    /// Older documents are migrated and written back. Records left
    /// `Syncing` by an interrupted session return to `Local`.
    pub fn open(
        backend: impl StorageBackend + 'static,
        key: impl Into<String>,
        now: Timestamp,
    ) -> Result<Self> {
        let key = key.into();
        let mut dirty = false;
        let mut migration = None;

        let mut snapshot = match backend.load(&key)? {
            None => {
                dirty = true;
                StorageSnapshot::new(now)
            }
            Some(document) => {
                let value: serde_json::Value = serde_json::from_str(&document)
                    .map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
                if detect_schema_version(&value) == SCHEMA_VERSION {
                    serde_json::from_value(value)
                        .map_err(|e| Error::InvalidSnapshot(e.to_string()))?
                } else {
                    let (snapshot, report) = migrate(value, now)?;
                    dirty = true;
                    migration = Some(report);
                    snapshot
                }
            }
        };

        snapshot.validate()?;

        let interrupted: Vec<RecordId> = snapshot
            .activities
            .values()
            .filter(|r| r.status == SyncStatus::Syncing)
            .map(|r| r.id.clone())
            .collect();
        for id in interrupted {
            if let Some(record) = snapshot.activities.get_mut(&id) {
                record.release_to_local()?;
            }
            snapshot.enqueue(&id);
            dirty = true;
        }

        let queued = snapshot.sync_queue.len();
        let activities = &snapshot.activities;
        snapshot.sync_queue.retain(|id| activities.contains_key(id));
        dirty |= snapshot.sync_queue.len() != queued;

        let mut store = Self {
            backend: Box::new(backend),
            key,
            snapshot,
            migration,
        };
        if dirty {
            let document = store.snapshot.to_json()?;
            store.backend.save(&store.key, &document)?;
        }
        Ok(store)
    }

    /// Open an empty, non-durable store.
    pub fn in_memory(now: Timestamp) -> Result<Self> {
        Self::open(MemoryBackend::new(), DEFAULT_STORAGE_KEY, now)
    }

    /// Report of the migration performed by [`LocalStore::open`], if any.
    pub fn migration_report(&self) -> Option<&MigrationReport> {
        self.migration.as_ref()
    }

    pub fn snapshot(&self) -> &StorageSnapshot {
        &self.snapshot
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.snapshot.metadata
    }

    // --- Caller-facing writes ---

    /// Record a new activity. Always succeeds locally once the fields are
    /// valid; the record starts `Local` and is queued for sync.
    pub fn create(&mut self, fields: ActivityFields, now: Timestamp) -> Result<ActivityRecord> {
        fields.validate()?;
        let record = ActivityRecord::new(create_identifier(), fields, now);
        self.commit(|snapshot| {
            snapshot.enqueue(&record.id);
            snapshot.insert(record.clone());
            Ok(())
        })?;
        Ok(record)
    }

    /// Apply a local edit to an existing activity.
    pub fn update(
        &mut self,
        id: &str,
        fields: ActivityFields,
        now: Timestamp,
    ) -> Result<ActivityRecord> {
        fields.validate()?;
        self.update_record(id, |record| {
            record.edit(fields, now);
            Ok(())
        })
    }

    // --- Record-level CRUD ---

    pub fn get(&self, id: &str) -> Option<&ActivityRecord> {
        self.snapshot.get(id)
    }

    /// Insert or replace a record after validating it.
    pub fn put(&mut self, record: ActivityRecord) -> Result<()> {
        record.validate()?;
        if let Some(existing) = self.snapshot.get(&record.id) {
            if record.version < existing.version {
                return Err(Error::InvalidRecord {
                    id: record.id,
                    reason: format!(
                        "version would decrease from {} to {}",
                        existing.version, record.version
                    ),
                });
            }
        }
        check_server_id(&self.snapshot, &record)?;

        self.commit(|snapshot| {
            sync_queue_membership(snapshot, &record);
            snapshot.insert(record);
            Ok(())
        })
    }

    /// Remove a record. Returns the removed record, or `None` if it did not
    /// exist. No tombstone is kept.
    pub fn delete(&mut self, id: &str) -> Result<Option<ActivityRecord>> {
        if !self.snapshot.activities.contains_key(id) {
            return Ok(None);
        }
        self.commit(|snapshot| {
            snapshot.dequeue(id);
            Ok(snapshot.activities.remove(id))
        })
    }

    /// All records in id (creation) order, optionally for one owner.
    pub fn list_all(&self, owner: Option<&str>) -> Vec<&ActivityRecord> {
        self.snapshot
            .activities
            .values()
            .filter(|r| owner.map_or(true, |o| r.owner() == o))
            .collect()
    }

    pub fn find_by_server_id(&self, server_id: &str) -> Option<&ActivityRecord> {
        self.snapshot
            .activities
            .values()
            .find(|r| r.server_id.as_deref() == Some(server_id))
    }

    /// Distinct owners with at least one local record.
    pub fn owners(&self) -> Vec<String> {
        let mut owners: Vec<String> = self
            .snapshot
            .activities
            .values()
            .map(|r| r.owner().to_string())
            .collect();
        owners.sort();
        owners.dedup();
        owners
    }

    // --- Sync bookkeeping ---

    /// Ids of records awaiting a push: queue order first, then any pending
    /// record the queue missed, in id order.
    pub fn pending_ids(&self) -> Vec<RecordId> {
        let is_pending = |id: &str| self.snapshot.get(id).is_some_and(|r| r.status.is_pending());

        let mut ids: Vec<RecordId> = self
            .snapshot
            .sync_queue
            .iter()
            .filter(|id| is_pending(id))
            .cloned()
            .collect();
        for record in self.snapshot.activities.values() {
            if record.status.is_pending() && !ids.contains(&record.id) {
                ids.push(record.id.clone());
            }
        }
        ids
    }

    pub fn pending_count(&self) -> usize {
        self.snapshot.pending_count()
    }

    /// Mutate one record in place. The closure's changes are validated and
    /// persisted together; on any error nothing changes.
    pub fn update_record<F>(&mut self, id: &str, f: F) -> Result<ActivityRecord>
    where
        F: FnOnce(&mut ActivityRecord) -> Result<()>,
    {
        let mut record = self
            .snapshot
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ActivityNotFound(id.to_string()))?;
        let before = record.version;

        f(&mut record)?;

        record.validate()?;
        if record.version < before {
            return Err(Error::InvalidRecord {
                id: record.id,
                reason: "version decreased".into(),
            });
        }
        check_server_id(&self.snapshot, &record)?;

        self.commit(|snapshot| {
            sync_queue_membership(snapshot, &record);
            snapshot.insert(record.clone());
            Ok(())
        })?;
        Ok(record)
    }

    /// Append a conflict resolution to the log.
    pub fn record_conflict(&mut self, entry: ConflictEntry) -> Result<()> {
        self.commit(|snapshot| {
            snapshot.metadata.conflict_log.push(entry);
            Ok(())
        })
    }

    pub fn set_last_sync_time(&mut self, time: Timestamp) -> Result<()> {
        self.commit(|snapshot| {
            snapshot.metadata.last_sync_time = Some(time);
            Ok(())
        })
    }

    /// Apply the actions of a pull plan in one write.
    ///
    /// Actions whose preconditions no longer hold (the record was edited,
    /// deleted or linked since planning) are skipped.
    pub fn apply_pull(&mut self, actions: Vec<PullAction>) -> Result<PullSummary> {
        if actions.is_empty() {
            return Ok(PullSummary::default());
        }

        self.commit(|snapshot| {
            let mut summary = PullSummary::default();

            for action in actions {
                match action {
                    PullAction::Insert(record) => {
                        let linked = record
                            .server_id
                            .as_deref()
                            .is_some_and(|sid| holder_of(snapshot, sid).is_some());
                        if snapshot.activities.contains_key(&record.id) || linked {
                            summary.skipped += 1;
                            continue;
                        }
                        record.validate()?;
                        snapshot.insert(record);
                        summary.inserted += 1;
                    }
                    PullAction::Link { id, remote } => {
                        if holder_of(snapshot, &remote.id).is_some() {
                            summary.skipped += 1;
                            continue;
                        }
                        let Some(record) = snapshot.activities.get_mut(&id) else {
                            summary.skipped += 1;
                            continue;
                        };
                        if record.server_id.is_some() || record.status == SyncStatus::Syncing {
                            summary.skipped += 1;
                            continue;
                        }
                        if record.fields == remote.fields {
                            record.adopt_remote(
                                remote.id,
                                remote.version,
                                remote.fields,
                                remote.updated_at,
                            );
                            snapshot.dequeue(&id);
                        } else {
                            // Different content: keep the local edit pending;
                            // the next push updates the linked remote copy.
                            record.server_id = Some(remote.id);
                        }
                        summary.linked += 1;
                    }
                    PullAction::Refresh { id, remote } => {
                        let Some(record) = snapshot.activities.get_mut(&id) else {
                            summary.skipped += 1;
                            continue;
                        };
                        if record.status != SyncStatus::Synced
                            || record.server_id.as_deref() != Some(remote.id.as_str())
                        {
                            summary.skipped += 1;
                            continue;
                        }
                        record.adopt_remote(
                            remote.id,
                            remote.version,
                            remote.fields,
                            remote.updated_at,
                        );
                        summary.refreshed += 1;
                    }
                }
            }

            Ok(summary)
        })
    }

    /// Remove several records in one write. Returns the removed records.
    pub fn remove_ids(&mut self, ids: &[RecordId]) -> Result<Vec<ActivityRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.commit(|snapshot| {
            let removed = ids
                .iter()
                .filter_map(|id| {
                    snapshot.dequeue(id);
                    snapshot.activities.remove(id)
                })
                .collect();
            Ok(removed)
        })
    }

    // --- Whole-state persistence ---

    /// A copy of the current state.
    pub fn export_snapshot(&self) -> StorageSnapshot {
        self.snapshot.clone()
    }

    /// Replace all state with `snapshot` after validating it.
    pub fn import_snapshot(&mut self, snapshot: StorageSnapshot) -> Result<()> {
        snapshot.validate()?;
        self.commit(|current| {
            *current = snapshot;
            Ok(())
        })
    }

    fn commit<T>(&mut self, f: impl FnOnce(&mut StorageSnapshot) -> Result<T>) -> Result<T> {
        let mut next = self.snapshot.clone();
        let out = f(&mut next)?;
        let document = next.to_json()?;
        self.backend.save(&self.key, &document)?;
        self.snapshot = next;
        Ok(out)
    }
}

fn holder_of<'a>(snapshot: &'a StorageSnapshot, server_id: &str) -> Option<&'a ActivityRecord> {
    snapshot
        .activities
        .values()
        .find(|r| r.server_id.as_deref() == Some(server_id))
}

/// Reject a record whose server id another record already holds.
fn check_server_id(snapshot: &StorageSnapshot, record: &ActivityRecord) -> Result<()> {
    if let Some(server_id) = &record.server_id {
        if let Some(other) = holder_of(snapshot, server_id) {
            if other.id != record.id {
                return Err(Error::InvalidRecord {
                    id: record.id.clone(),
                    reason: format!("server id {server_id} already linked to {}", other.id),
                });
            }
        }
    }
    Ok(())
}

/// Keep the advisory queue in step with the record's status.
fn sync_queue_membership(snapshot: &mut StorageSnapshot, record: &ActivityRecord) {
    if record.status.is_pending() {
        snapshot.enqueue(&record.id);
    } else if record.status == SyncStatus::Synced {
        snapshot.dequeue(&record.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ConflictResolution;
    use crate::wire::RemoteActivity;
    use crate::ActivityType;
    use serde_json::json;

    fn nap(start: Timestamp) -> ActivityFields {
        ActivityFields::new("baby-1", ActivityType::Sleep, start).with_end_time(start + 3_600_000)
    }

    fn remote(id: &str, client_id: Option<&str>, fields: ActivityFields, updated_at: Timestamp) -> RemoteActivity {
        RemoteActivity {
            id: id.into(),
            client_id: client_id.map(Into::into),
            version: 1,
            updated_at,
            fields,
        }
    }

    fn mark_synced(store: &mut LocalStore, id: &str, server_id: &str) {
        store
            .update_record(id, |r| {
                r.begin_sync()?;
                r.confirm_synced(server_id.into(), r.version, None)
            })
            .unwrap();
    }

    #[test]
    fn create_and_get() {
        let mut store = LocalStore::in_memory(0).unwrap();
        let record = store.create(nap(1_000), 5_000).unwrap();

        let stored = store.get(&record.id).unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.status, SyncStatus::Local);
        assert_eq!(stored.last_modified, 5_000);
        assert_eq!(store.snapshot().sync_queue, vec![record.id.clone()]);
    }

    #[test]
    fn create_rejects_invalid_fields() {
        let mut store = LocalStore::in_memory(0).unwrap();
        let result = store.create(ActivityFields::new("", ActivityType::Sleep, 0), 5_000);
        assert!(matches!(result, Err(Error::InvalidActivity(_))));
        assert!(store.list_all(None).is_empty());
    }

    #[test]
    fn identical_creates_are_not_deduplicated() {
        let mut store = LocalStore::in_memory(0).unwrap();
        let a = store.create(nap(1_000), 5_000).unwrap();
        let b = store.create(nap(1_000), 5_000).unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(store.list_all(None).len(), 2);
    }

    #[test]
    fn update_bumps_version() {
        let mut store = LocalStore::in_memory(0).unwrap();
        let record = store.create(nap(1_000), 5_000).unwrap();
        mark_synced(&mut store, &record.id, "42");

        let updated = store
            .update(&record.id, nap(1_000).with_details("restless"), 6_000)
            .unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(updated.status, SyncStatus::Local);
        assert_eq!(updated.server_id.as_deref(), Some("42"));
        assert_eq!(store.pending_ids(), vec![record.id]);
    }

    #[test]
    fn update_missing_record() {
        let mut store = LocalStore::in_memory(0).unwrap();
        let result = store.update("nope", nap(1_000), 5_000);
        assert!(matches!(result, Err(Error::ActivityNotFound(id)) if id == "nope"));
    }

    #[test]
    fn put_rejects_invariant_violations() {
        let mut store = LocalStore::in_memory(0).unwrap();

        let mut synced_without_id = ActivityRecord::new("a", nap(1_000), 5_000);
        synced_without_id.status = SyncStatus::Synced;
        assert!(store.put(synced_without_id).is_err());

        let mut stale_hash = ActivityRecord::new("a", nap(1_000), 5_000);
        stale_hash.content_hash = "0".repeat(64);
        assert!(store.put(stale_hash).is_err());

        assert!(store.get("a").is_none());
    }

    #[test]
    fn put_rejects_version_decrease() {
        let mut store = LocalStore::in_memory(0).unwrap();
        let mut record = ActivityRecord::new("a", nap(1_000), 5_000);
        record.version = 3;
        store.put(record.clone()).unwrap();

        record.version = 2;
        assert!(matches!(store.put(record), Err(Error::InvalidRecord { .. })));
        assert_eq!(store.get("a").unwrap().version, 3);
    }

    #[test]
    fn put_rejects_shared_server_id() {
        let mut store = LocalStore::in_memory(0).unwrap();
        store
            .put(ActivityRecord::from_remote("a", "42".into(), 1, nap(1_000), 5_000))
            .unwrap();

        let result = store.put(ActivityRecord::from_remote("b", "42".into(), 1, nap(2_000), 5_000));
        assert!(matches!(result, Err(Error::InvalidRecord { .. })));
    }

    #[test]
    fn delete_removes_record_and_queue_entry() {
        let mut store = LocalStore::in_memory(0).unwrap();
        let record = store.create(nap(1_000), 5_000).unwrap();

        let removed = store.delete(&record.id).unwrap();
        assert_eq!(removed.map(|r| r.id), Some(record.id.clone()));
        assert!(store.get(&record.id).is_none());
        assert!(store.snapshot().sync_queue.is_empty());

        assert_eq!(store.delete(&record.id).unwrap(), None);
    }

    #[test]
    fn list_all_filters_by_owner() {
        let mut store = LocalStore::in_memory(0).unwrap();
        store.create(nap(1_000), 5_000).unwrap();
        store
            .create(ActivityFields::new("baby-2", ActivityType::Diaper, 2_000), 5_000)
            .unwrap();

        assert_eq!(store.list_all(None).len(), 2);
        assert_eq!(store.list_all(Some("baby-2")).len(), 1);
        assert_eq!(store.owners(), vec!["baby-1", "baby-2"]);
    }

    #[test]
    fn list_all_is_in_creation_order() {
        let mut store = LocalStore::in_memory(0).unwrap();
        let ids: Vec<_> = (0..5)
            .map(|i| store.create(nap(i * 10), 5_000).unwrap().id)
            .collect();

        let listed: Vec<_> = store.list_all(None).iter().map(|r| r.id.clone()).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn pending_ids_include_unqueued_failures() {
        let mut store = LocalStore::in_memory(0).unwrap();
        let a = store.create(nap(1_000), 5_000).unwrap();
        let b = store.create(nap(2_000), 5_000).unwrap();
        store
            .update_record(&b.id, |r| {
                r.begin_sync()?;
                r.fail_sync()
            })
            .unwrap();

        let mut snapshot = store.export_snapshot();
        snapshot.sync_queue.clear();
        store.import_snapshot(snapshot).unwrap();

        assert_eq!(store.pending_ids(), vec![a.id, b.id]);
        assert_eq!(store.pending_count(), 2);
    }

    #[test]
    fn failed_write_leaves_state_untouched() {
        let backend = MemoryBackend::new();
        let mut store = LocalStore::open(backend.clone(), "k", 0).unwrap();
        let record = store.create(nap(1_000), 5_000).unwrap();

        backend.set_fail_writes(true);
        let result = store.update(&record.id, nap(1_000).with_details("lost"), 6_000);

        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(store.get(&record.id).unwrap().version, 1);
        assert_eq!(store.get(&record.id).unwrap().fields.details, None);
    }

    #[test]
    fn reopen_restores_state() {
        let backend = MemoryBackend::new();
        let id = {
            let mut store = LocalStore::open(backend.clone(), "k", 0).unwrap();
            store.create(nap(1_000), 5_000).unwrap().id
        };

        let store = LocalStore::open(backend, "k", 9_000).unwrap();
        assert!(store.get(&id).is_some());
        assert_eq!(store.metadata().created_at, 0);
        assert!(store.migration_report().is_none());
    }

    #[test]
    fn open_recovers_interrupted_attempts() {
        let backend = MemoryBackend::new();
        let id = {
            let mut store = LocalStore::open(backend.clone(), "k", 0).unwrap();
            let id = store.create(nap(1_000), 5_000).unwrap().id;
            store.update_record(&id, |r| r.begin_sync()).unwrap();
            id
        };

        let store = LocalStore::open(backend, "k", 9_000).unwrap();
        assert_eq!(store.get(&id).unwrap().status, SyncStatus::Local);
        assert_eq!(store.pending_ids(), vec![id]);
    }

    #[test]
    fn open_prunes_dangling_queue_entries() {
        let mut snapshot = StorageSnapshot::new(0);
        snapshot.sync_queue.push("ghost".into());
        let backend = MemoryBackend::new().with_document("k", snapshot.to_json().unwrap());

        let store = LocalStore::open(backend.clone(), "k", 0).unwrap();
        assert!(store.snapshot().sync_queue.is_empty());
        assert!(!backend.document("k").unwrap().contains("ghost"));
    }

    #[test]
    fn open_migrates_legacy_document() {
        let legacy = json!({
            "activities": [{
                "id": "old-1",
                "babyId": "baby-1",
                "type": "sleep",
                "startTime": 1000,
                "synced": true,
                "serverId": "7"
            }],
            "metadata": { "version": "1.0" }
        });
        let backend = MemoryBackend::new().with_document("k", legacy.to_string());

        let store = LocalStore::open(backend.clone(), "k", 9_000).unwrap();

        let report = store.migration_report().unwrap();
        assert_eq!(report.from_version, 1);
        assert_eq!(report.migrated, 1);
        assert_eq!(store.get("old-1").unwrap().status, SyncStatus::Synced);

        let persisted: serde_json::Value =
            serde_json::from_str(&backend.document("k").unwrap()).unwrap();
        assert_eq!(persisted["metadata"]["schemaVersion"], SCHEMA_VERSION);
    }

    #[test]
    fn open_rejects_future_schema() {
        let document = json!({ "activities": [], "metadata": { "schemaVersion": 99 } });
        let backend = MemoryBackend::new().with_document("k", document.to_string());

        let result = LocalStore::open(backend, "k", 0);
        assert!(matches!(result, Err(Error::UnsupportedSchema { found: 99, .. })));
    }

    #[test]
    fn open_rejects_garbage() {
        let backend = MemoryBackend::new().with_document("k", "{not json");
        assert!(matches!(
            LocalStore::open(backend, "k", 0),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn file_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let backend = FileBackend::new(dir.path()).unwrap();
            let mut store = LocalStore::open(backend, "activities", 0).unwrap();
            store.create(nap(1_000), 5_000).unwrap().id
        };

        assert!(dir.path().join("activities.json").exists());
        assert!(!dir.path().join("activities.json.tmp").exists());

        let backend = FileBackend::new(dir.path()).unwrap();
        let store = LocalStore::open(backend, "activities", 0).unwrap();
        assert!(store.get(&id).is_some());
    }

    #[test]
    fn file_backend_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        assert!(backend.load("../escape").is_err());
    }

    #[test]
    fn conflict_log_is_append_only() {
        let mut store = LocalStore::in_memory(0).unwrap();
        for resolved_at in [1, 2] {
            store
                .record_conflict(ConflictEntry {
                    record_id: "a".into(),
                    resolution: ConflictResolution::RemoteWins,
                    local_modified: 0,
                    remote_modified: 0,
                    resolved_at,
                })
                .unwrap();
        }

        let log = &store.metadata().conflict_log;
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].resolved_at, 2);
    }

    #[test]
    fn apply_pull_inserts_links_and_refreshes() {
        let mut store = LocalStore::in_memory(0).unwrap();
        let unlinked = store.create(nap(1_000), 5_000).unwrap();
        let settled = store.create(nap(2_000), 5_000).unwrap();
        mark_synced(&mut store, &settled.id, "50");

        let actions = vec![
            PullAction::Insert(ActivityRecord::from_remote("new", "51".into(), 3, nap(3_000), 7_000)),
            PullAction::Link {
                id: unlinked.id.clone(),
                remote: remote("52", Some(unlinked.id.as_str()), nap(1_000), 6_000),
            },
            PullAction::Refresh {
                id: settled.id.clone(),
                remote: remote("50", None, nap(2_000).with_details("other device"), 8_000),
            },
        ];

        let summary = store.apply_pull(actions).unwrap();
        assert_eq!(
            summary,
            PullSummary { inserted: 1, linked: 1, refreshed: 1, skipped: 0 }
        );

        let inserted = store.get("new").unwrap();
        assert_eq!(inserted.status, SyncStatus::Synced);
        assert_eq!(inserted.version, 3);

        let linked = store.get(&unlinked.id).unwrap();
        assert_eq!(linked.server_id.as_deref(), Some("52"));
        assert_eq!(linked.status, SyncStatus::Synced);
        assert_eq!(linked.version, 1);
        assert!(store.pending_ids().is_empty());

        let refreshed = store.get(&settled.id).unwrap();
        assert_eq!(refreshed.fields.details.as_deref(), Some("other device"));
        assert_eq!(refreshed.version, 2);
        assert_eq!(refreshed.last_modified, 8_000);
    }

    #[test]
    fn link_with_different_content_stays_pending() {
        let mut store = LocalStore::in_memory(0).unwrap();
        let record = store.create(nap(1_000), 5_000).unwrap();

        store
            .apply_pull(vec![PullAction::Link {
                id: record.id.clone(),
                remote: remote("52", Some(record.id.as_str()), nap(1_000).with_details("older"), 4_000),
            }])
            .unwrap();

        let linked = store.get(&record.id).unwrap();
        assert_eq!(linked.server_id.as_deref(), Some("52"));
        assert_eq!(linked.status, SyncStatus::Local);
        assert_eq!(store.pending_ids(), vec![record.id]);
    }

    #[test]
    fn apply_pull_skips_stale_actions() {
        let mut store = LocalStore::in_memory(0).unwrap();
        let record = store.create(nap(1_000), 5_000).unwrap();
        mark_synced(&mut store, &record.id, "50");

        let summary = store
            .apply_pull(vec![
                PullAction::Insert(ActivityRecord::from_remote("x", "50".into(), 1, nap(9), 1)),
                PullAction::Refresh {
                    id: "gone".into(),
                    remote: remote("60", None, nap(1), 1),
                },
            ])
            .unwrap();

        assert_eq!(summary.skipped, 2);
        assert!(store.get("x").is_none());
    }

    #[test]
    fn remove_ids_in_one_write() {
        let mut store = LocalStore::in_memory(0).unwrap();
        let a = store.create(nap(1_000), 5_000).unwrap();
        let b = store.create(nap(2_000), 5_000).unwrap();

        let removed = store.remove_ids(&[a.id.clone(), "ghost".into()]).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(store.get(&a.id).is_none());
        assert!(store.get(&b.id).is_some());
    }

    #[test]
    fn import_rejects_invalid_snapshot() {
        let mut store = LocalStore::in_memory(0).unwrap();
        let record = store.create(nap(1_000), 5_000).unwrap();

        let mut snapshot = StorageSnapshot::new(0);
        let mut bad = ActivityRecord::new("bad", nap(1), 1);
        bad.version = 0;
        snapshot.insert(bad);

        assert!(store.import_snapshot(snapshot).is_err());
        assert!(store.get(&record.id).is_some());
    }

    #[test]
    fn update_record_validates_before_commit() {
        let mut store = LocalStore::in_memory(0).unwrap();
        let record = store.create(nap(1_000), 5_000).unwrap();

        let result = store.update_record(&record.id, |r| {
            r.status = SyncStatus::Synced;
            Ok(())
        });

        assert!(result.is_err());
        assert_eq!(store.get(&record.id).unwrap().status, SyncStatus::Local);
    }
}
