//! The persisted document holding the whole local replica.
//!
//! Layout: `{ activities: ActivityRecord[], syncQueue: string[], metadata }`
//! stored under a single key. Activities are kept in a `BTreeMap` in memory
//! and written as an id-ordered array, so serialization is deterministic.

use crate::{error::Result, ActivityRecord, Error, RecordId, SchemaVersion, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: SchemaVersion = 2;

/// Which side won a last-write-wins conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Local fields were forced onto the server
    LocalWins,
    /// Server fields replaced the local edit
    RemoteWins,
}

/// One entry in the append-only conflict log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEntry {
    pub record_id: RecordId,
    pub resolution: ConflictResolution,
    /// Local `lastModified` at resolution time
    pub local_modified: Timestamp,
    /// Server-reported modification time
    pub remote_modified: Timestamp,
    pub resolved_at: Timestamp,
}

/// Snapshot-level metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub schema_version: SchemaVersion,
    /// Completion time of the last batch pass
    pub last_sync_time: Option<Timestamp>,
    #[serde(default)]
    pub conflict_log: Vec<ConflictEntry>,
    pub created_at: Timestamp,
}

/// Everything the Local Store persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSnapshot {
    #[serde(with = "activity_list")]
    pub activities: BTreeMap<RecordId, ActivityRecord>,
    /// Ids awaiting a sync attempt. Advisory: the record's status is
    /// authoritative.
    #[serde(default)]
    pub sync_queue: Vec<RecordId>,
    pub metadata: SnapshotMetadata,
}

impl StorageSnapshot {
    /// Create an empty snapshot.
    pub fn new(created_at: Timestamp) -> Self {
        Self {
            activities: BTreeMap::new(),
            sync_queue: Vec::new(),
            metadata: SnapshotMetadata {
                schema_version: SCHEMA_VERSION,
                last_sync_time: None,
                conflict_log: Vec::new(),
                created_at,
            },
        }
    }

    /// Insert or replace a record.
    pub fn insert(&mut self, record: ActivityRecord) {
        self.activities.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<&ActivityRecord> {
        self.activities.get(id)
    }

    /// Append an id to the queue unless it is already queued.
    pub fn enqueue(&mut self, id: &str) {
        if !self.sync_queue.iter().any(|queued| queued == id) {
            self.sync_queue.push(id.to_string());
        }
    }

    pub fn dequeue(&mut self, id: &str) {
        self.sync_queue.retain(|queued| queued != id);
    }

    /// Number of records awaiting a push.
    pub fn pending_count(&self) -> usize {
        self.activities
            .values()
            .filter(|r| r.status.is_pending())
            .count()
    }

    /// Validate every record and the cross-record invariants.
    pub fn validate(&self) -> Result<()> {
        if self.metadata.schema_version != SCHEMA_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "schema version {} does not match {}",
                self.metadata.schema_version, SCHEMA_VERSION
            )));
        }

        let mut server_ids = BTreeMap::new();
        for (key, record) in &self.activities {
            if key != &record.id {
                return Err(Error::InvalidSnapshot(format!(
                    "record stored under '{key}' has id '{}'",
                    record.id
                )));
            }
            record.validate()?;
            if let Some(server_id) = &record.server_id {
                if let Some(other) = server_ids.insert(server_id.clone(), record.id.clone()) {
                    return Err(Error::InvalidSnapshot(format!(
                        "server id {server_id} linked to both {other} and {}",
                        record.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize a current-schema document.
    ///
    /// Older documents must go through [`crate::migrate`] first.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.metadata.schema_version > SCHEMA_VERSION {
            return Err(Error::UnsupportedSchema {
                found: snapshot.metadata.schema_version,
                supported: SCHEMA_VERSION,
            });
        }

        Ok(snapshot)
    }
}

/// Stores the activity map as an array and rejects duplicate ids on read.
mod activity_list {
    use crate::{ActivityRecord, RecordId};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(
        activities: &BTreeMap<RecordId, ActivityRecord>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(activities.values())
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<BTreeMap<RecordId, ActivityRecord>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let list = Vec::<ActivityRecord>::deserialize(deserializer)?;
        let mut activities = BTreeMap::new();
        for record in list {
            let id = record.id.clone();
            if activities.insert(id.clone(), record).is_some() {
                return Err(D::Error::custom(format!("duplicate activity id '{id}'")));
            }
        }
        Ok(activities)
    }
}
