//! One-time upgrade of older on-disk documents.
//!
//! Schema 1 documents were written by clients that stored activities as
//! loosely typed JSON objects with a boolean "synced" flag instead of a
//! status. Migration keeps every record that can be repaired, infers missing
//! fields, and reports the ones it had to drop.

use crate::identity::create_identifier;
use crate::record::{ActivityFields, ActivityType};
use crate::snapshot::{ConflictEntry, SnapshotMetadata, SCHEMA_VERSION};
use crate::{
    error::Result, ActivityRecord, Error, SchemaVersion, StorageSnapshot, SyncStatus, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};

/// What a migration did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub from_version: SchemaVersion,
    pub to_version: SchemaVersion,
    pub migrated: usize,
    pub dropped: Vec<DroppedRecord>,
    /// Kept records whose fields had to be corrected
    #[serde(default)]
    pub repaired: Vec<RepairedRecord>,
}

/// A legacy record that could not be carried over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroppedRecord {
    pub id: Option<String>,
    pub reason: String,
}

/// A legacy record that was kept after correcting its fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairedRecord {
    pub id: String,
    pub repairs: Vec<String>,
}

/// Read the schema version of a stored document.
///
/// Documents without a usable version tag are treated as schema 1; a bare
/// array of activities predates the envelope and is schema 0.
pub fn detect_schema_version(document: &Value) -> SchemaVersion {
    if document.is_array() {
        return 0;
    }

    let metadata = document.get("metadata");
    let tagged = metadata
        .and_then(|m| m.get("schemaVersion"))
        .and_then(Value::as_u64)
        .or_else(|| {
            // Schema 1 wrote a "major.minor" string.
            metadata
                .and_then(|m| m.get("version"))
                .and_then(Value::as_str)
                .and_then(|v| v.split('.').next())
                .and_then(|major| major.parse().ok())
        });

    tagged
        .and_then(|v| SchemaVersion::try_from(v).ok())
        .unwrap_or(1)
}

/// Upgrade a stored document to the current schema.
pub fn migrate(document: Value, now: Timestamp) -> Result<(StorageSnapshot, MigrationReport)> {
    let from_version = detect_schema_version(&document);

    if from_version > SCHEMA_VERSION {
        return Err(Error::UnsupportedSchema {
            found: from_version,
            supported: SCHEMA_VERSION,
        });
    }

    if from_version == SCHEMA_VERSION {
        let snapshot: StorageSnapshot =
            serde_json::from_value(document).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        let report = MigrationReport {
            from_version,
            to_version: SCHEMA_VERSION,
            migrated: snapshot.activities.len(),
            dropped: Vec::new(),
            repaired: Vec::new(),
        };
        return Ok((snapshot, report));
    }

    let (raw_activities, raw_queue, raw_metadata) = match document {
        Value::Array(items) => (items, Vec::new(), Map::new()),
        Value::Object(mut root) => {
            let activities = match root.remove("activities") {
                Some(Value::Array(items)) => items,
                // Some builds keyed activities by id.
                Some(Value::Object(by_id)) => by_id.into_iter().map(|(_, v)| v).collect(),
                Some(Value::Null) | None => Vec::new(),
                Some(other) => {
                    return Err(Error::InvalidSnapshot(format!(
                        "activities must be a list, found {}",
                        json_kind(&other)
                    )))
                }
            };
            let queue = match root.remove("syncQueue") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            let metadata = match root.remove("metadata") {
                Some(Value::Object(m)) => m,
                _ => Map::new(),
            };
            (activities, queue, metadata)
        }
        other => {
            return Err(Error::InvalidSnapshot(format!(
                "expected a document object, found {}",
                json_kind(&other)
            )))
        }
    };

    let created_at = raw_metadata
        .get("createdAt")
        .and_then(parse_timestamp)
        .unwrap_or(now);
    let mut snapshot = StorageSnapshot::new(created_at);
    snapshot.metadata = SnapshotMetadata {
        schema_version: SCHEMA_VERSION,
        last_sync_time: raw_metadata
            .get("lastSyncTime")
            .or_else(|| raw_metadata.get("lastSync"))
            .and_then(parse_timestamp),
        conflict_log: raw_metadata
            .get("conflictLog")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| serde_json::from_value::<ConflictEntry>(e.clone()).ok())
                    .collect()
            })
            .unwrap_or_default(),
        created_at,
    };

    let mut report = MigrationReport {
        from_version,
        to_version: SCHEMA_VERSION,
        migrated: 0,
        dropped: Vec::new(),
        repaired: Vec::new(),
    };
    let mut linked = HashSet::new();

    for raw in raw_activities {
        let Value::Object(object) = raw else {
            report.dropped.push(DroppedRecord {
                id: None,
                reason: format!("expected an object, found {}", json_kind(&raw)),
            });
            continue;
        };

        let id_hint = string_field(&object, &["id", "localId"]);
        let (mut record, repairs) = match migrate_record(&object, now) {
            Ok(migrated) => migrated,
            Err(reason) => {
                report.dropped.push(DroppedRecord { id: id_hint, reason });
                continue;
            }
        };

        if snapshot.activities.contains_key(&record.id) {
            report.dropped.push(DroppedRecord {
                id: Some(record.id),
                reason: "duplicate id".into(),
            });
            continue;
        }

        if let Some(server_id) = record.server_id.clone() {
            if !linked.insert(server_id) {
                // Two legacy rows claimed the same remote record; keep the
                // first link and push the other as new work.
                record.server_id = None;
                record.status = SyncStatus::Local;
            }
        }

        if !repairs.is_empty() {
            report.repaired.push(RepairedRecord {
                id: record.id.clone(),
                repairs,
            });
        }
        snapshot.insert(record);
        report.migrated += 1;
    }

    let mut queued = BTreeSet::new();
    for entry in &raw_queue {
        let id = match entry {
            Value::String(id) => Some(id.clone()),
            Value::Object(item) => string_field(item, &["id", "activityId", "localId"]),
            _ => None,
        };
        if let Some(id) = id {
            if snapshot.activities.contains_key(&id) && queued.insert(id.clone()) {
                snapshot.sync_queue.push(id);
            }
        }
    }
    let pending: Vec<_> = snapshot
        .activities
        .values()
        .filter(|r| r.status.is_pending())
        .map(|r| r.id.clone())
        .collect();
    for id in pending {
        snapshot.enqueue(&id);
    }

    Ok((snapshot, report))
}

fn migrate_record(
    object: &Map<String, Value>,
    now: Timestamp,
) -> std::result::Result<(ActivityRecord, Vec<String>), String> {
    let baby_id = string_field(object, &["babyId", "baby_id", "baby"])
        .ok_or_else(|| "missing baby reference".to_string())?;
    let type_name = string_field(object, &["type", "activityType"])
        .ok_or_else(|| "missing activity type".to_string())?;
    let activity_type = ActivityType::parse(&type_name)
        .ok_or_else(|| format!("unknown activity type '{type_name}'"))?;
    let start_time = timestamp_field(object, &["startTime", "start_time", "timestamp"])
        .ok_or_else(|| "missing start time".to_string())?;

    let mut fields = ActivityFields {
        baby_id,
        activity_type,
        subtype: string_field(object, &["subtype", "subType"]),
        start_time,
        end_time: timestamp_field(object, &["endTime", "end_time"]),
        amount: object.get("amount").and_then(parse_amount),
        unit: string_field(object, &["unit"]),
        category: string_field(object, &["category"]),
        details: string_field(object, &["details", "notes"]),
    };
    let repairs = repair_fields(&mut fields);
    fields.validate().map_err(|e| e.to_string())?;

    let id = string_field(object, &["id", "localId"]).unwrap_or_else(create_identifier);
    let last_modified = timestamp_field(object, &["lastModified", "updatedAt", "createdAt"])
        .unwrap_or(now);
    let created_at = timestamp_field(object, &["createdAt"]).unwrap_or(last_modified);
    let server_id = string_field(object, &["serverId", "server_id"]);

    let explicit_status = object
        .get("status")
        .and_then(|s| serde_json::from_value::<SyncStatus>(s.clone()).ok());
    let confirmed_flag = ["synced", "isSynced"]
        .iter()
        .any(|key| object.get(*key).and_then(Value::as_bool) == Some(true));

    let status = match (explicit_status, server_id.is_some()) {
        // An attempt cannot survive a restart.
        (Some(SyncStatus::Syncing), _) => SyncStatus::Local,
        (Some(SyncStatus::Synced), false) => SyncStatus::Local,
        (Some(status), _) => status,
        (None, true) if confirmed_flag => SyncStatus::Synced,
        (None, _) => SyncStatus::Local,
    };

    let mut record = ActivityRecord::new(id, fields, last_modified);
    record.created_at = created_at;
    record.server_id = server_id;
    record.version = object
        .get("version")
        .and_then(Value::as_u64)
        .unwrap_or(1)
        .max(1);
    record.status = status;

    record.validate().map_err(|e| e.to_string())?;
    Ok((record, repairs))
}

/// Correct field values that older clients accepted but that no longer
/// validate. Returns a description of each correction.
fn repair_fields(fields: &mut ActivityFields) -> Vec<String> {
    let mut repairs = Vec::new();

    if let Some(end) = fields.end_time {
        if end < fields.start_time {
            repairs.push(format!(
                "cleared end time {end} before start time {}",
                fields.start_time
            ));
            fields.end_time = None;
        }
    }
    if let Some(amount) = fields.amount {
        if !amount.is_finite() || amount < 0.0 {
            repairs.push(format!("removed invalid amount {amount}"));
            fields.amount = None;
        }
    }
    if fields.amount.is_none() {
        if let Some(unit) = fields.unit.take() {
            repairs.push(format!("removed unit '{unit}' without an amount"));
        }
    }

    repairs
}

fn string_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match object.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn timestamp_field(object: &Map<String, Value>, keys: &[&str]) -> Option<Timestamp> {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(parse_timestamp))
}

/// Accept epoch milliseconds (number or numeric string) or RFC 3339.
fn parse_timestamp(value: &Value) -> Option<Timestamp> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok().or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .and_then(|dt| u64::try_from(dt.timestamp_millis()).ok())
        }),
        _ => None,
    }
}

fn parse_amount(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn legacy_document() -> Value {
        json!({
            "activities": [
                {
                    "id": "legacy-1",
                    "babyId": "baby-1",
                    "type": "feeding",
                    "subtype": "breast",
                    "startTime": "2024-02-01T08:00:00Z",
                    "endTime": "2024-02-01T08:20:00Z",
                    "synced": true,
                    "serverId": 17,
                    "updatedAt": 1706775000000u64
                },
                {
                    "id": "legacy-2",
                    "babyId": "baby-1",
                    "activityType": "Diaper",
                    "startTime": 1706776000000u64,
                    "notes": "rash cream",
                    "synced": false
                },
                {
                    "id": "legacy-3",
                    "type": "sleep",
                    "startTime": 1706776000000u64
                }
            ],
            "syncQueue": ["legacy-2", "missing"],
            "metadata": {
                "version": "1.0",
                "lastSync": 1706770000000u64,
                "createdAt": 1706000000000u64
            }
        })
    }

    #[test]
    fn detects_versions() {
        assert_eq!(detect_schema_version(&json!([])), 0);
        assert_eq!(detect_schema_version(&json!({"metadata": {"version": "1.0"}})), 1);
        assert_eq!(detect_schema_version(&json!({})), 1);
        assert_eq!(
            detect_schema_version(&json!({"metadata": {"schemaVersion": 2}})),
            2
        );
    }

    #[test]
    fn migrates_legacy_document() {
        let (snapshot, report) = migrate(legacy_document(), 9_000).unwrap();

        assert_eq!(report.from_version, 1);
        assert_eq!(report.to_version, SCHEMA_VERSION);
        assert_eq!(report.migrated, 2);
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].id.as_deref(), Some("legacy-3"));
        assert!(report.dropped[0].reason.contains("baby"));

        assert_eq!(snapshot.metadata.schema_version, SCHEMA_VERSION);
        assert_eq!(snapshot.metadata.last_sync_time, Some(1_706_770_000_000));
        assert_eq!(snapshot.metadata.created_at, 1_706_000_000_000);
        assert!(snapshot.validate().is_ok());
    }

    #[test]
    fn confirmed_flag_becomes_synced() {
        let (snapshot, _) = migrate(legacy_document(), 9_000).unwrap();

        let first = snapshot.get("legacy-1").unwrap();
        assert_eq!(first.status, SyncStatus::Synced);
        assert_eq!(first.server_id.as_deref(), Some("17"));
        assert_eq!(first.version, 1);
        assert_eq!(first.last_modified, 1_706_775_000_000);
        assert_eq!(first.fields.start_time, 1_706_774_400_000);
        assert_eq!(first.fields.end_time, Some(1_706_775_600_000));

        let second = snapshot.get("legacy-2").unwrap();
        assert_eq!(second.status, SyncStatus::Local);
        assert_eq!(second.fields.activity_type, ActivityType::Diaper);
        assert_eq!(second.fields.details.as_deref(), Some("rash cream"));
        assert_eq!(second.last_modified, 9_000);
    }

    #[test]
    fn synced_flag_without_server_id_stays_local() {
        let document = json!({
            "activities": [{
                "id": "x",
                "babyId": "b",
                "type": "growth",
                "startTime": 1000,
                "amount": "3.4",
                "unit": "kg",
                "synced": true
            }]
        });

        let (snapshot, _) = migrate(document, 9_000).unwrap();
        let record = snapshot.get("x").unwrap();
        assert_eq!(record.status, SyncStatus::Local);
        assert_eq!(record.fields.amount, Some(3.4));
    }

    #[test]
    fn queue_is_pruned_and_completed() {
        let (snapshot, _) = migrate(legacy_document(), 9_000).unwrap();
        assert_eq!(snapshot.sync_queue, vec!["legacy-2"]);
    }

    #[test]
    fn hashes_are_recomputed() {
        let (snapshot, _) = migrate(legacy_document(), 9_000).unwrap();
        for record in snapshot.activities.values() {
            assert_eq!(
                record.content_hash,
                crate::compute_content_hash(&record.fields)
            );
        }
    }

    #[test]
    fn missing_ids_are_generated() {
        let document = json!([{ "babyId": "b", "type": "leisure", "startTime": 1000 }]);
        let (snapshot, report) = migrate(document, 9_000).unwrap();

        assert_eq!(report.from_version, 0);
        assert_eq!(snapshot.activities.len(), 1);
        let record = snapshot.activities.values().next().unwrap();
        assert!(!record.id.is_empty());
        assert_eq!(snapshot.sync_queue, vec![record.id.clone()]);
    }

    #[test]
    fn in_flight_status_restarts_as_local() {
        let document = json!({
            "activities": [{
                "id": "x", "babyId": "b", "type": "sleep", "startTime": 1000,
                "status": "syncing", "serverId": "5"
            }]
        });
        let (snapshot, _) = migrate(document, 9_000).unwrap();
        assert_eq!(snapshot.get("x").unwrap().status, SyncStatus::Local);
    }

    #[test]
    fn duplicate_rows_are_reported() {
        let document = json!({
            "activities": [
                { "id": "x", "babyId": "b", "type": "sleep", "startTime": 1000 },
                { "id": "x", "babyId": "b", "type": "sleep", "startTime": 2000 }
            ]
        });
        let (snapshot, report) = migrate(document, 9_000).unwrap();
        assert_eq!(snapshot.activities.len(), 1);
        assert_eq!(report.dropped[0].reason, "duplicate id");
    }

    #[test]
    fn shared_server_id_keeps_first_link() {
        let document = json!({
            "activities": [
                { "id": "a", "babyId": "b", "type": "sleep", "startTime": 1000, "serverId": "9", "synced": true },
                { "id": "b", "babyId": "b", "type": "sleep", "startTime": 2000, "serverId": "9", "synced": true }
            ]
        });
        let (snapshot, _) = migrate(document, 9_000).unwrap();

        assert_eq!(snapshot.get("a").unwrap().server_id.as_deref(), Some("9"));
        let second = snapshot.get("b").unwrap();
        assert_eq!(second.server_id, None);
        assert_eq!(second.status, SyncStatus::Local);
        assert!(snapshot.validate().is_ok());
    }

    #[test]
    fn repairable_fields_are_corrected_not_dropped() {
        let document = json!({
            "activities": [
                { "id": "a", "babyId": "b", "type": "feeding", "startTime": 1000, "unit": "ml" },
                { "id": "b", "babyId": "b", "type": "feeding", "startTime": 1000, "amount": -20, "unit": "ml" },
                { "id": "c", "babyId": "b", "type": "sleep", "startTime": 5000, "endTime": 4000 },
                { "id": "d", "babyId": "b", "type": "sleep", "startTime": 5000, "endTime": 6000 }
            ]
        });

        let (snapshot, report) = migrate(document, 9_000).unwrap();

        assert!(report.dropped.is_empty());
        assert_eq!(report.migrated, 4);
        assert_eq!(snapshot.activities.len(), 4);
        assert!(snapshot.validate().is_ok());

        let a = snapshot.get("a").unwrap();
        assert_eq!(a.fields.unit, None);
        let b = snapshot.get("b").unwrap();
        assert_eq!((b.fields.amount, b.fields.unit.as_deref()), (None, None));
        let c = snapshot.get("c").unwrap();
        assert_eq!(c.fields.end_time, None);
        assert_eq!(c.fields.start_time, 5_000);

        let repaired: Vec<(&str, usize)> = report
            .repaired
            .iter()
            .map(|r| (r.id.as_str(), r.repairs.len()))
            .collect();
        assert_eq!(repaired, vec![("a", 1), ("b", 2), ("c", 1)]);
        assert!(report.repaired[2].repairs[0].contains("end time 4000"));
    }

    #[test]
    fn rejects_future_schema() {
        let document = json!({ "metadata": { "schemaVersion": 7 } });
        assert!(matches!(
            migrate(document, 0),
            Err(Error::UnsupportedSchema { found: 7, .. })
        ));
    }

    #[test]
    fn current_schema_passes_through() {
        let mut snapshot = StorageSnapshot::new(5);
        snapshot.insert(ActivityRecord::new(
            "a",
            ActivityFields::new("b", ActivityType::Health, 1_000),
            2_000,
        ));
        let document = serde_json::to_value(&snapshot).unwrap();

        let (migrated, report) = migrate(document, 9_000).unwrap();
        assert_eq!(migrated, snapshot);
        assert_eq!(report.migrated, 1);
    }

    #[test]
    fn rejects_non_document() {
        assert!(matches!(
            migrate(json!("nope"), 0),
            Err(Error::InvalidSnapshot(_))
        ));
    }
}
