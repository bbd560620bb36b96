//! Activity records and their sync state machine.

use crate::identity::compute_content_hash;
use crate::{error::Result, Error, RecordId, ServerId, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of care event being logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    Feeding,
    Sleep,
    Diaper,
    Growth,
    Health,
    Leisure,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Feeding => "feeding",
            ActivityType::Sleep => "sleep",
            ActivityType::Diaper => "diaper",
            ActivityType::Growth => "growth",
            ActivityType::Health => "health",
            ActivityType::Leisure => "leisure",
        }
    }

    /// Parse a type name, accepting a few spellings older clients stored.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "feeding" | "feed" => Some(ActivityType::Feeding),
            "sleep" | "nap" => Some(ActivityType::Sleep),
            "diaper" | "diapering" | "nappy" => Some(ActivityType::Diaper),
            "growth" => Some(ActivityType::Growth),
            "health" => Some(ActivityType::Health),
            "leisure" | "play" => Some(ActivityType::Leisure),
            _ => None,
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync status of a record.
///
/// `Local -> Syncing -> {Synced | SyncFailed}`, `SyncFailed -> Syncing`,
/// and a local edit moves any settled state back to `Local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Written locally, not yet confirmed remotely
    Local,
    /// A remote write is in flight
    Syncing,
    /// Confirmed by the remote authority
    Synced,
    /// Last attempt failed; needs a retry or user attention
    SyncFailed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Local => "local",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::SyncFailed => "sync_failed",
        }
    }

    /// Whether a batch push should pick this record up.
    pub fn is_pending(&self) -> bool {
        matches!(self, SyncStatus::Local | SyncStatus::SyncFailed)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The business fields of an activity. Everything here feeds the content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityFields {
    /// Baby this activity belongs to (the owner scope)
    pub baby_id: String,
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Start of the activity (milliseconds since epoch)
    pub start_time: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Free-text notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ActivityFields {
    /// Minimal fields for an activity starting at `start_time`.
    pub fn new(
        baby_id: impl Into<String>,
        activity_type: ActivityType,
        start_time: Timestamp,
    ) -> Self {
        Self {
            baby_id: baby_id.into(),
            activity_type,
            subtype: None,
            start_time,
            end_time: None,
            amount: None,
            unit: None,
            category: None,
            details: None,
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn with_end_time(mut self, end_time: Timestamp) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn with_amount(mut self, amount: f64, unit: impl Into<String>) -> Self {
        self.amount = Some(amount);
        self.unit = Some(unit.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Check the fields are well formed.
    pub fn validate(&self) -> Result<()> {
        if self.baby_id.trim().is_empty() {
            return Err(Error::InvalidActivity("baby reference is required".into()));
        }
        if let Some(end) = self.end_time {
            if end < self.start_time {
                return Err(Error::InvalidActivity(format!(
                    "end time {end} is before start time {}",
                    self.start_time
                )));
            }
        }
        if let Some(amount) = self.amount {
            if !amount.is_finite() || amount < 0.0 {
                return Err(Error::InvalidActivity(format!(
                    "amount must be a non-negative number, got {amount}"
                )));
            }
        } else if self.unit.is_some() {
            return Err(Error::InvalidActivity("unit given without an amount".into()));
        }
        Ok(())
    }
}

/// A locally replicated activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    /// Client-generated, sortable, immutable primary key
    pub id: RecordId,
    /// Identifier assigned by the remote authority after the first
    /// successful write
    pub server_id: Option<ServerId>,
    /// Incremented on every local mutation
    pub version: Version,
    pub status: SyncStatus,
    /// Time of the most recent local mutation
    pub last_modified: Timestamp,
    pub created_at: Timestamp,
    /// Digest of the business fields
    pub content_hash: String,
    #[serde(flatten)]
    pub fields: ActivityFields,
}

impl ActivityRecord {
    /// Create a fresh local record (`version = 1`, `status = Local`).
    pub fn new(id: impl Into<RecordId>, fields: ActivityFields, now: Timestamp) -> Self {
        let content_hash = compute_content_hash(&fields);
        Self {
            id: id.into(),
            server_id: None,
            version: 1,
            status: SyncStatus::Local,
            last_modified: now,
            created_at: now,
            content_hash,
            fields,
        }
    }

    /// Build a record for an activity that only exists remotely so far.
    pub fn from_remote(
        id: impl Into<RecordId>,
        server_id: ServerId,
        version: Version,
        fields: ActivityFields,
        modified_at: Timestamp,
    ) -> Self {
        let mut record = Self::new(id, fields, modified_at);
        record.server_id = Some(server_id);
        record.version = version.max(1);
        record.status = SyncStatus::Synced;
        record
    }

    pub fn owner(&self) -> &str {
        &self.fields.baby_id
    }

    /// Apply a local edit.
    ///
    /// Bumps the version and rehashes. The status returns to `Local` unless
    /// an attempt is in flight; in that case it stays `Syncing` and the sync
    /// engine notices the newer version when the attempt settles.
    pub fn edit(&mut self, fields: ActivityFields, now: Timestamp) {
        self.fields = fields;
        self.content_hash = compute_content_hash(&self.fields);
        self.version += 1;
        self.last_modified = self.last_modified.max(now);
        if self.status != SyncStatus::Syncing {
            self.status = SyncStatus::Local;
        }
    }

    /// `Local | SyncFailed -> Syncing`.
    pub fn begin_sync(&mut self) -> Result<()> {
        if !self.status.is_pending() {
            return Err(self.transition_error(SyncStatus::Syncing));
        }
        self.status = SyncStatus::Syncing;
        Ok(())
    }

    /// `Syncing -> Synced`, recording the server-confirmed state.
    ///
    /// Server-normalized fields are taken over without a version bump (no
    /// local mutation happened); the version only catches up with the
    /// server's token so the next update is not behind it.
    pub fn confirm_synced(
        &mut self,
        server_id: ServerId,
        server_version: Version,
        server_fields: Option<ActivityFields>,
    ) -> Result<()> {
        if self.status != SyncStatus::Syncing {
            return Err(self.transition_error(SyncStatus::Synced));
        }
        if let Some(fields) = server_fields {
            if fields != self.fields {
                self.fields = fields;
                self.content_hash = compute_content_hash(&self.fields);
            }
        }
        self.server_id = Some(server_id);
        self.version = self.version.max(server_version);
        self.status = SyncStatus::Synced;
        Ok(())
    }

    /// `Syncing -> Local`: the remote write succeeded but a newer local edit
    /// landed meanwhile. The server identity is kept so the next attempt
    /// updates instead of creating a duplicate.
    pub fn confirm_superseded(&mut self, server_id: ServerId, server_version: Version) -> Result<()> {
        if self.status != SyncStatus::Syncing {
            return Err(self.transition_error(SyncStatus::Local));
        }
        self.server_id = Some(server_id);
        self.version = self.version.max(server_version);
        self.status = SyncStatus::Local;
        Ok(())
    }

    /// `Syncing -> SyncFailed`.
    pub fn fail_sync(&mut self) -> Result<()> {
        if self.status != SyncStatus::Syncing {
            return Err(self.transition_error(SyncStatus::SyncFailed));
        }
        self.status = SyncStatus::SyncFailed;
        Ok(())
    }

    /// `Syncing -> Local`: the attempt ended without a verdict (offline) or
    /// was overtaken by a local edit.
    pub fn release_to_local(&mut self) -> Result<()> {
        if self.status != SyncStatus::Syncing {
            return Err(self.transition_error(SyncStatus::Local));
        }
        self.status = SyncStatus::Local;
        Ok(())
    }

    /// Take over the remote copy's business fields verbatim and mark the
    /// record `Synced`.
    pub fn adopt_remote(
        &mut self,
        server_id: ServerId,
        server_version: Version,
        fields: ActivityFields,
        modified_at: Timestamp,
    ) {
        if fields != self.fields {
            self.fields = fields;
            self.content_hash = compute_content_hash(&self.fields);
            self.version += 1;
        }
        self.version = self.version.max(server_version);
        self.last_modified = self.last_modified.max(modified_at);
        self.server_id = Some(server_id);
        self.status = SyncStatus::Synced;
    }

    /// Forget the server identity after the remote copy was confirmed
    /// missing. Only valid while an attempt is in flight.
    pub fn unlink(&mut self) -> Result<()> {
        if self.status != SyncStatus::Syncing {
            return Err(Error::InvalidRecord {
                id: self.id.clone(),
                reason: format!("cannot clear server id while {}", self.status),
            });
        }
        self.server_id = None;
        Ok(())
    }

    /// Check the record-level invariants.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidRecord {
            id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("empty id".into()));
        }
        if self.version == 0 {
            return Err(invalid("version must start at 1".into()));
        }
        if self.status == SyncStatus::Synced && self.server_id.is_none() {
            return Err(invalid("synced record has no server id".into()));
        }
        if self.content_hash != compute_content_hash(&self.fields) {
            return Err(invalid("content hash does not match fields".into()));
        }
        self.fields.validate()
    }

    fn transition_error(&self, to: SyncStatus) -> Error {
        Error::InvalidTransition {
            id: self.id.clone(),
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }
}
