//! Request and response bodies of the remote activities API.
//!
//! Shared by the HTTP client and the reference server so both sides agree on
//! the JSON shape. Business fields are flattened into each body.

use crate::{ActivityFields, RecordId, ServerId, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// Body of `POST /activities`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateActivityRequest {
    /// Local identifier; the server deduplicates creates on it
    pub client_id: RecordId,
    pub client_version: Version,
    /// Client `lastModified` at send time
    pub modified_at: Timestamp,
    #[serde(flatten)]
    pub fields: ActivityFields,
}

/// Body of `PATCH /activities/{serverId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateActivityRequest {
    /// Optimistic concurrency token
    pub client_version: Version,
    pub modified_at: Timestamp,
    /// Overwrite regardless of the stored version
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
    #[serde(flatten)]
    pub fields: ActivityFields,
}

/// An activity as the server stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteActivity {
    pub id: ServerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<RecordId>,
    pub version: Version,
    /// Server-side modification time
    pub updated_at: Timestamp,
    #[serde(flatten)]
    pub fields: ActivityFields,
}

/// Pagination block of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    /// 1-based page number
    pub page: u32,
    pub total_count: u64,
    pub total_pages: u32,
    pub has_more: bool,
}

/// Body of `GET /activities`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPage {
    pub data: Vec<RemoteActivity>,
    pub pagination: Pagination,
}

/// Body of a `409 Conflict` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictBody {
    pub error: String,
    /// The server's current copy
    pub current: RemoteActivity,
}

/// Generic error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
