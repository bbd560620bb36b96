//! Activity handlers - create, update, list and delete.

use crate::error::{AppError, Result};
use crate::store::{ActivityStore, UpdateRejection};
use nestlog_engine::wire::{ActivityPage, CreateActivityRequest, RemoteActivity, UpdateActivityRequest};
use nestlog_engine::Timestamp;
use serde::Deserialize;

/// Query parameters of a listing.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    /// Only activities of this baby
    pub owner: Option<String>,
    /// 1-based page number
    pub page: Option<u32>,
    /// Maximum number of activities to return
    pub limit: Option<u32>,
}

/// Default limit for listings.
const DEFAULT_LIMIT: u32 = 100;

/// Store a new activity. Returns the row and whether it was created.
pub fn handle_create(
    store: &ActivityStore,
    request: CreateActivityRequest,
) -> Result<(RemoteActivity, bool)> {
    if request.client_id.trim().is_empty() {
        return Err(AppError::BadRequest("clientId must not be empty".to_string()));
    }
    request.fields.validate()?;

    let (activity, created) = store.create(request);
    if created {
        tracing::debug!(server_id = %activity.id, "activity created");
    } else {
        tracing::debug!(server_id = %activity.id, "duplicate create answered with existing row");
    }
    Ok((activity, created))
}

/// Apply an update, refusing stale versions unless forced.
pub fn handle_update(
    store: &ActivityStore,
    id: &str,
    request: UpdateActivityRequest,
    now: Timestamp,
) -> Result<RemoteActivity> {
    request.fields.validate()?;
    let forced = request.force;

    match store.update(id, request, now) {
        Ok(activity) => {
            tracing::debug!(server_id = %id, version = activity.version, forced, "activity updated");
            Ok(activity)
        }
        Err(UpdateRejection::NotFound) => Err(AppError::NotFound(format!("activity {id}"))),
        Err(UpdateRejection::Conflict(current)) => {
            tracing::info!(server_id = %id, stored = current.version, "stale update refused");
            Err(AppError::Conflict(current))
        }
    }
}

/// Serve one page of a listing.
pub fn handle_list(store: &ActivityStore, query: ListQuery, max_page_size: u32) -> Result<ActivityPage> {
    let page = query.page.unwrap_or(1);
    if page == 0 {
        return Err(AppError::BadRequest("page is 1-based".to_string()));
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIMIT)
        .clamp(1, max_page_size.max(1));

    Ok(store.list(query.owner.as_deref(), page, limit))
}

pub fn handle_delete(store: &ActivityStore, id: &str) -> Result<()> {
    if store.delete(id) {
        tracing::debug!(server_id = %id, "activity deleted");
        Ok(())
    } else {
        Err(AppError::NotFound(format!("activity {id}")))
    }
}

pub fn handle_get(store: &ActivityStore, id: &str) -> Result<RemoteActivity> {
    store
        .get(id)
        .ok_or_else(|| AppError::NotFound(format!("activity {id}")))
}
