//! In-memory activity storage.
//!
//! Rows are keyed by a server-assigned sequential id. A second index maps
//! client ids to server ids so that repeating a create returns the row the
//! first attempt made.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nestlog_engine::wire::{
    ActivityPage, CreateActivityRequest, Pagination, RemoteActivity, UpdateActivityRequest,
};
use nestlog_engine::{RecordId, ServerId, Timestamp};
use std::sync::atomic::{AtomicU64, Ordering};

/// A stored row and its insertion sequence.
#[derive(Debug, Clone)]
struct StoredActivity {
    seq: u64,
    activity: RemoteActivity,
}

/// Why an update was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateRejection {
    NotFound,
    /// Carries the stored row
    Conflict(Box<RemoteActivity>),
}

/// Thread-safe activity table.
#[derive(Debug, Default)]
pub struct ActivityStore {
    rows: DashMap<ServerId, StoredActivity>,
    by_client_id: DashMap<RecordId, ServerId>,
    next_seq: AtomicU64,
}

impl ActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<RemoteActivity> {
        self.rows.get(id).map(|row| row.activity.clone())
    }

    /// Insert a new row, or return the existing row for the same client id.
    ///
    /// The flag is `true` when a row was created.
    pub fn create(&self, request: CreateActivityRequest) -> (RemoteActivity, bool) {
        match self.by_client_id.entry(request.client_id.clone()) {
            Entry::Occupied(mut existing) => {
                if let Some(row) = self.rows.get(existing.get()) {
                    return (row.activity.clone(), false);
                }
                // The row was deleted; the client id is free again.
                let (activity, seq) = self.new_row(request);
                existing.insert(activity.id.clone());
                self.rows.insert(
                    activity.id.clone(),
                    StoredActivity {
                        seq,
                        activity: activity.clone(),
                    },
                );
                (activity, true)
            }
            Entry::Vacant(slot) => {
                let (activity, seq) = self.new_row(request);
                slot.insert(activity.id.clone());
                self.rows.insert(
                    activity.id.clone(),
                    StoredActivity {
                        seq,
                        activity: activity.clone(),
                    },
                );
                (activity, true)
            }
        }
    }

    fn new_row(&self, request: CreateActivityRequest) -> (RemoteActivity, u64) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let activity = RemoteActivity {
            id: seq.to_string(),
            client_id: Some(request.client_id),
            version: request.client_version.max(1),
            updated_at: request.modified_at,
            fields: request.fields,
        };
        (activity, seq)
    }

    /// Apply an update with optimistic concurrency.
    ///
    /// Refused with the stored row when the client's version is behind the
    /// stored one, unless `force` is set. An accepted update always moves the
    /// stored version forward.
    pub fn update(
        &self,
        id: &str,
        request: UpdateActivityRequest,
        now: Timestamp,
    ) -> Result<RemoteActivity, UpdateRejection> {
        let mut row = self.rows.get_mut(id).ok_or(UpdateRejection::NotFound)?;
        let stored = &mut row.activity;

        if !request.force && request.client_version < stored.version {
            return Err(UpdateRejection::Conflict(Box::new(stored.clone())));
        }

        stored.version = if request.force {
            stored.version + 1
        } else {
            (stored.version + 1).max(request.client_version)
        };
        stored.updated_at = if request.modified_at > 0 {
            request.modified_at
        } else {
            now
        };
        stored.fields = request.fields;
        Ok(stored.clone())
    }

    /// One page of rows in insertion order, optionally for one owner.
    pub fn list(&self, owner: Option<&str>, page: u32, limit: u32) -> ActivityPage {
        let mut matching: Vec<(u64, RemoteActivity)> = self
            .rows
            .iter()
            .filter(|row| owner.map_or(true, |o| row.activity.fields.baby_id == o))
            .map(|row| (row.seq, row.activity.clone()))
            .collect();
        matching.sort_by_key(|(seq, _)| *seq);

        let limit = limit.max(1);
        let page = page.max(1);
        let total_count = matching.len() as u64;
        let total_pages = u32::try_from(total_count.div_ceil(u64::from(limit))).unwrap_or(u32::MAX);
        let skip = (page as usize - 1).saturating_mul(limit as usize);

        let data = matching
            .into_iter()
            .skip(skip)
            .take(limit as usize)
            .map(|(_, activity)| activity)
            .collect();

        ActivityPage {
            data,
            pagination: Pagination {
                page,
                total_count,
                total_pages,
                has_more: page < total_pages,
            },
        }
    }

    /// Remove a row. Returns whether it existed.
    pub fn delete(&self, id: &str) -> bool {
        match self.rows.remove(id) {
            Some((_, row)) => {
                if let Some(client_id) = &row.activity.client_id {
                    self.by_client_id.remove_if(client_id, |_, sid| sid == id);
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestlog_engine::{ActivityFields, ActivityType};

    fn create_request(client_id: &str, owner: &str) -> CreateActivityRequest {
        CreateActivityRequest {
            client_id: client_id.to_string(),
            client_version: 1,
            modified_at: 1_000,
            fields: ActivityFields::new(owner, ActivityType::Diaper, 500),
        }
    }

    fn update_request(version: u64, force: bool) -> UpdateActivityRequest {
        UpdateActivityRequest {
            client_version: version,
            modified_at: 2_000,
            force,
            fields: ActivityFields::new("baby-1", ActivityType::Diaper, 500).with_details("wet"),
        }
    }

    #[test]
    fn test_create_is_idempotent_by_client_id() {
        let store = ActivityStore::new();

        let (first, created) = store.create(create_request("c1", "baby-1"));
        assert!(created);
        let (second, created) = store.create(create_request("c1", "baby-1"));
        assert!(!created);

        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_create_after_delete_makes_new_row() {
        let store = ActivityStore::new();
        let (first, _) = store.create(create_request("c1", "baby-1"));
        assert!(store.delete(&first.id));

        let (second, created) = store.create(create_request("c1", "baby-1"));
        assert!(created);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_update_conflict_and_force() {
        let store = ActivityStore::new();
        let (row, _) = store.create(create_request("c1", "baby-1"));

        let accepted = store.update(&row.id, update_request(3, false), 9_999).unwrap();
        assert_eq!(accepted.version, 3);
        assert_eq!(accepted.updated_at, 2_000);

        match store.update(&row.id, update_request(2, false), 9_999) {
            Err(UpdateRejection::Conflict(current)) => assert_eq!(current.version, 3),
            other => panic!("expected conflict, got {other:?}"),
        }

        let forced = store.update(&row.id, update_request(2, true), 9_999).unwrap();
        assert_eq!(forced.version, 4);
    }

    #[test]
    fn test_update_missing_row() {
        let store = ActivityStore::new();
        assert_eq!(
            store.update("404", update_request(1, false), 0),
            Err(UpdateRejection::NotFound)
        );
    }

    #[test]
    fn test_list_pages_by_owner() {
        let store = ActivityStore::new();
        for i in 0..5 {
            store.create(create_request(&format!("a{i}"), "baby-1"));
        }
        store.create(create_request("b0", "baby-2"));

        let first = store.list(Some("baby-1"), 1, 2);
        assert_eq!(first.data.len(), 2);
        assert_eq!(first.pagination.total_count, 5);
        assert_eq!(first.pagination.total_pages, 3);
        assert!(first.pagination.has_more);

        let last = store.list(Some("baby-1"), 3, 2);
        assert_eq!(last.data.len(), 1);
        assert!(!last.pagination.has_more);

        assert_eq!(store.list(None, 1, 100).data.len(), 6);
        assert_eq!(store.list(Some("nobody"), 1, 10).pagination.total_pages, 0);
    }
}
