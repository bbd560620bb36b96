//! Reconciliation decisions between the local replica and the remote
//! authority.
//!
//! Everything here is a pure function over local records and remote
//! listings. The sync runtime fetches, this module decides, and the store
//! applies.
//!
//! # Pull matching
//!
//! A remote activity is matched to a local record by, in order:
//!
//! 1. server id,
//! 2. the client identifier the remote carries,
//! 3. content hash, against local records that never got a server id.
//!
//! Unmatched remote activities become new `Synced` local records.

use crate::identity::{compute_content_hash, create_identifier};
use crate::snapshot::ConflictResolution;
use crate::wire::RemoteActivity;
use crate::{ActivityRecord, RecordId, ServerId, SyncStatus, Timestamp};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Last-write-wins by modification time.
///
/// The local copy wins only when it was modified strictly later than the
/// remote one; ties go to the server.
pub fn resolve_conflict(
    local_modified: Timestamp,
    remote_modified: Timestamp,
) -> ConflictResolution {
    if local_modified > remote_modified {
        ConflictResolution::LocalWins
    } else {
        ConflictResolution::RemoteWins
    }
}

/// A change the pull phase wants applied to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum PullAction {
    /// A remote activity with no local counterpart
    Insert(ActivityRecord),
    /// Attach a server id to a local record that lacked one
    Link { id: RecordId, remote: RemoteActivity },
    /// A settled local record has a newer remote copy
    Refresh { id: RecordId, remote: RemoteActivity },
}

/// Outcome of matching one listing page against the local records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullPlan {
    pub actions: Vec<PullAction>,
    /// Remote activities already reflected locally
    pub unchanged: usize,
}

/// Match remote activities against the local records.
pub fn plan_pull<'a, I>(locals: I, remotes: &[RemoteActivity]) -> PullPlan
where
    I: IntoIterator<Item = &'a ActivityRecord>,
{
    let locals: BTreeMap<&str, &ActivityRecord> =
        locals.into_iter().map(|r| (r.id.as_str(), r)).collect();

    let by_server: HashMap<&str, &ActivityRecord> = locals
        .values()
        .filter_map(|r| r.server_id.as_deref().map(|sid| (sid, *r)))
        .collect();

    // Candidates for hash matching, in id order so the oldest wins.
    let mut unlinked_by_hash: HashMap<&str, Vec<&ActivityRecord>> = HashMap::new();
    for record in locals.values() {
        if record.server_id.is_none() && record.status != SyncStatus::Syncing {
            unlinked_by_hash
                .entry(record.content_hash.as_str())
                .or_default()
                .push(*record);
        }
    }

    let mut plan = PullPlan::default();
    let mut claimed: HashSet<RecordId> = HashSet::new();
    let mut unmatched: Vec<&RemoteActivity> = Vec::new();

    // Identity matches first, so a hash match can never steal a record that
    // a later row names by client id.
    for remote in remotes {
        if let Some(local) = by_server.get(remote.id.as_str()) {
            if needs_refresh(local, remote) {
                plan.actions.push(PullAction::Refresh {
                    id: local.id.clone(),
                    remote: remote.clone(),
                });
            } else {
                plan.unchanged += 1;
            }
            continue;
        }

        let by_client = remote
            .client_id
            .as_deref()
            .and_then(|client_id| locals.get(client_id))
            .filter(|local| local.server_id.is_none());
        if let Some(local) = by_client {
            if local.status == SyncStatus::Syncing {
                // The in-flight create links itself when it returns.
                plan.unchanged += 1;
                continue;
            }
            if claimed.insert(local.id.clone()) {
                plan.actions.push(PullAction::Link {
                    id: local.id.clone(),
                    remote: remote.clone(),
                });
                continue;
            }
        }

        unmatched.push(remote);
    }

    let mut inserted: HashSet<RecordId> = HashSet::new();
    for remote in unmatched {
        // A row that names a client id belongs to that record, even one this
        // device has never seen; only anonymous rows fall back to the hash.
        let hash_match = match remote.client_id {
            Some(_) => None,
            None => {
                let hash = compute_content_hash(&remote.fields);
                unlinked_by_hash
                    .get(hash.as_str())
                    .and_then(|candidates| candidates.iter().find(|r| !claimed.contains(&r.id)))
                    .copied()
            }
        };
        if let Some(local) = hash_match {
            claimed.insert(local.id.clone());
            plan.actions.push(PullAction::Link {
                id: local.id.clone(),
                remote: remote.clone(),
            });
            continue;
        }

        let id = match remote.client_id.as_ref() {
            Some(client_id)
                if !locals.contains_key(client_id.as_str()) && !inserted.contains(client_id) =>
            {
                client_id.clone()
            }
            _ => create_identifier(),
        };
        inserted.insert(id.clone());
        plan.actions.push(PullAction::Insert(ActivityRecord::from_remote(
            id,
            remote.id.clone(),
            remote.version,
            remote.fields.clone(),
            remote.updated_at,
        )));
    }

    plan
}

/// A settled record is refreshed when the remote copy is newer and differs.
/// Pending and in-flight records keep their local edits.
fn needs_refresh(local: &ActivityRecord, remote: &RemoteActivity) -> bool {
    local.status == SyncStatus::Synced
        && remote.updated_at > local.last_modified
        && compute_content_hash(&remote.fields) != local.content_hash
}

/// Whether a record modified at `last_modified` is still inside the grace
/// window at `now`.
pub fn within_grace(now: Timestamp, last_modified: Timestamp, grace_ms: u64) -> bool {
    now.saturating_sub(last_modified) < grace_ms
}

/// Local records of `owner` that were deleted remotely.
///
/// `remote_ids` must be the complete listing for the owner. Only `Synced`
/// records with a server id are candidates, and only once they have been
/// untouched for the grace window.
pub fn plan_remote_deletions<'a, I>(
    locals: I,
    owner: &str,
    remote_ids: &HashSet<ServerId>,
    now: Timestamp,
    grace_ms: u64,
) -> Vec<RecordId>
where
    I: IntoIterator<Item = &'a ActivityRecord>,
{
    locals
        .into_iter()
        .filter(|r| r.owner() == owner && r.status == SyncStatus::Synced)
        .filter(|r| {
            r.server_id
                .as_ref()
                .is_some_and(|sid| !remote_ids.contains(sid))
        })
        .filter(|r| !within_grace(now, r.last_modified, grace_ms))
        .map(|r| r.id.clone())
        .collect()
}

/// Number of sequential chunks needed to push `total` records.
pub fn chunk_count(total: usize, chunk_size: usize) -> usize {
    total.div_ceil(chunk_size.max(1))
}
