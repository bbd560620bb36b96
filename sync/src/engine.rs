//! The record sync engine: drives one record from `Local` to `Synced`.
//!
//! # Attempt lifecycle
//!
//! 1. The record moves to `Syncing` and `sync_start` is emitted.
//! 2. A record without a server id is created remotely; otherwise it is
//!    updated with its version as the concurrency token.
//! 3. `404` on update clears the server id and falls back to a create.
//! 4. `409` is settled last-write-wins: the newer local copy is forced onto
//!    the server, or the newer server copy replaces the local fields.
//! 5. Any other failure marks the record `SyncFailed` and schedules a retry
//!    from the delay table, except validation errors and offline results.
//!
//! A local edit that lands while an attempt is in flight is never lost:
//! when the attempt settles and the version has moved, the record goes back
//! to `Local` and a fresh attempt starts.
//!
//! Retry timers only sleep and then post the record id to a channel. A
//! single worker task drains the channel and runs the attempts.

use crate::error::{RemoteError, Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::remote::RemoteApi;
use crate::store::SharedStore;
use nestlog_engine::reconcile::resolve_conflict;
use nestlog_engine::wire::{CreateActivityRequest, RemoteActivity, UpdateActivityRequest};
use nestlog_engine::{
    ActivityRecord, Clock, ConflictEntry, ConflictResolution, RecordId, RetryDecision,
    RetryPolicy, RetryTracker, ServerId, SyncStatus, Version,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How a call to [`RecordSyncEngine::sync_one`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The remote confirmed the record
    Synced { server_id: ServerId, version: Version },
    /// A version conflict was settled; the record is `Synced`
    Resolved {
        server_id: ServerId,
        resolution: ConflictResolution,
    },
    /// Nothing to do
    AlreadySynced,
    /// Another attempt for this record is running
    InFlight,
    /// The record was deleted locally
    Missing,
    /// No attempt was possible; the record stays `Local`
    Offline,
    /// The record is `SyncFailed`
    Failed { retry_in: Option<Duration> },
}

impl SyncOutcome {
    /// Whether the record is confirmed remotely after this call.
    pub fn is_synced(&self) -> bool {
        matches!(
            self,
            SyncOutcome::Synced { .. } | SyncOutcome::Resolved { .. } | SyncOutcome::AlreadySynced
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SyncOutcome::Offline | SyncOutcome::Failed { .. })
    }
}

/// Receiving end of the retry channel, handed to
/// [`RecordSyncEngine::spawn_retry_worker`].
#[derive(Debug)]
pub struct RetryReceiver(mpsc::UnboundedReceiver<RecordId>);

enum Begin {
    Started(ActivityRecord),
    Done(SyncOutcome),
}

enum Settled {
    Done(SyncOutcome),
    /// The record was edited during the attempt; run another one
    Requeued,
}

#[derive(Debug, Default)]
struct RetryState {
    tracker: RetryTracker,
    timers: HashMap<RecordId, JoinHandle<()>>,
}

/// Per-record sync state machine.
pub struct RecordSyncEngine {
    store: SharedStore,
    remote: Arc<dyn RemoteApi>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    online: AtomicBool,
    retries: Mutex<RetryState>,
    retry_tx: mpsc::UnboundedSender<RecordId>,
}

impl RecordSyncEngine {
    pub fn new(
        store: SharedStore,
        remote: Arc<dyn RemoteApi>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        policy: RetryPolicy,
    ) -> (Arc<Self>, RetryReceiver) {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            store,
            remote,
            clock,
            events,
            online: AtomicBool::new(true),
            retries: Mutex::new(RetryState {
                tracker: RetryTracker::new(policy),
                timers: HashMap::new(),
            }),
            retry_tx,
        });
        (engine, RetryReceiver(retry_rx))
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteApi> {
        &self.remote
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Run attempts for one record until it settles.
    ///
    /// Only local store failures are returned as errors; every network
    /// failure is reflected in the record's status and in events.
    pub async fn sync_one(&self, id: &str) -> Result<SyncOutcome> {
        loop {
            if !self.is_online() {
                debug!(record_id = %id, "offline; skipping sync attempt");
                return Ok(SyncOutcome::Offline);
            }

            let record = match self.begin(id)? {
                Begin::Started(record) => record,
                Begin::Done(outcome) => return Ok(outcome),
            };

            let attempt = self.attempts(id) + 1;
            debug!(record_id = %id, attempt, version = record.version, "sync attempt");
            self.events.emit(SyncEvent::SyncStart {
                record_id: record.id.clone(),
                attempt,
            });

            let (result, vanished) = self.push(&record).await;
            let settled = match result {
                Ok(remote) => self.finish_success(&record, remote, None).await?,
                Err(RemoteError::VersionConflict(current)) => {
                    self.resolve(&record, *current).await?
                }
                Err(err) => self.finish_failure(&record, err, vanished)?,
            };

            match settled {
                Settled::Done(outcome) => return Ok(outcome),
                Settled::Requeued => {
                    debug!(record_id = %id, "edited during attempt; starting a fresh one");
                }
            }
        }
    }

    fn begin(&self, id: &str) -> Result<Begin> {
        let begun = self.store.write(|store| -> nestlog_engine::Result<Begin> {
            let Some(status) = store.get(id).map(|r| r.status) else {
                return Ok(Begin::Done(SyncOutcome::Missing));
            };
            match status {
                SyncStatus::Synced => Ok(Begin::Done(SyncOutcome::AlreadySynced)),
                SyncStatus::Syncing => Ok(Begin::Done(SyncOutcome::InFlight)),
                SyncStatus::Local | SyncStatus::SyncFailed => {
                    let record = store.update_record(id, |r| r.begin_sync())?;
                    Ok(Begin::Started(record))
                }
            }
        })?;
        Ok(begun)
    }

    /// Issue the remote write. The flag reports whether the update target
    /// was confirmed missing and a create was issued instead.
    async fn push(
        &self,
        record: &ActivityRecord,
    ) -> (std::result::Result<RemoteActivity, RemoteError>, bool) {
        let Some(server_id) = record.server_id.as_deref() else {
            return (self.remote.create(create_request(record)).await, false);
        };

        match self.remote.update(server_id, update_request(record, false)).await {
            Err(RemoteError::NotFound) => {
                warn!(record_id = %record.id, server_id, "remote copy is gone; recreating");
                (self.remote.create(create_request(record)).await, true)
            }
            other => (other, false),
        }
    }

    /// Settle a version conflict last-write-wins.
    async fn resolve(&self, record: &ActivityRecord, current: RemoteActivity) -> Result<Settled> {
        let resolution = resolve_conflict(record.last_modified, current.updated_at);
        info!(
            record_id = %record.id,
            server_id = %current.id,
            local_modified = record.last_modified,
            remote_modified = current.updated_at,
            ?resolution,
            "version conflict"
        );

        match resolution {
            ConflictResolution::LocalWins => {
                let forced = self
                    .remote
                    .update(&current.id, update_request(record, true))
                    .await;
                match forced {
                    Ok(remote) => {
                        let settled = self
                            .finish_success(record, remote, Some(resolution))
                            .await?;
                        if matches!(settled, Settled::Done(SyncOutcome::Resolved { .. })) {
                            self.log_conflict(record, &current, resolution)?;
                        }
                        Ok(settled)
                    }
                    Err(err) => self.finish_failure(record, err, false),
                }
            }
            ConflictResolution::RemoteWins => {
                let adopted = self.store.write(|store| {
                    let Some(local) = store.get(&record.id) else {
                        return Ok(None);
                    };
                    let edited = local.version != record.version;
                    store
                        .update_record(&record.id, |r| {
                            if edited {
                                r.release_to_local()
                            } else {
                                r.adopt_remote(
                                    current.id.clone(),
                                    current.version,
                                    current.fields.clone(),
                                    current.updated_at,
                                );
                                Ok(())
                            }
                        })
                        .map(|_| Some(edited))
                })?;

                match adopted {
                    None => Ok(Settled::Done(SyncOutcome::Missing)),
                    Some(true) => Ok(Settled::Requeued),
                    Some(false) => {
                        self.log_conflict(record, &current, resolution)?;
                        self.reset_attempts(&record.id);
                        Ok(Settled::Done(SyncOutcome::Resolved {
                            server_id: current.id,
                            resolution,
                        }))
                    }
                }
            }
        }
    }

    async fn finish_success(
        &self,
        record: &ActivityRecord,
        remote: RemoteActivity,
        resolution: Option<ConflictResolution>,
    ) -> Result<Settled> {
        let confirmed = self.store.write(|store| {
            let Some(local) = store.get(&record.id) else {
                return Ok(None);
            };
            let edited = local.version != record.version;
            store
                .update_record(&record.id, |r| {
                    if edited {
                        r.confirm_superseded(remote.id.clone(), remote.version)
                    } else {
                        r.confirm_synced(
                            remote.id.clone(),
                            remote.version,
                            Some(remote.fields.clone()),
                        )
                    }
                })
                .map(|r| Some((r, edited)))
        })?;

        match confirmed {
            None => {
                // Deleted locally while the write was in flight.
                debug!(record_id = %record.id, server_id = %remote.id, "removing orphaned remote copy");
                if let Err(err) = self.remote.delete(&remote.id).await {
                    warn!(server_id = %remote.id, error = %err, "failed to remove orphaned remote copy");
                }
                Ok(Settled::Done(SyncOutcome::Missing))
            }
            Some((_, true)) => Ok(Settled::Requeued),
            Some((confirmed, false)) => {
                self.reset_attempts(&record.id);
                let server_id = remote.id;
                info!(record_id = %record.id, %server_id, version = confirmed.version, "synced");
                self.events.emit(SyncEvent::SyncSuccess {
                    record_id: record.id.clone(),
                    server_id: server_id.clone(),
                    version: confirmed.version,
                });
                Ok(Settled::Done(match resolution {
                    Some(resolution) => SyncOutcome::Resolved {
                        server_id,
                        resolution,
                    },
                    None => SyncOutcome::Synced {
                        server_id,
                        version: confirmed.version,
                    },
                }))
            }
        }
    }

    fn finish_failure(
        &self,
        record: &ActivityRecord,
        err: RemoteError,
        vanished: bool,
    ) -> Result<Settled> {
        let offline = matches!(err, RemoteError::Offline(_));
        let id = record.id.as_str();

        let edited = self.store.write(|store| {
            let Some(local) = store.get(id) else {
                return Ok(None);
            };
            let edited = local.version != record.version;
            store
                .update_record(id, |r| {
                    if vanished {
                        r.unlink()?;
                    }
                    if offline || edited {
                        r.release_to_local()
                    } else {
                        r.fail_sync()
                    }
                })
                .map(|_| Some(edited))
        })?;

        let Some(edited) = edited else {
            return Ok(Settled::Done(SyncOutcome::Missing));
        };

        if offline {
            debug!(record_id = %id, error = %err, "remote unreachable");
            self.events.emit(SyncEvent::SyncError {
                record_id: id.to_string(),
                error: err.to_string(),
                retry_in_ms: None,
            });
            return Ok(Settled::Done(SyncOutcome::Offline));
        }
        if edited {
            return Ok(Settled::Requeued);
        }

        if let RemoteError::Validation(_) = err {
            warn!(record_id = %id, error = %err, "rejected by remote; not retrying");
            self.events.emit(SyncEvent::SyncError {
                record_id: id.to_string(),
                error: err.to_string(),
                retry_in_ms: None,
            });
            return Ok(Settled::Done(SyncOutcome::Failed { retry_in: None }));
        }

        let decision = self
            .retries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tracker
            .record_failure(id);

        match decision {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    record_id = %id,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "sync failed; retry scheduled"
                );
                self.schedule_retry(id, delay);
                self.events.emit(SyncEvent::SyncError {
                    record_id: id.to_string(),
                    error: err.to_string(),
                    retry_in_ms: Some(delay.as_millis() as u64),
                });
                Ok(Settled::Done(SyncOutcome::Failed {
                    retry_in: Some(delay),
                }))
            }
            RetryDecision::Exhausted { attempts } => {
                let exhausted = SyncError::RetriesExhausted {
                    id: id.to_string(),
                    attempts,
                };
                warn!(record_id = %id, error = %err, "{exhausted}");
                self.events.emit(SyncEvent::SyncError {
                    record_id: id.to_string(),
                    error: format!("{exhausted}: {err}"),
                    retry_in_ms: None,
                });
                Ok(Settled::Done(SyncOutcome::Failed { retry_in: None }))
            }
        }
    }

    fn log_conflict(
        &self,
        record: &ActivityRecord,
        current: &RemoteActivity,
        resolution: ConflictResolution,
    ) -> Result<()> {
        let entry = ConflictEntry {
            record_id: record.id.clone(),
            resolution,
            local_modified: record.last_modified,
            remote_modified: current.updated_at,
            resolved_at: self.clock.now(),
        };
        self.store.write(|store| store.record_conflict(entry))?;
        self.events.emit(SyncEvent::ConflictResolved {
            record_id: record.id.clone(),
            resolution,
            local_modified: record.last_modified,
            remote_modified: current.updated_at,
        });
        Ok(())
    }

    // --- Retry scheduling ---

    /// Consecutive automatic failures recorded for `id`.
    pub fn attempts(&self, id: &str) -> u32 {
        self.retries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tracker
            .failures(id)
    }

    /// Number of retry timers that have not fired yet.
    pub fn scheduled_retries(&self) -> usize {
        self.retries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .timers
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    fn schedule_retry(&self, id: &str, delay: Duration) {
        let tx = self.retry_tx.clone();
        let record_id = id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The worker is gone only after dispose.
            let _ = tx.send(record_id);
        });

        let mut retries = self.retries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = retries.timers.insert(id.to_string(), timer) {
            previous.abort();
        }
    }

    /// Forget one record's failures and cancel its pending retry.
    pub fn reset_attempts(&self, id: &str) {
        let mut retries = self.retries.lock().unwrap_or_else(PoisonError::into_inner);
        retries.tracker.reset(id);
        if let Some(timer) = retries.timers.remove(id) {
            timer.abort();
        }
    }

    /// Cancel every pending retry and forget all failure counts.
    pub fn cancel_retries(&self) {
        let mut retries = self.retries.lock().unwrap_or_else(PoisonError::into_inner);
        let cancelled = retries.timers.len();
        for (_, timer) in retries.timers.drain() {
            timer.abort();
        }
        retries.tracker.clear();
        if cancelled > 0 {
            debug!(cancelled, "retry timers cancelled");
        }
    }

    /// Ask the retry worker to attempt `id` soon.
    pub fn request_sync(&self, id: &str) {
        let _ = self.retry_tx.send(id.to_string());
    }

    fn forget_finished_timer(&self, id: &str) {
        let mut retries = self.retries.lock().unwrap_or_else(PoisonError::into_inner);
        if retries
            .timers
            .get(id)
            .is_some_and(|timer| timer.is_finished())
        {
            retries.timers.remove(id);
        }
    }

    /// Start the task that runs fired retries and opportunistic requests.
    ///
    /// The task holds only a weak reference and ends once the engine is
    /// dropped.
    pub fn spawn_retry_worker(self: &Arc<Self>, receiver: RetryReceiver) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        let RetryReceiver(mut rx) = receiver;

        tokio::spawn(async move {
            while let Some(id) = rx.recv().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.forget_finished_timer(&id);
                if let Err(err) = engine.sync_one(&id).await {
                    error!(record_id = %id, error = %err, "sync attempt failed");
                }
            }
        })
    }
}

impl std::fmt::Debug for RecordSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSyncEngine")
            .field("online", &self.is_online())
            .field("scheduled_retries", &self.scheduled_retries())
            .finish()
    }
}

fn create_request(record: &ActivityRecord) -> CreateActivityRequest {
    CreateActivityRequest {
        client_id: record.id.clone(),
        client_version: record.version,
        modified_at: record.last_modified,
        fields: record.fields.clone(),
    }
}

fn update_request(record: &ActivityRecord, force: bool) -> UpdateActivityRequest {
    UpdateActivityRequest {
        client_version: record.version,
        modified_at: record.last_modified,
        force,
        fields: record.fields.clone(),
    }
}
