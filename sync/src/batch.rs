//! Batch sync: push every pending record, then pull and reconcile.
//!
//! One pass runs at a time. A trigger that arrives while a pass is running
//! is dropped; whatever it would have covered is picked up by the next pass.

use crate::config::SyncConfig;
use crate::engine::{RecordSyncEngine, SyncOutcome};
use crate::error::{RemoteError, Result};
use crate::events::{SyncEvent, SyncTrigger};
use futures::future::join_all;
use nestlog_engine::reconcile::{plan_pull, plan_remote_deletions};
use nestlog_engine::wire::RemoteActivity;
use nestlog_engine::{RecordId, ServerId};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on pages fetched per owner in one pass.
const MAX_PAGES: u32 = 10_000;

/// Summary of one batch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub trigger: Option<SyncTrigger>,
    /// Records queued for the push phase
    pub total: usize,
    pub synced: usize,
    pub errors: usize,
    /// Push candidates that needed no attempt (in flight, deleted)
    pub skipped: usize,
    /// Size of each dispatched push chunk, in order
    pub chunks: Vec<usize>,
    /// Remote rows received during the pull phase
    pub pulled: usize,
    pub inserted: usize,
    pub linked: usize,
    pub refreshed: usize,
    /// Local ids removed because their remote copy is gone
    pub removed: Vec<RecordId>,
    /// The pass stopped early because the remote was unreachable
    pub offline: bool,
}

/// Clears the in-progress flag when the pass ends, including on error.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs full push-then-pull reconciliation passes.
#[derive(Debug)]
pub struct BatchSyncController {
    engine: Arc<RecordSyncEngine>,
    config: SyncConfig,
    running: AtomicBool,
}

impl BatchSyncController {
    pub fn new(engine: Arc<RecordSyncEngine>, config: SyncConfig) -> Self {
        Self {
            engine,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &Arc<RecordSyncEngine> {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one pass. Returns `None` when another pass was already running.
    pub async fn run(&self, trigger: SyncTrigger) -> Result<Option<BatchReport>> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            debug!(%trigger, "batch sync already running; trigger dropped");
            return Ok(None);
        };

        let store = self.engine.store();
        let pending = store.read(|s| s.pending_ids());

        // A pass gives exhausted records a fresh set of retries.
        for id in &pending {
            self.engine.reset_attempts(id);
        }

        let mut report = BatchReport {
            trigger: Some(trigger),
            total: pending.len(),
            ..BatchReport::default()
        };
        info!(%trigger, total = report.total, "batch sync started");
        self.engine.events().emit(SyncEvent::BatchSyncStart {
            trigger,
            total: report.total,
        });

        if self.engine.is_online() {
            self.push(&pending, &mut report).await?;
        } else {
            report.offline = true;
        }

        if report.offline {
            warn!(%trigger, "remote unreachable; pull skipped");
        } else {
            self.pull(&mut report).await?;
            let now = self.engine.clock().now();
            store.write(|s| s.set_last_sync_time(now))?;
        }

        info!(
            %trigger,
            synced = report.synced,
            errors = report.errors,
            pulled = report.pulled,
            removed = report.removed.len(),
            "batch sync complete"
        );
        self.engine.events().emit(SyncEvent::BatchSyncComplete {
            trigger,
            synced: report.synced,
            errors: report.errors,
            pulled: report.pulled,
            removed: report.removed.len(),
        });

        Ok(Some(report))
    }

    async fn push(&self, pending: &[RecordId], report: &mut BatchReport) -> Result<()> {
        for (index, chunk) in pending.chunks(self.config.chunk_size.max(1)).enumerate() {
            if index > 0 && !self.config.chunk_pause.is_zero() {
                tokio::time::sleep(self.config.chunk_pause).await;
            }

            debug!(chunk = index, size = chunk.len(), "pushing chunk");
            report.chunks.push(chunk.len());

            let outcomes = join_all(chunk.iter().map(|id| self.engine.sync_one(id))).await;
            for outcome in outcomes {
                match outcome? {
                    SyncOutcome::Offline => {
                        report.errors += 1;
                        report.offline = true;
                    }
                    SyncOutcome::Failed { .. } => report.errors += 1,
                    outcome if outcome.is_synced() => report.synced += 1,
                    _ => report.skipped += 1,
                }
            }

            if report.offline {
                warn!(chunk = index, "remote unreachable; remaining chunks skipped");
                break;
            }
        }
        Ok(())
    }

    /// Owners to pull: the configured scope plus every owner held locally.
    fn owners(&self) -> Vec<String> {
        let mut owners = self.engine.store().read(|s| s.owners());
        owners.extend(self.config.owners.iter().cloned());
        owners.sort();
        owners.dedup();
        owners
    }

    async fn pull(&self, report: &mut BatchReport) -> Result<()> {
        let grace_ms = u64::try_from(self.config.deletion_grace.as_millis()).unwrap_or(u64::MAX);

        for owner in self.owners() {
            let remotes = match self.fetch_all(&owner).await {
                Ok(remotes) => remotes,
                Err(err) => {
                    warn!(%owner, error = %err, "listing failed; owner skipped");
                    report.errors += 1;
                    continue;
                }
            };
            report.pulled += remotes.len();

            let remote_ids: HashSet<ServerId> = remotes.iter().map(|r| r.id.clone()).collect();
            let now = self.engine.clock().now();

            let (summary, removed) = self.engine.store().write(|s| {
                let plan = plan_pull(s.list_all(None), &remotes);
                let summary = s.apply_pull(plan.actions)?;

                let doomed = plan_remote_deletions(s.list_all(None), &owner, &remote_ids, now, grace_ms);
                let removed = s.remove_ids(&doomed)?;
                nestlog_engine::Result::Ok((summary, removed))
            })?;

            debug!(
                %owner,
                inserted = summary.inserted,
                linked = summary.linked,
                refreshed = summary.refreshed,
                skipped = summary.skipped,
                "pull applied"
            );
            report.inserted += summary.inserted;
            report.linked += summary.linked;
            report.refreshed += summary.refreshed;

            if !removed.is_empty() {
                let ids: Vec<RecordId> = removed.into_iter().map(|r| r.id).collect();
                info!(%owner, count = ids.len(), "removed records deleted remotely");
                self.engine.events().emit(SyncEvent::CleanupCompleted {
                    removed: ids.clone(),
                });
                report.removed.extend(ids);
            }
        }
        Ok(())
    }

    /// Fetch the complete remote listing for `owner`.
    async fn fetch_all(&self, owner: &str) -> std::result::Result<Vec<RemoteActivity>, RemoteError> {
        let remote = self.engine.remote();
        let mut rows = Vec::new();
        let mut page = 1;

        loop {
            let listing = remote.list(owner, page, self.config.page_size).await?;
            let received = listing.data.len();
            rows.extend(listing.data);

            if !listing.pagination.has_more || received == 0 {
                break;
            }
            if page >= MAX_PAGES {
                return Err(RemoteError::Transient(format!(
                    "listing for {owner} exceeded {MAX_PAGES} pages"
                )));
            }
            page += 1;
        }
        Ok(rows)
    }
}
