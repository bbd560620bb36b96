//! The sync service: composition root of the client runtime.
//!
//! An application builds exactly one [`SyncService`] at startup, hands
//! references to whatever needs to record or observe activities, and calls
//! [`SyncService::dispose`] on shutdown.
//!
//! ```no_run
//! use nestlog_engine::{ActivityFields, ActivityType, SystemClock};
//! use nestlog_sync::{Connectivity, ManualConnectivity, SyncConfig, SyncService};
//! use std::sync::Arc;
//!
//! # async fn run() -> nestlog_sync::Result<()> {
//! let config = SyncConfig::from_env()?;
//! let connectivity = Arc::new(ManualConnectivity::new(Connectivity::Online));
//! let mut service = SyncService::open(config, Arc::new(SystemClock), connectivity)?;
//!
//! let mut events = service.subscribe();
//! service.record_activity(ActivityFields::new("baby-1", ActivityType::Sleep, 1_700_000_000_000))?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{}", event.name());
//! }
//! service.dispose().await;
//! # Ok(())
//! # }
//! ```

use crate::batch::{BatchReport, BatchSyncController};
use crate::config::SyncConfig;
use crate::engine::RecordSyncEngine;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent, SyncTrigger};
use crate::monitor::{AppEvent, ConnectivityMonitor, ConnectivityObserver, MonitorHandle, MonitorSettings};
use crate::remote::{HttpRemote, RemoteApi};
use crate::store::SharedStore;
use nestlog_engine::{
    ActivityFields, ActivityRecord, Clock, FileBackend, LocalStore, MemoryBackend, RecordId,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owns the local store, the record sync engine, the batch controller and
/// the connectivity monitor.
pub struct SyncService {
    config: SyncConfig,
    engine: Arc<RecordSyncEngine>,
    controller: Arc<BatchSyncController>,
    monitor: Option<MonitorHandle>,
    worker: Option<JoinHandle<()>>,
}

impl SyncService {
    /// Wire the runtime around an already opened store. Must be called from
    /// within a tokio runtime.
    pub fn init(
        config: SyncConfig,
        store: LocalStore,
        remote: Arc<dyn RemoteApi>,
        clock: Arc<dyn Clock>,
        connectivity: Arc<dyn ConnectivityObserver>,
    ) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new(config.event_capacity);
        let (engine, retries) = RecordSyncEngine::new(
            SharedStore::new(store),
            remote,
            clock,
            events,
            config.retry.clone(),
        );
        engine.set_online(connectivity.current().is_online());
        let worker = engine.spawn_retry_worker(retries);

        let controller = Arc::new(BatchSyncController::new(Arc::clone(&engine), config.clone()));
        let monitor = ConnectivityMonitor::new(
            Arc::clone(&controller),
            connectivity,
            MonitorSettings {
                stabilize_delay: config.stabilize_delay,
                periodic_interval: config.periodic_interval,
            },
        )
        .spawn();

        info!(api = %config.api_base_url, "sync service started");
        Ok(Self {
            config,
            engine,
            controller,
            monitor: Some(monitor),
            worker: Some(worker),
        })
    }

    /// Open the configured store and talk to the configured HTTP remote.
    ///
    /// The snapshot lives in `storage_dir` when set; otherwise the session
    /// is in-memory only.
    pub fn open(
        config: SyncConfig,
        clock: Arc<dyn Clock>,
        connectivity: Arc<dyn ConnectivityObserver>,
    ) -> Result<Self> {
        let now = clock.now();
        let store = match &config.storage_dir {
            Some(dir) => LocalStore::open(FileBackend::new(dir)?, config.storage_key.clone(), now)?,
            None => LocalStore::open(MemoryBackend::new(), config.storage_key.clone(), now)?,
        };

        if let Some(report) = store.migration_report() {
            info!(
                from = report.from_version,
                to = report.to_version,
                migrated = report.migrated,
                dropped = report.dropped.len(),
                repaired = report.repaired.len(),
                "local store migrated"
            );
            for repaired in &report.repaired {
                warn!(id = %repaired.id, repairs = ?repaired.repairs, "legacy record repaired");
            }
            for dropped in &report.dropped {
                warn!(id = ?dropped.id, reason = %dropped.reason, "legacy record dropped");
            }
        }

        let remote = HttpRemote::new(&config.api_base_url, config.request_timeout)?;
        Self::init(config, store, Arc::new(remote), clock, connectivity)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<RecordSyncEngine> {
        &self.engine
    }

    fn ensure_active(&self) -> Result<()> {
        if self.worker.is_none() {
            return Err(SyncError::Disposed);
        }
        Ok(())
    }

    // --- Local writes ---

    /// Record a new activity. Succeeds as soon as the local write does; a
    /// sync attempt follows in the background.
    pub fn record_activity(&self, fields: ActivityFields) -> Result<ActivityRecord> {
        self.ensure_active()?;
        let now = self.engine.clock().now();
        let record = self.engine.store().write(|s| s.create(fields, now))?;

        debug!(record_id = %record.id, owner = record.owner(), "activity recorded");
        self.sync_soon(&record.id);
        Ok(record)
    }

    /// Replace an activity's business fields.
    pub fn edit_activity(&self, id: &str, fields: ActivityFields) -> Result<ActivityRecord> {
        self.ensure_active()?;
        let now = self.engine.clock().now();
        let record = self.engine.store().write(|s| s.update(id, fields, now))?;

        debug!(record_id = %record.id, version = record.version, "activity edited");
        self.sync_soon(&record.id);
        Ok(record)
    }

    /// Remove an activity locally, then delete its remote copy.
    ///
    /// Local removal always happens; a failed remote delete is logged only.
    pub async fn remove_activity(&self, id: &str) -> Result<Option<ActivityRecord>> {
        self.ensure_active()?;
        self.engine.reset_attempts(id);
        let Some(removed) = self.engine.store().write(|s| s.delete(id))? else {
            return Ok(None);
        };
        debug!(record_id = %id, "activity removed locally");

        if let Some(server_id) = removed.server_id.as_deref() {
            match self.engine.remote().delete(server_id).await {
                Ok(()) => debug!(record_id = %id, server_id, "remote copy deleted"),
                Err(err) => warn!(record_id = %id, server_id, error = %err, "remote delete failed"),
            }
        }
        Ok(Some(removed))
    }

    fn sync_soon(&self, id: &RecordId) {
        if self.engine.is_online() {
            self.engine.reset_attempts(id);
            self.engine.request_sync(id);
        }
    }

    // --- Reads ---

    pub fn activity(&self, id: &str) -> Option<ActivityRecord> {
        self.engine.store().read(|s| s.get(id).cloned())
    }

    /// Activities in creation order, optionally for one owner.
    pub fn activities(&self, owner: Option<&str>) -> Vec<ActivityRecord> {
        self.engine
            .store()
            .read(|s| s.list_all(owner).into_iter().cloned().collect())
    }

    pub fn pending_count(&self) -> usize {
        self.engine.store().read(|s| s.pending_count())
    }

    // --- Triggers ---

    /// Run a manual batch pass and wait for it. Returns `None` when a pass
    /// was already running.
    pub async fn sync_now(&self) -> Result<Option<BatchReport>> {
        self.ensure_active()?;
        self.controller.run(SyncTrigger::Manual).await
    }

    /// Tell the monitor the app returned to the foreground.
    pub fn notify_foreground(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.notify(AppEvent::Foregrounded);
        }
    }

    /// Subscribe to sync events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.events().subscribe()
    }

    pub fn events(&self) -> &EventBus {
        self.engine.events()
    }

    /// Stop the monitor, the retry timers and the retry worker. Local data
    /// stays readable; writes and triggers fail with [`SyncError::Disposed`].
    pub async fn dispose(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.shutdown().await;
        }
        self.engine.cancel_retries();
        self.engine.set_online(false);
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        info!("sync service disposed");
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.engine.cancel_retries();
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("engine", &self.engine)
            .field("disposed", &self.worker.is_none())
            .finish()
    }
}
