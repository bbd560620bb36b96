//! Connectivity and trigger monitor.
//!
//! Turns platform signals into batch passes:
//!
//! - connectivity regained: wait for the link to stabilize, then run a
//!   `recovery` pass (a monitor that starts online does the same, so work
//!   left by a previous session is pushed)
//! - connectivity lost: mark the engine offline and cancel every retry timer
//! - app foregrounded: run a `foreground` pass when online
//! - periodic tick: run a `periodic` pass only when records are pending
//!
//! Platform connectivity is injected through [`ConnectivityObserver`];
//! timers come from `tokio::time`, so tests drive everything with a paused
//! runtime clock and [`ManualConnectivity`].

use crate::batch::BatchSyncController;
use crate::events::SyncTrigger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Network reachability as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(self) -> bool {
        self == Connectivity::Online
    }
}

/// Source of connectivity transitions.
pub trait ConnectivityObserver: Send + Sync {
    fn current(&self) -> Connectivity;

    /// A receiver that is notified on every transition.
    fn subscribe(&self) -> watch::Receiver<Connectivity>;
}

/// A [`ConnectivityObserver`] flipped by hand. Platform glue code calls
/// [`ManualConnectivity::set`] from its own network callbacks; tests use it
/// to simulate outages.
#[derive(Debug)]
pub struct ManualConnectivity {
    tx: watch::Sender<Connectivity>,
}

impl ManualConnectivity {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, state: Connectivity) {
        self.tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }
}

impl ConnectivityObserver for ManualConnectivity {
    fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}

/// Application lifecycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEvent {
    Foregrounded,
}

/// Timing of the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub stabilize_delay: Duration,
    pub periodic_interval: Duration,
}

/// Control handle of a running monitor. Dropping it stops the monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    app_tx: mpsc::UnboundedSender<AppEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn notify(&self, event: AppEvent) {
        // Fails only after the monitor stopped.
        let _ = self.app_tx.send(event);
    }

    /// Stop the monitor and abort any pass it started.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    error!(error = %err, "monitor task panicked");
                }
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Watches connectivity, lifecycle events and the periodic timer.
pub struct ConnectivityMonitor {
    controller: Arc<BatchSyncController>,
    connectivity: Arc<dyn ConnectivityObserver>,
    settings: MonitorSettings,
}

impl ConnectivityMonitor {
    pub fn new(
        controller: Arc<BatchSyncController>,
        connectivity: Arc<dyn ConnectivityObserver>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            controller,
            connectivity,
            settings,
        }
    }

    /// Start the monitor loop on the current runtime.
    pub fn spawn(self) -> MonitorHandle {
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(app_rx, shutdown_rx));

        MonitorHandle {
            app_tx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    async fn run(
        self,
        mut app_rx: mpsc::UnboundedReceiver<AppEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let engine = Arc::clone(self.controller.engine());
        let mut link = self.connectivity.subscribe();
        let mut link_open = true;
        let mut state = *link.borrow_and_update();
        engine.set_online(state.is_online());

        let mut recovery_at = state
            .is_online()
            .then(|| Instant::now() + self.settings.stabilize_delay);

        let period = self.settings.periodic_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut passes = JoinSet::new();
        info!(?state, "sync monitor started");

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,

                changed = link.changed(), if link_open => {
                    if changed.is_err() {
                        debug!("connectivity source closed");
                        link_open = false;
                        continue;
                    }
                    let next = *link.borrow_and_update();
                    if next == state {
                        continue;
                    }
                    state = next;
                    match state {
                        Connectivity::Online => {
                            info!(
                                stabilize_ms = self.settings.stabilize_delay.as_millis() as u64,
                                "connectivity regained"
                            );
                            engine.set_online(true);
                            recovery_at = Some(Instant::now() + self.settings.stabilize_delay);
                        }
                        Connectivity::Offline => {
                            info!("connectivity lost; cancelling retries");
                            engine.set_online(false);
                            engine.cancel_retries();
                            recovery_at = None;
                        }
                    }
                }

                _ = time::sleep_until(recovery_at.unwrap_or_else(Instant::now)), if recovery_at.is_some() => {
                    recovery_at = None;
                    self.start_pass(&mut passes, SyncTrigger::Recovery);
                }

                Some(event) = app_rx.recv() => match event {
                    AppEvent::Foregrounded if engine.is_online() => {
                        self.start_pass(&mut passes, SyncTrigger::Foreground);
                    }
                    AppEvent::Foregrounded => debug!("foregrounded while offline"),
                },

                _ = ticker.tick() => {
                    let pending = engine.store().read(|s| s.pending_count());
                    if engine.is_online() && pending > 0 {
                        self.start_pass(&mut passes, SyncTrigger::Periodic);
                    } else {
                        debug!(pending, online = engine.is_online(), "periodic tick skipped");
                    }
                }

                Some(joined) = passes.join_next(), if !passes.is_empty() => {
                    if let Err(err) = joined {
                        if !err.is_cancelled() {
                            error!(error = %err, "batch pass panicked");
                        }
                    }
                }
            }
        }

        passes.abort_all();
        info!("sync monitor stopped");
    }

    fn start_pass(&self, passes: &mut JoinSet<()>, trigger: SyncTrigger) {
        if self.controller.is_running() {
            debug!(%trigger, "batch sync already running; trigger dropped");
            return;
        }
        let controller = Arc::clone(&self.controller);
        passes.spawn(async move {
            if let Err(err) = controller.run(trigger).await {
                error!(%trigger, error = %err, "batch sync failed");
            }
        });
    }
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("connectivity", &self.connectivity.current())
            .field("settings", &self.settings)
            .finish()
    }
}
