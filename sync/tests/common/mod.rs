//! Shared fixtures for the sync integration tests.
//!
//! [`FakeRemote`] is an in-memory implementation of the activities API with
//! the same semantics as the reference server, plus knobs for outages,
//! injected failures and latency. Every call is logged with the tokio
//! instant it started at, so tests on a paused clock can check timing.

#![allow(dead_code)]

use async_trait::async_trait;
use nestlog_engine::wire::{
    ActivityPage, CreateActivityRequest, Pagination, RemoteActivity, UpdateActivityRequest,
};
use nestlog_engine::{ActivityFields, ActivityType, Clock, LocalStore, ManualClock, RetryPolicy};
use nestlog_sync::{
    EventBus, RecordSyncEngine, RemoteApi, RemoteError, SharedStore, SyncConfig, SyncEvent,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Epoch milliseconds used as "now" at the start of every test.
pub const T0: u64 = 1_706_745_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Create,
    Update,
    List,
    Delete,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub op: Op,
    /// Client id for creates, server id for updates and deletes, owner for
    /// listings
    pub target: String,
    pub at: Instant,
    pub force: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    rows: BTreeMap<u64, RemoteActivity>,
    next_id: u64,
    offline: bool,
    /// Consumed by creates and updates, one per call
    scripted: VecDeque<RemoteError>,
    /// Returned by every create and update while set
    failing: Option<RemoteError>,
    /// Returned by every listing while set
    failing_list: Option<RemoteError>,
    /// Perform the next create, then report a transient failure
    lose_next_create_response: bool,
    latency: Duration,
    calls: Vec<Call>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Scriptable in-memory remote.
#[derive(Debug, Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_offline(&self, offline: bool) {
        self.with(|s| s.offline = offline);
    }

    pub fn fail_next(&self, error: RemoteError) {
        self.with(|s| s.scripted.push_back(error));
    }

    pub fn fail_writes(&self, error: Option<RemoteError>) {
        self.with(|s| s.failing = error);
    }

    pub fn fail_lists(&self, error: Option<RemoteError>) {
        self.with(|s| s.failing_list = error);
    }

    pub fn lose_next_create_response(&self) {
        self.with(|s| s.lose_next_create_response = true);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.with(|s| s.latency = latency);
    }

    /// Store a row as if another device had created it.
    pub fn seed(
        &self,
        client_id: Option<&str>,
        fields: ActivityFields,
        updated_at: u64,
    ) -> RemoteActivity {
        self.with(|s| {
            s.next_id += 1;
            let row = RemoteActivity {
                id: s.next_id.to_string(),
                client_id: client_id.map(str::to_string),
                version: 1,
                updated_at,
                fields,
            };
            s.rows.insert(s.next_id, row.clone());
            row
        })
    }

    /// Overwrite a row as if another device had edited it.
    pub fn overwrite(
        &self,
        server_id: &str,
        version: u64,
        updated_at: u64,
        fields: ActivityFields,
    ) {
        self.with(|s| {
            let row = s.rows.get_mut(&parse_id(server_id)).expect("row exists");
            row.version = version;
            row.updated_at = updated_at;
            row.fields = fields;
        });
    }

    /// Delete a row behind the client's back.
    pub fn remove(&self, server_id: &str) {
        self.with(|s| s.rows.remove(&parse_id(server_id)));
    }

    pub fn row(&self, server_id: &str) -> Option<RemoteActivity> {
        self.with(|s| s.rows.get(&parse_id(server_id)).cloned())
    }

    pub fn rows(&self) -> Vec<RemoteActivity> {
        self.with(|s| s.rows.values().cloned().collect())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    pub fn calls_of(&self, op: Op) -> Vec<Call> {
        self.with(|s| s.calls.iter().filter(|c| c.op == op).cloned().collect())
    }

    pub fn max_in_flight(&self) -> usize {
        self.with(|s| s.max_in_flight)
    }

    pub fn clear_calls(&self) {
        self.with(|s| s.calls.clear());
    }

    /// Log the call, wait out the latency and report whether the remote is
    /// reachable.
    async fn enter(&self, op: Op, target: &str, force: bool) -> Result<(), RemoteError> {
        let latency = self.with(|s| {
            s.calls.push(Call {
                op,
                target: target.to_string(),
                at: Instant::now(),
                force,
            });
            s.in_flight += 1;
            s.max_in_flight = s.max_in_flight.max(s.in_flight);
            s.latency
        });
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.with(|s| {
            s.in_flight -= 1;
            if s.offline {
                Err(RemoteError::Offline("connection refused".into()))
            } else {
                Ok(())
            }
        })
    }

    fn injected_write_failure(&self) -> Option<RemoteError> {
        self.with(|s| s.scripted.pop_front().or_else(|| s.failing.clone()))
    }
}

fn parse_id(server_id: &str) -> u64 {
    server_id.parse().unwrap_or(u64::MAX)
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn create(&self, request: CreateActivityRequest) -> Result<RemoteActivity, RemoteError> {
        self.enter(Op::Create, &request.client_id, false).await?;
        if let Some(err) = self.injected_write_failure() {
            return Err(err);
        }

        self.with(|s| {
            let existing = s
                .rows
                .values()
                .find(|r| r.client_id.as_deref() == Some(request.client_id.as_str()))
                .cloned();
            let row = match existing {
                Some(row) => row,
                None => {
                    s.next_id += 1;
                    let row = RemoteActivity {
                        id: s.next_id.to_string(),
                        client_id: Some(request.client_id.clone()),
                        version: request.client_version.max(1),
                        updated_at: request.modified_at,
                        fields: request.fields.clone(),
                    };
                    s.rows.insert(s.next_id, row.clone());
                    row
                }
            };

            if std::mem::take(&mut s.lose_next_create_response) {
                return Err(RemoteError::Transient("response lost".into()));
            }
            Ok(row)
        })
    }

    async fn update(
        &self,
        server_id: &str,
        request: UpdateActivityRequest,
    ) -> Result<RemoteActivity, RemoteError> {
        self.enter(Op::Update, server_id, request.force).await?;
        if let Some(err) = self.injected_write_failure() {
            return Err(err);
        }

        self.with(|s| {
            let row = s
                .rows
                .get_mut(&parse_id(server_id))
                .ok_or(RemoteError::NotFound)?;
            if !request.force && request.client_version < row.version {
                return Err(RemoteError::VersionConflict(Box::new(row.clone())));
            }
            row.version = if request.force {
                row.version + 1
            } else {
                (row.version + 1).max(request.client_version)
            };
            row.updated_at = request.modified_at;
            row.fields = request.fields;
            Ok(row.clone())
        })
    }

    async fn list(&self, owner: &str, page: u32, limit: u32) -> Result<ActivityPage, RemoteError> {
        self.enter(Op::List, owner, false).await?;
        if let Some(err) = self.with(|s| s.failing_list.clone()) {
            return Err(err);
        }

        self.with(|s| {
            let matching: Vec<RemoteActivity> = s
                .rows
                .values()
                .filter(|r| r.fields.baby_id == owner)
                .cloned()
                .collect();
            let limit = limit.max(1) as usize;
            let total_pages = matching.len().div_ceil(limit) as u32;
            let data = matching
                .iter()
                .skip((page.max(1) as usize - 1) * limit)
                .take(limit)
                .cloned()
                .collect();
            Ok(ActivityPage {
                data,
                pagination: Pagination {
                    page,
                    total_count: matching.len() as u64,
                    total_pages,
                    has_more: page < total_pages,
                },
            })
        })
    }

    async fn delete(&self, server_id: &str) -> Result<(), RemoteError> {
        self.enter(Op::Delete, server_id, false).await?;
        self.with(|s| {
            s.rows
                .remove(&parse_id(server_id))
                .map(|_| ())
                .ok_or(RemoteError::NotFound)
        })
    }
}

/// Configuration with test-friendly timings.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        chunk_pause: Duration::from_millis(100),
        ..SyncConfig::default()
    }
}

pub fn fields(owner: &str, details: &str) -> ActivityFields {
    ActivityFields::new(owner, ActivityType::Feeding, T0 - 60_000)
        .with_subtype("bottle")
        .with_amount(120.0, "ml")
        .with_details(details)
}

/// A record sync engine over an in-memory store, with its retry worker
/// running.
pub struct Harness {
    pub engine: Arc<RecordSyncEngine>,
    pub remote: Arc<FakeRemote>,
    pub clock: Arc<ManualClock>,
    pub events: broadcast::Receiver<SyncEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        let remote = FakeRemote::new();
        let clock = Arc::new(ManualClock::new(T0));
        let store = SharedStore::new(LocalStore::in_memory(T0).unwrap());
        let bus = EventBus::new(1024);
        let events = bus.subscribe();

        let (engine, retries) =
            RecordSyncEngine::new(store, remote.clone(), clock.clone(), bus, policy);
        engine.spawn_retry_worker(retries);

        Self {
            engine,
            remote,
            clock,
            events,
        }
    }

    /// Create a local record at the current clock time.
    pub fn create(&self, owner: &str, details: &str) -> String {
        let now = self.clock.now();
        self.engine
            .store()
            .write(|s| s.create(fields(owner, details), now))
            .unwrap()
            .id
    }

    pub fn edit(&self, id: &str, details: &str) {
        let now = self.clock.now();
        let owner = self.record(id).fields.baby_id;
        self.engine
            .store()
            .write(|s| s.update(id, fields(&owner, details), now))
            .unwrap();
    }

    pub fn record(&self, id: &str) -> nestlog_engine::ActivityRecord {
        self.engine.store().read(|s| s.get(id).cloned()).unwrap()
    }

    /// Every event received so far.
    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Install a test subscriber once; `RUST_LOG` controls the output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
