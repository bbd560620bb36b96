//! Shared handle to the local store.

use nestlog_engine::LocalStore;
use std::sync::{Arc, Mutex, PoisonError};

/// The single local store, shared by the service, the record sync engine
/// and the batch controller.
///
/// Access goes through closures so the lock is never held across an
/// `.await`: store operations are synchronous and finish before any network
/// call begins.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<LocalStore>>,
}

impl SharedStore {
    pub fn new(store: LocalStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn read<T>(&self, f: impl FnOnce(&LocalStore) -> T) -> T {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn write<T>(&self, f: impl FnOnce(&mut LocalStore) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.read(|store| f.debug_tuple("SharedStore").field(store).finish())
    }
}
