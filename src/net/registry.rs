//! Live connection registry.
//!
//! # Responsibilities
//! - Map connection ids to live connections
//! - Allocate connection ids
//! - Guarantee a connection is removed by at most one caller
//! - Refuse registrations once the server starts stopping
//! - Remember torn-down connections until their tasks finish, so stop can
//!   wait for them
//!
//! # Design Decisions
//! - One mutex guards both the map and the open/closed gate, so "drain on
//!   stop" and "register after accept" cannot interleave
//! - The lock is held only for the map operation itself, never across hooks
//! - Poisoning is ignored: the map stays consistent because no operation
//!   panics half-way through a mutation

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::ServerError;
use crate::net::connection::ConnectionId;

#[derive(Debug)]
struct RegistryInner<T> {
    open: bool,
    entries: HashMap<ConnectionId, T>,
    /// Removed from `entries`, tasks still running.
    retiring: HashMap<ConnectionId, T>,
}

/// Mutex-guarded map of live connections.
#[derive(Debug)]
pub struct Registry<T> {
    inner: Mutex<RegistryInner<T>>,
    next_id: AtomicU64,
}

impl<T: Clone> Registry<T> {
    /// Create a closed, empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                open: false,
                entries: HashMap::new(),
                retiring: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh id. Ids are never reused within one registry.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Start accepting registrations.
    pub fn open(&self) {
        self.lock().open = true;
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Register `value` under `id`.
    ///
    /// Fails with [`ServerError::NotListening`] when the registry is closed.
    pub fn insert(&self, id: ConnectionId, value: T) -> Result<(), ServerError> {
        let mut inner = self.lock();
        if !inner.open {
            return Err(ServerError::NotListening);
        }
        inner.entries.insert(id, value);
        Ok(())
    }

    /// Remove `id` and park it as retiring. Only the first caller for a
    /// given id gets `Some`.
    ///
    /// The move happens in one critical section, so a concurrent
    /// `close_and_drain` sees the entry in exactly one of the two maps.
    pub fn retire(&self, id: ConnectionId) -> Option<T> {
        let mut inner = self.lock();
        let value = inner.entries.remove(&id)?;
        inner.retiring.insert(id, value.clone());
        Some(value)
    }

    /// Drop a retiring entry once its teardown has finished.
    pub fn forget(&self, id: ConnectionId) {
        self.lock().retiring.remove(&id);
    }

    /// Entries removed but not yet forgotten.
    pub fn retiring(&self) -> Vec<T> {
        self.lock().retiring.values().cloned().collect()
    }

    pub fn get(&self, id: ConnectionId) -> Option<T> {
        self.lock().entries.get(&id).cloned()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current entries, in no particular order.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().entries.values().cloned().collect()
    }

    /// Close the registry and take every entry, in one critical section.
    pub fn close_and_drain(&self) -> Vec<T> {
        let mut inner = self.lock();
        inner.open = false;
        inner.entries.drain().map(|(_, v)| v).collect()
    }
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
