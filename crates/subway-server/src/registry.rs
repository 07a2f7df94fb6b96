//! Active operations for one connection.
//!
//! Each id maps to a slot that is either `Pending` (the operation is being set
//! up) or `Live` (it owns a running event stream). A reservation mints a
//! unique token; promoting `Pending` to `Live` is a compare-and-swap on that
//! token, so a `stop` or overwrite that replaced the slot in the meantime
//! makes the promotion fail and the caller disposes the new handle itself.
//!
//! Every entry leaves the map through a path that disposes it, and disposal is
//! idempotent, so no handle outlives its entry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Stops a running operation when disposed.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    cancel: CancellationToken,
}

impl SubscriptionHandle {
    /// Handle that cancels `cancel` on disposal.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Stop the operation. Idempotent.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    /// Whether `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug)]
enum Slot {
    Pending,
    Live(SubscriptionHandle),
}

#[derive(Debug)]
struct Registration {
    token: u64,
    slot: Slot,
}

impl Registration {
    fn dispose(&self) {
        if let Slot::Live(handle) = &self.slot {
            handle.dispose();
        }
    }
}

/// Why a reservation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReserveError {
    /// The id is already in use.
    #[error("operation id already exists")]
    Duplicate,
    /// The registry has been disposed.
    #[error("registry disposed")]
    Disposed,
}

/// Concurrent map from operation id to its slot.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: DashMap<String, Registration>,
    next_token: AtomicU64,
    disposed: AtomicBool,
}

impl SubscriptionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `id` with a pending slot; fails if the id is present.
    pub fn reserve(&self, id: &str) -> Result<u64, ReserveError> {
        self.ensure_open()?;
        let token = self.mint();
        match self.entries.entry(id.to_owned()) {
            Entry::Occupied(_) => return Err(ReserveError::Duplicate),
            Entry::Vacant(vacant) => {
                let _ = vacant.insert(Registration {
                    token,
                    slot: Slot::Pending,
                });
            }
        }
        self.after_insert(id, token)
    }

    /// Reserve `id`, disposing and replacing whatever held it.
    ///
    /// The old entry is disposed before the new one becomes visible; both
    /// happen under the map's entry lock.
    pub fn reserve_overwrite(&self, id: &str) -> Result<u64, ReserveError> {
        self.ensure_open()?;
        let token = self.mint();
        let fresh = Registration {
            token,
            slot: Slot::Pending,
        };
        match self.entries.entry(id.to_owned()) {
            Entry::Occupied(mut occupied) => {
                occupied.get().dispose();
                let _ = occupied.insert(fresh);
                debug!(id, "replaced existing operation");
            }
            Entry::Vacant(vacant) => {
                let _ = vacant.insert(fresh);
            }
        }
        self.after_insert(id, token)
    }

    /// Install `handle` for `id` only if the slot is still the pending one
    /// minted as `token`. On failure the handle is returned undisposed.
    pub fn compare_exchange(
        &self,
        id: &str,
        token: u64,
        handle: SubscriptionHandle,
    ) -> Result<(), SubscriptionHandle> {
        if let Some(mut entry) = self.entries.get_mut(id) {
            if entry.token == token && matches!(entry.slot, Slot::Pending) {
                entry.slot = Slot::Live(handle);
                drop(entry);
                if self.disposed.load(Ordering::Acquire) {
                    let _ = self.remove_if_current(id, token);
                }
                return Ok(());
            }
        }
        Err(handle)
    }

    /// Whether `id` is still held by the reservation `token`.
    pub fn contains(&self, id: &str, token: u64) -> bool {
        self.entries.get(id).is_some_and(|e| e.token == token)
    }

    /// Whether `id` has any entry.
    pub fn contains_id(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Remove and dispose `id` if it is still held by `token`.
    pub fn remove_if_current(&self, id: &str, token: u64) -> bool {
        match self.entries.remove_if(id, |_, e| e.token == token) {
            Some((_, registration)) => {
                registration.dispose();
                true
            }
            None => false,
        }
    }

    /// Remove and dispose `id` if present.
    pub fn try_remove(&self, id: &str) -> bool {
        match self.entries.remove(id) {
            Some((_, registration)) => {
                registration.dispose();
                true
            }
            None => false,
        }
    }

    /// Dispose every entry. Later reservations fail with `Disposed`.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.entries.retain(|_, registration| {
            registration.dispose();
            false
        });
    }

    /// Whether `dispose` has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids currently present (sorted).
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn mint(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn ensure_open(&self) -> Result<(), ReserveError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(ReserveError::Disposed)
        } else {
            Ok(())
        }
    }

    // dispose() may have swept the map between ensure_open and the insert
    fn after_insert(&self, id: &str, token: u64) -> Result<u64, ReserveError> {
        if self.disposed.load(Ordering::Acquire) {
            let _ = self.remove_if_current(id, token);
            return Err(ReserveError::Disposed);
        }
        Ok(token)
    }
}
