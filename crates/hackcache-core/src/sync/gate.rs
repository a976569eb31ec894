//! Per-resource single-flight coordination.
//!
//! Each resource has one slot: `Idle` when `fetching` is false, `Fetching`
//! otherwise. The first caller to find a slot idle owns the fetch; everyone
//! arriving before `finish` joins the pending queue and gets the same outcome.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::ResourceKind;

/// Completion handle for a refresh; receives the shared outcome once.
pub type RefreshCallback = Box<dyn FnOnce(bool) + Send + 'static>;

#[derive(Default)]
struct Slot {
    fetching: bool,
    pending: Vec<RefreshCallback>,
    /// Contents must be discarded before the next merge
    invalidated: bool,
}

pub struct RefreshGate {
    slots: [Mutex<Slot>; ResourceKind::COUNT],
}

impl Default for RefreshGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshGate {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Mutex::new(Slot::default())),
        }
    }

    fn slot(&self, kind: ResourceKind) -> MutexGuard<'_, Slot> {
        self.slots[kind.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register interest in `kind`. Returns `true` when the caller moved the
    /// slot from idle to fetching and must now run the fetch.
    pub fn enqueue(&self, kind: ResourceKind, callback: Option<RefreshCallback>) -> bool {
        let mut slot = self.slot(kind);
        if let Some(callback) = callback {
            slot.pending.push(callback);
        }
        if slot.fetching {
            debug!(resource = %kind, waiting = slot.pending.len(), "Coalesced onto in-flight refresh");
            return false;
        }
        slot.fetching = true;
        true
    }

    /// Return the slot to idle and hand back every queued callback, in
    /// arrival order. Callers invoke them after dropping all locks.
    pub fn finish(&self, kind: ResourceKind) -> Vec<RefreshCallback> {
        let mut slot = self.slot(kind);
        slot.fetching = false;
        std::mem::take(&mut slot.pending)
    }

    /// `finish` and deliver `outcome` to every waiter.
    pub fn complete(&self, kind: ResourceKind, outcome: bool) -> usize {
        let callbacks = self.finish(kind);
        let delivered = callbacks.len();
        for callback in callbacks {
            callback(outcome);
        }
        delivered
    }

    pub fn is_fetching(&self, kind: ResourceKind) -> bool {
        self.slot(kind).fetching
    }

    pub fn pending(&self, kind: ResourceKind) -> usize {
        self.slot(kind).pending.len()
    }

    /// Flag `kind` so the owner of the next (or current) fetch discards the
    /// resident contents before merging.
    pub fn mark_invalid(&self, kind: ResourceKind) {
        self.slot(kind).invalidated = true;
    }

    /// Consume the invalidation flag.
    pub fn take_invalidation(&self, kind: ResourceKind) -> bool {
        std::mem::take(&mut self.slot(kind).invalidated)
    }
}
