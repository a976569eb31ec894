use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Value;

use super::merge::{MergeError, MergeOutcome, Mergeable};

/// Type-erased view of a resident resource, used by the refresh and snapshot paths.
pub trait ResidentStore: Send + Sync {
    fn since(&self) -> Option<i64>;
    fn merge(&self, payload: &Value, full: bool) -> Result<MergeOutcome, MergeError>;
    fn to_serialized(&self) -> Value;
    fn invalidate(&self) -> MergeOutcome;

    /// A merge has succeeded at least once. Invalidation does not reset it.
    fn is_populated(&self) -> bool;
}

/// Shared, atomically replaced copy of one resource's state.
///
/// Readers clone the current `Arc` and never observe a partial merge: merges
/// run on a private copy that is swapped in once complete. Writers are
/// serialized by `writer`.
pub struct Resident<M: Mergeable> {
    current: RwLock<Arc<M>>,
    writer: Mutex<()>,
    populated: AtomicBool,
}

impl<M: Mergeable + Default> Default for Resident<M> {
    fn default() -> Self {
        Self::new(M::default())
    }
}

impl<M: Mergeable> Resident<M> {
    pub fn new(initial: M) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            writer: Mutex::new(()),
            populated: AtomicBool::new(false),
        }
    }

    /// Current contents. Cheap; holds no lock after returning.
    pub fn load(&self) -> Arc<M> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn install(&self, value: M) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(value);
    }
}

impl<M: Mergeable> ResidentStore for Resident<M> {
    fn since(&self) -> Option<i64> {
        self.load().since()
    }

    fn merge(&self, payload: &Value, full: bool) -> Result<MergeOutcome, MergeError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let mut working = (*self.load()).clone();
        let previous_mark = working.since();
        let outcome = working.merge_payload(payload, full)?;

        if outcome.changed() || working.since() != previous_mark {
            self.install(working);
        }
        self.populated.store(true, Ordering::Release);
        Ok(outcome)
    }

    fn to_serialized(&self) -> Value {
        self.load().to_serialized()
    }

    fn invalidate(&self) -> MergeOutcome {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut working = (*self.load()).clone();
        let outcome = working.invalidate();
        self.install(working);
        outcome
    }

    fn is_populated(&self) -> bool {
        self.populated.load(Ordering::Acquire)
    }
}
