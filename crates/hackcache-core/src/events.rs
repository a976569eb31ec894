//! Typed notification bus.
//!
//! Components publish `CacheEvent`s; any number of subscribers (UI, CLI)
//! receive them. Publishing never blocks and never fails: with no
//! subscribers the event is dropped.

use tokio::sync::broadcast;
use tracing::trace;

use crate::cache::MergeOutcome;
use crate::sync::ResourceKind;

/// Buffered events per subscriber before the slowest one starts lagging
const BUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A refresh or restore changed a resource.
    ResourceUpdated {
        resource: ResourceKind,
        summary: MergeOutcome,
    },
    /// Login, logout, or revocation.
    SessionChanged { logged_in: bool },
    /// Identity or capability flags changed.
    ProfileUpdated,
    /// Something failed that passive UI may want to surface.
    Failure {
        resource: Option<ResourceKind>,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<CacheEvent>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(BUS_CAPACITY)
    }
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: CacheEvent) {
        trace!(?event, "Publishing event");
        let _ = self.tx.send(event);
    }
}
