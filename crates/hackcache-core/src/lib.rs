//! Offline data cache for the hackathon companion app.
//!
//! `SyncService` mirrors server-owned resources on the device: it refreshes
//! each one through a coalescing single-flight gate, folds incremental
//! payloads into resident collections, manages the session credential and
//! persists everything to a snapshot so the app works offline at launch.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod events;
pub mod models;
pub mod service;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiError, NetworkActivity, RequestGateway, Transport};
pub use auth::{CredentialManager, Identity, SecretStore};
pub use cache::{Collection, MergeOutcome, Snapshot};
pub use config::Config;
pub use events::{CacheEvent, NotificationBus};
pub use service::{SyncService, WriteOp};
pub use sync::{RefreshError, ResourceKind};
