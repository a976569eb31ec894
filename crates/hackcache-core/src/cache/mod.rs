//! Local cache of server-owned resources.
//!
//! This module provides:
//! - `Collection`: ordered, ID-indexed entities with a high-water mark
//! - The incremental merge engine (`Mergeable`) shared by network refresh
//!   and snapshot restore
//! - `Resident`: lock-free-read holder that installs merged copies atomically
//! - `SnapshotStore`: durable save/restore of the whole cache

pub mod collection;
pub mod merge;
pub mod resident;
pub mod snapshot;

pub use collection::{Collection, Entity};
pub use merge::{MergeError, MergeOutcome, Mergeable};
pub use resident::{Resident, ResidentStore};
pub use snapshot::{DurableFile, FsDurableFile, Snapshot, SnapshotStore};
