//! Refresh coordination.
//!
//! This module provides:
//! - `ResourceKind`: the resources mirrored locally, their routes and
//!   snapshot fields
//! - `RefreshGate`: at most one fetch in flight per resource, with late
//!   callers queued onto it
//! - `RefreshError`: the reason a refresh reported failure

pub mod error;
pub mod gate;
pub mod resource;

pub use error::RefreshError;
pub use gate::{RefreshCallback, RefreshGate};
pub use resource::ResourceKind;
