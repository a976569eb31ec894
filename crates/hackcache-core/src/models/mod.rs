//! Data models for server-owned resources.
//!
//! - `Announcement`: broadcast messages with a category bit set
//! - `Event`, `Location`: the schedule and the places it happens
//! - `Floor`: venue map floors
//! - `ScanEvent`, `ScannedDataField`: badge scanning
//! - `Countdown`: the event window

pub mod announcement;
pub mod countdown;
pub mod event;
pub mod floor;
pub mod location;
pub mod scan;

pub use announcement::{Announcement, Category};
pub use countdown::Countdown;
pub use event::{Event, EventCategory};
pub use floor::Floor;
pub use location::Location;
pub use scan::{ScanEvent, ScanResult, ScannedDataField};
