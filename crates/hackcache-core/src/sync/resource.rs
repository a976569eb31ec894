use std::fmt;

use serde::{Deserialize, Serialize};

/// One named kind of server-owned data mirrored on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Announcements,
    Countdown,
    Events,
    Locations,
    Map,
    ScanEvents,
    Profile,
}

impl ResourceKind {
    pub const COUNT: usize = 7;

    pub const ALL: [ResourceKind; Self::COUNT] = [
        ResourceKind::Announcements,
        ResourceKind::Countdown,
        ResourceKind::Events,
        ResourceKind::Locations,
        ResourceKind::Map,
        ResourceKind::ScanEvents,
        ResourceKind::Profile,
    ];

    /// Resources persisted in the snapshot as their own field.
    /// Profile data travels with the credential instead.
    pub const CACHED: [ResourceKind; 6] = [
        ResourceKind::Announcements,
        ResourceKind::Countdown,
        ResourceKind::Events,
        ResourceKind::Locations,
        ResourceKind::Map,
        ResourceKind::ScanEvents,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            ResourceKind::Announcements => 0,
            ResourceKind::Countdown => 1,
            ResourceKind::Events => 2,
            ResourceKind::Locations => 3,
            ResourceKind::Map => 4,
            ResourceKind::ScanEvents => 5,
            ResourceKind::Profile => 6,
        }
    }

    /// Refresh route, relative to the configured base URL.
    pub fn route(self) -> &'static str {
        match self {
            ResourceKind::Announcements => "/v1/announcements/",
            ResourceKind::Countdown => "/v1/configuration/",
            ResourceKind::Events => "/v1/events/",
            ResourceKind::Locations => "/v1/locations/",
            ResourceKind::Map => "/v1/map/",
            ResourceKind::ScanEvents => "/v1/scan_events/",
            ResourceKind::Profile => "/v1/profile/",
        }
    }

    /// Field name used for this resource inside the snapshot record.
    pub fn snapshot_key(self) -> &'static str {
        match self {
            ResourceKind::Announcements => "announcements",
            ResourceKind::Countdown => "countdown",
            ResourceKind::Events => "events",
            ResourceKind::Locations => "locations",
            ResourceKind::Map => "map",
            ResourceKind::ScanEvents => "scan_events",
            ResourceKind::Profile => "profile",
        }
    }

    /// Resource that must be fresh before this one is fetched.
    pub fn depends_on(self) -> Option<ResourceKind> {
        match self {
            ResourceKind::Events => Some(ResourceKind::Locations),
            _ => None,
        }
    }

    /// Parse a user-supplied resource name (CLI, config).
    pub fn parse(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.snapshot_key() == normalized)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.snapshot_key())
    }
}
