use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::Entity;

/// Something attendees can be scanned into (meals, swag, check-in).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanEvent {
    pub id: String,
    pub name: String,
    #[serde(
        rename = "expiry_date",
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl ScanEvent {
    pub fn is_expired(&self, at: DateTime<Utc>) -> bool {
        self.expires_at.map(|expiry| at >= expiry).unwrap_or(false)
    }
}

impl Entity for ScanEvent {
    const RESULTS_KEY: &'static str = "scan_events";

    fn id(&self) -> &str {
        &self.id
    }

    fn marker(&self) -> Option<i64> {
        self.updated_at
    }
}

/// One label/value pair returned by the server after a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedDataField {
    pub label: String,
    pub value: String,
    /// Hex RGB, e.g. `"ff3232"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl ScannedDataField {
    /// Parsed `(r, g, b)`; black when absent or malformed.
    pub fn rgb(&self) -> (u8, u8, u8) {
        let Some(value) = self
            .color
            .as_deref()
            .and_then(|c| u32::from_str_radix(c.trim_start_matches('#'), 16).ok())
        else {
            return (0, 0, 0);
        };
        (
            ((value >> 16) & 0xFF) as u8,
            ((value >> 8) & 0xFF) as u8,
            (value & 0xFF) as u8,
        )
    }
}

/// Result of a scan attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub scanned: bool,
    pub fields: Vec<ScannedDataField>,
}
