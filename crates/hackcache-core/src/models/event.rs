use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{Collection, Entity};
use crate::models::Location;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    General,
    Logistics,
    Food,
    Learn,
    Social,
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventCategory::General => write!(f, "General"),
            EventCategory::Logistics => write!(f, "Logistics"),
            EventCategory::Food => write!(f, "Food"),
            EventCategory::Learn => write!(f, "Learn"),
            EventCategory::Social => write!(f, "Social"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub category: EventCategory,
    #[serde(rename = "location")]
    pub location_id: String,
    #[serde(rename = "startDate", with = "chrono::serde::ts_milliseconds")]
    pub start: DateTime<Utc>,
    #[serde(rename = "endDate", with = "chrono::serde::ts_milliseconds")]
    pub end: DateTime<Utc>,
    #[serde(rename = "desc", default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl Event {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn is_happening_at(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Look up this event's location in a locations collection.
    pub fn location<'a>(&self, locations: &'a Collection<Location>) -> Option<&'a Location> {
        locations.get(&self.location_id)
    }

    pub fn formatted_time(&self) -> String {
        format!("{} - {}", self.start.format("%a %H:%M"), self.end.format("%H:%M"))
    }
}

impl Entity for Event {
    const RESULTS_KEY: &'static str = "events";

    fn id(&self) -> &str {
        &self.id
    }

    fn marker(&self) -> Option<i64> {
        self.updated_at
    }

    fn display_order(a: &Self, b: &Self) -> Ordering {
        a.start.cmp(&b.start)
    }
}
