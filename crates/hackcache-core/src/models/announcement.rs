use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::Entity;

/// Bit set of announcement categories, as sent by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(u32);

impl Category {
    pub const NONE: Category = Category(0);
    pub const EMERGENCY: Category = Category(1 << 0);
    pub const LOGISTICS: Category = Category(1 << 1);
    pub const FOOD: Category = Category(1 << 2);
    pub const SWAG: Category = Category(1 << 3);
    pub const SPONSOR: Category = Category(1 << 4);
    pub const OTHER: Category = Category(1 << 5);

    const NAMED: [(Category, &'static str); 6] = [
        (Category::EMERGENCY, "Emergency"),
        (Category::LOGISTICS, "Logistics"),
        (Category::FOOD, "Food"),
        (Category::SWAG, "Swag"),
        (Category::SPONSOR, "Sponsor"),
        (Category::OTHER, "Other"),
    ];

    pub fn from_bits(bits: u32) -> Self {
        Category(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Category) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl std::ops::BitOr for Category {
    type Output = Category;

    fn bitor(self, rhs: Category) -> Category {
        Category(self.0 | rhs.0)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names();
        if names.is_empty() {
            f.write_str("None")
        } else {
            f.write_str(&names.join(", "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: String,
    #[serde(rename = "name")]
    pub title: String,
    #[serde(rename = "info")]
    pub message: String,
    #[serde(rename = "broadcast_time", with = "chrono::serde::ts_milliseconds")]
    pub broadcast_at: DateTime<Utc>,
    #[serde(default)]
    pub category: Category,
    #[serde(rename = "is_approved", default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl Announcement {
    /// Form fields sent when creating or updating an announcement.
    /// Server-owned fields (id, approval, marker) are not included.
    pub fn to_form(&self) -> Vec<(String, String)> {
        vec![
            ("name".to_string(), self.title.clone()),
            ("info".to_string(), self.message.clone()),
            (
                "broadcast_time".to_string(),
                self.broadcast_at.timestamp_millis().to_string(),
            ),
            ("category".to_string(), self.category.bits().to_string()),
        ]
    }
}

impl Entity for Announcement {
    const RESULTS_KEY: &'static str = "announcements";

    fn id(&self) -> &str {
        &self.id
    }

    fn marker(&self) -> Option<i64> {
        self.updated_at
    }

    /// Newest first
    fn display_order(a: &Self, b: &Self) -> Ordering {
        b.broadcast_at.cmp(&a.broadcast_at)
    }
}
