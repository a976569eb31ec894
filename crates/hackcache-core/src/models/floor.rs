use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::cache::Entity;

/// One floor of the venue map.
///
/// `offset_fraction` is the floor's vertical position within the stacked
/// floor-plan view (0.0 top, 1.0 bottom); `aspect_ratio` is the image's
/// width over height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Floor {
    pub id: String,
    pub name: String,
    #[serde(rename = "level")]
    pub index: i32,
    #[serde(default)]
    pub description: String,
    pub image_url: String,
    #[serde(default)]
    pub offset_fraction: f64,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

fn default_aspect_ratio() -> f64 {
    1.0
}

impl Entity for Floor {
    const RESULTS_KEY: &'static str = "floors";

    fn id(&self) -> &str {
        &self.id
    }

    fn marker(&self) -> Option<i64> {
        self.updated_at
    }

    fn display_order(a: &Self, b: &Self) -> Ordering {
        a.index.cmp(&b.index)
    }
}
