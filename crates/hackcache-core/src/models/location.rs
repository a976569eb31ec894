use serde::{Deserialize, Serialize};

use crate::cache::Entity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl Entity for Location {
    const RESULTS_KEY: &'static str = "locations";

    fn id(&self) -> &str {
        &self.id
    }

    fn marker(&self) -> Option<i64> {
        self.updated_at
    }
}
