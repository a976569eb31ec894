//! Incremental merge of server payloads into resident state.
//!
//! A payload is a JSON object holding an array of item representations under
//! the entity kind's results key, plus an optional `date_updated` marker. Each
//! item is either an upsert or a tombstone (`"deleted": true`). Items that fail
//! to decode are skipped individually.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::collection::{Collection, Entity};

/// Top-level payload key carrying the server's own high-water mark.
pub const DATE_UPDATED_KEY: &str = "date_updated";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Payload has no `{0}` entry")]
    MissingResults(&'static str),

    #[error("None of the {0} records in the payload could be decoded")]
    NothingDecoded(usize),
}

/// What a merge did to the resident state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub skipped: usize,
}

impl MergeOutcome {
    /// An insert, an update with different field values, or a removal happened.
    pub fn changed(&self) -> bool {
        self.inserted + self.updated + self.removed > 0
    }

    pub(crate) fn replaced() -> Self {
        Self {
            updated: 1,
            ..Self::default()
        }
    }
}

/// Resident state that can absorb a server payload.
///
/// Implementations mutate `self` in place; callers run them on a private copy
/// and install the copy only when the merge succeeds.
pub trait Mergeable: Clone + Send + Sync + 'static {
    /// Value for the refresh route's `since` filter.
    fn since(&self) -> Option<i64>;

    /// Fold `payload` into `self`. `full` is true when the payload is not
    /// filtered by `since` (first fetch, or a snapshot restore).
    fn merge_payload(&mut self, payload: &Value, full: bool) -> Result<MergeOutcome, MergeError>;

    /// Representation stored in the snapshot. Merging it into an empty value
    /// reproduces `self`.
    fn to_serialized(&self) -> Value;

    /// Forget everything so the next fetch is a full one.
    /// Reports what was discarded.
    fn invalidate(&mut self) -> MergeOutcome;
}

#[derive(Debug, Deserialize)]
struct ItemHeader {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    updated_at: Option<i64>,
}

impl<T: Entity> Mergeable for Collection<T> {
    fn since(&self) -> Option<i64> {
        self.high_water_mark()
    }

    fn merge_payload(&mut self, payload: &Value, full: bool) -> Result<MergeOutcome, MergeError> {
        let object = payload.as_object().ok_or(MergeError::NotAnObject)?;
        let items = object
            .get(T::RESULTS_KEY)
            .and_then(Value::as_array)
            .ok_or(MergeError::MissingResults(T::RESULTS_KEY))?;

        let mut outcome = MergeOutcome::default();
        let mut mark = self.high_water_mark();
        let mut decoded = 0usize;
        let mut tombstones = 0usize;
        // State of every touched ID before the merge, compared once at the end
        let mut before: HashMap<String, Option<T>> = HashMap::new();

        for item in items {
            let header = match ItemHeader::deserialize(item) {
                Ok(header) => header,
                Err(e) => {
                    debug!(kind = T::RESULTS_KEY, error = %e, "Skipping record without a readable header");
                    outcome.skipped += 1;
                    continue;
                }
            };

            if header.deleted {
                let Some(id) = header.id else {
                    outcome.skipped += 1;
                    continue;
                };
                tombstones += 1;
                mark = mark.max(header.updated_at);
                before.entry(id.clone()).or_insert_with(|| self.get(&id).cloned());
                self.remove(&id);
                continue;
            }

            match T::deserialize(item) {
                Ok(entity) => {
                    decoded += 1;
                    mark = mark.max(entity.marker());
                    before
                        .entry(entity.id().to_string())
                        .or_insert_with(|| self.get(entity.id()).cloned());
                    self.upsert(entity);
                }
                Err(e) => {
                    debug!(kind = T::RESULTS_KEY, id = ?header.id, error = %e, "Skipping undecodable record");
                    outcome.skipped += 1;
                }
            }
        }

        for (id, original) in &before {
            match (original, self.get(id)) {
                (None, Some(_)) => outcome.inserted += 1,
                (Some(_), None) => outcome.removed += 1,
                (Some(old), Some(new)) if old != new => outcome.updated += 1,
                _ => {}
            }
        }

        if full && decoded == 0 && tombstones == 0 && outcome.skipped > 0 {
            warn!(kind = T::RESULTS_KEY, skipped = outcome.skipped, "Full payload had no decodable records");
            return Err(MergeError::NothingDecoded(outcome.skipped));
        }
        if outcome.skipped > 0 {
            warn!(kind = T::RESULTS_KEY, skipped = outcome.skipped, "Skipped malformed records during merge");
        }

        mark = mark.max(object.get(DATE_UPDATED_KEY).and_then(Value::as_i64));
        self.set_high_water_mark(mark);

        if !before.is_empty() {
            self.resort();
        }

        Ok(outcome)
    }

    fn to_serialized(&self) -> Value {
        let items: Vec<Value> = self
            .iter()
            .filter_map(|item| serde_json::to_value(item).ok())
            .collect();

        let mut object = Map::new();
        object.insert(T::RESULTS_KEY.to_string(), Value::Array(items));
        if let Some(mark) = self.high_water_mark() {
            object.insert(DATE_UPDATED_KEY.to_string(), Value::from(mark));
        }
        Value::Object(object)
    }

    fn invalidate(&mut self) -> MergeOutcome {
        let removed = self.len();
        Collection::invalidate(self);
        MergeOutcome {
            removed,
            ..MergeOutcome::default()
        }
    }
}
