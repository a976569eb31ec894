use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cache::{MergeError, MergeOutcome, Mergeable};

/// Key wrapping the countdown object in payloads and the snapshot
const CONFIGURATION_KEY: &str = "configuration";

/// The event window the countdown runs over.
///
/// Unlike collections this is a single object: a payload replaces it wholesale
/// and there is no incremental `since` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Countdown {
    #[serde(rename = "start_date", with = "chrono::serde::ts_milliseconds")]
    pub start: DateTime<Utc>,
    #[serde(rename = "end_date", with = "chrono::serde::ts_milliseconds")]
    pub end: DateTime<Utc>,
}

impl Default for Countdown {
    fn default() -> Self {
        Self {
            start: DateTime::UNIX_EPOCH,
            end: DateTime::UNIX_EPOCH,
        }
    }
}

impl Countdown {
    pub fn is_configured(&self) -> bool {
        self.end > self.start
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Time left, with `at` clamped into the window.
    pub fn time_remaining(&self, at: DateTime<Utc>) -> Duration {
        let clamped = at.clamp(self.start, self.end.max(self.start));
        self.end.max(self.start) - clamped
    }

    /// Fraction of the window elapsed, in `0.0..=1.0`.
    pub fn progress(&self, at: DateTime<Utc>) -> f64 {
        let total = self.duration().num_milliseconds();
        if total <= 0 {
            return 0.0;
        }
        1.0 - self.time_remaining(at).num_milliseconds() as f64 / total as f64
    }

    /// `HH:MM:SS`, hours unbounded.
    pub fn remaining_display(&self, at: DateTime<Utc>) -> String {
        let total = self.time_remaining(at).num_seconds();
        format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
    }
}

impl Mergeable for Countdown {
    fn since(&self) -> Option<i64> {
        None
    }

    fn merge_payload(&mut self, payload: &Value, _full: bool) -> Result<MergeOutcome, MergeError> {
        let object = payload.as_object().ok_or(MergeError::NotAnObject)?;
        let config = object
            .get(CONFIGURATION_KEY)
            .ok_or(MergeError::MissingResults(CONFIGURATION_KEY))?;
        let fresh = Countdown::deserialize(config).map_err(|_| MergeError::NothingDecoded(1))?;

        if fresh == *self {
            return Ok(MergeOutcome::default());
        }
        *self = fresh;
        Ok(MergeOutcome::replaced())
    }

    fn to_serialized(&self) -> Value {
        json!({ CONFIGURATION_KEY: self })
    }

    fn invalidate(&mut self) -> MergeOutcome {
        if *self == Countdown::default() {
            return MergeOutcome::default();
        }
        *self = Countdown::default();
        MergeOutcome::replaced()
    }
}
