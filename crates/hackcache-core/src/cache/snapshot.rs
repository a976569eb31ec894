use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::auth::Identity;
use crate::sync::ResourceKind;

/// Snapshot file name in the cache directory
pub const SNAPSHOT_FILE: &str = "archive.json";

const SAVED_AT_KEY: &str = "saved_at";
const CREDENTIAL_KEY: &str = "credential";

/// Whole-file byte storage used for the snapshot.
pub trait DurableFile: Send + Sync {
    /// `Ok(None)` when the file does not exist.
    fn read_all(&self, path: &Path) -> Result<Option<Vec<u8>>>;
    fn write_all(&self, path: &Path, bytes: &[u8]) -> Result<()>;
}

/// `DurableFile` backed by the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsDurableFile;

impl DurableFile for FsDurableFile {
    fn read_all(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(bytes))
    }

    fn write_all(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        // Write a sibling then rename so readers never see a torn file
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

/// Aggregate on-disk record of the whole cache.
///
/// One named field per cached resource plus the credential's non-secret
/// identity. No schema version is carried; a missing or unreadable field is
/// treated as "not present".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub saved_at: Option<DateTime<Utc>>,
    pub credential: Option<Identity>,
    resources: HashMap<ResourceKind, Value>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self {
            saved_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn resource(&self, kind: ResourceKind) -> Option<&Value> {
        self.resources.get(&kind)
    }

    pub fn set_resource(&mut self, kind: ResourceKind, value: Value) {
        self.resources.insert(kind, value);
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut object = Map::new();
        if let Some(saved_at) = self.saved_at {
            object.insert(SAVED_AT_KEY.to_string(), serde_json::to_value(saved_at)?);
        }
        if let Some(ref identity) = self.credential {
            object.insert(CREDENTIAL_KEY.to_string(), serde_json::to_value(identity)?);
        }
        for kind in ResourceKind::CACHED {
            if let Some(value) = self.resources.get(&kind) {
                object.insert(kind.snapshot_key().to_string(), value.clone());
            }
        }
        Ok(serde_json::to_vec_pretty(&Value::Object(object))?)
    }

    /// Decode field by field. Returns `None` only when the bytes are not a
    /// JSON object at all.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let object = match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(object)) => object,
            Ok(_) => {
                warn!("Snapshot is not a JSON object, ignoring it");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Snapshot is corrupt, ignoring it");
                return None;
            }
        };

        let saved_at = object
            .get(SAVED_AT_KEY)
            .and_then(|v| DateTime::<Utc>::deserialize(v).ok());
        let credential = object.get(CREDENTIAL_KEY).and_then(|v| match Identity::deserialize(v) {
            Ok(identity) => Some(identity),
            Err(e) => {
                debug!(error = %e, "Ignoring unreadable credential field");
                None
            }
        });
        let resources = ResourceKind::CACHED
            .into_iter()
            .filter_map(|kind| object.get(kind.snapshot_key()).map(|v| (kind, v.clone())))
            .collect();

        Some(Self {
            saved_at,
            credential,
            resources,
        })
    }

    pub fn age_minutes(&self) -> Option<i64> {
        self.saved_at.map(|saved| (Utc::now() - saved).num_minutes())
    }

    pub fn age_display(&self) -> String {
        let Some(minutes) = self.age_minutes() else {
            return "never".to_string();
        };
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}

/// Saves and loads the single aggregate snapshot file.
pub struct SnapshotStore {
    file: Arc<dyn DurableFile>,
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(file: Arc<dyn DurableFile>, cache_dir: &Path) -> Self {
        Self {
            file,
            path: cache_dir.join(SNAPSHOT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stored snapshot. Failures are logged, never surfaced:
    /// everything in the snapshot can be fetched again.
    pub fn save(&self, snapshot: &Snapshot) -> bool {
        let result = snapshot
            .to_bytes()
            .and_then(|bytes| self.file.write_all(&self.path, &bytes));
        match result {
            Ok(()) => {
                debug!(path = %self.path.display(), "Snapshot saved");
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to save snapshot");
                false
            }
        }
    }

    /// Absence, IO errors and corruption all mean "no cache".
    pub fn load(&self) -> Option<Snapshot> {
        match self.file.read_all(&self.path) {
            Ok(Some(bytes)) => Snapshot::from_bytes(&bytes),
            Ok(None) => {
                debug!(path = %self.path.display(), "No snapshot on disk");
                None
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read snapshot");
                None
            }
        }
    }
}
