// =============================================================================
// Series Storage: durable byte-level persistence per TimeframeKey
// =============================================================================
//
// The candle store only needs two things from storage: read the bytes last
// written for a key, and replace them atomically. The file backend writes a
// temporary sibling and renames it over the target, so a crash mid-write
// leaves either the old or the new series on disk, never a torn one.
// =============================================================================

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{HubError, HubResult};
use crate::types::TimeframeKey;

/// Durable byte storage keyed by series.
pub trait SeriesStorage: Send + Sync {
    /// Bytes last written for `key`, or `None` if nothing was ever written.
    fn read(&self, key: &TimeframeKey) -> HubResult<Option<Vec<u8>>>;

    /// Replace the stored bytes for `key`; all-or-nothing.
    fn write_atomic(&self, key: &TimeframeKey, bytes: &[u8]) -> HubResult<()>;
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

/// One JSON file per key under `<root>/<market>/<ASSET>/<timeframe>.json`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Key components are validated on construction, so each key maps to
    /// its own file.
    fn path_for(&self, key: &TimeframeKey) -> PathBuf {
        self.root
            .join(key.market_id())
            .join(key.asset())
            .join(format!("{}.json", key.timeframe()))
    }
}

impl SeriesStorage for FileStorage {
    fn read(&self, key: &TimeframeKey) -> HubResult<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HubError::storage(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    fn write_atomic(&self, key: &TimeframeKey, bytes: &[u8]) -> HubResult<()> {
        let path = self.path_for(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                HubError::storage(format!("failed to create {}: {e}", dir.display()))
            })?;
        }

        let tmp_path = path.with_extension("json.tmp");
        let write_tmp = || -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()
        };
        write_tmp().map_err(|e| {
            HubError::storage(format!("failed to write {}: {e}", tmp_path.display()))
        })?;

        fs::rename(&tmp_path, &path).map_err(|e| {
            HubError::storage(format!("failed to rename onto {}: {e}", path.display()))
        })?;

        debug!(path = %path.display(), bytes = bytes.len(), "series written");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Volatile storage for running without a cache directory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: RwLock<HashMap<TimeframeKey, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SeriesStorage for MemoryStorage {
    fn read(&self, key: &TimeframeKey) -> HubResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(key).cloned())
    }

    fn write_atomic(&self, key: &TimeframeKey, bytes: &[u8]) -> HubResult<()> {
        self.blobs.write().insert(key.clone(), bytes.to_vec());
        Ok(())
    }
}
