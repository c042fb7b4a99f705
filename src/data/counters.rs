//! Persistent dataset counters.
//!
//! Every data directory (global, proposal, sample) keeps its own JSON counter file
//! mapping dataset kinds to their last assigned number:
//!
//! ```text
//! {
//!   "block": 3,
//!   "point": 2214,
//!   "scan": 118
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ScanResult;

/// Storage backend for dataset counters.
pub trait CounterStore: Send + Sync {
    /// Current value of `key` in `dir` (0 if never written).
    fn read(&self, dir: &Path, key: &str) -> ScanResult<u64>;

    /// Persist `value` for `key` in `dir`.
    fn write(&self, dir: &Path, key: &str, value: u64) -> ScanResult<()>;
}

/// Counters kept in a JSON file inside each data directory.
#[derive(Debug, Clone)]
pub struct FileCounterStore {
    filename: String,
}

impl FileCounterStore {
    /// Store using `filename` inside every directory.
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
        }
    }

    fn path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.filename)
    }

    fn load(&self, dir: &Path) -> ScanResult<BTreeMap<String, u64>> {
        let path = self.path(dir);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let json = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Replace the counter file in one rename so a crash never leaves it truncated.
    fn save(&self, dir: &Path, counters: &BTreeMap<String, u64>) -> ScanResult<()> {
        fs::create_dir_all(dir)?;
        let path = self.path(dir);
        let staging = dir.join(format!(".{}.tmp", self.filename));
        let json = serde_json::to_string_pretty(counters)?;
        fs::write(&staging, json)?;
        fs::rename(&staging, &path)?;
        Ok(())
    }
}

impl Default for FileCounterStore {
    fn default() -> Self {
        Self::new("counters.json")
    }
}

impl CounterStore for FileCounterStore {
    fn read(&self, dir: &Path, key: &str) -> ScanResult<u64> {
        Ok(self.load(dir)?.get(key).copied().unwrap_or(0))
    }

    fn write(&self, dir: &Path, key: &str, value: u64) -> ScanResult<()> {
        let mut counters = self.load(dir)?;
        counters.insert(key.to_string(), value);
        self.save(dir, &counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScanError;
    use tempfile::tempdir;

    #[test]
    fn missing_file_reads_zero() {
        let dir = tempdir().unwrap();
        let store = FileCounterStore::default();
        assert_eq!(store.read(dir.path(), "scan").unwrap(), 0);
    }

    #[test]
    fn keys_are_independent() {
        let dir = tempdir().unwrap();
        let store = FileCounterStore::new("counters.json");
        store.write(dir.path(), "scan", 7).unwrap();
        store.write(dir.path(), "point", 12).unwrap();
        store.write(dir.path(), "scan", 8).unwrap();

        assert_eq!(store.read(dir.path(), "scan").unwrap(), 8);
        assert_eq!(store.read(dir.path(), "point").unwrap(), 12);

        let json = fs::read_to_string(dir.path().join("counters.json")).unwrap();
        let stored: BTreeMap<String, u64> = serde_json::from_str(&json).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored["point"], 12);
        assert!(!dir.path().join(".counters.json.tmp").exists());
    }

    #[test]
    fn creates_missing_directories() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("p1234").join("sample");
        let store = FileCounterStore::default();
        store.write(&nested, "block", 1).unwrap();
        assert_eq!(store.read(&nested, "block").unwrap(), 1);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("counters.json"), "scan 3\n").unwrap();
        let store = FileCounterStore::default();
        assert!(matches!(
            store.read(dir.path(), "scan"),
            Err(ScanError::Serialization(_))
        ));
    }
}
