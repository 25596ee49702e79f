//! Engine configuration persisted as `settings.json` under the storage
//! root. Defaults are written on first run so a deployment is always
//! self-describing; later opens re-read the saved file.

use crate::error::StoreError;
use crate::telemetry::{noop_event_listener, EngineEventListener};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Which tiers absorb writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Strategy {
    /// WAL only; files are compacted when explicitly asked to.
    Wal,
    /// WAL plus eager compaction of every sealed file.
    Compressed,
    /// Memory tier only; pressure and age flush to pages.
    Memory,
    /// WAL and memory together; the memory tier is a read-through cache
    /// whose evictions may simply drop.
    Cache,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Strategy::Wal => "WAL",
            Strategy::Compressed => "COMPRESSED",
            Strategy::Memory => "MEMORY",
            Strategy::Cache => "CACHE",
        };
        f.write_str(s)
    }
}

/// Tunables saved to disk. Everything not serializable (the event
/// listener) lives next to the persisted part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Max records per WAL file; a full file seals and rolls.
    pub wal_file_size: usize,
    /// In-process records buffered before a WAL write-through.
    pub wal_buffer_size: usize,
    /// Bytes per in-page chunk buffer.
    pub chunk_size: u32,
    /// Max chunks per page file.
    pub page_chunk_capacity: u32,
    /// Open pages kept mapped.
    pub page_cache_size: usize,
    pub strategy: Strategy,
    /// Memory-tier budget in bytes (0 disables the limit).
    pub memory_limit: usize,
    /// Fraction of `memory_limit` at which shedding starts.
    pub percent_when_start_dropping: f64,
    /// Fraction of `memory_limit` shed per trigger.
    pub percent_to_drop: f64,
    /// Measurements per memory-tier bucket.
    pub bucket_capacity: usize,
    /// Late-arrival window: older writes bypass the memory tier.
    pub write_window_ms: u64,
    /// Extra slack added to the flush tick period.
    pub write_window_sync_delta_ms: u64,

    #[serde(skip, default = "noop_event_listener")]
    pub event_listener: Arc<dyn EngineEventListener>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            wal_file_size: 2_000 * 4,
            wal_buffer_size: 2_000,
            chunk_size: 1024,
            page_chunk_capacity: 1024,
            page_cache_size: 10,
            strategy: Strategy::Compressed,
            memory_limit: 128 * 1024 * 1024,
            percent_when_start_dropping: 0.75,
            percent_to_drop: 0.15,
            bucket_capacity: 512,
            write_window_ms: 5_000,
            write_window_sync_delta_ms: 500,
            event_listener: noop_event_listener(),
        }
    }
}

impl Settings {
    /// Loads `settings.json` from `storage_root`, or writes the defaults
    /// there on first run.
    pub fn open(storage_root: &Path) -> Result<Self, StoreError> {
        let path = Self::file_path(storage_root);
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let settings: Settings = serde_json::from_str(&content)
                .map_err(|e| StoreError::Config(format!("settings parse failed: {}", e)))?;
            settings.validate()?;
            Ok(settings)
        } else {
            fs::create_dir_all(storage_root)?;
            let settings = Settings::default();
            settings.save(storage_root)?;
            Ok(settings)
        }
    }

    pub fn save(&self, storage_root: &Path) -> Result<(), StoreError> {
        self.validate()?;
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        fs::write(Self::file_path(storage_root), content)?;
        Ok(())
    }

    pub fn file_path(storage_root: &Path) -> PathBuf {
        storage_root.join(SETTINGS_FILE_NAME)
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.wal_file_size == 0 {
            return Err(StoreError::Config("wal_file_size must be positive".to_string()));
        }
        if self.chunk_size < 64 {
            return Err(StoreError::Config("chunk_size must be at least 64 bytes".to_string()));
        }
        if self.bucket_capacity == 0 {
            return Err(StoreError::Config("bucket_capacity must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.percent_when_start_dropping)
            || !(0.0..=1.0).contains(&self.percent_to_drop)
            || self.percent_to_drop > self.percent_when_start_dropping
        {
            return Err(StoreError::Config(
                "drop percentages must satisfy 0 <= to_drop <= when_start <= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// True when writes go to the WAL tier.
    pub fn uses_wal(&self) -> bool {
        !matches!(self.strategy, Strategy::Memory)
    }

    /// True when writes go to the memory tier.
    pub fn uses_memory(&self) -> bool {
        matches!(self.strategy, Strategy::Memory | Strategy::Cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn first_run_writes_defaults() {
        let dir = tempdir().unwrap();
        let s = Settings::open(dir.path()).unwrap();
        assert!(Settings::file_path(dir.path()).exists());
        assert_eq!(s.strategy, Strategy::Compressed);
    }

    #[test]
    fn saved_settings_are_reloaded() {
        let dir = tempdir().unwrap();
        {
            let mut s = Settings::open(dir.path()).unwrap();
            s.strategy = Strategy::Cache;
            s.wal_file_size = 123;
            s.save(dir.path()).unwrap();
        }
        let s = Settings::open(dir.path()).unwrap();
        assert_eq!(s.strategy, Strategy::Cache);
        assert_eq!(s.wal_file_size, 123);
    }

    #[test]
    fn strategy_serializes_as_upper_case() {
        let s = serde_json::to_string(&Strategy::Compressed).unwrap();
        assert_eq!(s, "\"COMPRESSED\"");
    }

    #[test]
    fn nonsense_percentages_are_rejected() {
        let dir = tempdir().unwrap();
        let mut s = Settings::default();
        s.percent_to_drop = 0.9;
        s.percent_when_start_dropping = 0.5;
        assert!(s.save(dir.path()).is_err());
    }
}
