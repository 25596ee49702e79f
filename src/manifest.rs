//! Journaled registry of the live WAL and page files.
//!
//! The manifest is a small JSON document under the storage root. Every
//! mutation rewrites it through a temp file, fsync, atomic rename, and
//! parent-directory sync, so a crash can leave a data file without a
//! manifest entry (swept by fsck) but never an entry without its file:
//! files are registered only after they are fully on disk and
//! deregistered before they are unlinked.

use crate::error::StoreError;

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const MANIFEST_FILE_NAME: &str = "Manifest";

/// On-disk layout of the manifest document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestDoc {
    format: String,
    pages: Vec<String>,
    wals: Vec<String>,
}

impl ManifestDoc {
    fn new(format: &str) -> Self {
        ManifestDoc {
            format: format.to_string(),
            pages: Vec::new(),
            wals: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    inner: Mutex<ManifestDoc>,
}

impl Manifest {
    /// Opens or creates the manifest under `storage_root`.
    pub fn open(storage_root: &Path, format: &str) -> Result<Self, StoreError> {
        let path = storage_root.join(MANIFEST_FILE_NAME);
        let doc = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| StoreError::corruption(format!("Manifest parse failed: {}", e)))?
        } else {
            let doc = ManifestDoc::new(format);
            write_atomic(&path, &doc)?;
            doc
        };
        Ok(Manifest { path, inner: Mutex::new(doc) })
    }

    pub fn page_list(&self) -> Vec<String> {
        self.inner.lock().map(|d| d.pages.clone()).unwrap_or_default()
    }

    pub fn wal_list(&self) -> Vec<String> {
        self.inner.lock().map(|d| d.wals.clone()).unwrap_or_default()
    }

    pub fn page_append(&self, name: &str) -> Result<(), StoreError> {
        let mut doc = self.inner.lock()?;
        if !doc.pages.iter().any(|p| p == name) {
            doc.pages.push(name.to_string());
            write_atomic(&self.path, &doc)?;
        }
        Ok(())
    }

    pub fn page_rm(&self, name: &str) -> Result<(), StoreError> {
        let mut doc = self.inner.lock()?;
        let before = doc.pages.len();
        doc.pages.retain(|p| p != name);
        if doc.pages.len() != before {
            write_atomic(&self.path, &doc)?;
        }
        Ok(())
    }

    pub fn wal_append(&self, name: &str) -> Result<(), StoreError> {
        let mut doc = self.inner.lock()?;
        if !doc.wals.iter().any(|w| w == name) {
            doc.wals.push(name.to_string());
            write_atomic(&self.path, &doc)?;
        }
        Ok(())
    }

    pub fn wal_rm(&self, name: &str) -> Result<(), StoreError> {
        let mut doc = self.inner.lock()?;
        let before = doc.wals.len();
        doc.wals.retain(|w| w != name);
        if doc.wals.len() != before {
            write_atomic(&self.path, &doc)?;
        }
        Ok(())
    }

    pub fn get_format(&self) -> String {
        self.inner.lock().map(|d| d.format.clone()).unwrap_or_default()
    }

    pub fn set_format(&self, format: &str) -> Result<(), StoreError> {
        let mut doc = self.inner.lock()?;
        doc.format = format.to_string();
        write_atomic(&self.path, &doc)
    }
}

fn write_atomic(path: &Path, doc: &ManifestDoc) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(doc)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let tmp = path.with_extension("tmp");
    let mut f = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp)?;
    f.write_all(&bytes)?;
    f.sync_data()?;
    drop(f);
    fs::rename(&tmp, path)?;
    sync_parent_dir(path)?;
    Ok(())
}

fn sync_parent_dir(path: &Path) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Internal("Missing parent dir".to_string()))?;
    let dir = File::open(parent)?;
    dir.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_append_and_reload() {
        let dir = tempdir().unwrap();
        {
            let m = Manifest::open(dir.path(), "1").unwrap();
            m.wal_append("a.wal").unwrap();
            m.wal_append("b.wal").unwrap();
            m.page_append("a.page").unwrap();
            m.wal_rm("a.wal").unwrap();
        }
        let m = Manifest::open(dir.path(), "1").unwrap();
        assert_eq!(m.wal_list(), vec!["b.wal".to_string()]);
        assert_eq!(m.page_list(), vec!["a.page".to_string()]);
        assert_eq!(m.get_format(), "1");
    }

    #[test]
    fn appends_are_idempotent() {
        let dir = tempdir().unwrap();
        let m = Manifest::open(dir.path(), "1").unwrap();
        m.page_append("p").unwrap();
        m.page_append("p").unwrap();
        assert_eq!(m.page_list().len(), 1);
    }

    #[test]
    fn format_tag_round_trips() {
        let dir = tempdir().unwrap();
        {
            let m = Manifest::open(dir.path(), "1").unwrap();
            m.set_format("2").unwrap();
        }
        let m = Manifest::open(dir.path(), "1").unwrap();
        assert_eq!(m.get_format(), "2");
    }

    #[test]
    fn garbage_manifest_is_a_corruption_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE_NAME), b"not json").unwrap();
        let err = Manifest::open(dir.path(), "1").unwrap_err();
        assert!(matches!(err, StoreError::Corruption { .. }));
    }
}
