use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tempfile::tempdir;

use strata::page::PageWriter;
use strata::wal::WalFile;
use strata::{Engine, Meas, QueryInterval, Settings, Strategy};

fn small_settings(strategy: Strategy) -> Settings {
    let mut s = Settings::default();
    s.strategy = strategy;
    s.wal_file_size = 512;
    s.wal_buffer_size = 32;
    s.chunk_size = 512;
    s.page_chunk_capacity = 128;
    s.write_window_ms = 3_600_000;
    s
}

fn open_engine(root: &Path, strategy: Strategy) -> Engine {
    Engine::open_with(root, small_settings(strategy), false).unwrap()
}

/// Live data files on disk, by name.
fn data_files(root: &Path) -> HashSet<String> {
    fs::read_dir(root)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".wal") || n.ends_with(".page") || n.ends_with(".pagei"))
        .collect()
}

fn manifest_files(root: &Path) -> HashSet<String> {
    let doc: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(root.join("Manifest")).unwrap()).unwrap();
    let mut out = HashSet::new();
    for w in doc["wals"].as_array().unwrap() {
        out.insert(w.as_str().unwrap().to_string());
    }
    for p in doc["pages"].as_array().unwrap() {
        out.insert(format!("{}.page", p.as_str().unwrap()));
        out.insert(format!("{}.pagei", p.as_str().unwrap()));
    }
    out
}

#[test]
fn reopen_recovers_all_appended_data() {
    let dir = tempdir().unwrap();
    let total = 50_000u64;
    {
        let db = open_engine(dir.path(), Strategy::Compressed);
        let batch: Vec<Meas> = (0..total).map(|t| Meas::new(1, t, t as f64, 0)).collect();
        let status = db.append(&batch).unwrap();
        assert_eq!(status.writes, total as usize);
        db.stop().unwrap();
    }
    let db = open_engine(dir.path(), Strategy::Compressed);
    assert_eq!(db.max_time().unwrap(), Some(total - 1));
    assert_eq!(db.min_time().unwrap(), Some(0));

    let out = db
        .read_interval(&QueryInterval::new(vec![1], 0, total - 100, total))
        .unwrap();
    assert_eq!(out.len(), 100);
}

#[test]
fn manifest_matches_filesystem_after_append_and_drop() {
    let dir = tempdir().unwrap();
    let db = open_engine(dir.path(), Strategy::Compressed);
    let batch: Vec<Meas> = (0..3_000u64).map(|t| Meas::new(2, t, 0.0, 0)).collect();
    db.append(&batch).unwrap();
    db.flush().unwrap();

    assert_eq!(data_files(dir.path()), manifest_files(dir.path()));
    db.stop().unwrap();
    assert_eq!(data_files(dir.path()), manifest_files(dir.path()));
}

#[test]
fn unfinished_drop_leaves_wal_or_page_never_both() {
    // Crash simulation: the page exists under the WAL's stem, but the
    // WAL was never removed (the drop did not commit). Startup must
    // delete the page and recompact from the WAL.
    let dir = tempdir().unwrap();
    let root = dir.path();
    let wal_name;
    {
        let db = open_engine(root, Strategy::Wal);
        let batch: Vec<Meas> = (0..200u64).map(|t| Meas::new(1, t, t as f64, 0)).collect();
        db.append(&batch).unwrap();
        db.stop().unwrap();

        wal_name = manifest_files(root)
            .into_iter()
            .find(|n| n.ends_with(".wal"))
            .expect("one wal on disk");
    }

    // Half-finished drop: page files installed, manifest knows the
    // page, the WAL is still live.
    let stem = wal_name.trim_end_matches(".wal").to_string();
    let batch: Vec<Meas> = (0..200u64).map(|t| Meas::new(1, t, t as f64, 0)).collect();
    let mut w = PageWriter::create(root, &stem, 512, 64).unwrap();
    w.append(&batch).unwrap();
    w.close().unwrap();
    let manifest_path = root.join("Manifest");
    let mut doc: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&manifest_path).unwrap()).unwrap();
    doc["pages"].as_array_mut().unwrap().push(serde_json::json!(stem));
    fs::write(&manifest_path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();

    let db = open_engine(root, Strategy::Compressed);
    db.flush().unwrap();

    // Exactly one copy of the data remains referenced.
    let out = db.read_interval(&QueryInterval::new(vec![1], 0, 0, u64::MAX)).unwrap();
    assert_eq!(out.len(), 200, "data must exist exactly once after recovery");
    assert_eq!(data_files(root), manifest_files(root));
}

#[test]
fn torn_wal_tail_is_repaired_on_reopen() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let wal_name;
    {
        let db = open_engine(root, Strategy::Wal);
        let batch: Vec<Meas> = (0..100u64).map(|t| Meas::new(1, t, t as f64, 0)).collect();
        db.append(&batch).unwrap();
        db.stop().unwrap();
        wal_name = manifest_files(root)
            .into_iter()
            .find(|n| n.ends_with(".wal"))
            .unwrap();
    }

    // Crash mid-record: half a record of garbage at the tail.
    {
        use std::io::Write;
        let mut f = fs::OpenOptions::new().append(true).open(root.join(&wal_name)).unwrap();
        f.write_all(&[0x5a; 13]).unwrap();
    }

    let db = open_engine(root, Strategy::Wal);
    let out = db.read_interval(&QueryInterval::new(vec![1], 0, 0, u64::MAX)).unwrap();
    assert_eq!(out.len(), 100, "whole records must survive, the fragment must not");
}

#[test]
fn orphan_files_are_swept_at_startup() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    {
        let db = open_engine(root, Strategy::Compressed);
        db.append(&[Meas::new(1, 1, 1.0, 0)]).unwrap();
        db.stop().unwrap();
    }

    // A stray WAL the manifest never heard of.
    let mut stray = WalFile::create(&root.join("feedbeef00000000.wal"), 16, 4).unwrap();
    stray.append(&Meas::new(9, 9, 9.0, 0)).unwrap();
    stray.seal().unwrap();

    let db = open_engine(root, Strategy::Compressed);
    assert!(!root.join("feedbeef00000000.wal").exists(), "orphan must be removed");
    let out = db.read_interval(&QueryInterval::new(vec![9], 0, 0, u64::MAX)).unwrap();
    assert!(out.is_empty());
}

#[test]
fn erase_old_drops_whole_pages_and_repack_consolidates() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let db = open_engine(root, Strategy::Compressed);

    // Two generations far apart, forced into separate page files.
    let old: Vec<Meas> = (0..600u64).map(|t| Meas::new(1, t, 0.0, 0)).collect();
    db.append(&old).unwrap();
    db.compress_all().unwrap();
    let fresh: Vec<Meas> = (0..600u64).map(|t| Meas::new(1, 1_000_000 + t, 0.0, 0)).collect();
    db.append(&fresh).unwrap();
    db.compress_all().unwrap();

    db.erase_old(500_000).unwrap();
    let out = db.read_interval(&QueryInterval::new(vec![1], 0, 0, u64::MAX)).unwrap();
    assert_eq!(out.len(), 600, "only the fresh generation survives");
    assert!(out.iter().all(|m| m.time >= 1_000_000));

    db.repack().unwrap();
    let after = db.read_interval(&QueryInterval::new(vec![1], 0, 0, u64::MAX)).unwrap();
    assert_eq!(after.len(), 600, "repack must not change query results");
    assert_eq!(data_files(root), manifest_files(root));
}

#[test]
fn fsck_quarantines_a_corrupted_page() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let db = open_engine(root, Strategy::Compressed);
    let batch: Vec<Meas> = (0..600u64).map(|t| Meas::new(1, t, t as f64, 0)).collect();
    db.append(&batch).unwrap();
    db.compress_all().unwrap();

    let page_name = data_files(root)
        .into_iter()
        .find(|n| n.ends_with(".page"))
        .expect("a page exists after compress_all");

    // Flip a byte inside the first chunk's compressed body. The page
    // header is 53 bytes; each slot starts with the chunk's index
    // record copy.
    let path = root.join(&page_name);
    let mut bytes = fs::read(&path).unwrap();
    let victim = 53 + strata::chunk::CHUNK_HEADER_SIZE + 10;
    bytes[victim] ^= 0xff;
    fs::write(&path, &bytes).unwrap();

    db.fsck().unwrap();
    let stem = page_name.trim_end_matches(".page");
    assert!(root.join(format!("{}.page.broken", stem)).exists());
    assert!(!root.join(&page_name).exists());
}
