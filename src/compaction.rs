//! Compaction orchestrator: moves data down the tiers.
//!
//! Sealed WAL files and aged memory buckets become page files here.
//! One compaction mutex serializes every page write; the pending queue
//! has its own lock so enqueueing never waits on I/O. Tasks run on the
//! single-threaded disk-I/O pool and `try_lock` the compaction mutex,
//! re-posting themselves on contention instead of blocking the worker.
//!
//! The drop protocol is at-most-once: a page is fully written and
//! fsynced under a temp name, renamed, registered in the manifest, and
//! only then is its source WAL forgotten and unlinked. A crash anywhere
//! in between leaves both the WAL and (possibly) a page with the same
//! stem; startup cleanup deletes the page and the WAL is compacted
//! again.

use crate::error::StoreError;
use crate::manifest::Manifest;
use crate::memory::DropRequest;
use crate::page::{self, PageCache, PageReader, PageWriter};
use crate::telemetry::{EngineEvent, EngineEventListener};
use crate::threads::{ThreadKind, ThreadManager};
use crate::types::{meas_id_time_order, Meas, Time};
use crate::wal::{WalFile, WAL_EXT};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const IO_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);
const FLUSH_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct CompactorConfig {
    pub storage_root: PathBuf,
    pub chunk_size: u32,
    pub page_chunk_capacity: u32,
}

struct Shared {
    cfg: CompactorConfig,
    manifest: Arc<Manifest>,
    page_cache: Arc<PageCache>,
    threads: Arc<ThreadManager>,
    events: Arc<dyn EngineEventListener>,
    /// Serializes all page writes.
    compaction_lock: Mutex<()>,
    /// Pending WAL drops; guarded separately so enqueue never blocks on I/O.
    queue: Mutex<HashSet<String>>,
    in_queue: AtomicUsize,
}

/// The compaction orchestrator.
pub struct Compactor {
    shared: Arc<Shared>,
    mem_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Compactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compactor")
            .field("pending", &self.shared.in_queue.load(Ordering::Relaxed))
            .finish()
    }
}

impl Compactor {
    /// Creates the compactor and spawns the drain loop for memory-tier
    /// drop requests. The loop exits when every sender is gone.
    pub fn start(
        cfg: CompactorConfig,
        manifest: Arc<Manifest>,
        page_cache: Arc<PageCache>,
        threads: Arc<ThreadManager>,
        events: Arc<dyn EngineEventListener>,
        drop_rx: Receiver<DropRequest>,
    ) -> Compactor {
        let shared = Arc::new(Shared {
            cfg,
            manifest,
            page_cache,
            threads,
            events,
            compaction_lock: Mutex::new(()),
            queue: Mutex::new(HashSet::new()),
            in_queue: AtomicUsize::new(0),
        });

        let drain_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("strata-mem-drop".to_string())
            .spawn(move || {
                while let Ok(req) = drop_rx.recv() {
                    drain_shared.in_queue.fetch_add(1, Ordering::SeqCst);
                    if !req.measurements.is_empty() {
                        let mut batch = req.measurements;
                        batch.sort_by(meas_id_time_order);
                        let stem = random_stem();
                        if let Err(e) = write_pages(&drain_shared, &stem, &batch) {
                            drain_shared.events.on_event(EngineEvent::CompactionFailed {
                                source: "memory".to_string(),
                                error: e.to_string(),
                            });
                        }
                    }
                    drain_shared.in_queue.fetch_sub(1, Ordering::SeqCst);
                    if let Some(ack) = req.ack {
                        let _ = ack.send(());
                    }
                }
            })
            .expect("spawn memory drop drain");

        Compactor { shared, mem_handle: Mutex::new(Some(handle)) }
    }

    /// Number of drops currently queued or running.
    pub fn pending(&self) -> usize {
        self.shared.in_queue.load(Ordering::SeqCst)
    }

    /// Queues a sealed WAL file for compaction. Idempotent: a file
    /// already pending is not queued twice.
    pub fn drop_wal(&self, file_name: &str) -> Result<(), StoreError> {
        {
            let mut queue = self.shared.queue.lock()?;
            if queue.contains(file_name) {
                return Ok(());
            }
            if !self.shared.cfg.storage_root.join(file_name).exists() {
                return Ok(());
            }
            queue.insert(file_name.to_string());
            self.shared.in_queue.fetch_add(1, Ordering::SeqCst);
        }
        if let Err(e) = post_wal_task(Arc::clone(&self.shared), file_name.to_string()) {
            finish_wal_task(&self.shared, file_name);
            return Err(e);
        }
        Ok(())
    }

    /// Blocks until the pending counter reaches zero.
    pub fn flush(&self) {
        while self.shared.in_queue.load(Ordering::SeqCst) != 0 {
            thread::sleep(FLUSH_POLL);
        }
    }

    /// Startup recovery. Deletes pages whose stem collides with a
    /// still-live WAL (an unfinished drop) and sweeps files the
    /// manifest does not know about.
    pub fn clean_storage(&self) -> Result<(), StoreError> {
        let sh = &self.shared;
        sh.events.on_event(EngineEvent::FsckStarted);
        let root = &sh.cfg.storage_root;

        let wals: HashSet<String> = sh.manifest.wal_list().into_iter().collect();
        let pages: HashSet<String> = sh.manifest.page_list().into_iter().collect();

        for wal_name in &wals {
            let stem = wal_stem(wal_name);
            if page::page_path(root, &stem).exists() || pages.contains(&stem) {
                sh.events.on_event(EngineEvent::FsckUnfinishedDrop {
                    wal: wal_name.clone(),
                    page: stem.clone(),
                });
                sh.page_cache.forget(&stem);
                sh.manifest.page_rm(&stem)?;
                page::erase(root, &stem)?;
            }
        }

        // Orphans: data files on disk with no manifest entry.
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let keep = if name.ends_with(&format!(".{}", WAL_EXT)) {
                wals.contains(&name)
            } else if name.ends_with(&format!(".{}", page::PAGE_EXT))
                || name.ends_with(&format!(".{}", page::PAGE_INDEX_EXT))
            {
                let stem = wal_stem(&name);
                self.shared.manifest.page_list().contains(&stem)
            } else {
                true
            };
            if !keep {
                sh.events.on_event(EngineEvent::FsckRemovedOrphan { name: name.clone() });
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    /// Verifies every page; a corrupt one is quarantined by renaming its
    /// files to `<name>.broken` and dropping it from the manifest.
    pub fn check_pages(&self) -> Result<(), StoreError> {
        let sh = &self.shared;
        let root = &sh.cfg.storage_root;
        for stem in sh.manifest.page_list() {
            let verified = PageReader::open(root, &stem).and_then(|p| p.verify());
            if let Err(e) = verified {
                sh.events.on_event(EngineEvent::PageQuarantined {
                    name: stem.clone(),
                    error: e.to_string(),
                });
                sh.page_cache.forget(&stem);
                sh.manifest.page_rm(&stem)?;
                for p in [page::page_path(root, &stem), page::index_path(root, &stem)] {
                    if p.exists() {
                        let broken = p.with_extension(format!(
                            "{}.broken",
                            p.extension().and_then(|e| e.to_str()).unwrap_or("bin")
                        ));
                        let _ = std::fs::rename(&p, &broken);
                    }
                }
            }
        }
        Ok(())
    }

    /// Removes whole pages whose newest measurement is older than `t`.
    pub fn erase_old(&self, t: Time) -> Result<(), StoreError> {
        let sh = &self.shared;
        let _guard = sh.compaction_lock.lock()?;
        for stem in sh.manifest.page_list() {
            let reader = sh.page_cache.get(&stem)?;
            if reader.max_time() < t {
                sh.manifest.page_rm(&stem)?;
                sh.page_cache.forget(&stem);
                page::erase(&sh.cfg.storage_root, &stem)?;
                sh.events.on_event(EngineEvent::PageErased { name: stem });
            }
        }
        Ok(())
    }

    /// Rewrites all pages into freshly packed chunks. Small pages left
    /// behind by memory drops collapse into one dense page.
    pub fn repack(&self) -> Result<(), StoreError> {
        let sh = &self.shared;
        let _guard = sh.compaction_lock.lock()?;
        let stems = sh.manifest.page_list();
        if stems.len() < 2 {
            return Ok(());
        }

        let mut batch: Vec<Meas> = Vec::new();
        for stem in &stems {
            let reader = sh.page_cache.get(stem)?;
            batch.extend(reader.read_all()?);
        }
        if batch.is_empty() {
            return Ok(());
        }
        batch.sort_by(meas_id_time_order);

        let new_stem = random_stem();
        write_pages(sh, &new_stem, &batch)?;
        for stem in &stems {
            sh.manifest.page_rm(stem)?;
            sh.page_cache.forget(stem);
            page::erase(&sh.cfg.storage_root, stem)?;
        }
        Ok(())
    }

    /// Stops the memory-drop drain loop. Senders must be gone first or
    /// this blocks until they are.
    pub fn stop(&self) {
        if let Ok(mut h) = self.mem_handle.lock() {
            if let Some(handle) = h.take() {
                let _ = handle.join();
            }
        }
    }
}

fn post_wal_task(shared: Arc<Shared>, file_name: String) -> Result<(), StoreError> {
    let threads = Arc::clone(&shared.threads);
    threads.post(ThreadKind::DiskIo, move |_| {
        run_wal_task(shared, file_name);
    })?;
    Ok(())
}

fn run_wal_task(shared: Arc<Shared>, file_name: String) {
    // Under contention, re-queue instead of blocking the only disk
    // thread on the lock.
    let Ok(guard) = shared.compaction_lock.try_lock() else {
        let resubmit = Arc::clone(&shared);
        if post_wal_task(resubmit, file_name.clone()).is_err() {
            finish_wal_task(&shared, &file_name);
        }
        return;
    };

    shared
        .events
        .on_event(EngineEvent::CompactionStarted { source: file_name.clone() });

    let mut attempt = 0;
    loop {
        match write_wal_to_page(&shared, &file_name) {
            Ok(page) => {
                shared.events.on_event(EngineEvent::CompactionFinished {
                    source: file_name.clone(),
                    page,
                });
                break;
            }
            Err(StoreError::Io(e)) if attempt + 1 < IO_RETRIES => {
                attempt += 1;
                shared.events.on_event(EngineEvent::CompactionRetried {
                    source: file_name.clone(),
                    attempt,
                });
                let _ = e;
                thread::sleep(RETRY_BACKOFF * attempt);
            }
            Err(e) => {
                // The WAL stays on disk untouched; the next startup's
                // cleanup reconciles whatever half-state remains.
                shared.events.on_event(EngineEvent::CompactionFailed {
                    source: file_name.clone(),
                    error: e.to_string(),
                });
                break;
            }
        }
    }

    drop(guard);
    finish_wal_task(&shared, &file_name);
}

fn finish_wal_task(shared: &Shared, file_name: &str) {
    if let Ok(mut queue) = shared.queue.lock() {
        queue.remove(file_name);
    }
    shared.in_queue.fetch_sub(1, Ordering::SeqCst);
}

/// The actual drop: WAL → page, manifest swap, WAL unlink.
fn write_wal_to_page(shared: &Shared, file_name: &str) -> Result<String, StoreError> {
    let root = &shared.cfg.storage_root;
    let wal_path = root.join(file_name);
    let wal = WalFile::open(&wal_path, false)?;
    let mut batch = wal.read_all()?;

    let stem = wal_stem(file_name);
    if batch.is_empty() {
        shared.manifest.wal_rm(file_name)?;
        std::fs::remove_file(&wal_path)?;
        return Ok(stem);
    }
    batch.sort_by(meas_id_time_order);

    write_pages(shared, &stem, &batch)?;
    shared.manifest.wal_rm(file_name)?;
    std::fs::remove_file(&wal_path)?;
    Ok(stem)
}

/// Writes a sorted batch into one page, spilling into `<stem>_N`
/// continuation pages when a single page cannot hold it.
fn write_pages(shared: &Shared, stem: &str, batch: &[Meas]) -> Result<(), StoreError> {
    let root = &shared.cfg.storage_root;
    let mut offset = 0;
    let mut part = 0u32;
    while offset < batch.len() {
        let name = if part == 0 { stem.to_string() } else { format!("{}_{}", stem, part) };
        let mut writer =
            PageWriter::create(root, &name, shared.cfg.chunk_size, shared.cfg.page_chunk_capacity)?;
        let taken = writer.append(&batch[offset..])?;
        if taken == 0 {
            return Err(StoreError::Internal("page writer made no progress".to_string()));
        }
        let chunks = writer.chunk_count();
        let installed = writer.close()?;
        shared.manifest.page_append(&installed)?;
        shared
            .events
            .on_event(EngineEvent::PageWritten { name: installed, chunks });
        offset += taken;
        part += 1;
    }
    Ok(())
}

/// `a1b2….wal` → `a1b2…`; page stems mirror their source WAL name.
pub fn wal_stem(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string())
}

/// Random stem for files not derived from a WAL (memory drops, repack).
pub fn random_stem() -> String {
    format!("{:016x}", rand::random::<u64>())
}
