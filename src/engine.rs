//! Engine facade: the single entry point of the storage core.
//!
//! Appends go to the WAL and the memory tier inside one call, so a
//! measurement is query-visible the moment `append` returns. Queries
//! fan out to pages, memory, and WAL files in parallel and merge with
//! last-write-wins on `(id, time)`; the freshest tier (memory, then
//! WAL, then pages) wins ties so reads stay consistent while a
//! compaction races them.

use crate::compaction::{self, Compactor, CompactorConfig};
use crate::error::StoreError;
use crate::lockfile::LockFile;
use crate::manifest::Manifest;
use crate::memory::{now_ms, AppendOutcome, DropRequest, EvictionMode, MemTier, MemTierConfig};
use crate::page::PageCache;
use crate::settings::{Settings, Strategy};
use crate::telemetry::{EngineEvent, EngineEventListener};
use crate::threads::{TaskHandle, ThreadKind, ThreadManager};
use crate::types::{
    Flag, Id, Id2Meas, Meas, QueryInterval, QueryTimePoint, Status, Time,
};
use crate::wal::{WalFile, WAL_EXT};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};

/// On-disk format tag recorded in the manifest.
pub const STORAGE_FORMAT: &str = "1";

const DROP_CHANNEL_CAPACITY: usize = 64;

/// Live-append observer registered through [`Engine::subscribe`].
pub trait ReadCallback: Send + Sync + 'static {
    fn call(&self, m: &Meas);
}

struct Subscription {
    ids: Vec<Id>,
    flag: Flag,
    callback: Arc<dyn ReadCallback>,
}

impl Subscription {
    fn matches(&self, m: &Meas) -> bool {
        (self.ids.is_empty() || self.ids.contains(&m.id)) && m.matches_flag(self.flag)
    }
}

/// Manages the active WAL file and rolls to a fresh one when it fills.
#[derive(Debug)]
struct WalTier {
    root: PathBuf,
    manifest: Arc<Manifest>,
    file_size: usize,
    buffer_size: usize,
    active: Mutex<WalFile>,
}

impl WalTier {
    /// Reopens the tier from the manifest: the one unsealed, non-full
    /// file becomes active again; anything else stays sealed on disk
    /// awaiting compaction. Returns the names of files found full or
    /// sealed so the engine can queue their drops.
    fn recover(
        root: &Path,
        manifest: Arc<Manifest>,
        file_size: usize,
        buffer_size: usize,
    ) -> Result<(WalTier, Vec<String>), StoreError> {
        let mut active: Option<WalFile> = None;
        let mut droppable = Vec::new();

        for name in manifest.wal_list() {
            let path = root.join(&name);
            if !path.exists() {
                // Entry without a file violates the journal invariant.
                return Err(StoreError::corruption(format!(
                    "manifest references missing WAL {}",
                    name
                )));
            }
            let wal = WalFile::open(&path, false)?;
            if wal.is_sealed() || wal.count() as usize >= file_size {
                droppable.push(name);
            } else if active.is_none() {
                active = Some(WalFile::open_for_append(&path, file_size, buffer_size)?);
            } else {
                // Two unsealed files can only come from a crash between
                // roll and seal; keep the newest active, drop the rest.
                let mut stale = WalFile::open_for_append(&path, file_size, buffer_size)?;
                stale.seal()?;
                droppable.push(name);
            }
        }

        let active = match active {
            Some(w) => w,
            None => Self::fresh_file(root, &manifest, file_size, buffer_size)?,
        };

        Ok((
            WalTier {
                root: root.to_path_buf(),
                manifest,
                file_size,
                buffer_size,
                active: Mutex::new(active),
            },
            droppable,
        ))
    }

    fn fresh_file(
        root: &Path,
        manifest: &Manifest,
        file_size: usize,
        buffer_size: usize,
    ) -> Result<WalFile, StoreError> {
        let name = format!("{}.{}", compaction::random_stem(), WAL_EXT);
        let wal = WalFile::create(&root.join(&name), file_size, buffer_size)?;
        manifest.wal_append(&name)?;
        Ok(wal)
    }

    /// Appends one measurement, rolling the file when it fills. Returns
    /// the sealed file's name when a roll happened.
    fn append(&self, m: &Meas) -> Result<Option<String>, StoreError> {
        let mut active = self.active.lock()?;
        if active.append(m)? {
            return Ok(None);
        }
        active.seal()?;
        let sealed_name = active.file_name();
        let fresh = Self::fresh_file(&self.root, &self.manifest, self.file_size, self.buffer_size)?;
        let old = std::mem::replace(&mut *active, fresh);
        drop(old);
        active.append(m)?;
        Ok(Some(sealed_name))
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.active.lock()?.flush()
    }

    /// Seals the active file and starts a new one; used by
    /// `compress_all`. Returns the sealed name unless it was empty.
    fn seal_active(&self) -> Result<Option<String>, StoreError> {
        let mut active = self.active.lock()?;
        if active.count() == 0 {
            return Ok(None);
        }
        active.seal()?;
        let sealed_name = active.file_name();
        let fresh = Self::fresh_file(&self.root, &self.manifest, self.file_size, self.buffer_size)?;
        *active = fresh;
        Ok(Some(sealed_name))
    }

    /// Runs `f` over every live WAL file, the active one included.
    fn for_each_file<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnMut(&WalFile) -> Result<(), StoreError>,
    {
        let names = self.manifest.wal_list();
        self.for_each_file_in(&names, f)
    }

    /// Like [`WalTier::for_each_file`] over a caller-held snapshot of
    /// file names. Queries snapshot the WAL list before the page list
    /// so a measurement mid-compaction is seen by at least one tier.
    fn for_each_file_in<F>(&self, names: &[String], mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(&WalFile) -> Result<(), StoreError>,
    {
        let active = self.active.lock()?;
        let active_name = active.file_name();
        f(&active)?;
        drop(active);

        for name in names {
            if *name == active_name {
                continue;
            }
            match WalFile::open(&self.root.join(name), false) {
                Ok(wal) => f(&wal)?,
                // Compacted away between listing and open; pages serve it now.
                Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// The storage engine.
pub struct Engine {
    storage_root: PathBuf,
    settings: Settings,
    events: Arc<dyn EngineEventListener>,
    lock: Mutex<LockFile>,
    manifest: Arc<Manifest>,
    page_cache: Arc<PageCache>,
    threads: Arc<ThreadManager>,
    compactor: Arc<Compactor>,
    mem: Option<Arc<MemTier>>,
    wal: Option<Arc<WalTier>>,
    drop_tx: Mutex<Option<SyncSender<DropRequest>>>,
    subscribers: Mutex<Vec<Subscription>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("storage_root", &self.storage_root)
            .field("strategy", &self.settings.strategy)
            .finish()
    }
}

impl Engine {
    /// Opens (or initializes) the engine under `storage_root` using the
    /// settings file found there.
    pub fn open(storage_root: &Path) -> Result<Engine, StoreError> {
        let settings = Settings::open(storage_root)?;
        Self::open_with(storage_root, settings, false)
    }

    /// Opens with explicit settings. `ignore_lock_file` bypasses the
    /// ownership check for offline inspection.
    pub fn open_with(
        storage_root: &Path,
        settings: Settings,
        ignore_lock_file: bool,
    ) -> Result<Engine, StoreError> {
        std::fs::create_dir_all(storage_root)?;
        let events = settings.event_listener.clone();

        let lock = LockFile::acquire(storage_root, ignore_lock_file)?;
        // Only the lock holder may rewrite the settings file.
        settings.save(storage_root)?;

        let manifest = Arc::new(Manifest::open(storage_root, STORAGE_FORMAT)?);
        if manifest.get_format() != STORAGE_FORMAT {
            return Err(StoreError::corruption(format!(
                "storage format {} is not supported (expected {})",
                manifest.get_format(),
                STORAGE_FORMAT
            )));
        }

        let page_cache = Arc::new(PageCache::new(storage_root, settings.page_cache_size));
        let threads = Arc::new(ThreadManager::start());
        let (drop_tx, drop_rx) = mpsc::sync_channel(DROP_CHANNEL_CAPACITY);

        let compactor = Arc::new(Compactor::start(
            CompactorConfig {
                storage_root: storage_root.to_path_buf(),
                chunk_size: settings.chunk_size,
                page_chunk_capacity: settings.page_chunk_capacity,
            },
            Arc::clone(&manifest),
            Arc::clone(&page_cache),
            Arc::clone(&threads),
            events.clone(),
            drop_rx,
        ));

        // Startup recovery before any tier comes up: unfinished drops
        // and orphans must be gone before files are reopened.
        compactor.clean_storage()?;

        let mem = if settings.uses_memory() {
            let eviction = match settings.strategy {
                Strategy::Cache => EvictionMode::Discard,
                _ => EvictionMode::Persist,
            };
            Some(Arc::new(MemTier::start(
                MemTierConfig {
                    bucket_capacity: settings.bucket_capacity,
                    write_window_ms: settings.write_window_ms,
                    sync_delta_ms: settings.write_window_sync_delta_ms,
                    memory_limit: settings.memory_limit,
                    percent_when_start_dropping: settings.percent_when_start_dropping,
                    percent_to_drop: settings.percent_to_drop,
                    eviction,
                },
                drop_tx.clone(),
                events.clone(),
            )))
        } else {
            None
        };

        let wal = if settings.uses_wal() {
            let (tier, droppable) = WalTier::recover(
                storage_root,
                Arc::clone(&manifest),
                settings.wal_file_size,
                settings.wal_buffer_size,
            )?;
            let tier = Arc::new(tier);
            if matches!(settings.strategy, Strategy::Compressed | Strategy::Cache) {
                for name in droppable {
                    compactor.drop_wal(&name)?;
                }
            }
            Some(tier)
        } else {
            None
        };

        events.on_event(EngineEvent::EngineStarted);
        Ok(Engine {
            storage_root: storage_root.to_path_buf(),
            settings,
            events,
            lock: Mutex::new(lock),
            manifest,
            page_cache,
            threads,
            compactor,
            mem,
            wal,
            drop_tx: Mutex::new(Some(drop_tx)),
            subscribers: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn strategy(&self) -> Strategy {
        self.settings.strategy
    }

    pub fn format() -> &'static str {
        STORAGE_FORMAT
    }

    /// Appends a batch. Measurements are only ever ignored while the
    /// engine is stopping.
    pub fn append(&self, batch: &[Meas]) -> Result<Status, StoreError> {
        let mut status = Status::default();
        for m in batch {
            if self.stopped.load(Ordering::SeqCst) {
                status.ignored += 1;
                continue;
            }
            self.append_one_inner(m)?;
            status.writes += 1;
        }
        Ok(status)
    }

    /// Appends a single measurement.
    pub fn append_one(&self, m: &Meas) -> Result<Status, StoreError> {
        self.append(std::slice::from_ref(m))
    }

    fn append_one_inner(&self, m: &Meas) -> Result<(), StoreError> {
        if let Some(mem) = &self.mem {
            let outcome = if self.wal.is_some() {
                mem.append(m, now_ms())?
            } else {
                // No WAL below the memory tier; the window cannot be
                // allowed to drop data.
                mem.append(m, 0)?
            };
            debug_assert!(self.wal.is_some() || outcome == AppendOutcome::Accepted);
            let _ = outcome;
        }
        if let Some(wal) = &self.wal {
            if let Some(sealed) = wal.append(m)? {
                self.events.on_event(EngineEvent::WalRolled { name: sealed.clone() });
                if matches!(self.settings.strategy, Strategy::Compressed | Strategy::Cache) {
                    self.compactor.drop_wal(&sealed)?;
                }
            }
        }
        self.notify_subscribers(m)?;
        Ok(())
    }

    /// Registers a live observer for appends matching `ids` and `flag`
    /// (empty ids = every series). Used by the network layer's
    /// subscription support.
    pub fn subscribe(
        &self,
        ids: Vec<Id>,
        flag: Flag,
        callback: Arc<dyn ReadCallback>,
    ) -> Result<(), StoreError> {
        self.subscribers.lock()?.push(Subscription { ids, flag, callback });
        Ok(())
    }

    fn notify_subscribers(&self, m: &Meas) -> Result<(), StoreError> {
        let subs = self.subscribers.lock()?;
        for s in subs.iter() {
            if s.matches(m) {
                s.callback.call(m);
            }
        }
        Ok(())
    }

    /// Fans a task out to the common pool, collecting its output.
    fn spawn_tier<T, F>(&self, tier: &'static str, f: F) -> (Arc<Mutex<Option<T>>>, Option<TaskHandle>)
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    {
        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        let events = self.events.clone();
        let handle = self
            .threads
            .post(ThreadKind::Common, move |_| match f() {
                Ok(v) => {
                    if let Ok(mut s) = out.lock() {
                        *s = Some(v);
                    }
                }
                Err(e) => {
                    events.on_event(EngineEvent::TierQueryFailed { tier, error: e.to_string() });
                }
            })
            .ok();
        (slot, handle)
    }

    /// Range query across all tiers, merged last-write-wins.
    pub fn read_interval(&self, q: &QueryInterval) -> Result<Vec<Meas>, StoreError> {
        // Tier ranks break (id, time) ties: the freshest copy wins.
        const RANK_PAGE: u8 = 0;
        const RANK_WAL: u8 = 1;
        const RANK_MEM: u8 = 2;

        // WAL names before the page list: a record leaving the WAL for a
        // page is then guaranteed to show up in at least one snapshot.
        let wal_names = self.manifest.wal_list();

        let page_q = q.clone();
        let page_cache = Arc::clone(&self.page_cache);
        let manifest = Arc::clone(&self.manifest);
        let compactor = Arc::clone(&self.compactor);
        let events = self.events.clone();
        let (pages_slot, pages_handle) = self.spawn_tier("pages", move || {
            use rayon::prelude::*;
            let stems = manifest.page_list();
            let per_page: Vec<Vec<Meas>> = stems
                .par_iter()
                .map(|stem| {
                    let mut out = Vec::new();
                    let page = match page_cache.get(stem) {
                        Ok(p) => p,
                        Err(e) => {
                            events.on_event(EngineEvent::TierQueryFailed {
                                tier: "pages",
                                error: format!("{}: {}", stem, e),
                            });
                            return out;
                        }
                    };
                    let links = page.chunks_by_interval(&page_q);
                    if links.is_empty() {
                        return out;
                    }
                    if let Err(e) = page.read_links(&page_q, &links, &mut |m| out.push(m)) {
                        // Skip the damaged page; quarantine it so the
                        // next query does not trip over it again.
                        events.on_event(EngineEvent::TierQueryFailed {
                            tier: "pages",
                            error: format!("{}: {}", stem, e),
                        });
                        if matches!(e, StoreError::Checksum(_)) {
                            let _ = compactor.check_pages();
                        }
                    }
                    out
                })
                .collect();
            let out: Vec<Meas> = per_page.into_iter().flatten().collect();
            Ok(out)
        });

        let wal_out = match &self.wal {
            Some(wal) => {
                let wal = Arc::clone(wal);
                let wal_q = q.clone();
                let (slot, handle) = self.spawn_tier("wal", move || {
                    let mut out = Vec::new();
                    wal.for_each_file_in(&wal_names, |f| f.read_interval(&wal_q, &mut out))?;
                    Ok(out)
                });
                Some((slot, handle))
            }
            None => None,
        };

        let mut mem_out: Vec<Meas> = Vec::new();
        if let Some(mem) = &self.mem {
            mem.read_interval(q, &mut mem_out)?;
        }

        let mut merged: Vec<(Meas, u8)> = Vec::new();
        if let Some((slot, handle)) = wal_out {
            if let Some(h) = handle {
                h.wait();
            }
            if let Some(v) = slot.lock()?.take() {
                merged.extend(v.into_iter().map(|m| (m, RANK_WAL)));
            }
        }
        if let Some(h) = pages_handle {
            h.wait();
        }
        if let Some(v) = pages_slot.lock()?.take() {
            merged.extend(v.into_iter().map(|m| (m, RANK_PAGE)));
        }
        merged.extend(mem_out.into_iter().map(|m| (m, RANK_MEM)));

        merged.sort_by_key(|(m, rank)| (m.id, m.time, std::cmp::Reverse(*rank)));
        merged.dedup_by(|a, b| a.0.id == b.0.id && a.0.time == b.0.time);
        Ok(merged.into_iter().map(|(m, _)| m).collect())
    }

    /// For each queried id, the latest measurement at or before the
    /// time point; ids with no observation get the `NO_DATA` sentinel.
    pub fn read_time_point(&self, q: &QueryTimePoint) -> Result<Id2Meas, StoreError> {
        let mut out = Id2Meas::new();

        if let Some(mem) = &self.mem {
            mem.read_time_point(q, &mut out)?;
        }
        if let Some(wal) = &self.wal {
            wal.for_each_file(|f| f.read_time_point(q, &mut out))?;
        }
        for stem in self.manifest.page_list() {
            match self.page_cache.get(&stem) {
                Ok(page) => page.values_before_time_point(q, &mut out)?,
                Err(e) => self.events.on_event(EngineEvent::TierQueryFailed {
                    tier: "pages",
                    error: format!("{}: {}", stem, e),
                }),
            }
        }

        for id in &q.ids {
            out.entry(*id).or_insert_with(|| Meas::no_data(*id, q.time_point));
        }
        Ok(out)
    }

    /// Most recent value per id across all tiers; the same filling rule
    /// as [`Engine::read_time_point`].
    pub fn current_value(&self, ids: &[Id], flag: Flag) -> Result<Id2Meas, StoreError> {
        let mut out = Id2Meas::new();
        if let Some(mem) = &self.mem {
            mem.current_value(ids, flag, &mut out)?;
        }
        if let Some(wal) = &self.wal {
            wal.for_each_file(|f| f.current_value(ids, flag, &mut out))?;
        }
        let q = QueryTimePoint::new(ids.to_vec(), flag, Time::MAX);
        for stem in self.manifest.page_list() {
            match self.page_cache.get(&stem) {
                Ok(page) => page.values_before_time_point(&q, &mut out)?,
                Err(e) => self.events.on_event(EngineEvent::TierQueryFailed {
                    tier: "pages",
                    error: format!("{}: {}", stem, e),
                }),
            }
        }
        for id in ids {
            out.entry(*id).or_insert_with(|| Meas::no_data(*id, 0));
        }
        Ok(out)
    }

    pub fn min_time(&self) -> Result<Option<Time>, StoreError> {
        let mut min: Option<Time> = None;
        let mut fold = |t: Option<Time>| {
            if let Some(t) = t {
                min = Some(min.map_or(t, |m| m.min(t)));
            }
        };
        if let Some(mem) = &self.mem {
            fold(mem.min_time());
        }
        if let Some(wal) = &self.wal {
            wal.for_each_file(|f| {
                fold(f.min_time());
                Ok(())
            })?;
        }
        for stem in self.manifest.page_list() {
            fold(Some(self.page_cache.get(&stem)?.min_time()));
        }
        Ok(min)
    }

    pub fn max_time(&self) -> Result<Option<Time>, StoreError> {
        let mut max: Option<Time> = None;
        let mut fold = |t: Option<Time>| {
            if let Some(t) = t {
                max = Some(max.map_or(t, |m| m.max(t)));
            }
        };
        if let Some(mem) = &self.mem {
            fold(mem.max_time());
        }
        if let Some(wal) = &self.wal {
            wal.for_each_file(|f| {
                fold(f.max_time());
                Ok(())
            })?;
        }
        for stem in self.manifest.page_list() {
            fold(Some(self.page_cache.get(&stem)?.max_time()));
        }
        Ok(max)
    }

    /// Time bounds of one series, or `None` for an unknown id.
    pub fn min_max_time(&self, id: Id) -> Result<Option<(Time, Time)>, StoreError> {
        let mut acc: Option<(Time, Time)> = None;
        let mut fold = |b: Option<(Time, Time)>| {
            if let Some((lo, hi)) = b {
                acc = Some(match acc {
                    Some((alo, ahi)) => (alo.min(lo), ahi.max(hi)),
                    None => (lo, hi),
                });
            }
        };
        if let Some(mem) = &self.mem {
            fold(mem.min_max_time(id)?);
        }
        if let Some(wal) = &self.wal {
            wal.for_each_file(|f| {
                fold(f.min_max_time(id)?);
                Ok(())
            })?;
        }
        for stem in self.manifest.page_list() {
            fold(self.page_cache.get(&stem)?.min_max_time(id)?);
        }
        Ok(acc)
    }

    /// Blocks until buffered writes are durable and the compaction
    /// queue is empty.
    pub fn flush(&self) -> Result<(), StoreError> {
        if let Some(wal) = &self.wal {
            wal.flush()?;
        }
        if let Some(mem) = &self.mem {
            mem.flush_blocking()?;
        }
        self.mem_barrier()?;
        self.compactor.flush();
        Ok(())
    }

    /// Pushes a barrier through the drop channel and waits for it, so
    /// every bucket queued before this point is on disk.
    fn mem_barrier(&self) -> Result<(), StoreError> {
        let tx = self.drop_tx.lock()?;
        if let Some(tx) = tx.as_ref() {
            let (ack_tx, ack_rx) = mpsc::channel();
            if tx.send(DropRequest::barrier(ack_tx)).is_ok() {
                let _ = ack_rx.recv();
            }
        }
        Ok(())
    }

    /// Seals the active WAL and compacts every log file into pages.
    pub fn compress_all(&self) -> Result<(), StoreError> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };
        if let Some(sealed) = wal.seal_active()? {
            self.events.on_event(EngineEvent::WalRolled { name: sealed });
        }
        let active_name = {
            let active = wal.active.lock()?;
            active.file_name()
        };
        for name in self.manifest.wal_list() {
            if name != active_name {
                self.compactor.drop_wal(&name)?;
            }
        }
        self.compactor.flush();
        Ok(())
    }

    /// Startup-style integrity pass: unfinished drops, orphans, page
    /// checksums, WAL tail repair.
    pub fn fsck(&self) -> Result<(), StoreError> {
        self.compactor.clean_storage()?;
        self.compactor.check_pages()?;
        if let Some(wal) = &self.wal {
            // Opening repairs a torn tail as a side effect.
            wal.for_each_file(|_| Ok(()))?;
        }
        Ok(())
    }

    /// Removes whole pages older than `t`.
    pub fn erase_old(&self, t: Time) -> Result<(), StoreError> {
        self.compactor.erase_old(t)
    }

    /// Rewrites pages into densely packed chunks.
    pub fn repack(&self) -> Result<(), StoreError> {
        self.compactor.repack()
    }

    /// Stops the engine: drains in-flight work, joins every thread, and
    /// releases the lock file. Idempotent.
    pub fn stop(&self) -> Result<(), StoreError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.events.on_event(EngineEvent::EngineStopping);

        if let Some(wal) = &self.wal {
            wal.flush()?;
        }
        if let Some(mem) = &self.mem {
            mem.flush_blocking()?;
            mem.stop();
        }
        self.mem_barrier()?;
        // Dropping the last sender lets the drain loop exit.
        *self.drop_tx.lock()? = None;
        self.compactor.flush();
        self.compactor.stop();
        self.threads.stop();
        self.lock.lock()?.release();
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
